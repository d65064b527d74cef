//! Server info and file list exchange.
//!
//! Every response opens a fresh connection to the requestor; the request
//! connection was already closed by the pump.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::core::FileServer;
use crate::error::ServerError;
use crate::events::ServerEvent;
use crate::protocol::{self, EndpointPayload, FileListPayload, FolderPayload, MessageType, ServerInfoPayload};
use crate::socket;

/// Separator between the path and size of one file list entry.
const FIELD_DELIMITER: char = '|';
/// Separator between file list entries.
const ENTRY_DELIMITER: char = '*';

pub(crate) fn handle_server_info_request(
    server: &Arc<FileServer>,
    endpoint: EndpointPayload,
) -> Result<(), ServerError> {
    let requestor: SocketAddr = socket::parse_endpoint(&endpoint.sender_ip, endpoint.sender_port)?;
    let (self_ip, self_port) = server.self_endpoint();
    let folder: String = server.transfer_folder().to_string_lossy().into_owned();
    // The public address is only known if a discovery collaborator told us;
    // peers treat an empty string as "not learned yet".
    let public_ip: String = String::new();

    tracing::debug!(to = %requestor, "Answering server info request");
    server.send_framed(
        requestor,
        &protocol::encode_server_info(&self_ip, self_port, &public_ip, &folder),
    )
}

pub(crate) fn handle_server_info_response(
    server: &Arc<FileServer>,
    response: ServerInfoPayload,
) -> Result<(), ServerError> {
    {
        let mut state = server.state.lock().expect("state lock poisoned");
        state.remote.local_ip = response.local_ip.parse().ok();
        state.remote.public_ip = response.public_ip.parse().ok();
        state.remote.port = u16::try_from(response.port).unwrap_or(0);
        state.remote.transfer_folder = PathBuf::from(&response.folder);
    }

    server.events.emit(ServerEvent::ReceivedServerInfo {
        local_ip: response.local_ip,
        port: response.port,
        public_ip: response.public_ip,
        folder: response.folder,
    });

    Ok(())
}

pub(crate) fn handle_file_list_request(
    server: &Arc<FileServer>,
    request: FolderPayload,
) -> Result<(), ServerError> {
    let requestor: SocketAddr = socket::parse_endpoint(&request.sender_ip, request.sender_port)?;
    let (self_ip, self_port) = server.self_endpoint();
    let target: &Path = Path::new(&request.folder);

    if !target.is_dir() {
        tracing::warn!(folder = %request.folder, "Requested folder does not exist");
        return server.send_framed(
            requestor,
            &protocol::encode_endpoint(
                MessageType::RequestedFolderDoesNotExist,
                &self_ip,
                self_port,
            ),
        );
    }

    let entries: Vec<(String, u64)> = list_folder(target)?;
    if entries.is_empty() {
        tracing::debug!(folder = %request.folder, "Requested folder has no files");
        return server.send_framed(
            requestor,
            &protocol::encode_endpoint(
                MessageType::NoFilesAvailableForDownload,
                &self_ip,
                self_port,
            ),
        );
    }

    let list: String = format_file_list(&entries);
    tracing::debug!(to = %requestor, count = entries.len(), "Sending file list");
    server.send_framed(
        requestor,
        &protocol::encode_file_list(&self_ip, self_port, &request.folder, &list),
    )
}

pub(crate) fn handle_file_list_response(
    server: &Arc<FileServer>,
    response: FileListPayload,
) -> Result<(), ServerError> {
    let files: Vec<(String, u64)> = parse_file_list(&response.list);
    server
        .state
        .lock()
        .expect("state lock poisoned")
        .remote_files = files.clone();

    server.events.emit(ServerEvent::ReceivedFileList {
        folder: response.folder,
        files,
    });

    Ok(())
}

/// Files directly inside `folder`, in directory order, dot-prefixed names
/// skipped. No recursion.
fn list_folder(folder: &Path) -> Result<Vec<(String, u64)>, ServerError> {
    let mut entries: Vec<(String, u64)> = Vec::new();

    for entry in fs::read_dir(folder)? {
        let entry = entry?;
        let name: String = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }
        let metadata = entry.metadata()?;
        if !metadata.is_file() {
            continue;
        }
        entries.push((entry.path().to_string_lossy().into_owned(), metadata.len()));
    }

    Ok(entries)
}

/// Joins entries as `path "|" size`, separated by `"*"`.
///
/// The delimiters are literal with no escaping: a path containing either
/// character corrupts the list. Known weakness of the wire format.
fn format_file_list(entries: &[(String, u64)]) -> String {
    entries
        .iter()
        .map(|(path, size)| format!("{}{}{}", path, FIELD_DELIMITER, size))
        .collect::<Vec<String>>()
        .join(&ENTRY_DELIMITER.to_string())
}

/// Inverse of [`format_file_list`]. Malformed entries are dropped.
fn parse_file_list(list: &str) -> Vec<(String, u64)> {
    list.split(ENTRY_DELIMITER)
        .filter_map(|entry| {
            let (path, size) = entry.rsplit_once(FIELD_DELIMITER)?;
            let size: u64 = size.parse().ok()?;
            Some((path.to_string(), size))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;

    #[test]
    fn test_file_list_format_parse_roundtrip() {
        let entries: Vec<(String, u64)> = vec![
            ("/srv/a.bin".into(), 3),
            ("/srv/movie.mkv".into(), 700 * 1024 * 1024),
        ];

        let list: String = format_file_list(&entries);
        assert_eq!(list, "/srv/a.bin|3*/srv/movie.mkv|734003200");
        assert_eq!(parse_file_list(&list), entries);
    }

    #[test]
    fn test_parse_drops_malformed_entries() {
        let parsed: Vec<(String, u64)> = parse_file_list("good|1*no-delimiter*bad|size*also|2");
        assert_eq!(parsed, vec![("good".into(), 1), ("also".into(), 2)]);
    }

    #[test]
    fn test_list_folder_skips_dot_files_and_directories() {
        let dir = tempfile::tempdir().unwrap();
        File::create(dir.path().join("visible.bin"))
            .unwrap()
            .write_all(b"abc")
            .unwrap();
        File::create(dir.path().join(".hidden")).unwrap();
        fs::create_dir(dir.path().join("subdir")).unwrap();

        let entries: Vec<(String, u64)> = list_folder(dir.path()).unwrap();

        assert_eq!(entries.len(), 1);
        assert!(entries[0].0.ends_with("visible.bin"));
        assert_eq!(entries[0].1, 3);
    }

    #[test]
    fn test_list_folder_on_empty_folder_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(list_folder(dir.path()).unwrap().is_empty());
    }
}
