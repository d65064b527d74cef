//! The file send pipeline: announcing a transfer, streaming bytes after the
//! peer accepts, and the stall/retry control around it.
//!
//! The connection that carries the transfer request stays open: once the
//! peer's acceptance arrives on our listener, the byte stream continues on
//! that original connection, followed by the peer's completion handshake.
//! Streaming runs on the background worker so the pump can keep framing
//! control messages, in particular `FileTransferStalled`.

use std::cmp::min;
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::net::{SocketAddr, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::instrument;

use crate::core::FileServer;
use crate::error::{ServerError, TransferError};
use crate::events::ServerEvent;
use crate::framing;
use crate::protocol::{self, EndpointPayload, FolderPayload, OutboundFileRequest, MessageType, HANDSHAKE};
use crate::socket;
use crate::state::ServerFlags;

/// Small files additionally log every chunk sent.
const PER_CHUNK_EVENT_LIMIT: usize = 10;

/// Announces an outbound transfer to `remote` and parks the connection
/// until the peer's accept or reject arrives on our listener.
#[instrument(name = "send_file", skip_all, fields(path = %local_path.display()))]
pub(crate) fn send_file(
    server: &FileServer,
    remote: SocketAddr,
    local_path: &Path,
    remote_folder: &str,
) -> Result<(), ServerError> {
    let metadata = fs::metadata(local_path)
        .map_err(|_| TransferError::FileMissing(local_path.to_path_buf()))?;
    let file_name = local_path
        .file_name()
        .ok_or_else(|| TransferError::FileMissing(local_path.to_path_buf()))?;
    let file_size: u64 = metadata.len();
    let remote_path: String = format!(
        "{}/{}",
        remote_folder.trim_end_matches('/'),
        file_name.to_string_lossy()
    );
    let (self_ip, self_port) = server.self_endpoint();

    tracing::info!(to = %remote, %remote_path, file_size, "Announcing outbound file transfer");

    ServerFlags::lower(&server.flags.outbound_stalled);

    let mut stream: TcpStream = socket::connect(remote, server.config.connect_timeout())?;
    let payload: Vec<u8> =
        protocol::encode_inbound_file_request(&remote_path, file_size as i64, &self_ip, self_port);
    socket::send_all(
        &mut stream,
        &framing::encode_frame(&payload),
        server.config.send_timeout(),
    )?;

    {
        let mut state = server.state.lock().expect("state lock poisoned");
        state.begin_outbound(local_path.to_path_buf(), file_size, remote_folder.to_string());
        state.outgoing_stream = Some(stream);
    }
    server.flags.transfer_in_progress.store(true, Ordering::SeqCst);

    Ok(())
}

/// The peer accepted: resume the parked connection and stream the file
/// bytes on the background worker.
pub(crate) fn handle_accepted(
    server: &Arc<FileServer>,
    endpoint: EndpointPayload,
) -> Result<(), ServerError> {
    server.events.emit(ServerEvent::ClientAcceptedFileTransfer {
        remote_ip: endpoint.sender_ip,
        remote_port: endpoint.sender_port,
    });

    let stream: TcpStream = server
        .state
        .lock()
        .expect("state lock poisoned")
        .outgoing_stream
        .take()
        .ok_or(TransferError::NoPendingTransfer)?;

    let worker_server: Arc<FileServer> = Arc::clone(server);
    server.worker.execute(move || {
        let result: Result<(), ServerError> = stream_file_bytes(&worker_server, stream);
        worker_server
            .flags
            .transfer_in_progress
            .store(false, Ordering::SeqCst);

        if let Err(err) = result {
            tracing::error!("Outbound transfer failed: {}", err);
            worker_server.events.emit(ServerEvent::ErrorOccurred {
                message: err.to_string(),
            });
        }
    });

    Ok(())
}

/// The peer rejected: drop the parked connection. The outgoing path is
/// kept on record until the next outbound request replaces it.
pub(crate) fn handle_rejected(
    server: &Arc<FileServer>,
    endpoint: EndpointPayload,
) -> Result<(), ServerError> {
    server
        .state
        .lock()
        .expect("state lock poisoned")
        .outgoing_stream
        .take();
    server.flags.transfer_in_progress.store(false, Ordering::SeqCst);

    server.events.emit(ServerEvent::ClientRejectedFileTransfer {
        remote_ip: endpoint.sender_ip,
        remote_port: endpoint.sender_port,
    });

    Ok(())
}

/// The peer reports our stream stalled on its end. The active send loop
/// observes the flag between chunks and aborts.
pub(crate) fn handle_stalled(
    server: &Arc<FileServer>,
    _endpoint: EndpointPayload,
) -> Result<(), ServerError> {
    tracing::warn!("Peer reported a stalled transfer");
    ServerFlags::raise(&server.flags.outbound_stalled);

    Ok(())
}

/// The peer asks us to re-send the transfer that previously stalled.
pub(crate) fn handle_retry(
    server: &Arc<FileServer>,
    folder: FolderPayload,
) -> Result<(), ServerError> {
    server.events.emit(ServerEvent::ReceivedRetryRequest {
        remote_ip: folder.sender_ip.clone(),
        remote_port: folder.sender_port,
    });
    ServerFlags::raise(&server.flags.retry_previous_transfer);

    let path: PathBuf = server
        .state
        .lock()
        .expect("state lock poisoned")
        .outgoing_file_path
        .clone()
        .ok_or(TransferError::NothingToRetry)?;
    let remote: SocketAddr = socket::parse_endpoint(&folder.sender_ip, folder.sender_port)?;

    let result: Result<(), ServerError> = send_file(server, remote, &path, &folder.folder);
    ServerFlags::lower(&server.flags.retry_previous_transfer);

    result
}

/// The peer asks us to push one of our files to it (a pull, from its side).
pub(crate) fn handle_outbound_request(
    server: &Arc<FileServer>,
    request: OutboundFileRequest,
) -> Result<(), ServerError> {
    let path = PathBuf::from(&request.file_path);
    server
        .events
        .emit(ServerEvent::ReceivedOutboundFileTransferRequest {
            file_path: path.clone(),
            remote_folder: request.remote_folder.clone(),
        });

    let requestor: SocketAddr = socket::parse_endpoint(&request.sender_ip, request.sender_port)?;
    if !path.is_file() {
        tracing::warn!(path = %path.display(), "Requested file does not exist, rejecting");
        let (self_ip, self_port) = server.self_endpoint();
        server.send_framed(
            requestor,
            &protocol::encode_endpoint(MessageType::FileTransferRejected, &self_ip, self_port),
        )?;
        return Ok(());
    }

    send_file(server, requestor, &path, &request.remote_folder)
}

/// Issued by the receiving side of a stalled inbound transfer: ask the
/// original sender to start over.
pub(crate) fn request_retry(server: &FileServer) -> Result<(), ServerError> {
    let peer: SocketAddr = server
        .state
        .lock()
        .expect("state lock poisoned")
        .retry_peer
        .ok_or(TransferError::NothingToRetry)?;
    let (self_ip, self_port) = server.self_endpoint();
    let folder: String = server.config.transfer_folder.to_string_lossy().into_owned();

    tracing::info!(to = %peer, "Requesting transfer retry");
    server.send_framed(
        peer,
        &protocol::encode_folder(
            MessageType::RetryOutboundFileTransfer,
            &self_ip,
            self_port,
            &folder,
        ),
    )
}

/// Streams the whole file, then waits for the receiver's handshake.
fn stream_file_bytes(server: &Arc<FileServer>, mut stream: TcpStream) -> Result<(), ServerError> {
    let (path, file_size) = {
        let state = server.state.lock().expect("state lock poisoned");
        let path: PathBuf = state
            .outgoing_file_path
            .clone()
            .ok_or(TransferError::NoPendingTransfer)?;
        (path, state.outgoing_file_size)
    };

    server.events.emit(ServerEvent::SendFileBytesStarted {
        file_path: path.clone(),
        file_size: file_size as i64,
    });

    let buffer_size: usize = server.config.buffer_size;
    let per_chunk_events: bool = file_size <= (PER_CHUNK_EVENT_LIMIT * buffer_size) as u64;
    let mut file: BufReader<File> =
        BufReader::new(File::open(&path).map_err(TransferError::File)?);
    let mut chunk: Vec<u8> = vec![0; buffer_size];
    let mut bytes_remaining: u64 = file_size;
    let mut last_reported: f64 = 0.0;

    while bytes_remaining > 0 {
        // The pump raises this flag when the peer sends FileTransferStalled.
        if ServerFlags::is_set(&server.flags.outbound_stalled) {
            server.events.emit(ServerEvent::StalledByPeer);
            return Err(TransferError::StalledByPeer.into());
        }

        let want: usize = min(buffer_size as u64, bytes_remaining) as usize;
        file.read_exact(&mut chunk[..want])
            .map_err(TransferError::File)?;
        socket::send_all(&mut stream, &chunk[..want], server.config.send_timeout())
            .map_err(TransferError::from)?;
        bytes_remaining -= want as u64;

        if per_chunk_events {
            server.events.emit(ServerEvent::SentFileChunkToClient {
                bytes_sent: want,
                bytes_remaining: bytes_remaining as i64,
            });
        }
        if file_size > 0 {
            let percent_complete: f64 = (file_size - bytes_remaining) as f64 / file_size as f64;
            if percent_complete - last_reported > server.config.transfer_update_interval {
                last_reported = percent_complete;
                server
                    .events
                    .emit(ServerEvent::UpdateFileTransferProgress { percent_complete });
            }
        }
    }

    if let Ok(mut state) = server.state.lock() {
        state.last_bytes_sent = file_size;
    }

    // Completion handshake, on the same socket the bytes went out on.
    let mut confirmation: [u8; HANDSHAKE.len()] = [0; HANDSHAKE.len()];
    socket::receive_exact(
        &mut stream,
        &mut confirmation,
        server.config.receive_timeout(),
    )
    .map_err(TransferError::from)?;

    if confirmation != HANDSHAKE {
        return Err(TransferError::ConfirmationMismatch {
            expected: String::from_utf8_lossy(HANDSHAKE).into_owned(),
            received: String::from_utf8_lossy(&confirmation).into_owned(),
        }
        .into());
    }

    server.events.emit(ServerEvent::ReceivedConfirmationMessage);
    server.events.emit(ServerEvent::SendFileBytesComplete);
    tracing::info!(path = %path.display(), file_size, "Outbound transfer complete");

    Ok(())
}
