//! Typed message payloads and their wire codecs.
//!
//! Every payload begins with a 4-byte little-endian type code followed by a
//! type-specific body. All integers are little-endian; strings are UTF-8
//! prefixed by a 4-byte byte length. The enclosing length prefix is applied
//! by the framing layer, not here.

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::FrameError;

/// The literal confirmation string a receiver sends, unframed, after the
/// last byte of a successful inbound transfer.
pub const HANDSHAKE: &[u8] = b"handshake";

/// Wire codes of every message the protocol speaks. Values are stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MessageType {
    TextMessage = 1,
    InboundFileTransferRequest = 2,
    OutboundFileTransferRequest = 3,
    FileTransferAccepted = 4,
    FileTransferRejected = 5,
    FileTransferStalled = 6,
    RetryOutboundFileTransfer = 7,
    FileListRequest = 8,
    FileListResponse = 9,
    NoFilesAvailableForDownload = 10,
    RequestedFolderDoesNotExist = 11,
    ServerInfoRequest = 12,
    ServerInfoResponse = 13,
    ShutdownServerCommand = 14,
}

impl MessageType {
    /// Requests the pump must dispatch as soon as they are framed.
    ///
    /// Text messages and file list requests may sit in the queue until the
    /// host processes them explicitly; everything else either continues an
    /// in-flight transfer or is a response the caller is blocked on.
    pub fn is_immediate(self) -> bool {
        !matches!(self, Self::TextMessage | Self::FileListRequest)
    }
}

impl TryFrom<u32> for MessageType {
    type Error = FrameError;

    fn try_from(code: u32) -> Result<Self, Self::Error> {
        match code {
            1 => Ok(Self::TextMessage),
            2 => Ok(Self::InboundFileTransferRequest),
            3 => Ok(Self::OutboundFileTransferRequest),
            4 => Ok(Self::FileTransferAccepted),
            5 => Ok(Self::FileTransferRejected),
            6 => Ok(Self::FileTransferStalled),
            7 => Ok(Self::RetryOutboundFileTransfer),
            8 => Ok(Self::FileListRequest),
            9 => Ok(Self::FileListResponse),
            10 => Ok(Self::NoFilesAvailableForDownload),
            11 => Ok(Self::RequestedFolderDoesNotExist),
            12 => Ok(Self::ServerInfoRequest),
            13 => Ok(Self::ServerInfoResponse),
            14 => Ok(Self::ShutdownServerCommand),
            other => Err(FrameError::UnknownType(other)),
        }
    }
}

/// `TextMessage` body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextPayload {
    pub sender_ip: String,
    pub sender_port: u32,
    pub text: String,
}

/// `InboundFileTransferRequest` body: "you have an inbound file transfer".
/// The file bytes follow on the same connection once the receiver accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundFileRequest {
    /// Full path the receiver should write, inside its transfer folder.
    pub local_path: String,
    pub file_size: i64,
    pub sender_ip: String,
    pub sender_port: u32,
}

/// `OutboundFileTransferRequest` body: "perform an outbound transfer to me".
/// The handler answers by starting a push toward the requestor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundFileRequest {
    /// Path of the requested file on the responder.
    pub file_path: String,
    pub file_size: i64,
    pub sender_ip: String,
    pub sender_port: u32,
    /// Folder on the requestor the file should land in.
    pub remote_folder: String,
}

/// Shared body of every message that carries only the sender's endpoint:
/// accepted/rejected/stalled notifications, server info requests, shutdown
/// commands and the two empty file-list responses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointPayload {
    pub sender_ip: String,
    pub sender_port: u32,
}

/// Shared body of `RetryOutboundFileTransfer` and `FileListRequest`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderPayload {
    pub sender_ip: String,
    pub sender_port: u32,
    pub folder: String,
}

/// `FileListResponse` body. `list` is `path "|" size` entries joined by
/// `"*"`, with no escaping. Paths containing either delimiter corrupt the
/// list; this is a known weakness of the wire format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileListPayload {
    pub sender_ip: String,
    pub sender_port: u32,
    pub folder: String,
    pub list: String,
}

/// `ServerInfoResponse` body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfoPayload {
    pub local_ip: String,
    pub port: u32,
    pub public_ip: String,
    pub folder: String,
}

/// A fully decoded payload, ready for dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    Text(TextPayload),
    InboundFileRequest(InboundFileRequest),
    OutboundFileRequest(OutboundFileRequest),
    Endpoint(EndpointPayload),
    Folder(FolderPayload),
    FileList(FileListPayload),
    ServerInfo(ServerInfoPayload),
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

struct PayloadWriter {
    buf: Vec<u8>,
}

impl PayloadWriter {
    fn new(message_type: MessageType) -> Self {
        let mut buf: Vec<u8> = Vec::with_capacity(64);
        buf.write_u32::<LittleEndian>(message_type as u32)
            .expect("writing to a Vec cannot fail");
        Self { buf }
    }

    fn put_u32(mut self, value: u32) -> Self {
        self.buf
            .write_u32::<LittleEndian>(value)
            .expect("writing to a Vec cannot fail");
        self
    }

    fn put_i64(mut self, value: i64) -> Self {
        self.buf
            .write_i64::<LittleEndian>(value)
            .expect("writing to a Vec cannot fail");
        self
    }

    fn put_str(mut self, value: &str) -> Self {
        self.buf
            .write_u32::<LittleEndian>(value.len() as u32)
            .expect("writing to a Vec cannot fail");
        self.buf.extend_from_slice(value.as_bytes());
        self
    }

    fn finish(self) -> Vec<u8> {
        self.buf
    }
}

pub fn encode_text(sender_ip: &str, sender_port: u32, text: &str) -> Vec<u8> {
    PayloadWriter::new(MessageType::TextMessage)
        .put_str(sender_ip)
        .put_u32(sender_port)
        .put_str(text)
        .finish()
}

pub fn encode_inbound_file_request(
    local_path: &str,
    file_size: i64,
    sender_ip: &str,
    sender_port: u32,
) -> Vec<u8> {
    PayloadWriter::new(MessageType::InboundFileTransferRequest)
        .put_str(local_path)
        .put_i64(file_size)
        .put_str(sender_ip)
        .put_u32(sender_port)
        .finish()
}

pub fn encode_outbound_file_request(
    file_path: &str,
    file_size: i64,
    sender_ip: &str,
    sender_port: u32,
    remote_folder: &str,
) -> Vec<u8> {
    PayloadWriter::new(MessageType::OutboundFileTransferRequest)
        .put_str(file_path)
        .put_i64(file_size)
        .put_str(sender_ip)
        .put_u32(sender_port)
        .put_str(remote_folder)
        .finish()
}

/// Encoder for every endpoint-only message type.
pub fn encode_endpoint(message_type: MessageType, sender_ip: &str, sender_port: u32) -> Vec<u8> {
    debug_assert!(matches!(
        message_type,
        MessageType::FileTransferAccepted
            | MessageType::FileTransferRejected
            | MessageType::FileTransferStalled
            | MessageType::ServerInfoRequest
            | MessageType::ShutdownServerCommand
            | MessageType::NoFilesAvailableForDownload
            | MessageType::RequestedFolderDoesNotExist
    ));
    PayloadWriter::new(message_type)
        .put_str(sender_ip)
        .put_u32(sender_port)
        .finish()
}

/// Encoder for `RetryOutboundFileTransfer` and `FileListRequest`.
pub fn encode_folder(
    message_type: MessageType,
    sender_ip: &str,
    sender_port: u32,
    folder: &str,
) -> Vec<u8> {
    debug_assert!(matches!(
        message_type,
        MessageType::RetryOutboundFileTransfer | MessageType::FileListRequest
    ));
    PayloadWriter::new(message_type)
        .put_str(sender_ip)
        .put_u32(sender_port)
        .put_str(folder)
        .finish()
}

pub fn encode_file_list(sender_ip: &str, sender_port: u32, folder: &str, list: &str) -> Vec<u8> {
    PayloadWriter::new(MessageType::FileListResponse)
        .put_str(sender_ip)
        .put_u32(sender_port)
        .put_str(folder)
        .put_str(list)
        .finish()
}

pub fn encode_server_info(local_ip: &str, port: u32, public_ip: &str, folder: &str) -> Vec<u8> {
    PayloadWriter::new(MessageType::ServerInfoResponse)
        .put_str(local_ip)
        .put_u32(port)
        .put_str(public_ip)
        .put_str(folder)
        .finish()
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

struct PayloadReader<'a> {
    cursor: Cursor<&'a [u8]>,
}

impl<'a> PayloadReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self {
            cursor: Cursor::new(data),
        }
    }

    fn remaining(&self) -> usize {
        let len: usize = self.cursor.get_ref().len();
        len.saturating_sub(self.cursor.position() as usize)
    }

    fn truncated(&self, expected: usize) -> FrameError {
        FrameError::TruncatedPayload {
            expected,
            received: self.remaining(),
        }
    }

    fn get_u32(&mut self) -> Result<u32, FrameError> {
        let expected: usize = 4;
        if self.remaining() < expected {
            return Err(self.truncated(expected));
        }
        Ok(self
            .cursor
            .read_u32::<LittleEndian>()
            .expect("length checked above"))
    }

    fn get_i64(&mut self) -> Result<i64, FrameError> {
        let expected: usize = 8;
        if self.remaining() < expected {
            return Err(self.truncated(expected));
        }
        Ok(self
            .cursor
            .read_i64::<LittleEndian>()
            .expect("length checked above"))
    }

    fn get_str(&mut self) -> Result<String, FrameError> {
        let len: usize = self.get_u32()? as usize;
        if self.remaining() < len {
            return Err(self.truncated(len));
        }
        let pos: usize = self.cursor.position() as usize;
        let bytes: &[u8] = &self.cursor.get_ref()[pos..pos + len];
        let text: String =
            String::from_utf8(bytes.to_vec()).map_err(|_| FrameError::InvalidString)?;
        self.cursor.set_position((pos + len) as u64);
        Ok(text)
    }
}

/// Reads the leading type code without consuming the body.
pub fn peek_type(data: &[u8]) -> Result<MessageType, FrameError> {
    let mut reader = PayloadReader::new(data);
    MessageType::try_from(reader.get_u32()?)
}

/// Decodes a complete payload (type code plus body) into a typed record.
pub fn decode_payload(data: &[u8]) -> Result<(MessageType, Body), FrameError> {
    let mut reader = PayloadReader::new(data);
    let message_type: MessageType = MessageType::try_from(reader.get_u32()?)?;

    let body: Body = match message_type {
        MessageType::TextMessage => Body::Text(TextPayload {
            sender_ip: reader.get_str()?,
            sender_port: reader.get_u32()?,
            text: reader.get_str()?,
        }),
        MessageType::InboundFileTransferRequest => Body::InboundFileRequest(InboundFileRequest {
            local_path: reader.get_str()?,
            file_size: reader.get_i64()?,
            sender_ip: reader.get_str()?,
            sender_port: reader.get_u32()?,
        }),
        MessageType::OutboundFileTransferRequest => {
            Body::OutboundFileRequest(OutboundFileRequest {
                file_path: reader.get_str()?,
                file_size: reader.get_i64()?,
                sender_ip: reader.get_str()?,
                sender_port: reader.get_u32()?,
                remote_folder: reader.get_str()?,
            })
        }
        MessageType::FileTransferAccepted
        | MessageType::FileTransferRejected
        | MessageType::FileTransferStalled
        | MessageType::ServerInfoRequest
        | MessageType::ShutdownServerCommand
        | MessageType::NoFilesAvailableForDownload
        | MessageType::RequestedFolderDoesNotExist => Body::Endpoint(EndpointPayload {
            sender_ip: reader.get_str()?,
            sender_port: reader.get_u32()?,
        }),
        MessageType::RetryOutboundFileTransfer | MessageType::FileListRequest => {
            Body::Folder(FolderPayload {
                sender_ip: reader.get_str()?,
                sender_port: reader.get_u32()?,
                folder: reader.get_str()?,
            })
        }
        MessageType::FileListResponse => Body::FileList(FileListPayload {
            sender_ip: reader.get_str()?,
            sender_port: reader.get_u32()?,
            folder: reader.get_str()?,
            list: reader.get_str()?,
        }),
        MessageType::ServerInfoResponse => Body::ServerInfo(ServerInfoPayload {
            local_ip: reader.get_str()?,
            port: reader.get_u32()?,
            public_ip: reader.get_str()?,
            folder: reader.get_str()?,
        }),
    };

    Ok((message_type, body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_message_roundtrip() {
        // GIVEN
        let payload: Vec<u8> = encode_text("192.168.2.11", 5001, "hello there");
        // WHEN
        let (message_type, body) = decode_payload(&payload).unwrap();
        // THEN
        assert_eq!(message_type, MessageType::TextMessage);
        assert_eq!(
            body,
            Body::Text(TextPayload {
                sender_ip: "192.168.2.11".into(),
                sender_port: 5001,
                text: "hello there".into(),
            })
        );
    }

    #[test]
    fn test_inbound_file_request_roundtrip() {
        let payload: Vec<u8> =
            encode_inbound_file_request("/tmp/in/a.bin", 3, "127.0.0.1", 5001);
        let (message_type, body) = decode_payload(&payload).unwrap();

        assert_eq!(message_type, MessageType::InboundFileTransferRequest);
        assert_eq!(
            body,
            Body::InboundFileRequest(InboundFileRequest {
                local_path: "/tmp/in/a.bin".into(),
                file_size: 3,
                sender_ip: "127.0.0.1".into(),
                sender_port: 5001,
            })
        );
    }

    #[test]
    fn test_outbound_file_request_roundtrip() {
        let payload: Vec<u8> =
            encode_outbound_file_request("/srv/big.iso", 1 << 33, "10.0.0.2", 6000, "/tmp/in");
        let (message_type, body) = decode_payload(&payload).unwrap();

        assert_eq!(message_type, MessageType::OutboundFileTransferRequest);
        assert_eq!(
            body,
            Body::OutboundFileRequest(OutboundFileRequest {
                file_path: "/srv/big.iso".into(),
                file_size: 1 << 33,
                sender_ip: "10.0.0.2".into(),
                sender_port: 6000,
                remote_folder: "/tmp/in".into(),
            })
        );
    }

    #[test]
    fn test_endpoint_payload_roundtrip_for_every_carrier() {
        let carriers: [MessageType; 7] = [
            MessageType::FileTransferAccepted,
            MessageType::FileTransferRejected,
            MessageType::FileTransferStalled,
            MessageType::ServerInfoRequest,
            MessageType::ShutdownServerCommand,
            MessageType::NoFilesAvailableForDownload,
            MessageType::RequestedFolderDoesNotExist,
        ];

        for carrier in carriers {
            let payload: Vec<u8> = encode_endpoint(carrier, "127.0.0.1", 5002);
            let (message_type, body) = decode_payload(&payload).unwrap();

            assert_eq!(message_type, carrier);
            assert_eq!(
                body,
                Body::Endpoint(EndpointPayload {
                    sender_ip: "127.0.0.1".into(),
                    sender_port: 5002,
                })
            );
        }
    }

    #[test]
    fn test_file_list_response_roundtrip() {
        let list: &str = "a.bin|3*b.iso|1024";
        let payload: Vec<u8> = encode_file_list("127.0.0.1", 5002, "/srv", list);
        let (message_type, body) = decode_payload(&payload).unwrap();

        assert_eq!(message_type, MessageType::FileListResponse);
        assert_eq!(
            body,
            Body::FileList(FileListPayload {
                sender_ip: "127.0.0.1".into(),
                sender_port: 5002,
                folder: "/srv".into(),
                list: list.into(),
            })
        );
    }

    #[test]
    fn test_server_info_response_roundtrip() {
        let payload: Vec<u8> = encode_server_info("192.168.2.11", 5001, "93.184.216.34", "/srv");
        let (message_type, body) = decode_payload(&payload).unwrap();

        assert_eq!(message_type, MessageType::ServerInfoResponse);
        assert_eq!(
            body,
            Body::ServerInfo(ServerInfoPayload {
                local_ip: "192.168.2.11".into(),
                port: 5001,
                public_ip: "93.184.216.34".into(),
                folder: "/srv".into(),
            })
        );
    }

    #[test]
    fn test_unknown_type_code_is_rejected() {
        let mut payload: Vec<u8> = Vec::new();
        payload.extend_from_slice(&99u32.to_le_bytes());

        match decode_payload(&payload) {
            Err(FrameError::UnknownType(99)) => {}
            other => panic!("expected UnknownType(99), got {:?}", other),
        }
    }

    #[test]
    fn test_truncated_body_is_rejected() {
        // GIVEN a text payload with its tail cut off mid-string
        let full: Vec<u8> = encode_text("127.0.0.1", 5001, "hello");
        let truncated: &[u8] = &full[..full.len() - 2];
        // WHEN + THEN
        match decode_payload(truncated) {
            Err(FrameError::TruncatedPayload { .. }) => {}
            other => panic!("expected TruncatedPayload, got {:?}", other),
        }
    }

    #[test]
    fn test_empty_strings_survive_roundtrip() {
        let payload: Vec<u8> = encode_text("", 0, "");
        let (_, body) = decode_payload(&payload).unwrap();

        assert_eq!(
            body,
            Body::Text(TextPayload {
                sender_ip: String::new(),
                sender_port: 0,
                text: String::new(),
            })
        );
    }
}
