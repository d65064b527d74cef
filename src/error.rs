use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors produced by the socket primitives.
///
/// Underlying OS errors are collapsed into this small set so that handlers
/// never have to inspect raw `io::ErrorKind`s.
#[derive(Debug, Error)]
pub enum SocketError {
    #[error("operation timed out after {0} ms")]
    Timeout(u64),

    #[error("connection refused by remote host")]
    ConnectionRefused,

    #[error("connection reset by remote host")]
    ConnectionReset,

    #[error("remote host closed the connection")]
    PeerClosed,

    #[error("socket error: {0}")]
    Io(String),
}

/// Errors produced while framing messages off the wire.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("stream ended before a complete length prefix was read")]
    TruncatedLength,

    #[error("payload truncated: expected {expected} bytes, got {received}")]
    TruncatedPayload { expected: usize, received: usize },

    #[error("unknown message type code: {0}")]
    UnknownType(u32),

    #[error("payload string is not valid UTF-8")]
    InvalidString,

    #[error(transparent)]
    Socket(#[from] SocketError),
}

/// Errors produced by the file transfer pipelines.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("local file does not exist: {0}")]
    FileMissing(PathBuf),

    #[error("inbound transfer stalled, peer notified")]
    Stalled,

    #[error("outbound transfer cancelled: peer reported a stall")]
    StalledByPeer,

    #[error("confirmation mismatch: expected {expected:?}, got {received:?}")]
    ConfirmationMismatch { expected: String, received: String },

    #[error("no outbound transfer on record to retry")]
    NothingToRetry,

    #[error("no pending outbound transfer for this acceptance")]
    NoPendingTransfer,

    #[error("file I/O failed: {0}")]
    File(#[from] io::Error),

    #[error(transparent)]
    Socket(#[from] SocketError),
}

/// Top-level error type of the request engine.
///
/// Only `Bind` and `Accept` are fatal to the request pump; every other
/// variant is reported to the event stream and the pump keeps running.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind listener: {0}")]
    Bind(#[source] io::Error),

    #[error("accept loop failed: {0}")]
    Accept(#[source] io::Error),

    #[error("request {0} was already processed")]
    AlreadyProcessed(u32),

    #[error("no request with id {0}")]
    UnknownRequestId(u32),

    #[error("another request is currently being processed")]
    NotIdle,

    #[error("request requires an open peer connection but none is available")]
    MissingConnection,

    #[error(transparent)]
    Socket(#[from] SocketError),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error("file I/O failed: {0}")]
    File(#[from] io::Error),
}
