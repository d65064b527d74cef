//! Engine events, delivered to two sinks: the per-request log attached to
//! each archived message, and a channel the host application drains.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Mutex;
use std::time::SystemTime;

use crate::protocol::MessageType;

/// Everything observable about the engine, as tagged variants.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    ServerStartedListening { addr: SocketAddr },
    ServerStoppedListening,
    ConnectionAccepted { remote: SocketAddr },
    ReceivedRequest { id: u32, message_type: MessageType, remote: SocketAddr },
    QueuedRequest { id: u32, message_type: MessageType },
    ProcessingRequest { id: u32, message_type: MessageType },
    RequestArchived { id: u32 },
    ReceivedTextMessage { text: String, remote_ip: String, remote_port: u32 },
    ReceivedInboundFileTransferRequest { file_path: PathBuf, file_size: i64 },
    ReceivedOutboundFileTransferRequest { file_path: PathBuf, remote_folder: String },
    AcceptedFileTransfer { file_path: PathBuf, file_size: i64 },
    RejectedFileTransfer { file_path: PathBuf },
    ClientAcceptedFileTransfer { remote_ip: String, remote_port: u32 },
    ClientRejectedFileTransfer { remote_ip: String, remote_port: u32 },
    SendFileBytesStarted { file_path: PathBuf, file_size: i64 },
    SentFileChunkToClient { bytes_sent: usize, bytes_remaining: i64 },
    SendFileBytesComplete,
    ReceiveFileBytesStarted { file_path: PathBuf, file_size: i64 },
    ReceivedFileBytesFromSocket { bytes_received: usize, total_received: i64 },
    UpdateFileTransferProgress { percent_complete: f64 },
    ReceiveFileBytesComplete { file_path: PathBuf, file_size: i64 },
    ReceivedConfirmationMessage,
    FileTransferStalled,
    StalledByPeer,
    ReceivedRetryRequest { remote_ip: String, remote_port: u32 },
    ReceivedServerInfo { local_ip: String, port: u32, public_ip: String, folder: String },
    ReceivedFileList { folder: String, files: Vec<(String, u64)> },
    NoFilesAvailableForDownload { remote_ip: String },
    RequestedFolderDoesNotExist { remote_ip: String },
    ShutdownRequested,
    ErrorOccurred { message: String },
}

/// One event, stamped and tagged with the request it belongs to.
#[derive(Debug, Clone)]
pub struct EventRecord {
    /// Id of the request being processed when the event fired, if any.
    pub request_id: Option<u32>,
    pub timestamp: SystemTime,
    pub event: ServerEvent,
}

/// Fan-out point for [`ServerEvent`]s.
///
/// Events are tagged with the id of the request currently being processed
/// so the archived log can be sliced per request. The observer side of the
/// channel may be dropped; emission never fails.
pub struct EventBus {
    observer: Sender<EventRecord>,
    /// 0 means "no request is active".
    active_request: AtomicU32,
    /// Records collected for the active request, drained on archive.
    log: Mutex<Vec<EventRecord>>,
}

impl EventBus {
    pub fn new() -> (Self, Receiver<EventRecord>) {
        let (tx, rx) = mpsc::channel();
        let bus = Self {
            observer: tx,
            active_request: AtomicU32::new(0),
            log: Mutex::new(Vec::new()),
        };
        (bus, rx)
    }

    pub fn set_active_request(&self, id: u32) {
        self.active_request.store(id, Ordering::SeqCst);
    }

    pub fn clear_active_request(&self) {
        self.active_request.store(0, Ordering::SeqCst);
    }

    /// Stamps, tags and fans out one event.
    pub fn emit(&self, event: ServerEvent) {
        let id: u32 = self.active_request.load(Ordering::SeqCst);
        let record = EventRecord {
            request_id: (id != 0).then_some(id),
            timestamp: SystemTime::now(),
            event,
        };

        if record.request_id.is_some() {
            self.log
                .lock()
                .expect("event log lock poisoned")
                .push(record.clone());
        }
        // The host may have dropped its receiver; that is not an error.
        let _ = self.observer.send(record);
    }

    /// Takes every record collected for the given request, in emission order.
    pub fn drain_log(&self, request_id: u32) -> Vec<EventRecord> {
        let mut log = self.log.lock().expect("event log lock poisoned");
        let (matching, rest): (Vec<EventRecord>, Vec<EventRecord>) = log
            .drain(..)
            .partition(|record| record.request_id == Some(request_id));
        *log = rest;
        matching
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_are_tagged_with_the_active_request() {
        let (bus, rx) = EventBus::new();

        bus.set_active_request(7);
        bus.emit(ServerEvent::ReceivedConfirmationMessage);
        bus.clear_active_request();
        bus.emit(ServerEvent::ServerStoppedListening);

        let first: EventRecord = rx.try_recv().unwrap();
        let second: EventRecord = rx.try_recv().unwrap();
        assert_eq!(first.request_id, Some(7));
        assert_eq!(second.request_id, None);
    }

    #[test]
    fn test_drain_log_returns_only_the_requested_slice() {
        let (bus, _rx) = EventBus::new();

        bus.set_active_request(1);
        bus.emit(ServerEvent::ReceivedConfirmationMessage);
        bus.set_active_request(2);
        bus.emit(ServerEvent::SendFileBytesComplete);
        bus.clear_active_request();

        let slice: Vec<EventRecord> = bus.drain_log(1);
        assert_eq!(slice.len(), 1);
        assert!(matches!(
            slice[0].event,
            ServerEvent::ReceivedConfirmationMessage
        ));

        // Records for request 2 are still there for its own drain.
        let slice: Vec<EventRecord> = bus.drain_log(2);
        assert_eq!(slice.len(), 1);
    }

    #[test]
    fn test_emit_survives_dropped_observer() {
        let (bus, rx) = EventBus::new();
        drop(rx);

        bus.emit(ServerEvent::ServerStoppedListening);
    }
}
