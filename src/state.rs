//! Shared mutable state: the transfer scratch pad and the atomic flag set.

use std::net::{SocketAddr, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::message::ServerInfo;

/// Working fields of the active transfer, reset at the start of each
/// outbound or inbound transfer.
#[derive(Default)]
pub struct ServerState {
    pub incoming_file_path: Option<PathBuf>,
    pub incoming_file_size: u64,
    /// Kept after a rejection or stall so a retry can re-enter the send
    /// pipeline; only the next outbound request overwrites it.
    pub outgoing_file_path: Option<PathBuf>,
    pub outgoing_file_size: u64,
    /// Folder on the receiving peer the outbound file should land in.
    pub outgoing_remote_folder: Option<String>,
    /// The connection that carried our transfer request, held open for the
    /// byte stream once the peer accepts.
    pub outgoing_stream: Option<TcpStream>,
    /// Where a stalled inbound transfer came from, for issuing a retry.
    pub retry_peer: Option<SocketAddr>,
    pub last_bytes_received: u64,
    pub last_bytes_sent: u64,
    /// What we know about the peer on the other end.
    pub remote: ServerInfo,
    /// File list most recently received from the peer.
    pub remote_files: Vec<(String, u64)>,
}

impl ServerState {
    /// Clears the outbound scratch for a fresh send. The previous outgoing
    /// path is intentionally replaced, not blanked, by the caller.
    pub fn begin_outbound(&mut self, path: PathBuf, size: u64, remote_folder: String) {
        self.outgoing_file_path = Some(path);
        self.outgoing_file_size = size;
        self.outgoing_remote_folder = Some(remote_folder);
        self.outgoing_stream = None;
        self.last_bytes_sent = 0;
    }

    pub fn begin_inbound(&mut self, path: PathBuf, size: u64, sender: SocketAddr) {
        self.incoming_file_path = Some(path);
        self.incoming_file_size = size;
        self.retry_peer = Some(sender);
        self.last_bytes_received = 0;
    }
}

/// Cross-task visibility flags.
///
/// The stall monitor and the transfer loops run on different threads from
/// the request pump, so every flag flip goes through compare-exchange.
#[derive(Default)]
pub struct ServerFlags {
    pub initialized: AtomicBool,
    pub listening: AtomicBool,
    pub idle: AtomicBool,
    pub transfer_in_progress: AtomicBool,
    pub inbound_stalled: AtomicBool,
    pub outbound_stalled: AtomicBool,
    pub shutdown_initiated: AtomicBool,
    pub retry_previous_transfer: AtomicBool,
    pub no_files_available: AtomicBool,
    pub requested_folder_missing: AtomicBool,
}

impl ServerFlags {
    pub fn new() -> Self {
        let flags = Self::default();
        flags.idle.store(true, Ordering::SeqCst);
        flags
    }

    /// Flips `flag` from `false` to `true`; returns whether this call won.
    pub fn raise(flag: &AtomicBool) -> bool {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Flips `flag` from `true` to `false`; returns whether this call won.
    pub fn lower(flag: &AtomicBool) -> bool {
        flag.compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn is_set(flag: &AtomicBool) -> bool {
        flag.load(Ordering::SeqCst)
    }
}

/// Byte counter the stall monitor samples while a transfer runs.
#[derive(Default)]
pub struct TransferProgress {
    bytes: AtomicU64,
}

impl TransferProgress {
    pub fn reset(&self) {
        self.bytes.store(0, Ordering::SeqCst);
    }

    pub fn add(&self, count: u64) {
        self.bytes.fetch_add(count, Ordering::SeqCst);
    }

    pub fn total(&self) -> u64 {
        self.bytes.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raise_and_lower_report_the_winning_transition() {
        let flags = ServerFlags::new();

        assert!(ServerFlags::raise(&flags.inbound_stalled));
        // Second raise loses: the flag is already up.
        assert!(!ServerFlags::raise(&flags.inbound_stalled));
        assert!(ServerFlags::is_set(&flags.inbound_stalled));

        assert!(ServerFlags::lower(&flags.inbound_stalled));
        assert!(!ServerFlags::lower(&flags.inbound_stalled));
    }

    #[test]
    fn test_new_server_starts_idle() {
        let flags = ServerFlags::new();
        assert!(ServerFlags::is_set(&flags.idle));
        assert!(!ServerFlags::is_set(&flags.listening));
    }

    #[test]
    fn test_progress_counter_accumulates() {
        let progress = TransferProgress::default();
        progress.add(100);
        progress.add(28);
        assert_eq!(progress.total(), 128);

        progress.reset();
        assert_eq!(progress.total(), 0);
    }
}
