//! Core data records: received requests and peer identity.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::SystemTime;

use crate::events::EventRecord;
use crate::protocol::MessageType;

/// One framed request received off the wire.
///
/// Born in the framing step, mutated only by appending event log entries,
/// and moved to the archive once its handler returns.
#[derive(Debug)]
pub struct Message {
    /// Monotonically assigned on receipt, starting at 1. Never reused.
    pub id: u32,
    pub message_type: MessageType,
    /// The full payload as framed (type code + body), without the length
    /// prefix.
    pub data: Vec<u8>,
    /// Source address of the connection that delivered the request.
    pub remote_addr: SocketAddr,
    pub timestamp: SystemTime,
    /// Events the handler emitted while processing this request.
    pub event_log: Vec<EventRecord>,
}

impl Message {
    pub fn new(message_type: MessageType, data: Vec<u8>, remote_addr: SocketAddr) -> Self {
        Self {
            id: 0,
            message_type,
            data,
            remote_addr,
            timestamp: SystemTime::now(),
            event_log: Vec::new(),
        }
    }
}

/// Identity of a peer as this server knows it.
///
/// `session_ip` is whichever address was observed on the most recently
/// accepted connection; `local_ip` and `public_ip` are learned through the
/// server info exchange.
#[derive(Debug, Clone, Default)]
pub struct ServerInfo {
    pub name: String,
    pub session_ip: Option<IpAddr>,
    pub local_ip: Option<IpAddr>,
    pub public_ip: Option<IpAddr>,
    pub port: u16,
    pub transfer_folder: PathBuf,
}

impl PartialEq for ServerInfo {
    /// Two peers are the same server when their session address and port
    /// match; names and learned addresses are advisory.
    fn eq(&self, other: &Self) -> bool {
        self.session_ip == other.session_ip && self.port == other.port
    }
}

impl Eq for ServerInfo {}
