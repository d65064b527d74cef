use std::path::PathBuf;
use std::time::Duration;

use crate::discovery::Cidr;

pub const DEFAULT_PORT: u16 = 7878;
pub const DEFAULT_BUFFER_SIZE: usize = 8 * 1024;
pub const DEFAULT_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_STALL_TIMEOUT_MS: u64 = 5000;
/// Emit a progress event every 0.25% of the file.
pub const DEFAULT_UPDATE_INTERVAL: f64 = 0.0025;

/// Static configuration of a peer, assembled by the binaries from CLI
/// arguments. The engine itself never reads the environment.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Human-readable name reported in server info exchanges.
    pub name: String,
    /// Port the listener binds to. Port 0 asks the OS for an ephemeral port.
    pub port: u16,
    /// Preferred subnet for local IPv4 discovery.
    pub cidr_hint: Option<Cidr>,
    /// The single directory this peer serves files from and writes
    /// incoming files into.
    pub transfer_folder: PathBuf,
    /// Socket read/chunk size. Also bounds the framing carry buffer.
    pub buffer_size: usize,
    pub connect_timeout_ms: u64,
    pub send_timeout_ms: u64,
    pub receive_timeout_ms: u64,
    /// How long an inbound transfer may make no byte progress before the
    /// stall monitor fires.
    pub stall_timeout_ms: u64,
    /// Minimum fraction of the file between two progress events.
    pub transfer_update_interval: f64,
}

impl ServerConfig {
    pub fn new(name: impl Into<String>, port: u16, transfer_folder: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            port,
            cidr_hint: None,
            transfer_folder: transfer_folder.into(),
            buffer_size: DEFAULT_BUFFER_SIZE,
            connect_timeout_ms: DEFAULT_TIMEOUT_MS,
            send_timeout_ms: DEFAULT_TIMEOUT_MS,
            receive_timeout_ms: DEFAULT_TIMEOUT_MS,
            stall_timeout_ms: DEFAULT_STALL_TIMEOUT_MS,
            transfer_update_interval: DEFAULT_UPDATE_INTERVAL,
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_millis(self.stall_timeout_ms)
    }
}
