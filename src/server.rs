use std::path::PathBuf;
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::time::Duration;
use std::{fs, process, thread};

use clap::{Parser, ValueHint};
use tracing_subscriber::EnvFilter;

use file_peer::config::{
    ServerConfig, DEFAULT_BUFFER_SIZE, DEFAULT_PORT, DEFAULT_STALL_TIMEOUT_MS, DEFAULT_TIMEOUT_MS,
};
use file_peer::core::FileServer;
use file_peer::discovery::Cidr;
use file_peer::error::ServerError;
use file_peer::events::EventRecord;

#[derive(Parser, Debug)]
#[command(version = "1.0", about = "Peer-to-peer file transfer server")]
struct Args {
    /// Name this peer reports to other servers
    #[arg(short = 'n', long = "name", default_value = "file-peer")]
    name: String,

    /// Port to listen on (0 picks an ephemeral port)
    #[arg(short = 'p', long = "port", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Folder served to peers; incoming files land here too
    #[arg(short = 'd', long = "dir", value_hint = ValueHint::DirPath, default_value = "transfer")]
    transfer_folder: PathBuf,

    /// Preferred subnet for local address discovery, e.g. 192.168.2.0/24
    #[arg(long = "cidr")]
    cidr: Option<Cidr>,

    /// Socket chunk size in bytes
    #[arg(long = "buffer-size", default_value_t = DEFAULT_BUFFER_SIZE)]
    buffer_size: usize,

    /// Connect/send/receive timeout in milliseconds
    #[arg(long = "timeout", default_value_t = DEFAULT_TIMEOUT_MS)]
    timeout_ms: u64,

    /// Inbound transfer stall timeout in milliseconds
    #[arg(long = "stall-timeout", default_value_t = DEFAULT_STALL_TIMEOUT_MS)]
    stall_timeout_ms: u64,
}

impl Args {
    fn into_config(self) -> ServerConfig {
        let mut config = ServerConfig::new(self.name, self.port, self.transfer_folder);
        config.cidr_hint = self.cidr;
        config.buffer_size = self.buffer_size;
        config.connect_timeout_ms = self.timeout_ms;
        config.send_timeout_ms = self.timeout_ms;
        config.receive_timeout_ms = self.timeout_ms;
        config.stall_timeout_ms = self.stall_timeout_ms;
        config
    }
}

fn main() -> Result<(), ServerError> {
    if cfg!(not(target_family = "unix")) {
        eprintln!("This program is intended for Unix-like systems only.");
        process::exit(1);
    }

    tracing_subscriber::fmt()
        .compact()
        .with_target(false)
        .with_env_filter(EnvFilter::from_default_env()) // RUST_LOG env var by default
        .init();

    let args = Args::parse();
    tracing::debug!(?args, "Parsed arguments");

    fs::create_dir_all(&args.transfer_folder)?;
    let (server, events) = FileServer::new(args.into_config());

    spawn_event_logger(events);
    spawn_queue_drainer(Arc::clone(&server));

    server.run()
}

/// Surfaces engine events in the log.
fn spawn_event_logger(events: Receiver<EventRecord>) {
    thread::spawn(move || {
        while let Ok(record) = events.recv() {
            match record.request_id {
                Some(id) => tracing::info!(request = id, event = ?record.event),
                None => tracing::info!(event = ?record.event),
            }
        }
    });
}

/// Without an interactive host, queued requests are processed as they come.
fn spawn_queue_drainer(server: Arc<FileServer>) {
    thread::spawn(move || loop {
        if server.pending_count() > 0 {
            if let Err(err) = server.process_next() {
                tracing::error!("Failed to process queued request: {}", err);
            }
        }
        thread::sleep(Duration::from_millis(250));
    });
}
