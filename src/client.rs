use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};
use std::{fs, process, thread};

use clap::{Parser, Subcommand, ValueHint};
use tracing_subscriber::EnvFilter;

use file_peer::config::ServerConfig;
use file_peer::core::FileServer;
use file_peer::error::ServerError;
use file_peer::events::{EventRecord, ServerEvent};

const OPERATION_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(version = "1.0", about = "One-shot driver for a file-peer server")]
struct Args {
    /// Address of the remote peer
    #[arg(short = 'a', long = "peer")]
    peer: SocketAddr,

    /// Port our own listener binds to for responses (0 picks one)
    #[arg(short = 'p', long = "port", default_value_t = 0)]
    port: u16,

    /// Local folder for received files
    #[arg(short = 'd', long = "dir", value_hint = ValueHint::DirPath, default_value = "downloads")]
    transfer_folder: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send a text message to the peer
    Text { message: String },
    /// Push a local file into a folder on the peer
    Push {
        file: PathBuf,
        #[arg(long = "remote-folder")]
        remote_folder: String,
    },
    /// Ask the peer to send one of its files here
    Pull { remote_path: String },
    /// List the files in a folder on the peer
    List { folder: String },
    /// Fetch the peer's server info
    Info,
}

fn main() -> Result<(), ServerError> {
    if cfg!(not(target_family = "unix")) {
        eprintln!("This program is intended for Unix-like systems only.");
        process::exit(1);
    }

    tracing_subscriber::fmt()
        .compact()
        .with_target(false)
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    tracing::debug!(?args, "Parsed arguments");

    fs::create_dir_all(&args.transfer_folder)?;
    let config = ServerConfig::new("file-peer-client", args.port, &args.transfer_folder);
    let (server, events) = FileServer::new(config);

    // Responses from the peer arrive at our own listener, so the full
    // engine runs for the duration of the operation.
    let pump: thread::JoinHandle<Result<(), ServerError>> = {
        let server: Arc<FileServer> = Arc::clone(&server);
        thread::spawn(move || server.run())
    };
    wait_for_listener(&server);

    let outcome: Result<(), ServerError> = run_command(&server, &events, args.peer, args.command);

    server.send_shutdown()?;
    pump.join().expect("pump thread panicked")?;

    outcome
}

fn wait_for_listener(server: &FileServer) {
    let deadline: Instant = Instant::now() + Duration::from_secs(5);
    while server.listen_addr().is_none() {
        if Instant::now() >= deadline {
            eprintln!("Listener failed to start in time.");
            process::exit(1);
        }
        thread::sleep(Duration::from_millis(10));
    }
}

fn run_command(
    server: &Arc<FileServer>,
    events: &Receiver<EventRecord>,
    peer: SocketAddr,
    command: Command,
) -> Result<(), ServerError> {
    match command {
        Command::Text { message } => {
            server.send_text(peer, &message)?;
            println!("Text message sent to {}.", peer);
            Ok(())
        }
        Command::Push {
            file,
            remote_folder,
        } => {
            server.send_file(peer, &file, &remote_folder)?;
            wait_for(events, |event| match event {
                ServerEvent::SendFileBytesComplete => {
                    println!("File delivered and confirmed.");
                    true
                }
                ServerEvent::ClientRejectedFileTransfer { .. } => {
                    println!("Peer rejected the transfer (file already exists there?).");
                    true
                }
                ServerEvent::ErrorOccurred { message } => {
                    eprintln!("Transfer failed: {}", message);
                    true
                }
                _ => false,
            })
        }
        Command::Pull { remote_path } => {
            server.request_file(peer, &remote_path)?;
            wait_for(events, |event| match event {
                ServerEvent::ReceiveFileBytesComplete {
                    file_path,
                    file_size,
                } => {
                    println!("Received {} ({} bytes).", file_path.display(), file_size);
                    true
                }
                ServerEvent::ClientRejectedFileTransfer { .. }
                | ServerEvent::RejectedFileTransfer { .. } => {
                    println!("Transfer was rejected.");
                    true
                }
                ServerEvent::ErrorOccurred { message } => {
                    eprintln!("Transfer failed: {}", message);
                    true
                }
                _ => false,
            })
        }
        Command::List { folder } => {
            server.request_file_list(peer, &folder)?;
            wait_for(events, |event| match event {
                ServerEvent::ReceivedFileList { folder, files } => {
                    println!("Files in {}:", folder);
                    for (path, size) in files {
                        println!("  {} ({} bytes)", path, size);
                    }
                    true
                }
                ServerEvent::NoFilesAvailableForDownload { .. } => {
                    println!("The folder has no files available for download.");
                    true
                }
                ServerEvent::RequestedFolderDoesNotExist { .. } => {
                    println!("The folder does not exist on the peer.");
                    true
                }
                _ => false,
            })
        }
        Command::Info => {
            server.request_server_info(peer)?;
            wait_for(events, |event| match event {
                ServerEvent::ReceivedServerInfo {
                    local_ip,
                    port,
                    public_ip,
                    folder,
                } => {
                    println!("Peer server info:");
                    println!("  local ip:        {}", local_ip);
                    println!("  port:            {}", port);
                    println!("  public ip:       {}", public_ip);
                    println!("  transfer folder: {}", folder);
                    true
                }
                _ => false,
            })
        }
    }
}

/// Drains events until `terminal` recognizes one, or the operation times
/// out.
fn wait_for(
    events: &Receiver<EventRecord>,
    mut terminal: impl FnMut(&ServerEvent) -> bool,
) -> Result<(), ServerError> {
    let deadline: Instant = Instant::now() + OPERATION_TIMEOUT;

    loop {
        let remaining: Duration = deadline.saturating_duration_since(Instant::now());
        match events.recv_timeout(remaining) {
            Ok(record) if terminal(&record.event) => return Ok(()),
            Ok(_) => continue,
            Err(RecvTimeoutError::Timeout) => {
                eprintln!("Timed out waiting for the peer.");
                process::exit(1);
            }
            Err(RecvTimeoutError::Disconnected) => return Ok(()),
        }
    }
}
