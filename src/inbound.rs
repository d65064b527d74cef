//! The file receive pipeline and the stall monitor.
//!
//! An inbound transfer rides the connection that delivered its request:
//! the receiver answers the sender's listener with accept or reject, then
//! drains the framing carry buffer and reads the remaining bytes off the
//! original stream. The sender may have coalesced the head of the file with
//! the request frame, which is exactly what the carry buffer preserves.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::net::{SocketAddr, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::instrument;

use crate::core::FileServer;
use crate::error::{ServerError, SocketError, TransferError};
use crate::events::ServerEvent;
use crate::framing::FrameReader;
use crate::protocol::{self, InboundFileRequest, MessageType, HANDSHAKE};
use crate::socket;
use crate::state::ServerFlags;

/// Small files additionally log every socket read.
const PER_READ_EVENT_LIMIT: usize = 10;

/// Handles an `InboundFileTransferRequest`: reject if the file exists,
/// otherwise accept and drain the byte stream into the transfer folder.
#[instrument(name = "receive_file", skip_all, fields(path = %request.local_path))]
pub(crate) fn receive_file(
    server: &Arc<FileServer>,
    request: InboundFileRequest,
    stream: &mut TcpStream,
    reader: &mut FrameReader,
) -> Result<(), ServerError> {
    let path = PathBuf::from(&request.local_path);
    let file_size: u64 = u64::try_from(request.file_size).unwrap_or(0);
    let sender: SocketAddr = socket::parse_endpoint(&request.sender_ip, request.sender_port)?;
    let (self_ip, self_port) = server.self_endpoint();

    server
        .events
        .emit(ServerEvent::ReceivedInboundFileTransferRequest {
            file_path: path.clone(),
            file_size: request.file_size,
        });

    // 1. Reject when the destination already exists; no receive loop runs.
    if path.exists() {
        tracing::warn!("Destination file exists, rejecting transfer");
        server.events.emit(ServerEvent::RejectedFileTransfer {
            file_path: path.clone(),
        });
        server.send_framed(
            sender,
            &protocol::encode_endpoint(MessageType::FileTransferRejected, &self_ip, self_port),
        )?;
        return Ok(());
    }

    // 2. Arm the transfer state before telling the sender to stream.
    ServerFlags::lower(&server.flags.inbound_stalled);
    server.flags.transfer_in_progress.store(true, Ordering::SeqCst);
    server.progress.reset();
    {
        let mut state = server.state.lock().expect("state lock poisoned");
        state.begin_inbound(path.clone(), file_size, sender);
    }

    server.events.emit(ServerEvent::AcceptedFileTransfer {
        file_path: path.clone(),
        file_size: request.file_size,
    });
    server.send_framed(
        sender,
        &protocol::encode_endpoint(MessageType::FileTransferAccepted, &self_ip, self_port),
    )?;

    // 3. Drain the byte stream into the file.
    let result: Result<(), ServerError> = receive_file_bytes(server, &path, file_size, stream, reader);

    server.flags.transfer_in_progress.store(false, Ordering::SeqCst);
    if let Ok(mut state) = server.state.lock() {
        state.last_bytes_received = server.progress.total();
    }

    match result {
        Ok(()) => {
            // 4. Completion handshake on the same socket.
            socket::send_all(stream, HANDSHAKE, server.config.send_timeout())?;
            server.events.emit(ServerEvent::ReceiveFileBytesComplete {
                file_path: path,
                file_size: request.file_size,
            });
            Ok(())
        }
        Err(err) => {
            // A stalled or broken transfer leaves no partial file behind;
            // a retry re-sends from the start and must not be rejected as
            // "already exists".
            let _ = fs::remove_file(&path);
            Err(err)
        }
    }
}

fn receive_file_bytes(
    server: &Arc<FileServer>,
    path: &PathBuf,
    file_size: u64,
    stream: &mut TcpStream,
    reader: &mut FrameReader,
) -> Result<(), ServerError> {
    server.events.emit(ServerEvent::ReceiveFileBytesStarted {
        file_path: path.clone(),
        file_size: file_size as i64,
    });

    let buffer_size: usize = server.config.buffer_size;
    let per_read_events: bool = file_size <= (PER_READ_EVENT_LIMIT * buffer_size) as u64;
    let mut file: BufWriter<File> = BufWriter::new(File::create(path)?);
    let mut total: u64 = 0;
    let mut last_reported: f64 = 0.0;

    // The carry buffer holds the verbatim head of the file stream whenever
    // the sender coalesced it with the request frame. It must be consumed
    // before any fresh socket read.
    while total < file_size {
        let want: usize = buffer_size.min((file_size - total) as usize);
        let carried: Vec<u8> = reader.drain_carry(want);
        if carried.is_empty() {
            break;
        }
        file.write_all(&carried)?;
        total += carried.len() as u64;
        server.progress.add(carried.len() as u64);
        report_progress(
            server,
            carried.len(),
            total,
            file_size,
            per_read_events,
            &mut last_reported,
        );
    }

    let mut chunk: Vec<u8> = vec![0; buffer_size];
    while total < file_size {
        if ServerFlags::is_set(&server.flags.inbound_stalled) {
            return Err(stall_exit(server, total));
        }

        let want: usize = buffer_size.min((file_size - total) as usize);
        match socket::receive(stream, &mut chunk[..want], server.config.receive_timeout()) {
            Ok(n) => {
                file.write_all(&chunk[..n])?;
                total += n as u64;
                server.progress.add(n as u64);
                report_progress(server, n, total, file_size, per_read_events, &mut last_reported);
            }
            // A quiet socket is not an error by itself; the stall monitor
            // decides when the peer has given up.
            Err(SocketError::Timeout(_)) => continue,
            Err(err) => return Err(TransferError::from(err).into()),
        }
    }

    file.flush()?;
    Ok(())
}

/// Notifies the sender that the transfer stalled and reports the abort.
fn stall_exit(server: &Arc<FileServer>, received: u64) -> ServerError {
    tracing::warn!(%received, "Inbound transfer stalled, notifying sender");
    server.events.emit(ServerEvent::FileTransferStalled);

    let (self_ip, self_port) = server.self_endpoint();
    let sender: Option<SocketAddr> = server
        .state
        .lock()
        .expect("state lock poisoned")
        .retry_peer;
    if let Some(sender) = sender {
        if let Err(err) = server.send_framed(
            sender,
            &protocol::encode_endpoint(MessageType::FileTransferStalled, &self_ip, self_port),
        ) {
            tracing::error!("Failed to notify sender of the stall: {}", err);
        }
    }

    TransferError::Stalled.into()
}

fn report_progress(
    server: &Arc<FileServer>,
    bytes_received: usize,
    total: u64,
    file_size: u64,
    per_read_events: bool,
    last_reported: &mut f64,
) {
    if per_read_events {
        server.events.emit(ServerEvent::ReceivedFileBytesFromSocket {
            bytes_received,
            total_received: total as i64,
        });
    }
    if file_size == 0 {
        return;
    }

    let percent_complete: f64 = total as f64 / file_size as f64;
    if percent_complete - *last_reported > server.config.transfer_update_interval {
        *last_reported = percent_complete;
        server
            .events
            .emit(ServerEvent::UpdateFileTransferProgress { percent_complete });
    }
}

/// Watches the progress counter on its own thread and raises
/// `inbound_stalled` when an active transfer stops making byte progress.
pub struct StallMonitor {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl StallMonitor {
    const POLL_INTERVAL: Duration = Duration::from_millis(50);

    pub(crate) fn spawn(server: Arc<FileServer>) -> Self {
        let stop: Arc<AtomicBool> = Arc::new(AtomicBool::new(false));
        let stop_flag: Arc<AtomicBool> = Arc::clone(&stop);

        let thread: JoinHandle<()> = thread::spawn(move || {
            let span = tracing::info_span!("stall_monitor");
            let _guard = span.enter();

            let stall_timeout: Duration = server.config.stall_timeout();
            let mut last_total: u64 = server.progress.total();
            let mut last_change: Instant = Instant::now();

            while !stop_flag.load(Ordering::SeqCst) {
                thread::sleep(Self::POLL_INTERVAL);

                if !ServerFlags::is_set(&server.flags.transfer_in_progress) {
                    last_total = server.progress.total();
                    last_change = Instant::now();
                    continue;
                }

                let total: u64 = server.progress.total();
                if total != last_total {
                    last_total = total;
                    last_change = Instant::now();
                } else if last_change.elapsed() >= stall_timeout {
                    if ServerFlags::raise(&server.flags.inbound_stalled) {
                        tracing::warn!(bytes = total, "No transfer progress, flagging stall");
                    }
                    last_change = Instant::now();
                }
            }
        });

        Self {
            stop,
            thread: Some(thread),
        }
    }

    pub fn stop(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
