//! The listener and request pump.
//!
//! One peer connects at a time. Each accepted connection delivers exactly
//! one framed request, which is either dispatched on the spot or queued for
//! explicit processing. Inbound file bytes ride the same connection as the
//! request that announced them, so the dispatcher hands the open stream and
//! its framing carry buffer to the receive pipeline.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::instrument;

use crate::config::ServerConfig;
use crate::discovery;
use crate::error::ServerError;
use crate::events::{EventBus, EventRecord, ServerEvent};
use crate::framing::{self, FrameReader};
use crate::inbound::{self, StallMonitor};
use crate::message::{Message, ServerInfo};
use crate::metadata;
use crate::outbound;
use crate::protocol::{self, Body, MessageType};
use crate::queue::RequestQueue;
use crate::socket;
use crate::state::{ServerFlags, ServerState, TransferProgress};
use crate::worker::TransferWorker;

/// How long explicit processing waits for the engine to go idle before
/// giving up.
const IDLE_WAIT_LIMIT: Duration = Duration::from_millis(5000);

pub struct FileServer {
    pub(crate) config: ServerConfig,
    local_ip: Ipv4Addr,
    pub flags: ServerFlags,
    pub(crate) state: Mutex<ServerState>,
    pub(crate) queue: Mutex<RequestQueue>,
    pub(crate) events: EventBus,
    pub(crate) progress: TransferProgress,
    pub(crate) worker: TransferWorker,
    listen_addr: Mutex<Option<SocketAddr>>,
}

impl FileServer {
    /// Builds a peer and the event receiver the host drains.
    pub fn new(config: ServerConfig) -> (Arc<Self>, Receiver<EventRecord>) {
        let (events, receiver) = EventBus::new();
        let local_ip: Ipv4Addr = discovery::local_ipv4(config.cidr_hint.as_ref());

        let server: Arc<Self> = Arc::new(Self {
            config,
            local_ip,
            flags: ServerFlags::new(),
            state: Mutex::new(ServerState::default()),
            queue: Mutex::new(RequestQueue::new()),
            events,
            progress: TransferProgress::default(),
            worker: TransferWorker::new(),
            listen_addr: Mutex::new(None),
        });
        server.flags.initialized.store(true, Ordering::SeqCst);

        (server, receiver)
    }

    pub fn local_ip(&self) -> Ipv4Addr {
        self.local_ip
    }

    /// The bound listener address, once `run` has bound it.
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        *self.listen_addr.lock().expect("listen_addr lock poisoned")
    }

    pub fn port(&self) -> u16 {
        self.listen_addr().map_or(self.config.port, |addr| addr.port())
    }

    /// The `(ip, port)` pair this peer advertises inside payloads.
    pub(crate) fn self_endpoint(&self) -> (String, u32) {
        (self.local_ip.to_string(), u32::from(self.port()))
    }

    pub fn transfer_folder(&self) -> &Path {
        &self.config.transfer_folder
    }

    pub fn pending_count(&self) -> usize {
        self.queue.lock().expect("queue lock poisoned").pending_count()
    }

    pub fn pending_ids(&self) -> Vec<u32> {
        self.queue.lock().expect("queue lock poisoned").pending_ids()
    }

    /// Event log of an archived request, if that id has been processed.
    pub fn archived_events(&self, id: u32) -> Option<Vec<EventRecord>> {
        let queue = self.queue.lock().expect("queue lock poisoned");
        queue
            .archived()
            .iter()
            .find(|m| m.id == id)
            .map(|m| m.event_log.clone())
    }

    /// What this peer currently knows about the remote server.
    pub fn remote_info(&self) -> ServerInfo {
        self.state.lock().expect("state lock poisoned").remote.clone()
    }

    /// The file list most recently received from the peer.
    pub fn remote_files(&self) -> Vec<(String, u64)> {
        self.state
            .lock()
            .expect("state lock poisoned")
            .remote_files
            .clone()
    }

    // -----------------------------------------------------------------------
    // The pump
    // -----------------------------------------------------------------------

    /// Binds the listener and runs the request pump until a shutdown
    /// command arrives or the accept loop fails.
    pub fn run(self: &Arc<Self>) -> Result<(), ServerError> {
        let listener: TcpListener =
            TcpListener::bind((Ipv4Addr::UNSPECIFIED, self.config.port)).map_err(ServerError::Bind)?;
        let addr: SocketAddr = listener.local_addr().map_err(ServerError::Bind)?;

        *self.listen_addr.lock().expect("listen_addr lock poisoned") = Some(addr);
        self.flags.listening.store(true, Ordering::SeqCst);
        self.events.emit(ServerEvent::ServerStartedListening { addr });
        tracing::info!("Listening on {}...", addr);

        let monitor: StallMonitor = inbound::StallMonitor::spawn(Arc::clone(self));
        let result: Result<(), ServerError> = self.accept_loop(&listener);
        monitor.stop();

        self.flags.listening.store(false, Ordering::SeqCst);
        self.events.emit(ServerEvent::ServerStoppedListening);
        tracing::info!("Listener stopped");

        result
    }

    #[instrument(name = "pump", skip_all)]
    fn accept_loop(self: &Arc<Self>, listener: &TcpListener) -> Result<(), ServerError> {
        loop {
            if ServerFlags::is_set(&self.flags.shutdown_initiated) {
                return Ok(());
            }

            let (stream, peer) = listener.accept().map_err(ServerError::Accept)?;
            tracing::info!(peer_addr = ?peer, "Accepted connection");
            self.events.emit(ServerEvent::ConnectionAccepted { remote: peer });
            self.state
                .lock()
                .expect("state lock poisoned")
                .remote
                .session_ip = Some(peer.ip());

            // A failing handler never stops the pump; the connection is
            // dropped and the failure goes to the event stream.
            if let Err(err) = self.handle_connection(stream, peer) {
                tracing::error!("Failed to handle connection: {}", err);
                self.events.emit(ServerEvent::ErrorOccurred {
                    message: err.to_string(),
                });
            }

            if ServerFlags::is_set(&self.flags.shutdown_initiated) {
                return Ok(());
            }
        }
    }

    /// Frames one request off the connection, then dispatches or queues it.
    fn handle_connection(
        self: &Arc<Self>,
        mut stream: TcpStream,
        peer: SocketAddr,
    ) -> Result<(), ServerError> {
        stream
            .set_read_timeout(Some(self.config.receive_timeout()))
            .map_err(|e| socket::classify(e, self.config.receive_timeout_ms))?;

        let mut reader = FrameReader::new(self.config.buffer_size, self.config.receive_timeout_ms);
        let payload: Vec<u8> = reader.read_frame(&mut stream)?;
        let message_type: MessageType = protocol::peek_type(&payload)?;
        let message = Message::new(message_type, payload, peer);

        if message_type.is_immediate() {
            self.process_immediate(message, &mut stream, &mut reader)
        } else {
            let id: u32 = self
                .queue
                .lock()
                .expect("queue lock poisoned")
                .enqueue(message);
            self.events.emit(ServerEvent::QueuedRequest { id, message_type });
            tracing::debug!(%id, ?message_type, "Request queued for explicit processing");
            Ok(())
        }
    }

    fn process_immediate(
        self: &Arc<Self>,
        mut message: Message,
        stream: &mut TcpStream,
        reader: &mut FrameReader,
    ) -> Result<(), ServerError> {
        self.acquire_idle()?;
        message.id = self.queue.lock().expect("queue lock poisoned").assign_id();
        self.events.emit(ServerEvent::ReceivedRequest {
            id: message.id,
            message_type: message.message_type,
            remote: message.remote_addr,
        });

        self.events.set_active_request(message.id);
        let result: Result<(), ServerError> = self.dispatch(&message, Some((stream, reader)));
        self.finish_request(message, result);

        Ok(())
    }

    /// Processes the oldest queued request. Returns its id, or `None` when
    /// the queue is empty.
    pub fn process_next(self: &Arc<Self>) -> Result<Option<u32>, ServerError> {
        self.acquire_idle()?;
        let message: Message = match self
            .queue
            .lock()
            .expect("queue lock poisoned")
            .pop_next()
        {
            Some(message) => message,
            None => {
                self.flags.idle.store(true, Ordering::SeqCst);
                return Ok(None);
            }
        };

        let id: u32 = message.id;
        self.run_deferred(message);
        Ok(Some(id))
    }

    /// Processes a specific queued request. Refuses while another request
    /// is in flight, and reports already-processed and unknown ids.
    pub fn process_by_id(self: &Arc<Self>, id: u32) -> Result<(), ServerError> {
        if !ServerFlags::lower(&self.flags.idle) {
            return Err(ServerError::NotIdle);
        }
        let message: Message = match self
            .queue
            .lock()
            .expect("queue lock poisoned")
            .take_by_id(id)
        {
            Ok(message) => message,
            Err(err) => {
                self.flags.idle.store(true, Ordering::SeqCst);
                return Err(err);
            }
        };

        self.run_deferred(message);
        Ok(())
    }

    fn run_deferred(self: &Arc<Self>, message: Message) {
        self.events.emit(ServerEvent::ProcessingRequest {
            id: message.id,
            message_type: message.message_type,
        });
        self.events.set_active_request(message.id);
        let result: Result<(), ServerError> = self.dispatch(&message, None);
        self.finish_request(message, result);
    }

    /// Archives a processed request with its event log and goes idle again.
    fn finish_request(&self, mut message: Message, result: Result<(), ServerError>) {
        if let Err(err) = result {
            tracing::error!(id = message.id, "Request handler failed: {}", err);
            self.events.emit(ServerEvent::ErrorOccurred {
                message: err.to_string(),
            });
        }

        message.event_log = self.events.drain_log(message.id);
        self.events.clear_active_request();
        self.events.emit(ServerEvent::RequestArchived { id: message.id });
        self.queue
            .lock()
            .expect("queue lock poisoned")
            .archive(message);
        self.flags.idle.store(true, Ordering::SeqCst);
    }

    /// Claims the idle flag, waiting briefly if explicit processing holds it.
    fn acquire_idle(&self) -> Result<(), ServerError> {
        let deadline: Instant = Instant::now() + IDLE_WAIT_LIMIT;
        while !ServerFlags::lower(&self.flags.idle) {
            if Instant::now() >= deadline {
                return Err(ServerError::NotIdle);
            }
            thread::sleep(Duration::from_millis(5));
        }

        Ok(())
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    fn dispatch(
        self: &Arc<Self>,
        message: &Message,
        conn: Option<(&mut TcpStream, &mut FrameReader)>,
    ) -> Result<(), ServerError> {
        let (message_type, body) = protocol::decode_payload(&message.data)?;
        tracing::debug!(id = message.id, ?message_type, "Dispatching request");

        match body {
            Body::Text(text) => {
                tracing::info!(from = %text.sender_ip, "Received text message");
                self.events.emit(ServerEvent::ReceivedTextMessage {
                    text: text.text,
                    remote_ip: text.sender_ip,
                    remote_port: text.sender_port,
                });
                Ok(())
            }
            Body::InboundFileRequest(request) => match conn {
                Some((stream, reader)) => inbound::receive_file(self, request, stream, reader),
                None => Err(ServerError::MissingConnection),
            },
            Body::OutboundFileRequest(request) => outbound::handle_outbound_request(self, request),
            Body::Endpoint(endpoint) => match message_type {
                MessageType::FileTransferAccepted => outbound::handle_accepted(self, endpoint),
                MessageType::FileTransferRejected => outbound::handle_rejected(self, endpoint),
                MessageType::FileTransferStalled => outbound::handle_stalled(self, endpoint),
                MessageType::ServerInfoRequest => {
                    metadata::handle_server_info_request(self, endpoint)
                }
                MessageType::NoFilesAvailableForDownload => {
                    ServerFlags::raise(&self.flags.no_files_available);
                    self.events.emit(ServerEvent::NoFilesAvailableForDownload {
                        remote_ip: endpoint.sender_ip,
                    });
                    Ok(())
                }
                MessageType::RequestedFolderDoesNotExist => {
                    ServerFlags::raise(&self.flags.requested_folder_missing);
                    self.events.emit(ServerEvent::RequestedFolderDoesNotExist {
                        remote_ip: endpoint.sender_ip,
                    });
                    Ok(())
                }
                MessageType::ShutdownServerCommand => self.handle_shutdown(message),
                _ => unreachable!("decode pairs endpoint bodies with endpoint types"),
            },
            Body::Folder(folder) => match message_type {
                MessageType::RetryOutboundFileTransfer => outbound::handle_retry(self, folder),
                MessageType::FileListRequest => metadata::handle_file_list_request(self, folder),
                _ => unreachable!("decode pairs folder bodies with folder types"),
            },
            Body::FileList(response) => metadata::handle_file_list_response(self, response),
            Body::ServerInfo(response) => metadata::handle_server_info_response(self, response),
        }
    }

    /// A shutdown command is honored only when it comes from this host.
    fn handle_shutdown(&self, message: &Message) -> Result<(), ServerError> {
        let remote_ip: IpAddr = message.remote_addr.ip();
        let own: IpAddr = IpAddr::V4(self.local_ip);

        if remote_ip == own || remote_ip.is_loopback() {
            tracing::info!("Shutdown command accepted");
            self.events.emit(ServerEvent::ShutdownRequested);
            ServerFlags::raise(&self.flags.shutdown_initiated);
        } else {
            tracing::warn!(%remote_ip, "Ignoring shutdown command from another host");
        }

        Ok(())
    }

    // -----------------------------------------------------------------------
    // Outbound API
    // -----------------------------------------------------------------------

    /// Opens a connection to `remote`, writes one framed payload, closes.
    pub(crate) fn send_framed(&self, remote: SocketAddr, payload: &[u8]) -> Result<(), ServerError> {
        let mut stream: TcpStream = socket::connect(remote, self.config.connect_timeout())?;
        socket::send_all(
            &mut stream,
            &framing::encode_frame(payload),
            self.config.send_timeout(),
        )?;

        Ok(())
    }

    /// Sends a text message to the peer.
    pub fn send_text(&self, remote: SocketAddr, text: &str) -> Result<(), ServerError> {
        let (ip, port) = self.self_endpoint();
        tracing::info!(to = %remote, "Sending text message");

        self.send_framed(remote, &protocol::encode_text(&ip, port, text))
    }

    /// Announces and begins an outbound file transfer to the peer.
    pub fn send_file(
        &self,
        remote: SocketAddr,
        local_path: &Path,
        remote_folder: &str,
    ) -> Result<(), ServerError> {
        outbound::send_file(self, remote, local_path, remote_folder)
    }

    /// Asks the peer to push one of its files into our transfer folder.
    pub fn request_file(&self, remote: SocketAddr, remote_path: &str) -> Result<(), ServerError> {
        let (ip, port) = self.self_endpoint();
        let folder: String = self.config.transfer_folder.to_string_lossy().into_owned();
        tracing::info!(to = %remote, %remote_path, "Requesting file");

        self.send_framed(
            remote,
            &protocol::encode_outbound_file_request(remote_path, 0, &ip, port, &folder),
        )
    }

    /// Asks the peer for the contents of one of its folders.
    pub fn request_file_list(&self, remote: SocketAddr, folder: &str) -> Result<(), ServerError> {
        let (ip, port) = self.self_endpoint();
        // A fresh request invalidates the outcome flags of the previous one.
        self.flags.no_files_available.store(false, Ordering::SeqCst);
        self.flags
            .requested_folder_missing
            .store(false, Ordering::SeqCst);
        tracing::info!(to = %remote, %folder, "Requesting file list");

        self.send_framed(
            remote,
            &protocol::encode_folder(MessageType::FileListRequest, &ip, port, folder),
        )
    }

    /// Asks the peer for its server info.
    pub fn request_server_info(&self, remote: SocketAddr) -> Result<(), ServerError> {
        let (ip, port) = self.self_endpoint();

        self.send_framed(
            remote,
            &protocol::encode_endpoint(MessageType::ServerInfoRequest, &ip, port),
        )
    }

    /// Asks the sender of the last stalled inbound transfer to try again.
    pub fn retry_last_transfer(&self) -> Result<(), ServerError> {
        outbound::request_retry(self)
    }

    /// Delivers a shutdown command to this server's own pump.
    pub fn send_shutdown(&self) -> Result<(), ServerError> {
        let port: u16 = self.port();
        let own: SocketAddr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        let (ip, port) = self.self_endpoint();

        self.send_framed(
            own,
            &protocol::encode_endpoint(MessageType::ShutdownServerCommand, &ip, port),
        )
    }
}
