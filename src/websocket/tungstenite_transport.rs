use std::collections::{HashMap, VecDeque};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use tungstenite::stream::MaybeTlsStream;
use tungstenite::{Message, WebSocket};
use crate::error::{PosixError, TransportError};
use super::endpoint::Endpoint;
use super::options::{SessionOptions, SharedOptions};
use super::shared::{self, ControlFlow};
use super::transport::{OutgoingFrame, PongHandler, ReceiveCompletion, Received, SendCompletion, Transport, TransportEvents, TransportFactory, TransportState};
use super::types::Opcode;

type Socket = WebSocket<MaybeTlsStream<TcpStream>>;

enum WorkerCommand {
    Send(OutgoingFrame, SendCompletion),
    Receive(ReceiveCompletion),
    Cancel,
}

// ============================================================================
// TungsteniteTransport - a Transport backed by a tungstenite client socket
// ============================================================================

/// Runs one WebSocket client connection on its own worker thread.
///
/// The worker connects on `start`, keeps retrying while the server is unreachable
/// (reporting `Waiting`) and then polls the non-blocking socket, answering pings and
/// matching pongs to pending ping requests in order.
pub struct TungsteniteTransport {
    endpoint: Endpoint,
    headers: HashMap<String, String>,
    shared: SharedOptions,
    reconnect_interval: Duration,
    command_tx: Sender<WorkerCommand>,
    command_rx: Option<Receiver<WorkerCommand>>,
    events: Option<TransportEvents>,
    cancelled: Arc<AtomicBool>,
}

impl TungsteniteTransport {
    pub fn new(endpoint: Endpoint, options: &SessionOptions) -> Self {
        let (command_tx, command_rx) = unbounded::<WorkerCommand>();
        TungsteniteTransport {
            endpoint,
            headers: options.headers.clone(),
            shared: options.shared.clone(),
            reconnect_interval: options.reconnect_interval,
            command_tx,
            command_rx: Some(command_rx),
            events: None,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl Transport for TungsteniteTransport {
    fn bind(&mut self, events: TransportEvents) {
        self.events = Some(events);
    }

    fn start(&mut self) {
        let Some(events) = self.events.clone() else {
            tracing::error!("Transport for {} started without event sink", self.endpoint);
            return;
        };
        let Some(commands) = self.command_rx.take() else {
            tracing::trace!("Transport for {} already started", self.endpoint);
            return;
        };

        let worker = Worker {
            endpoint: self.endpoint.clone(),
            headers: self.headers.clone(),
            shared: self.shared.clone(),
            reconnect_interval: self.reconnect_interval,
            commands,
            events,
            cancelled: Arc::clone(&self.cancelled),
            pending_receives: VecDeque::new(),
            buffered: VecDeque::new(),
            pong_handlers: VecDeque::new(),
        };

        if tracing::enabled!(tracing::Level::DEBUG) {
            tracing::debug!("Starting transport worker thread for {}...", self.endpoint);
        }
        let spawned = thread::Builder::new()
            .name("s9-transport".to_string())
            .spawn(move || worker.run());
        if let Err(e) = spawned {
            tracing::error!("Failed to spawn transport worker: {}", e);
            if let Some(events) = &self.events {
                events.state_changed(TransportState::Failed(TransportError::from(e)));
            }
        }
    }

    fn send(&mut self, frame: OutgoingFrame, completion: SendCompletion) {
        if let Err(e) = self.command_tx.send(WorkerCommand::Send(frame, completion)) {
            if let WorkerCommand::Send(_, completion) = e.into_inner() {
                completion(Some(TransportError::Posix(PosixError::NotConnected)));
            }
        }
    }

    fn receive_one(&mut self, completion: ReceiveCompletion) {
        if let Err(e) = self.command_tx.send(WorkerCommand::Receive(completion)) {
            if let WorkerCommand::Receive(completion) = e.into_inner() {
                completion(Received::error(TransportError::Posix(PosixError::NotConnected)));
            }
        }
    }

    fn cancel(&mut self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.command_rx.take().is_some() {
            // Never started, there is no worker to stop.
            if let Some(events) = &self.events {
                events.state_changed(TransportState::Cancelled);
            }
            return;
        }
        if self.command_tx.send(WorkerCommand::Cancel).is_err() {
            tracing::trace!("Transport worker for {} already stopped", self.endpoint);
        }
    }
}

impl Drop for TungsteniteTransport {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Produces a [`TungsteniteTransport`] per connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct TungsteniteTransportFactory;

impl TransportFactory for TungsteniteTransportFactory {
    fn make_transport(&mut self, endpoint: &Endpoint, options: &SessionOptions) -> Box<dyn Transport> {
        Box::new(TungsteniteTransport::new(endpoint.clone(), options))
    }
}

// ============================================================================
// Worker - owns the socket on the transport thread
// ============================================================================

struct Worker {
    endpoint: Endpoint,
    headers: HashMap<String, String>,
    shared: SharedOptions,
    reconnect_interval: Duration,
    commands: Receiver<WorkerCommand>,
    events: TransportEvents,
    cancelled: Arc<AtomicBool>,
    pending_receives: VecDeque<ReceiveCompletion>,
    buffered: VecDeque<Received>,
    pong_handlers: VecDeque<PongHandler>,
}

impl Worker {
    fn run(mut self) {
        if tracing::enabled!(tracing::Level::DEBUG) {
            tracing::debug!("Starting transport event loop for {}", self.endpoint);
        }
        self.events.state_changed(TransportState::Preparing);

        if let Some(mut socket) = self.establish() {
            self.poll(&mut socket);
        }

        if tracing::enabled!(tracing::Level::DEBUG) {
            tracing::debug!("Transport event loop for {} stopped", self.endpoint);
        }
    }

    fn establish(&mut self) -> Option<Socket> {
        loop {
            if self.cancelled.load(Ordering::Acquire) {
                self.finish_cancelled();
                return None;
            }
            match shared::connect_socket(&self.endpoint, &self.headers) {
                Ok((mut socket, _response)) => {
                    if let Err(e) = shared::configure_non_blocking(&mut socket, &self.shared) {
                        self.finish_failed(TransportError::from(e));
                        return None;
                    }
                    if self.cancelled.load(Ordering::Acquire) {
                        shared::close_websocket_with_logging(&mut socket, "on cancel while connecting");
                        self.finish_cancelled();
                        return None;
                    }
                    self.events.state_changed(TransportState::Ready);
                    return Some(socket);
                },
                Err(e) if shared::is_retryable_connect_error(&e) => {
                    if tracing::enabled!(tracing::Level::DEBUG) {
                        tracing::debug!("Connecting to {} failed, retrying in {:?}: {}", self.endpoint, self.reconnect_interval, e);
                    }
                    self.events.state_changed(TransportState::Waiting(TransportError::from(e)));
                    if let ControlFlow::Break = self.wait_before_retry() {
                        return None;
                    }
                },
                Err(e) => {
                    tracing::error!("Connecting to {} failed: {}", self.endpoint, e);
                    self.finish_failed(TransportError::from(e));
                    return None;
                }
            }
        }
    }

    /// Handles commands until the next connection attempt is due.
    fn wait_before_retry(&mut self) -> ControlFlow {
        let deadline = Instant::now() + self.reconnect_interval;
        loop {
            match self.commands.recv_deadline(deadline) {
                Ok(WorkerCommand::Send(frame, completion)) => {
                    if tracing::enabled!(tracing::Level::TRACE) {
                        tracing::trace!("Not connected, failing {:?} frame", frame.metadata.opcode);
                    }
                    completion(Some(TransportError::Posix(PosixError::NotConnected)));
                },
                Ok(WorkerCommand::Receive(completion)) => self.pending_receives.push_back(completion),
                Ok(WorkerCommand::Cancel) | Err(RecvTimeoutError::Disconnected) => {
                    self.finish_cancelled();
                    return ControlFlow::Break;
                },
                Err(RecvTimeoutError::Timeout) => return ControlFlow::Continue,
            }
        }
    }

    fn poll(&mut self, socket: &mut Socket) {
        loop {
            // 1. Drain commands (non-blocking)
            loop {
                let command = match self.commands.try_recv() {
                    Ok(command) => command,
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => WorkerCommand::Cancel,
                };
                if let ControlFlow::Break = self.handle_command(command, socket) {
                    return;
                }
            }

            // 2. Read from socket (non-blocking)
            match socket.read() {
                Ok(Message::Pong(bytes)) => {
                    shared::trace_on_pong_message(&bytes);
                    match self.pong_handlers.pop_front() {
                        Some(handler) => handler(Ok(())),
                        None => tracing::trace!("Unsolicited pong ignored"),
                    }
                },
                Ok(message) => {
                    if let Some(received) = shared::into_received(message) {
                        self.deliver(received);
                    }
                },
                Err(e) if shared::is_would_block(&e) => {},
                Err(e) if shared::is_clean_closure(&e) => {
                    tracing::debug!("Connection to {} closed", self.endpoint);
                    self.finish_cancelled();
                    return;
                },
                Err(e) => {
                    tracing::error!("Error reading from {}: {}", self.endpoint, e);
                    self.finish_failed(TransportError::from(e));
                    return;
                }
            }

            // 3. Push out anything tungstenite buffered, including automatic pong replies
            if let Err(e) = socket.flush() {
                if !shared::is_would_block(&e) && !shared::is_clean_closure(&e) {
                    tracing::error!("Error flushing to {}: {}", self.endpoint, e);
                    self.finish_failed(TransportError::from(e));
                    return;
                }
            }

            // Optionally sleep to reduce CPU usage
            if let Some(duration) = self.shared.spin_wait_duration {
                thread::sleep(duration);
            }
        }
    }

    fn handle_command(&mut self, command: WorkerCommand, socket: &mut Socket) -> ControlFlow {
        match command {
            WorkerCommand::Send(frame, completion) => {
                let OutgoingFrame { payload, metadata, pong_handler } = frame;
                match shared::write_frame(socket, payload, &metadata) {
                    Ok(()) => {
                        if metadata.opcode == Opcode::Ping {
                            if let Some(handler) = pong_handler {
                                self.pong_handlers.push_back(handler);
                            }
                        }
                        completion(None);
                    },
                    Err(error) => completion(Some(error)),
                }
                ControlFlow::Continue
            },
            WorkerCommand::Receive(completion) => {
                match self.buffered.pop_front() {
                    Some(received) => completion(received),
                    None => self.pending_receives.push_back(completion),
                }
                ControlFlow::Continue
            },
            WorkerCommand::Cancel => {
                shared::close_websocket_with_logging(socket, "on cancel");
                self.finish_cancelled();
                ControlFlow::Break
            }
        }
    }

    fn deliver(&mut self, received: Received) {
        match self.pending_receives.pop_front() {
            Some(completion) => completion(received),
            None => self.buffered.push_back(received),
        }
    }

    fn finish_cancelled(&mut self) {
        self.pending_receives.clear();
        self.pong_handlers.clear();
        self.events.state_changed(TransportState::Cancelled);
    }

    fn finish_failed(&mut self, error: TransportError) {
        self.events.state_changed(TransportState::Failed(error.clone()));
        for completion in self.pending_receives.drain(..) {
            completion(Received::error(error.clone()));
        }
        for handler in self.pong_handlers.drain(..) {
            handler(Err(error.clone()));
        }
    }
}
