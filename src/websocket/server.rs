use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};
use dashmap::DashMap;
use tungstenite::{Message, WebSocket};
use crate::error::{S9Result, S9WebSocketError};
use super::shared::{self, ControlFlow};

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(10);
const CONNECTION_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Identifies a connection accepted by one [`S9WebSocketServer`].
pub type ServerConnectionId = u64;

/// Observes a [`S9WebSocketServer`]. Called from the connection threads.
pub trait S9ServerDelegate: Send + Sync {
    fn on_open(&self, connection: ServerConnectionId) {
        // Default: noop
        let _ = connection;
    }
    fn on_text_message(&self, connection: ServerConnectionId, text: &str) {
        // Default: noop
        let _ = (connection, text);
    }
    fn on_binary_message(&self, connection: ServerConnectionId, data: &[u8]) {
        // Default: noop
        let _ = (connection, data);
    }
    fn on_close(&self, connection: ServerConnectionId) {
        // Default: noop
        let _ = connection;
    }
}

/// Open connections by id, each reachable through its outbound queue.
#[derive(Default)]
struct Registry {
    running: AtomicBool,
    next_id: AtomicU64,
    connections: DashMap<ServerConnectionId, Sender<Message>>,
}

impl Registry {
    /// Queues `message` for every open connection, returns how many accepted it.
    fn broadcast(&self, message: &Message) -> usize {
        let mut sent = 0;
        for entry in self.connections.iter() {
            if entry.value().send(message.clone()).is_ok() {
                sent += 1;
            }
        }
        if tracing::enabled!(tracing::Level::TRACE) {
            tracing::trace!("Message broadcast to {} connections", sent);
        }
        sent
    }
}

// ============================================================================
// S9WebSocketServer - a minimal broadcast server
// ============================================================================

/// A small WebSocket server that fans every text or binary message out to all open
/// connections, including the sender.
///
/// Each accepted connection runs on its own thread. Pings are answered automatically.
pub struct S9WebSocketServer {
    listener: Option<TcpListener>,
    local_addr: SocketAddr,
    welcome_message: bool,
    delegate: Option<Arc<dyn S9ServerDelegate>>,
    registry: Arc<Registry>,
    accept_thread: Option<JoinHandle<()>>,
}

impl S9WebSocketServer {
    /// Binds the listener. Use port 0 to let the OS pick one, see [`local_addr`](Self::local_addr).
    pub fn bind<A: ToSocketAddrs>(addr: A) -> S9Result<S9WebSocketServer> {
        let listener = TcpListener::bind(addr)?;
        let local_addr = listener.local_addr()?;
        Ok(S9WebSocketServer {
            listener: Some(listener),
            local_addr,
            welcome_message: true,
            delegate: None,
            registry: Arc::new(Registry::default()),
            accept_thread: None,
        })
    }

    /// Greet each new connection with `Welcome you are connection: {id}`. Enabled by default.
    pub fn with_welcome_message(mut self, enabled: bool) -> Self {
        self.welcome_message = enabled;
        self
    }

    pub fn with_delegate(mut self, delegate: Arc<dyn S9ServerDelegate>) -> Self {
        self.delegate = Some(delegate);
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// `ws://` URI of this server.
    pub fn uri(&self) -> String {
        format!("ws://{}", self.local_addr)
    }

    pub fn connection_count(&self) -> usize {
        self.registry.connections.len()
    }

    /// Starts accepting connections on a background thread.
    pub fn start(&mut self) -> S9Result<()> {
        let Some(listener) = self.listener.take() else {
            return Err(S9WebSocketError::InvalidConfiguration("Server already started".to_string()));
        };
        listener.set_nonblocking(true)?;
        self.registry.running.store(true, Ordering::Release);

        let acceptor = Acceptor {
            listener,
            registry: Arc::clone(&self.registry),
            welcome_message: self.welcome_message,
            delegate: self.delegate.clone(),
        };

        if tracing::enabled!(tracing::Level::DEBUG) {
            tracing::debug!("Server starting on {}...", self.local_addr);
        }
        let handle = thread::Builder::new()
            .name("s9-server".to_string())
            .spawn(move || acceptor.run())?;
        self.accept_thread = Some(handle);
        Ok(())
    }

    /// Stops accepting and closes all open connections.
    pub fn stop(&mut self) {
        self.registry.running.store(false, Ordering::Release);
        if let Some(handle) = self.accept_thread.take() {
            if handle.join().is_err() {
                tracing::error!("Server accept thread panicked");
            }
            tracing::debug!("Server on {} stopped", self.local_addr);
        }
    }
}

impl Drop for S9WebSocketServer {
    fn drop(&mut self) {
        self.stop();
    }
}

// ============================================================================
// Accept loop and per-connection loop
// ============================================================================

struct Acceptor {
    listener: TcpListener,
    registry: Arc<Registry>,
    welcome_message: bool,
    delegate: Option<Arc<dyn S9ServerDelegate>>,
}

impl Acceptor {
    fn run(self) {
        tracing::debug!("Server ready");
        while self.registry.running.load(Ordering::Acquire) {
            match self.listener.accept() {
                Ok((stream, peer)) => self.spawn_connection(stream, peer),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL_INTERVAL),
                Err(e) => {
                    tracing::error!("Server failed to accept connection: {}", e);
                    thread::sleep(ACCEPT_POLL_INTERVAL);
                }
            }
        }
    }

    fn spawn_connection(&self, stream: TcpStream, peer: SocketAddr) {
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        let (outbound_tx, outbound_rx) = unbounded::<Message>();
        let server_connection = ServerConnection {
            id,
            registry: Arc::clone(&self.registry),
            delegate: self.delegate.clone(),
            outbound_tx,
            outbound_rx,
        };
        let welcome_message = self.welcome_message;

        if tracing::enabled!(tracing::Level::DEBUG) {
            tracing::debug!("Server accepted connection {} from {}", id, peer);
        }
        let spawned = thread::Builder::new()
            .name(format!("s9-server-connection-{}", id))
            .spawn(move || server_connection.run(stream, welcome_message));
        if let Err(e) = spawned {
            tracing::error!("Failed to spawn thread for connection {}: {}", id, e);
        }
    }
}

struct ServerConnection {
    id: ServerConnectionId,
    registry: Arc<Registry>,
    delegate: Option<Arc<dyn S9ServerDelegate>>,
    outbound_tx: Sender<Message>,
    outbound_rx: Receiver<Message>,
}

impl ServerConnection {
    fn run(self, stream: TcpStream, welcome_message: bool) {
        let mut socket = match self.handshake(stream) {
            Ok(socket) => socket,
            Err(e) => {
                tracing::error!("Server handshake for connection {} failed: {}", self.id, e);
                return;
            }
        };

        self.registry.connections.insert(self.id, self.outbound_tx.clone());
        if let Some(delegate) = &self.delegate {
            delegate.on_open(self.id);
        }
        tracing::debug!("Server did open connection {}", self.id);

        if welcome_message {
            let welcome = Message::text(format!("Welcome you are connection: {}", self.id));
            if self.outbound_tx.send(welcome).is_err() {
                tracing::trace!("Failed to queue welcome message for connection {}", self.id);
            }
        }

        while let ControlFlow::Continue = self.poll(&mut socket) {
            thread::sleep(CONNECTION_POLL_INTERVAL);
        }

        self.registry.connections.remove(&self.id);
        if let Some(delegate) = &self.delegate {
            delegate.on_close(self.id);
        }
        tracing::debug!("Server did close connection {}", self.id);
    }

    fn handshake(&self, stream: TcpStream) -> S9Result<WebSocket<TcpStream>> {
        // Accepted sockets inherit non-blocking mode from the listener on some platforms.
        stream.set_nonblocking(false)?;
        let socket = tungstenite::accept(stream).map_err(|e| match e {
            tungstenite::HandshakeError::Failure(e) => S9WebSocketError::from(e),
            tungstenite::HandshakeError::Interrupted(_) => S9WebSocketError::Io(std::io::ErrorKind::WouldBlock.into()),
        })?;
        socket.get_ref().set_nonblocking(true)?;
        socket.get_ref().set_nodelay(true)?;
        Ok(socket)
    }

    fn poll(&self, socket: &mut WebSocket<TcpStream>) -> ControlFlow {
        if !self.registry.running.load(Ordering::Acquire) {
            shared::close_websocket_with_logging(socket, "on server stop");
            return ControlFlow::Break;
        }

        // 1. Write queued messages
        loop {
            match self.outbound_rx.try_recv() {
                Ok(message) => {
                    if let Err(e) = socket.write(message) {
                        if !shared::is_would_block(&e) {
                            if !shared::is_clean_closure(&e) {
                                tracing::error!("Server failed to write to connection {}: {}", self.id, e);
                            }
                            return ControlFlow::Break;
                        }
                    }
                },
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }

        // 2. Read (non-blocking)
        match socket.read() {
            Ok(message) => self.on_message(message),
            Err(e) if shared::is_would_block(&e) => {},
            Err(e) if shared::is_clean_closure(&e) => return ControlFlow::Break,
            Err(e) => {
                tracing::debug!("Connection {} did fail: {}", self.id, e);
                return ControlFlow::Break;
            }
        }

        // 3. Flush
        if let Err(e) = socket.flush() {
            if !shared::is_would_block(&e) {
                if !shared::is_clean_closure(&e) {
                    tracing::debug!("Connection {} did fail on flush: {}", self.id, e);
                }
                return ControlFlow::Break;
            }
        }
        ControlFlow::Continue
    }

    fn on_message(&self, message: Message) {
        match &message {
            Message::Text(text) => {
                shared::trace_on_text_message(text);
                if let Some(delegate) = &self.delegate {
                    delegate.on_text_message(self.id, text.as_str());
                }
            },
            Message::Binary(bytes) => {
                shared::trace_on_binary_message(bytes);
                if let Some(delegate) = &self.delegate {
                    delegate.on_binary_message(self.id, bytes);
                }
            },
            Message::Close(close_frame) => {
                // tungstenite queues the close reply, the next read reports the closure.
                shared::trace_on_close_frame(close_frame);
                return;
            },
            Message::Ping(bytes) => {
                shared::trace_on_ping_message(bytes);
                return;
            },
            Message::Pong(bytes) => {
                shared::trace_on_pong_message(bytes);
                return;
            },
            Message::Frame(_) => {
                shared::trace_on_frame();
                return;
            }
        }
        self.registry.broadcast(&message);
    }
}
