use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;
use crossbeam_channel::{unbounded, Sender};
use tungstenite::protocol::frame::coding::CloseCode;
use crate::error::{S9Result, S9WebSocketError, TransportError};
use super::event_loop::SessionCore;
use super::endpoint::Endpoint;
use super::options::SessionOptions;
use super::transport::{ConnectionId, Received, TransportFactory, TransportState};
use super::tungstenite_transport::TungsteniteTransportFactory;
use super::types::{FrameMetadata, Opcode, S9WebSocketDelegate, SessionState};

// ============================================================================
// Commands - everything that reaches the session event loop
// ============================================================================

pub(crate) enum Command {
    SetDelegate(Option<Weak<dyn S9WebSocketDelegate>>),
    Connect,
    Send { payload: Vec<u8>, opcode: Opcode },
    Ping,
    PingInterval(Duration),
    Disconnect(CloseCode),
    StateChanged { connection: ConnectionId, state: TransportState },
    ViabilityChanged { connection: ConnectionId, is_viable: bool },
    BetterPathChanged { connection: ConnectionId, is_available: bool },
    Received { connection: ConnectionId, received: Received },
    SendCompleted { connection: ConnectionId, metadata: FrameMetadata, reason: Option<Vec<u8>>, error: Option<TransportError> },
    PongCompleted { connection: ConnectionId, result: Result<(), TransportError> },
    Shutdown,
    #[cfg(test)]
    Barrier(Sender<()>),
}

pub(crate) struct SessionShared {
    state: AtomicU8,
}

impl SessionShared {
    pub(crate) fn set_state(&self, state: SessionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }
}

// ============================================================================
// SessionHandle - cheap, cloneable access to a running session
// ============================================================================

/// A cloneable handle to a session.
///
/// Every method only enqueues a command for the session event loop and returns
/// immediately; outcomes are reported to the [`S9WebSocketDelegate`]. Methods fail with
/// [`S9WebSocketError::SessionClosed`] once the owning [`S9WebSocketSession`] was dropped.
#[derive(Clone)]
pub struct SessionHandle {
    commands: Sender<Command>,
    shared: Arc<SessionShared>,
}

impl SessionHandle {
    /// Connects, or resumes a connection that was never started. Idempotent.
    pub fn connect(&self) -> S9Result<()> {
        self.submit(Command::Connect)
    }

    #[inline]
    pub fn send_text(&self, text: &str) -> S9Result<()> {
        self.submit(Command::Send { payload: text.as_bytes().to_vec(), opcode: Opcode::Text })
    }

    /// Sends `bytes` as a text frame. Bytes that are not valid UTF-8 are silently dropped.
    pub fn send_text_bytes(&self, bytes: &[u8]) -> S9Result<()> {
        match std::str::from_utf8(bytes) {
            Ok(text) => self.send_text(text),
            Err(e) => {
                tracing::trace!("Dropping text message that is not valid UTF-8: {}", e);
                Ok(())
            }
        }
    }

    #[inline]
    pub fn send_binary(&self, data: Vec<u8>) -> S9Result<()> {
        self.submit(Command::Send { payload: data, opcode: Opcode::Binary })
    }

    /// Sends a single ping; the matching pong is reported via `on_pong`.
    pub fn ping(&self) -> S9Result<()> {
        self.submit(Command::Ping)
    }

    /// Pings every `interval`, replacing any previously configured interval.
    pub fn ping_interval(&self, interval: Duration) -> S9Result<()> {
        if interval.is_zero() {
            return Err(S9WebSocketError::InvalidConfiguration("Ping interval cannot be zero".to_string()));
        }
        self.submit(Command::PingInterval(interval))
    }

    /// Disconnects with a normal closure.
    pub fn disconnect(&self) -> S9Result<()> {
        self.disconnect_with(CloseCode::Normal)
    }

    pub fn disconnect_with(&self, close_code: CloseCode) -> S9Result<()> {
        self.submit(Command::Disconnect(close_code))
    }

    /// Observes `delegate` without keeping it alive.
    pub fn set_delegate<D: S9WebSocketDelegate + 'static>(&self, delegate: Weak<D>) -> S9Result<()> {
        let delegate: Weak<dyn S9WebSocketDelegate> = delegate;
        self.submit(Command::SetDelegate(Some(delegate)))
    }

    pub fn clear_delegate(&self) -> S9Result<()> {
        self.submit(Command::SetDelegate(None))
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// True if both handles refer to the same session.
    pub fn same_session(&self, other: &SessionHandle) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    pub(crate) fn shared(&self) -> &Arc<SessionShared> {
        &self.shared
    }

    pub(crate) fn commands(&self) -> &Sender<Command> {
        &self.commands
    }

    fn submit(&self, command: Command) -> S9Result<()> {
        self.commands.send(command).map_err(|_| S9WebSocketError::SessionClosed)
    }

    /// Waits until every command queued before this call has been handled.
    #[cfg(test)]
    pub(crate) fn settle(&self) {
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.commands.send(Command::Barrier(tx)).expect("session loop gone");
        rx.recv_timeout(Duration::from_secs(5)).expect("session loop did not settle");
    }
}

impl PartialEq for SessionHandle {
    fn eq(&self, other: &Self) -> bool {
        self.same_session(other)
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle").field("state", &self.state()).finish()
    }
}

// ============================================================================
// S9WebSocketSession - owns the event loop thread
// ============================================================================

/// A resilient WebSocket session.
///
/// The session runs its own event loop thread which owns all lifecycle state. Transport
/// events, completions, keepalive ticks and API calls are serialized through it. Use the
/// [`SessionHandle`] methods (available through `Deref`) to drive it.
///
/// Dropping the session stops the event loop and cancels the transport without waiting
/// for it to finish.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use s9_websocket_session::{S9WebSocketDelegate, S9WebSocketSession, SessionHandle, SessionOptions, TransportError, CloseCode};
///
/// struct Printer;
///
/// impl S9WebSocketDelegate for Printer {
///     fn on_connect(&self, session: &SessionHandle) {
///         session.send_text("Hello").ok();
///     }
///     fn on_disconnect(&self, _session: &SessionHandle, close_code: CloseCode, _reason: Option<&[u8]>) {
///         println!("Disconnected: {:?}", close_code);
///     }
///     fn on_error(&self, _session: &SessionHandle, error: &TransportError) {
///         eprintln!("Error: {}", error);
///     }
///     fn on_text_message(&self, _session: &SessionHandle, text: &str) {
///         println!("Received: {}", text);
///     }
///     fn on_binary_message(&self, _session: &SessionHandle, data: &[u8]) {
///         println!("Received {} bytes", data.len());
///     }
/// }
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let delegate = Arc::new(Printer);
/// let session = S9WebSocketSession::new("wss://echo.websocket.org", SessionOptions::new())?;
/// session.set_delegate(Arc::downgrade(&delegate))?;
/// session.connect()?;
/// # Ok(())
/// # }
/// ```
pub struct S9WebSocketSession {
    handle: SessionHandle,
}

impl S9WebSocketSession {
    /// Creates a session backed by the tungstenite transport.
    pub fn new(uri: &str, options: SessionOptions) -> S9Result<S9WebSocketSession> {
        let endpoint = Endpoint::parse(uri)?;
        Self::with_transport(endpoint, options, TungsteniteTransportFactory)
    }

    /// Creates a session that obtains its transports from `factory`.
    pub fn with_transport<F>(endpoint: Endpoint, options: SessionOptions, factory: F) -> S9Result<S9WebSocketSession>
    where
        F: TransportFactory + 'static,
    {
        let (commands, inbox) = unbounded::<Command>();
        let shared = Arc::new(SessionShared { state: AtomicU8::new(SessionState::Idle as u8) });
        let handle = SessionHandle { commands, shared };
        let connect_automatically = options.connect_automatically;

        let core = SessionCore::new(endpoint, options, Box::new(factory), handle.clone(), inbox);

        if tracing::enabled!(tracing::Level::DEBUG) {
            tracing::debug!("Starting session event loop thread...");
        }
        thread::Builder::new()
            .name("s9-session".to_string())
            .spawn(move || core.run())?;

        if connect_automatically {
            handle.connect()?;
        }

        Ok(S9WebSocketSession { handle })
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }
}

impl Deref for S9WebSocketSession {
    type Target = SessionHandle;

    fn deref(&self) -> &SessionHandle {
        &self.handle
    }
}

impl Drop for S9WebSocketSession {
    fn drop(&mut self) {
        if self.handle.submit(Command::Shutdown).is_ok() {
            tracing::trace!("Session shutdown requested on Drop");
        }
    }
}
