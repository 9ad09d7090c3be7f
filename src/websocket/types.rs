use tungstenite::protocol::frame::coding::CloseCode;
use crate::error::TransportError;
use super::session::SessionHandle;

// ============================================================================
// Macros
// ============================================================================

macro_rules! send_or_log {
    ($sender:expr, $context:expr, $event:expr) => {
        if let Err(e) = $sender.send($event) {
            tracing::trace!("Failed to send context {} through channel: {}", $context, e);
        }
    };
}

pub(crate) use send_or_log;

// ============================================================================
// Frames
// ============================================================================

/// WebSocket frame type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

/// Protocol metadata attached to a frame sent to or received from a transport.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameMetadata {
    pub opcode: Opcode,
    /// Only meaningful for [`Opcode::Close`].
    pub close_code: Option<CloseCode>,
}

impl FrameMetadata {
    pub fn new(opcode: Opcode) -> Self {
        FrameMetadata { opcode, close_code: None }
    }

    pub fn close(code: CloseCode) -> Self {
        FrameMetadata { opcode: Opcode::Close, close_code: Some(code) }
    }
}

// ============================================================================
// Session lifecycle
// ============================================================================

/// Lifecycle state of a session as seen by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SessionState {
    Idle = 0,
    Connecting = 1,
    Ready = 2,
    Migrating = 3,
    Disconnecting = 4,
    Disconnected = 5,
    Failed = 6,
}

impl SessionState {
    pub(crate) fn from_u8(value: u8) -> SessionState {
        match value {
            1 => SessionState::Connecting,
            2 => SessionState::Ready,
            3 => SessionState::Migrating,
            4 => SessionState::Disconnecting,
            5 => SessionState::Disconnected,
            6 => SessionState::Failed,
            _ => SessionState::Idle,
        }
    }
}

/// Outcome of a better-path migration: the live session, or why it could not move.
pub type MigrationResult = Result<SessionHandle, TransportError>;

// ============================================================================
// Delegate
// ============================================================================

/// Receives lifecycle and message notifications from a session.
///
/// The session only keeps a [`Weak`](std::sync::Weak) reference to its delegate, so the
/// delegate may be dropped at any time. All methods are called on the session's event loop
/// thread, one at a time. Calling back into the session from inside a notification is
/// fine, commands are queued.
pub trait S9WebSocketDelegate: Send + Sync {
    fn on_connect(&self, session: &SessionHandle);
    fn on_disconnect(&self, session: &SessionHandle, close_code: CloseCode, reason: Option<&[u8]>);
    /// An error received by a session is not necessarily fatal.
    fn on_error(&self, session: &SessionHandle, error: &TransportError);
    fn on_pong(&self, session: &SessionHandle) {
        // Default: noop
        let _ = session;
    }
    fn on_text_message(&self, session: &SessionHandle, text: &str);
    fn on_binary_message(&self, session: &SessionHandle, data: &[u8]);
    fn on_viability_change(&self, session: &SessionHandle, is_viable: bool) {
        // Default: noop
        let _ = (session, is_viable);
    }
    fn on_migration(&self, result: MigrationResult) {
        // Default: noop
        let _ = result;
    }
}
