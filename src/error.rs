//! Error types for S9 WebSocket session operations.
//!
//! Two layers of errors exist:
//!
//! - [`S9WebSocketError`] is returned directly to callers of the session API, e.g. for an
//!   invalid URI or a session whose event loop has already shut down.
//! - [`TransportError`] is the low-level error reported by a transport. It is what the
//!   session classifies and what the delegate receives in
//!   [`on_error`](crate::S9WebSocketDelegate::on_error).
//!
//! # Examples
//!
//! ```no_run
//! use s9_websocket_session::{S9WebSocketSession, S9WebSocketError, SessionOptions};
//!
//! # fn main() {
//! match S9WebSocketSession::new("not-a-websocket-uri", SessionOptions::new()) {
//!     Ok(session) => { /* use session */ },
//!     Err(S9WebSocketError::InvalidUri(msg)) => {
//!         eprintln!("Invalid URI: {}", msg);
//!     },
//!     Err(e) => {
//!         eprintln!("Session creation failed: {}", e);
//!     }
//! }
//! # }
//! ```

use std::fmt;
use std::io;
use tungstenite::Error as TungsteniteError;

/// Error type for all S9 WebSocket session operations.
///
/// # Error Categories
///
/// - **Setup errors**: [`InvalidUri`](Self::InvalidUri), [`InvalidConfiguration`](Self::InvalidConfiguration)
/// - **Lifecycle errors**: [`SessionClosed`](Self::SessionClosed)
/// - **Runtime errors**: [`Transport`](Self::Transport), [`Io`](Self::Io), [`Tungstenite`](Self::Tungstenite)
#[derive(Debug)]
pub enum S9WebSocketError {
    /// Invalid WebSocket URI was provided.
    ///
    /// The URI cannot be parsed, has no host, or doesn't use the `ws://` or `wss://` scheme.
    InvalidUri(String),

    /// Invalid configuration was provided.
    ///
    /// This error occurs when configuration options contain invalid values, such as:
    /// - Zero-duration spin waits, reconnect intervals or ping intervals
    /// - A waiting error limit of zero
    ///
    /// # Example
    /// ```no_run
    /// use s9_websocket_session::SessionOptions;
    /// use std::time::Duration;
    ///
    /// # fn main() {
    /// let result = SessionOptions::new().reconnect_interval(Duration::ZERO);
    /// assert!(result.is_err());
    /// # }
    /// ```
    InvalidConfiguration(String),

    /// The session event loop has shut down and no longer accepts commands.
    SessionClosed,

    /// A low-level transport error.
    Transport(TransportError),

    /// An I/O operation failed, e.g. spawning a thread or binding a listener.
    Io(io::Error),

    /// An error from the underlying tungstenite WebSocket library.
    Tungstenite(TungsteniteError),
}

impl fmt::Display for S9WebSocketError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            S9WebSocketError::InvalidUri(uri) => write!(f, "Invalid URI: {}", uri),
            S9WebSocketError::InvalidConfiguration(msg) => write!(f, "Invalid configuration: {}", msg),
            S9WebSocketError::SessionClosed => write!(f, "Session event loop already shut down"),
            S9WebSocketError::Transport(err) => write!(f, "Transport error: {}", err),
            S9WebSocketError::Io(err) => write!(f, "IO error: {}", err),
            S9WebSocketError::Tungstenite(err) => write!(f, "WebSocket error: {}", err),
        }
    }
}

impl std::error::Error for S9WebSocketError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            S9WebSocketError::Transport(err) => Some(err),
            S9WebSocketError::Io(err) => Some(err),
            S9WebSocketError::Tungstenite(err) => Some(err),
            _ => None,
        }
    }
}

// Convert from tungstenite errors to S9WebSocketError
impl From<TungsteniteError> for S9WebSocketError {
    fn from(err: TungsteniteError) -> Self {
        match err {
            TungsteniteError::Io(io_err) => S9WebSocketError::Io(io_err),
            TungsteniteError::Url(url_err) => S9WebSocketError::InvalidUri(url_err.to_string()),
            _ => S9WebSocketError::Tungstenite(err),
        }
    }
}

// Convert from std::io::Error to S9WebSocketError error
impl From<io::Error> for S9WebSocketError {
    fn from(err: io::Error) -> Self {
        S9WebSocketError::Io(err)
    }
}

impl From<TransportError> for S9WebSocketError {
    fn from(err: TransportError) -> Self {
        S9WebSocketError::Transport(err)
    }
}

/// Convenience type alias for `Result<T, S9WebSocketError>`.
pub type S9Result<T> = Result<T, S9WebSocketError>;

// ============================================================================
// Transport errors
// ============================================================================

/// POSIX-style socket error codes reported by a transport.
///
/// The session only ever inspects these codes, never error messages, to tell a
/// caller-intended closure apart from a genuine failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PosixError {
    /// `ETIMEDOUT`
    TimedOut,
    /// `ENOTCONN`
    NotConnected,
    /// `ECANCELED`
    Canceled,
    /// `ENETDOWN`
    NetworkDown,
    /// `ECONNABORTED`
    ConnectionAborted,
    /// `ECONNREFUSED`
    ConnectionRefused,
    /// `ECONNRESET`
    ConnectionReset,
    /// `EALREADY`
    AlreadyInProgress,
    /// `EHOSTUNREACH`
    HostUnreachable,
    /// `ENETUNREACH`
    NetworkUnreachable,
    /// `EPIPE`
    BrokenPipe,
    /// Any other I/O failure, by kind.
    Other(io::ErrorKind),
}

impl fmt::Display for PosixError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PosixError::TimedOut => write!(f, "Operation timed out"),
            PosixError::NotConnected => write!(f, "Socket is not connected"),
            PosixError::Canceled => write!(f, "Operation canceled"),
            PosixError::NetworkDown => write!(f, "Network is down"),
            PosixError::ConnectionAborted => write!(f, "Software caused connection abort"),
            PosixError::ConnectionRefused => write!(f, "Connection refused"),
            PosixError::ConnectionReset => write!(f, "Connection reset by peer"),
            PosixError::AlreadyInProgress => write!(f, "Operation already in progress"),
            PosixError::HostUnreachable => write!(f, "No route to host"),
            PosixError::NetworkUnreachable => write!(f, "Network is unreachable"),
            PosixError::BrokenPipe => write!(f, "Broken pipe"),
            PosixError::Other(kind) => write!(f, "{}", kind),
        }
    }
}

impl From<io::ErrorKind> for PosixError {
    fn from(kind: io::ErrorKind) -> Self {
        match kind {
            io::ErrorKind::TimedOut => PosixError::TimedOut,
            io::ErrorKind::NotConnected => PosixError::NotConnected,
            io::ErrorKind::NetworkDown => PosixError::NetworkDown,
            io::ErrorKind::ConnectionAborted => PosixError::ConnectionAborted,
            io::ErrorKind::ConnectionRefused => PosixError::ConnectionRefused,
            io::ErrorKind::ConnectionReset => PosixError::ConnectionReset,
            io::ErrorKind::HostUnreachable => PosixError::HostUnreachable,
            io::ErrorKind::NetworkUnreachable => PosixError::NetworkUnreachable,
            io::ErrorKind::BrokenPipe => PosixError::BrokenPipe,
            other => PosixError::Other(other),
        }
    }
}

/// A low-level error reported by a [`Transport`](crate::Transport).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// A socket-level error code.
    Posix(PosixError),
    /// Name resolution failed.
    Dns(String),
    /// TLS negotiation failed.
    Tls(String),
    /// The peer violated the WebSocket protocol or rejected the upgrade.
    Protocol(String),
}

impl TransportError {
    /// Returns the POSIX code if this is a socket-level error.
    pub fn posix_code(&self) -> Option<PosixError> {
        match self {
            TransportError::Posix(code) => Some(*code),
            _ => None,
        }
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Posix(code) => write!(f, "POSIX error: {}", code),
            TransportError::Dns(msg) => write!(f, "DNS error: {}", msg),
            TransportError::Tls(msg) => write!(f, "TLS error: {}", msg),
            TransportError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<PosixError> for TransportError {
    fn from(code: PosixError) -> Self {
        TransportError::Posix(code)
    }
}

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        TransportError::Posix(PosixError::from(err.kind()))
    }
}

impl From<TungsteniteError> for TransportError {
    fn from(err: TungsteniteError) -> Self {
        match err {
            TungsteniteError::ConnectionClosed | TungsteniteError::AlreadyClosed => {
                TransportError::Posix(PosixError::NotConnected)
            }
            TungsteniteError::Io(io_err) => TransportError::from(io_err),
            TungsteniteError::Tls(tls_err) => TransportError::Tls(tls_err.to_string()),
            TungsteniteError::Url(url_err) => TransportError::Dns(url_err.to_string()),
            other => TransportError::Protocol(other.to_string()),
        }
    }
}
