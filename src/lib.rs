//! # Silver9 WebSocket Session
//!
//! A resilient client-side WebSocket session on top of an exchangeable transport.
//!
//! [`S9WebSocketSession`] tracks the connection lifecycle, survives transient network
//! waits, migrates to a better network path when the transport reports one, keeps the
//! connection alive with periodic pings and reports every disconnection exactly once to
//! its [`S9WebSocketDelegate`].
//!
//! The bundled [`TungsteniteTransport`] connects with `tungstenite`. [`S9WebSocketServer`]
//! is a small broadcast server, handy for local testing.

mod websocket;
mod error;

pub use websocket::*;
pub use error::{PosixError, S9Result, S9WebSocketError, TransportError};
pub use tungstenite::protocol::frame::coding::CloseCode;
