// Public API modules
pub mod types;
pub mod options;
pub mod classifier;

// Internal modules
mod shared;
mod endpoint;
mod transport;
mod reporter;
mod keepalive;
mod connection;
mod event_loop;
mod session;
mod tungstenite_transport;
mod server;

#[cfg(test)]
pub(crate) mod testing;

// Re-export public types
pub use types::{FrameMetadata, MigrationResult, Opcode, S9WebSocketDelegate, SessionState};
pub use options::SessionOptions;
pub use endpoint::Endpoint;
pub use transport::{OutgoingFrame, PongHandler, ReceiveCompletion, Received, SendCompletion, Transport, TransportEvents, TransportFactory, TransportState};

// Re-export session and transport implementations
pub use session::{S9WebSocketSession, SessionHandle};
pub use tungstenite_transport::{TungsteniteTransport, TungsteniteTransportFactory};
pub use server::{S9ServerDelegate, S9WebSocketServer, ServerConnectionId};
