//! The boundary between a session and the raw, stateful transport underneath it.
//!
//! A transport delivers its events from whatever thread it likes. Nothing here touches
//! session state directly: every event and completion is turned into a command on the
//! session's inbox and handled on the session event loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use crossbeam_channel::Sender;
use crate::error::TransportError;
use super::endpoint::Endpoint;
use super::options::SessionOptions;
use super::session::Command;
use super::types::{send_or_log, FrameMetadata};

/// Identifies one transport instance within a session.
pub(crate) type ConnectionId = u64;

/// Called once a frame was handed to the network, with the error if it wasn't.
pub type SendCompletion = Box<dyn FnOnce(Option<TransportError>) + Send>;
/// Called with the next inbound frame, or the error that ended receiving.
pub type ReceiveCompletion = Box<dyn FnOnce(Received) + Send>;
/// Called once the pong answering a specific ping arrived, or the ping failed.
pub type PongHandler = Box<dyn FnOnce(Result<(), TransportError>) + Send>;

/// Raw connection state as reported by a transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportState {
    Setup,
    Preparing,
    Ready,
    /// Not connected, but the transport keeps trying.
    Waiting(TransportError),
    Failed(TransportError),
    Cancelled,
    /// A state the adapter could not map.
    Unknown,
}

/// Result of a single `receive_one` call.
#[derive(Debug, Default)]
pub struct Received {
    pub payload: Option<Vec<u8>>,
    pub metadata: Option<FrameMetadata>,
    pub error: Option<TransportError>,
}

impl Received {
    pub fn message(payload: Vec<u8>, metadata: FrameMetadata) -> Self {
        Received { payload: Some(payload), metadata: Some(metadata), error: None }
    }

    pub fn error(error: TransportError) -> Self {
        Received { error: Some(error), ..Received::default() }
    }
}

/// A frame handed to a transport.
pub struct OutgoingFrame {
    pub payload: Option<Vec<u8>>,
    pub metadata: FrameMetadata,
    /// Present on ping frames only.
    pub pong_handler: Option<PongHandler>,
}

/// A started-on-demand, framed WebSocket connection.
///
/// Implementations must never block in any of these methods and must deliver every
/// completion at most once.
pub trait Transport: Send {
    /// Attaches the sink for state, viability and better-path events. Called before `start`.
    fn bind(&mut self, events: TransportEvents);
    fn start(&mut self);
    fn send(&mut self, frame: OutgoingFrame, completion: SendCompletion);
    /// Requests exactly one inbound frame. May be called before `start`.
    fn receive_one(&mut self, completion: ReceiveCompletion);
    fn cancel(&mut self);
}

/// Creates a fresh transport for every connect and every migration.
pub trait TransportFactory: Send {
    fn make_transport(&mut self, endpoint: &Endpoint, options: &SessionOptions) -> Box<dyn Transport>;
}

/// Event sink handed to a transport. Once detached, events are silently dropped.
#[derive(Clone)]
pub struct TransportEvents {
    connection: ConnectionId,
    inbox: Sender<Command>,
    attached: Arc<AtomicBool>,
}

impl TransportEvents {
    pub(crate) fn new(connection: ConnectionId, inbox: Sender<Command>) -> Self {
        TransportEvents { connection, inbox, attached: Arc::new(AtomicBool::new(true)) }
    }

    pub fn state_changed(&self, state: TransportState) {
        if self.is_attached() {
            send_or_log!(self.inbox, "Command::StateChanged", Command::StateChanged { connection: self.connection, state });
        }
    }

    pub fn viability_changed(&self, is_viable: bool) {
        if self.is_attached() {
            send_or_log!(self.inbox, "Command::ViabilityChanged", Command::ViabilityChanged { connection: self.connection, is_viable });
        }
    }

    pub fn better_path_changed(&self, is_available: bool) {
        if self.is_attached() {
            send_or_log!(self.inbox, "Command::BetterPathChanged", Command::BetterPathChanged { connection: self.connection, is_available });
        }
    }

    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }

    pub(crate) fn detach(&self) {
        self.attached.store(false, Ordering::Release);
    }
}
