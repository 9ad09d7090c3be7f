use std::time::{Duration, Instant};
use crossbeam_channel::Sender;
use super::session::Command;
use super::transport::{ConnectionId, OutgoingFrame, Received, SendCompletion, Transport, TransportEvents, TransportState};
use super::types::send_or_log;

// ============================================================================
// Connection - one transport as seen by the session
// ============================================================================

pub(crate) struct Connection {
    pub(crate) id: ConnectionId,
    transport: Box<dyn Transport>,
    events: TransportEvents,
    pub(crate) state: TransportState,
    pub(crate) intentional_disconnect: bool,
    in_flight_sends: usize,
    started: bool,
    cancelled: bool,
}

impl Connection {
    /// Wraps a fresh transport and wires its event streams to the session inbox.
    pub(crate) fn new(id: ConnectionId, mut transport: Box<dyn Transport>, inbox: &Sender<Command>) -> Self {
        let events = TransportEvents::new(id, inbox.clone());
        transport.bind(events.clone());
        Connection {
            id,
            transport,
            events,
            state: TransportState::Setup,
            intentional_disconnect: false,
            in_flight_sends: 0,
            started: false,
            cancelled: false,
        }
    }

    /// One-shot; a transport is never started twice.
    pub(crate) fn start(&mut self) {
        if self.started {
            return;
        }
        self.started = true;
        if tracing::enabled!(tracing::Level::DEBUG) {
            tracing::debug!("Starting connection {}", self.id);
        }
        self.transport.start();
    }

    /// Requests the next inbound frame; its completion re-enters the session as a command.
    pub(crate) fn arm_receive(&mut self, inbox: &Sender<Command>) {
        let inbox = inbox.clone();
        let connection = self.id;
        self.transport.receive_one(Box::new(move |received: Received| {
            send_or_log!(inbox, "Command::Received", Command::Received { connection, received });
        }));
    }

    pub(crate) fn send(&mut self, frame: OutgoingFrame, completion: SendCompletion) {
        self.in_flight_sends += 1;
        self.transport.send(frame, completion);
    }

    pub(crate) fn send_completed(&mut self) {
        self.in_flight_sends = self.in_flight_sends.saturating_sub(1);
    }

    pub(crate) fn in_flight_sends(&self) -> usize {
        self.in_flight_sends
    }

    /// Stops the transport from generating further session events.
    pub(crate) fn detach(&self) {
        self.events.detach();
    }

    /// One-shot; repeated calls are ignored.
    pub(crate) fn cancel(&mut self) {
        if self.cancelled || self.state == TransportState::Cancelled {
            return;
        }
        self.cancelled = true;
        if tracing::enabled!(tracing::Level::DEBUG) {
            tracing::debug!("Cancelling connection {}", self.id);
        }
        self.transport.cancel();
    }
}

// ============================================================================
// Retiring - a detached connection waiting to be cancelled
// ============================================================================

/// A connection that no longer belongs to the session but may still have sends in flight.
///
/// It is cancelled as soon as its in-flight sends completed or its deadline passed,
/// whichever comes first. Without a deadline it waits for [`release`](Self::release).
pub(crate) struct Retiring {
    pub(crate) connection: Connection,
    cancel_at: Option<Instant>,
}

impl Retiring {
    pub(crate) fn after(connection: Connection, grace: Duration) -> Self {
        Retiring { connection, cancel_at: Some(Instant::now() + grace) }
    }

    /// Held until the connection replacing it resolved.
    pub(crate) fn until_released(connection: Connection) -> Self {
        Retiring { connection, cancel_at: None }
    }

    pub(crate) fn is_released(&self) -> bool {
        self.cancel_at.is_some()
    }

    pub(crate) fn release(&mut self, grace: Duration) {
        if self.cancel_at.is_none() {
            self.cancel_at = Some(Instant::now() + grace);
        }
    }

    pub(crate) fn deadline(&self) -> Option<Instant> {
        self.cancel_at
    }

    pub(crate) fn is_due(&self, now: Instant) -> bool {
        match self.cancel_at {
            Some(deadline) => self.connection.in_flight_sends() == 0 || now >= deadline,
            None => false,
        }
    }
}
