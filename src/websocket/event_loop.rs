//! The session event loop and the lifecycle state machine it drives.
//!
//! Everything in here runs on the session thread. Transport events, completions, API
//! calls and keepalive ticks all arrive as commands, so no state below is ever touched
//! concurrently.

use std::collections::VecDeque;
use std::sync::Weak;
use std::time::Instant;
use crossbeam_channel::{at, never, select, Receiver};
use tungstenite::protocol::frame::coding::CloseCode;
use crate::error::{PosixError, TransportError};
use super::classifier::{self, UNEXPECTED_DISCONNECTION_REASON};
use super::connection::{Connection, Retiring};
use super::endpoint::Endpoint;
use super::keepalive::Keepalive;
use super::options::SessionOptions;
use super::reporter::DisconnectionReporter;
use super::session::{Command, SessionHandle};
use super::shared::ControlFlow;
use super::transport::{ConnectionId, OutgoingFrame, PongHandler, Received, TransportFactory, TransportState};
use super::types::{send_or_log, FrameMetadata, MigrationResult, Opcode, S9WebSocketDelegate, SessionState};

const PING_PAYLOAD: &[u8] = b"ping";

/// Work that runs after the current command, still on the session thread.
enum Deferred {
    ReportDisconnection(u64),
}

pub(crate) struct SessionCore {
    endpoint: Endpoint,
    options: SessionOptions,
    factory: Box<dyn TransportFactory>,
    handle: SessionHandle,
    inbox: Receiver<Command>,
    delegate: Option<Weak<dyn S9WebSocketDelegate>>,
    connection: Option<Connection>,
    retiring: Vec<Retiring>,
    next_connection_id: ConnectionId,
    is_migrating: bool,
    error_while_waiting_count: u32,
    keepalive: Keepalive,
    reporter: DisconnectionReporter,
    deferred: VecDeque<Deferred>,
}

impl SessionCore {
    pub(crate) fn new(
        endpoint: Endpoint,
        options: SessionOptions,
        factory: Box<dyn TransportFactory>,
        handle: SessionHandle,
        inbox: Receiver<Command>,
    ) -> Self {
        SessionCore {
            endpoint,
            options,
            factory,
            handle,
            inbox,
            delegate: None,
            connection: None,
            retiring: Vec::new(),
            next_connection_id: 0,
            is_migrating: false,
            error_while_waiting_count: 0,
            keepalive: Keepalive::default(),
            reporter: DisconnectionReporter::new(),
            deferred: VecDeque::new(),
        }
    }

    // ========================================================================
    // Event loop
    // ========================================================================

    pub(crate) fn run(mut self) {
        if tracing::enabled!(tracing::Level::DEBUG) {
            tracing::debug!("Starting session event loop for {}", self.endpoint);
        }

        loop {
            let inbox = self.inbox.clone();
            let ticker = self.keepalive.receiver();
            let deadline = self.next_retirement_deadline().map(at).unwrap_or_else(never);

            let flow = select! {
                recv(inbox) -> command => match command {
                    Ok(command) => self.handle_command(command),
                    Err(_) => ControlFlow::Break,
                },
                recv(ticker) -> _ => {
                    self.ping();
                    ControlFlow::Continue
                },
                recv(deadline) -> _ => ControlFlow::Continue,
            };

            if let ControlFlow::Break = flow {
                self.shut_down();
                break;
            }
            self.run_deferred();
            self.cancel_due_retirements(Instant::now());
        }

        if tracing::enabled!(tracing::Level::DEBUG) {
            tracing::debug!("Session event loop for {} stopped", self.endpoint);
        }
    }

    fn handle_command(&mut self, command: Command) -> ControlFlow {
        match command {
            Command::SetDelegate(delegate) => self.delegate = delegate,
            Command::Connect => self.connect(),
            Command::Send { payload, opcode } => self.send(Some(payload), FrameMetadata::new(opcode), None),
            Command::Ping => self.ping(),
            Command::PingInterval(interval) => self.keepalive.install(interval),
            Command::Disconnect(close_code) => self.disconnect(close_code),
            Command::StateChanged { connection, state } => self.state_did_change(connection, state),
            Command::ViabilityChanged { connection, is_viable } => self.viability_did_change(connection, is_viable),
            Command::BetterPathChanged { connection, is_available } => self.better_path_did_change(connection, is_available),
            Command::Received { connection, received } => self.did_receive(connection, received),
            Command::SendCompleted { connection, metadata, reason, error } => self.send_did_complete(connection, metadata, reason, error),
            Command::PongCompleted { connection, result } => self.pong_did_complete(connection, result),
            Command::Shutdown => return ControlFlow::Break,
            #[cfg(test)]
            Command::Barrier(reply) => {
                // Runs everything queued by earlier commands before replying.
                self.run_deferred();
                self.cancel_due_retirements(Instant::now());
                let _ = reply.send(());
            }
        }
        ControlFlow::Continue
    }

    fn run_deferred(&mut self) {
        while let Some(work) = self.deferred.pop_front() {
            match work {
                Deferred::ReportDisconnection(generation) => {
                    if let Some(pending) = self.reporter.take_generation(generation) {
                        self.notify_disconnect(pending.close_code, pending.reason);
                    }
                }
            }
        }
    }

    // ========================================================================
    // Public operations
    // ========================================================================

    fn connect(&mut self) {
        match self.connection.as_mut() {
            None => {
                self.open_connection();
                self.set_state(SessionState::Connecting);
            },
            Some(connection) if !self.is_migrating => match connection.state {
                TransportState::Setup => connection.start(),
                ref state => {
                    if tracing::enabled!(tracing::Level::TRACE) {
                        tracing::trace!("Connect ignored, connection {} is {:?}", connection.id, state);
                    }
                }
            },
            Some(_) => tracing::trace!("Connect ignored while migrating"),
        }
    }

    fn open_connection(&mut self) {
        self.next_connection_id += 1;
        let transport = self.factory.make_transport(&self.endpoint, &self.options);
        let mut connection = Connection::new(self.next_connection_id, transport, self.handle.commands());
        connection.arm_receive(self.handle.commands());
        connection.start();
        self.connection = Some(connection);
        self.reporter.begin_episode();
    }

    fn send(&mut self, payload: Option<Vec<u8>>, metadata: FrameMetadata, pong_handler: Option<PongHandler>) {
        let Some(connection) = self.connection.as_mut() else {
            if tracing::enabled!(tracing::Level::TRACE) {
                tracing::trace!("No connection, dropping {:?} frame", metadata.opcode);
            }
            return;
        };

        let inbox = self.handle.commands().clone();
        let id = connection.id;
        let completed = metadata.clone();
        let reason = match metadata.opcode {
            Opcode::Close => payload.clone(),
            _ => None,
        };
        let frame = OutgoingFrame { payload, metadata, pong_handler };
        connection.send(frame, Box::new(move |error| {
            send_or_log!(inbox, "Command::SendCompleted", Command::SendCompleted { connection: id, metadata: completed, reason, error });
        }));
    }

    fn ping(&mut self) {
        let Some(connection) = self.connection.as_ref() else {
            tracing::trace!("No connection, skipping ping");
            return;
        };
        let inbox = self.handle.commands().clone();
        let id = connection.id;
        let pong_handler: PongHandler = Box::new(move |result| {
            send_or_log!(inbox, "Command::PongCompleted", Command::PongCompleted { connection: id, result });
        });
        self.send(Some(PING_PAYLOAD.to_vec()), FrameMetadata::new(Opcode::Ping), Some(pong_handler));
    }

    fn disconnect(&mut self, close_code: CloseCode) {
        if let Some(connection) = self.connection.as_mut() {
            connection.intentional_disconnect = true;
            self.set_state(SessionState::Disconnecting);
        }

        if close_code == CloseCode::Normal {
            if let Some(connection) = self.connection.as_mut() {
                connection.cancel();
            }
            self.schedule_disconnection(close_code, None);
            self.tear_down_connection(None);
            return;
        }

        let is_ready = self.connection.as_ref().is_some_and(|c| c.state == TransportState::Ready);
        if is_ready {
            // The report is scheduled from the send completion.
            self.send(None, FrameMetadata::close(close_code), None);
        } else {
            self.schedule_disconnection(close_code, None);
            self.tear_down_connection(None);
        }
    }

    // ========================================================================
    // Transport events
    // ========================================================================

    fn state_did_change(&mut self, id: ConnectionId, state: TransportState) {
        let Some(connection) = self.current_mut(id) else {
            tracing::trace!("Ignoring state change of stale connection {}", id);
            return;
        };
        let previous = std::mem::replace(&mut connection.state, state.clone());
        if tracing::enabled!(tracing::Level::DEBUG) {
            tracing::debug!("Connection {} state {:?} -> {:?}", id, previous, state);
        }

        match state {
            TransportState::Setup | TransportState::Preparing => {},
            TransportState::Ready => {
                self.error_while_waiting_count = 0;
                let was_migrating = std::mem::replace(&mut self.is_migrating, false);
                if previous != TransportState::Ready {
                    self.set_state(SessionState::Ready);
                    self.reporter.begin_episode();
                    self.notify(|delegate, session| delegate.on_connect(session));
                }
                if was_migrating {
                    self.resolve_migration(Ok(()));
                }
            },
            TransportState::Waiting(error) => {
                if previous == TransportState::Ready {
                    self.set_state(SessionState::Connecting);
                }
                self.report_error_or_disconnection(&error);

                if let Some(limit) = self.options.waiting_error_limit {
                    self.error_while_waiting_count += 1;
                    if self.error_while_waiting_count >= limit {
                        tracing::warn!("Connection {} kept waiting after {} errors, tearing down", id, limit);
                        self.error_while_waiting_count = 0;
                        if self.is_migrating {
                            self.resolve_migration(Err(error.clone()));
                        }
                        self.tear_down_connection(Some(error));
                    }
                }
            },
            TransportState::Failed(error) => {
                self.error_while_waiting_count = 0;
                if self.is_migrating {
                    self.resolve_migration(Err(error.clone()));
                }
                self.tear_down_connection(Some(error));
            },
            TransportState::Cancelled => {
                self.error_while_waiting_count = 0;
                if self.is_migrating {
                    self.resolve_migration(Err(TransportError::Posix(PosixError::Canceled)));
                }
                self.tear_down_connection(None);
            },
            TransportState::Unknown => {
                self.error_while_waiting_count = 0;
                let error = TransportError::Posix(PosixError::ConnectionAborted);
                if self.is_migrating {
                    self.resolve_migration(Err(error.clone()));
                }
                self.tear_down_connection(Some(error));
            },
        }
    }

    fn viability_did_change(&mut self, id: ConnectionId, is_viable: bool) {
        if self.current_mut(id).is_some() {
            self.notify(|delegate, session| delegate.on_viability_change(session, is_viable));
        }
    }

    fn better_path_did_change(&mut self, id: ConnectionId, is_available: bool) {
        if is_available && self.current_mut(id).is_some() {
            self.migrate_connection();
        }
    }

    // ========================================================================
    // Migration
    // ========================================================================

    fn migrate_connection(&mut self) {
        if self.is_migrating {
            tracing::debug!("Better path reported while a migration is in progress");
            self.notify_migration(Err(TransportError::Posix(PosixError::AlreadyInProgress)));
            return;
        }
        let is_ready = self.connection.as_ref().is_some_and(|c| c.state == TransportState::Ready);
        if !is_ready {
            tracing::trace!("Better path ignored, not connected");
            return;
        }
        let Some(mut old) = self.connection.take() else {
            return;
        };

        if tracing::enabled!(tracing::Level::DEBUG) {
            tracing::debug!("Migrating connection {} to a better path", old.id);
        }
        self.is_migrating = true;
        old.intentional_disconnect = true;
        old.detach();
        self.retiring.push(Retiring::until_released(old));

        self.open_connection();
        self.set_state(SessionState::Migrating);
    }

    /// Ends the migration and lets the replaced connections go.
    fn resolve_migration(&mut self, result: Result<(), TransportError>) {
        self.is_migrating = false;
        let grace = self.options.migration_grace;
        for retiring in self.retiring.iter_mut().filter(|r| !r.is_released()) {
            retiring.release(grace);
        }
        let handle = self.handle.clone();
        self.notify_migration(result.map(|()| handle));
    }

    // ========================================================================
    // Read loop and completions
    // ========================================================================

    fn did_receive(&mut self, id: ConnectionId, received: Received) {
        if self.current_mut(id).is_none() {
            tracing::trace!("Dropping frame from stale connection {}", id);
            return;
        }
        let Received { payload, metadata, error } = received;

        match (payload, metadata) {
            (payload, Some(metadata)) if metadata.opcode == Opcode::Close => {
                let close_code = metadata.close_code.unwrap_or(CloseCode::Status);
                self.peer_did_close(close_code, payload.filter(|p| !p.is_empty()));
                return;
            },
            (Some(payload), Some(metadata)) if !payload.is_empty() => self.dispatch_message(payload, metadata.opcode),
            _ => {},
        }

        match error {
            Some(error) => self.report_error_or_disconnection(&error),
            None => {
                let inbox = self.handle.commands().clone();
                if let Some(connection) = self.current_mut(id) {
                    connection.arm_receive(&inbox);
                }
            }
        }
    }

    fn dispatch_message(&mut self, payload: Vec<u8>, opcode: Opcode) {
        match opcode {
            Opcode::Text => match String::from_utf8(payload) {
                Ok(text) => {
                    if tracing::enabled!(tracing::Level::TRACE) {
                        tracing::trace!("Received text message: {}", text);
                    }
                    self.notify(|delegate, session| delegate.on_text_message(session, &text));
                },
                Err(_) => tracing::trace!("Dropping text message that is not valid UTF-8"),
            },
            Opcode::Binary => {
                if tracing::enabled!(tracing::Level::TRACE) {
                    tracing::trace!("Received binary message: {} bytes", payload.len());
                }
                self.notify(|delegate, session| delegate.on_binary_message(session, &payload));
            },
            // Pings are answered by the transport, pongs go to their per-request handler.
            Opcode::Ping | Opcode::Pong | Opcode::Continuation | Opcode::Close => {},
        }
    }

    fn peer_did_close(&mut self, close_code: CloseCode, reason: Option<Vec<u8>>) {
        if tracing::enabled!(tracing::Level::DEBUG) {
            tracing::debug!("Peer closed the connection with code {:?}", close_code);
        }
        self.schedule_disconnection(close_code, reason);
        self.tear_down_connection(None);
    }

    fn send_did_complete(&mut self, id: ConnectionId, metadata: FrameMetadata, reason: Option<Vec<u8>>, error: Option<TransportError>) {
        if let Some(connection) = self.current_mut(id) {
            connection.send_completed();
        } else {
            if let Some(retiring) = self.retiring.iter_mut().find(|r| r.connection.id == id) {
                retiring.connection.send_completed();
            }
            return;
        }

        if metadata.opcode == Opcode::Close {
            self.schedule_disconnection(metadata.close_code.unwrap_or(CloseCode::Normal), reason);
        }
        if let Some(error) = error {
            self.report_error_or_disconnection(&error);
        }
        if metadata.opcode == Opcode::Close {
            self.tear_down_connection(None);
        }
    }

    fn pong_did_complete(&mut self, id: ConnectionId, result: Result<(), TransportError>) {
        if self.current_mut(id).is_none() {
            return;
        }
        match result {
            Ok(()) => self.notify(|delegate, session| delegate.on_pong(session)),
            Err(error) => self.report_error_or_disconnection(&error),
        }
    }

    // ========================================================================
    // Errors, disconnection and teardown
    // ========================================================================

    fn report_error_or_disconnection(&mut self, error: &TransportError) {
        if classifier::should_report(error, self.is_intentional_disconnect()) {
            self.notify(|delegate, session| delegate.on_error(session, error));
        }
        if classifier::is_disconnection(error) && !self.reporter.is_pending() {
            self.schedule_disconnection(CloseCode::Away, Some(UNEXPECTED_DISCONNECTION_REASON.as_bytes().to_vec()));
        }
    }

    fn schedule_disconnection(&mut self, close_code: CloseCode, reason: Option<Vec<u8>>) {
        if let Some(generation) = self.reporter.schedule(close_code, reason) {
            self.deferred.push_back(Deferred::ReportDisconnection(generation));
        }
    }

    fn tear_down_connection(&mut self, error: Option<TransportError>) {
        // The replaced connection must not outlive the one that replaced it.
        if self.is_migrating {
            self.resolve_migration(Err(TransportError::Posix(PosixError::Canceled)));
        }
        let was_intentional = self.is_intentional_disconnect();
        if let Some(connection) = self.connection.as_mut() {
            connection.intentional_disconnect = true;
        }

        if let Some(error) = &error {
            if classifier::should_report(error, self.is_intentional_disconnect()) {
                self.notify(|delegate, session| delegate.on_error(session, error));
            }
        }
        self.keepalive.invalidate();

        if let Some(connection) = self.connection.take() {
            if tracing::enabled!(tracing::Level::DEBUG) {
                tracing::debug!("Tearing down connection {}", connection.id);
            }
            connection.detach();
            self.retiring.push(Retiring::after(connection, self.options.teardown_grace));
            self.cancel_due_retirements(Instant::now());
        }

        let state = match error {
            Some(_) if !was_intentional => SessionState::Failed,
            _ => SessionState::Disconnected,
        };
        self.set_state(state);

        if let Some(pending) = self.reporter.take() {
            self.notify_disconnect(pending.close_code, pending.reason);
        }
    }

    fn cancel_due_retirements(&mut self, now: Instant) {
        let mut index = 0;
        while index < self.retiring.len() {
            if self.retiring[index].is_due(now) {
                let mut retiring = self.retiring.swap_remove(index);
                retiring.connection.cancel();
            } else {
                index += 1;
            }
        }
    }

    fn next_retirement_deadline(&self) -> Option<Instant> {
        self.retiring.iter().filter_map(Retiring::deadline).min()
    }

    fn shut_down(&mut self) {
        tracing::debug!("Shutting down session");
        self.keepalive.invalidate();
        if let Some(mut connection) = self.connection.take() {
            connection.intentional_disconnect = true;
            connection.detach();
            connection.cancel();
        }
        for mut retiring in self.retiring.drain(..) {
            retiring.connection.cancel();
        }
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn current_mut(&mut self, id: ConnectionId) -> Option<&mut Connection> {
        self.connection.as_mut().filter(|c| c.id == id)
    }

    fn is_intentional_disconnect(&self) -> bool {
        self.connection.as_ref().is_some_and(|c| c.intentional_disconnect)
    }

    fn set_state(&self, state: SessionState) {
        self.handle.shared().set_state(state);
    }

    fn notify<F>(&self, f: F)
    where
        F: FnOnce(&dyn S9WebSocketDelegate, &SessionHandle),
    {
        if let Some(delegate) = self.delegate.as_ref().and_then(Weak::upgrade) {
            f(delegate.as_ref(), &self.handle);
        }
    }

    fn notify_disconnect(&self, close_code: CloseCode, reason: Option<Vec<u8>>) {
        if tracing::enabled!(tracing::Level::DEBUG) {
            tracing::debug!("Reporting disconnection with code {:?}", close_code);
        }
        self.notify(|delegate, session| delegate.on_disconnect(session, close_code, reason.as_deref()));
    }

    fn notify_migration(&self, result: MigrationResult) {
        if let Some(delegate) = self.delegate.as_ref().and_then(Weak::upgrade) {
            delegate.on_migration(result);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;
    use crate::error::{PosixError, TransportError};
    use crate::websocket::options::SessionOptions;
    use crate::websocket::testing::{Event, Harness, RecordingDelegate};
    use crate::websocket::transport::{Received, TransportState};
    use crate::websocket::types::{FrameMetadata, Opcode, SessionState};
    use super::*;

    fn posix(error: PosixError) -> TransportError {
        TransportError::Posix(error)
    }

    fn unexpected() -> Event {
        Event::Disconnect(CloseCode::Away, Some(UNEXPECTED_DISCONNECTION_REASON.as_bytes().to_vec()))
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn every_ready_edge_notifies_connect_once() {
        let harness = Harness::new();
        let control = harness.connect_ready();
        assert_eq!(harness.session.state(), SessionState::Ready);

        control.set_state(TransportState::Ready);
        control.set_state(TransportState::Waiting(posix(PosixError::ConnectionRefused)));
        control.set_state(TransportState::Preparing);
        control.set_state(TransportState::Ready);
        control.set_state(TransportState::Ready);
        harness.settle();

        assert_eq!(harness.delegate.events(), vec![
            Event::Connect,
            Event::Error(posix(PosixError::ConnectionRefused)),
            Event::Connect,
        ]);
        assert_eq!(harness.session.state(), SessionState::Ready);
    }

    #[test]
    fn connect_is_idempotent() {
        let harness = Harness::new();
        harness.session.connect().unwrap();
        harness.session.connect().unwrap();
        harness.settle();

        let control = harness.next_transport();
        assert!(harness.no_new_transport());
        assert_eq!(control.start_count(), 1);
        assert_eq!(harness.session.state(), SessionState::Connecting);

        control.set_state(TransportState::Ready);
        harness.session.connect().unwrap();
        harness.settle();
        assert!(harness.no_new_transport());
        assert_eq!(control.start_count(), 1);
    }

    #[test]
    fn connect_automatically_opens_on_creation() {
        let harness = Harness::with_options(SessionOptions::new().connect_automatically(true));
        let control = harness.next_transport();
        harness.settle();
        assert_eq!(control.start_count(), 1);
    }

    #[test]
    fn double_disconnect_reports_once() {
        let harness = Harness::new();
        let control = harness.connect_ready();

        harness.session.disconnect().unwrap();
        harness.session.disconnect().unwrap();
        harness.settle();

        assert_eq!(harness.delegate.events(), vec![Event::Connect, Event::Disconnect(CloseCode::Normal, None)]);
        assert_eq!(control.cancel_count(), 1);
        assert_eq!(harness.session.state(), SessionState::Disconnected);

        // Late events of the released transport are not seen anymore.
        control.set_state(TransportState::Cancelled);
        harness.settle();
        assert_eq!(harness.delegate.disconnects(), 1);
    }

    #[test]
    fn close_frame_completion_reports_its_code_once() {
        let harness = Harness::new();
        let control = harness.connect_ready();

        harness.session.disconnect_with(CloseCode::Away).unwrap();
        harness.settle();
        assert_eq!(harness.delegate.disconnects(), 0);
        assert_eq!(harness.session.state(), SessionState::Disconnecting);
        assert_eq!(control.sent_frames()[0].metadata, FrameMetadata::close(CloseCode::Away));

        control.complete_send(0, None);
        harness.settle();

        assert_eq!(harness.delegate.events(), vec![Event::Connect, Event::Disconnect(CloseCode::Away, None)]);
        assert_eq!(control.cancel_count(), 1);
        assert_eq!(harness.session.state(), SessionState::Disconnected);
    }

    #[test]
    fn not_connected_is_suppressed_only_after_intent() {
        let harness = Harness::new();
        let control = harness.connect_ready();

        harness.session.disconnect_with(CloseCode::Policy).unwrap();
        harness.settle();
        control.complete_send(0, Some(posix(PosixError::NotConnected)));
        harness.settle();

        assert_eq!(harness.delegate.events(), vec![Event::Connect, Event::Disconnect(CloseCode::Policy, None)]);

        let harness = Harness::new();
        let control = harness.connect_ready();
        assert!(control.deliver(Received::error(posix(PosixError::NotConnected))));
        harness.settle();

        assert_eq!(harness.delegate.events(), vec![
            Event::Connect,
            Event::Error(posix(PosixError::NotConnected)),
            unexpected(),
        ]);
        // A receive error ends the read loop.
        assert_eq!(control.pending_receives(), 0);
    }

    #[test]
    fn disconnect_without_ready_connection_reports_immediately() {
        let harness = Harness::new();
        harness.session.connect().unwrap();
        let control = harness.next_transport();

        harness.session.disconnect_with(CloseCode::Away).unwrap();
        harness.settle();

        assert!(control.sent_frames().is_empty());
        assert_eq!(harness.delegate.events(), vec![Event::Disconnect(CloseCode::Away, None)]);
        assert_eq!(control.cancel_count(), 1);
        assert_eq!(harness.session.state(), SessionState::Disconnected);
    }

    #[test]
    fn peer_close_frame_reports_code_and_reason() {
        let harness = Harness::new();
        let control = harness.connect_ready();

        assert!(control.deliver(Received::message(b"bye".to_vec(), FrameMetadata::close(CloseCode::Away))));
        harness.settle();

        assert_eq!(harness.delegate.events(), vec![
            Event::Connect,
            Event::Disconnect(CloseCode::Away, Some(b"bye".to_vec())),
        ]);
        assert_eq!(control.cancel_count(), 1);
        assert_eq!(harness.session.state(), SessionState::Disconnected);
    }

    #[test]
    fn peer_close_without_reason() {
        let harness = Harness::new();
        let control = harness.connect_ready();

        assert!(control.deliver(Received::message(Vec::new(), FrameMetadata::new(Opcode::Close))));
        harness.settle();

        assert_eq!(harness.delegate.events(), vec![Event::Connect, Event::Disconnect(CloseCode::Status, None)]);
    }

    #[test]
    fn messages_are_dispatched_by_opcode() {
        let harness = Harness::new();
        let control = harness.connect_ready();

        assert!(control.deliver(Received::message(b"hello".to_vec(), FrameMetadata::new(Opcode::Text))));
        harness.settle();
        assert!(control.deliver(Received::message(vec![1, 2, 3], FrameMetadata::new(Opcode::Binary))));
        harness.settle();
        assert!(control.deliver(Received::message(vec![0xff, 0xfe], FrameMetadata::new(Opcode::Text))));
        harness.settle();
        assert!(control.deliver(Received::message(Vec::new(), FrameMetadata::new(Opcode::Binary))));
        harness.settle();
        assert!(control.deliver(Received::message(b"pong".to_vec(), FrameMetadata::new(Opcode::Pong))));
        harness.settle();

        assert_eq!(harness.delegate.events(), vec![
            Event::Connect,
            Event::Text("hello".to_string()),
            Event::Binary(vec![1, 2, 3]),
        ]);
        assert_eq!(control.pending_receives(), 1);
    }

    #[test]
    fn sends_are_framed_by_opcode() {
        let harness = Harness::new();
        harness.session.send_text("dropped").unwrap();
        let control = harness.connect_ready();

        harness.session.send_text("hi").unwrap();
        harness.session.send_binary(vec![9]).unwrap();
        harness.session.send_text_bytes(&[0xc3, 0x28]).unwrap();
        harness.session.send_text_bytes("ok".as_bytes()).unwrap();
        harness.settle();

        let sent = control.sent_frames();
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[0].payload.as_deref(), Some(&b"hi"[..]));
        assert_eq!(sent[0].metadata.opcode, Opcode::Text);
        assert_eq!(sent[1].metadata.opcode, Opcode::Binary);
        assert_eq!(sent[2].payload.as_deref(), Some(&b"ok"[..]));
    }

    #[test]
    fn pong_is_reported_per_ping() {
        let harness = Harness::new();
        let control = harness.connect_ready();

        harness.session.ping().unwrap();
        harness.settle();
        let sent = control.sent_frames();
        assert_eq!(sent[0].metadata.opcode, Opcode::Ping);
        assert_eq!(sent[0].payload.as_deref(), Some(PING_PAYLOAD));

        control.complete_send(0, None);
        control.answer_ping(Ok(()));
        harness.settle();
        assert_eq!(harness.delegate.events(), vec![Event::Connect, Event::Pong]);
    }

    #[test]
    fn failing_ping_reports_error_without_pong() {
        let harness = Harness::new();
        let control = harness.connect_ready();

        harness.session.ping().unwrap();
        harness.settle();
        control.complete_send(0, None);
        control.answer_ping(Err(posix(PosixError::TimedOut)));
        harness.settle();

        let events = harness.delegate.events();
        assert!(!events.contains(&Event::Pong));
        assert_eq!(events, vec![Event::Connect, Event::Error(posix(PosixError::TimedOut)), unexpected()]);
    }

    #[test]
    fn ping_interval_pings_until_teardown() {
        let harness = Harness::new();
        let control = harness.connect_ready();

        assert!(harness.session.ping_interval(Duration::ZERO).is_err());
        harness.session.ping_interval(Duration::from_millis(10)).unwrap();
        let pings = |control: &crate::websocket::testing::MockControl| {
            control.sent_frames().iter().filter(|f| f.metadata.opcode == Opcode::Ping).count()
        };
        assert!(wait_until(|| pings(&control) >= 2));

        harness.session.disconnect().unwrap();
        harness.settle();
        let after_teardown = pings(&control);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(pings(&control), after_teardown);
    }

    #[test]
    fn waiting_errors_trip_the_breaker() {
        let options = SessionOptions::new().waiting_error_limit(Some(3)).unwrap();
        let harness = Harness::with_options(options);
        harness.session.connect().unwrap();
        let control = harness.next_transport();

        for _ in 0..2 {
            control.set_state(TransportState::Waiting(posix(PosixError::ConnectionRefused)));
        }
        harness.settle();
        assert_eq!(control.cancel_count(), 0);
        assert_eq!(harness.session.state(), SessionState::Connecting);

        control.set_state(TransportState::Waiting(posix(PosixError::ConnectionRefused)));
        harness.settle();

        let errors = harness.delegate.events().iter().filter(|e| matches!(e, Event::Error(_))).count();
        assert_eq!(errors, 4);
        assert_eq!(control.cancel_count(), 1);
        assert_eq!(harness.session.state(), SessionState::Failed);
    }

    #[test]
    fn disabled_breaker_keeps_waiting() {
        let options = SessionOptions::new().waiting_error_limit(None).unwrap();
        let harness = Harness::with_options(options);
        harness.session.connect().unwrap();
        let control = harness.next_transport();

        for _ in 0..30 {
            control.set_state(TransportState::Waiting(posix(PosixError::NetworkUnreachable)));
        }
        harness.settle();

        assert_eq!(control.cancel_count(), 0);
        assert_eq!(harness.session.state(), SessionState::Connecting);
    }

    #[test]
    fn unknown_state_tears_down_as_aborted() {
        let harness = Harness::new();
        let control = harness.connect_ready();

        control.set_state(TransportState::Unknown);
        harness.settle();

        assert_eq!(harness.delegate.events(), vec![Event::Connect, Event::Error(posix(PosixError::ConnectionAborted))]);
        assert_eq!(control.cancel_count(), 1);
        assert_eq!(harness.session.state(), SessionState::Failed);
    }

    #[test]
    fn cancelled_transport_tears_down_quietly() {
        let harness = Harness::new();
        let control = harness.connect_ready();

        control.set_state(TransportState::Cancelled);
        harness.settle();

        assert_eq!(harness.delegate.events(), vec![Event::Connect]);
        assert_eq!(harness.session.state(), SessionState::Disconnected);
    }

    #[test]
    fn viability_changes_are_forwarded() {
        let harness = Harness::new();
        let control = harness.connect_ready();

        control.viability(false);
        control.viability(true);
        harness.settle();

        assert_eq!(harness.delegate.events(), vec![Event::Connect, Event::Viability(false), Event::Viability(true)]);
    }

    #[test]
    fn migration_moves_to_new_connection() {
        let harness = Harness::new();
        let old = harness.connect_ready();

        old.better_path(true);
        harness.settle();
        let new = harness.next_transport();
        assert_eq!(harness.session.state(), SessionState::Migrating);
        assert_eq!(new.start_count(), 1);
        assert_eq!(old.cancel_count(), 0);

        new.set_state(TransportState::Ready);
        harness.settle();

        let events = harness.delegate.events();
        assert_eq!(events.len(), 3);
        assert_eq!(events[1], Event::Connect);
        match &events[2] {
            Event::Migration(Ok(handle)) => assert_eq!(*handle, harness.session.handle()),
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(old.cancel_count(), 1);
        assert_eq!(harness.session.state(), SessionState::Ready);

        // Only the new connection is heard from.
        assert!(old.deliver(Received::message(b"stale".to_vec(), FrameMetadata::new(Opcode::Text))));
        assert!(new.deliver(Received::message(b"fresh".to_vec(), FrameMetadata::new(Opcode::Text))));
        harness.settle();
        assert_eq!(harness.delegate.events().last(), Some(&Event::Text("fresh".to_string())));
        assert!(!harness.delegate.events().contains(&Event::Text("stale".to_string())));
    }

    #[test]
    fn second_migration_fails_fast() {
        let harness = Harness::new();
        let old = harness.connect_ready();

        old.better_path(true);
        harness.settle();
        let new = harness.next_transport();
        new.better_path(true);
        harness.settle();

        assert!(harness.no_new_transport());
        assert_eq!(harness.delegate.events(), vec![
            Event::Connect,
            Event::Migration(Err(posix(PosixError::AlreadyInProgress))),
        ]);

        new.set_state(TransportState::Ready);
        harness.settle();
        let events = harness.delegate.events();
        assert_eq!(events[2], Event::Connect);
        assert!(matches!(events[3], Event::Migration(Ok(_))));
    }

    #[test]
    fn failed_migration_resolves_with_error() {
        let harness = Harness::new();
        let old = harness.connect_ready();

        old.better_path(true);
        harness.settle();
        let new = harness.next_transport();
        new.set_state(TransportState::Failed(posix(PosixError::HostUnreachable)));
        harness.settle();

        assert_eq!(harness.delegate.events(), vec![
            Event::Connect,
            Event::Migration(Err(posix(PosixError::HostUnreachable))),
            Event::Error(posix(PosixError::HostUnreachable)),
        ]);
        assert_eq!(old.cancel_count(), 1);
        assert_eq!(new.cancel_count(), 1);
        assert_eq!(harness.session.state(), SessionState::Failed);
    }

    #[test]
    fn better_path_is_ignored_before_ready() {
        let harness = Harness::new();
        harness.session.connect().unwrap();
        let control = harness.next_transport();

        control.better_path(true);
        control.better_path(false);
        harness.settle();

        assert!(harness.no_new_transport());
        assert!(harness.delegate.events().is_empty());
    }

    #[test]
    fn disconnect_during_migration_cancels_old_connection() {
        let harness = Harness::new();
        let old = harness.connect_ready();

        old.better_path(true);
        harness.settle();
        let new = harness.next_transport();

        harness.session.disconnect().unwrap();
        harness.settle();

        assert_eq!(harness.delegate.events(), vec![
            Event::Connect,
            Event::Migration(Err(posix(PosixError::Canceled))),
            Event::Disconnect(CloseCode::Normal, None),
        ]);
        assert_eq!(old.cancel_count(), 1);
        assert_eq!(new.cancel_count(), 1);
        assert_eq!(harness.session.state(), SessionState::Disconnected);

        // A plain reconnect afterwards is not reported as a migration.
        let fresh = harness.connect_ready();
        assert_eq!(fresh.start_count(), 1);
        let events = harness.delegate.events();
        assert_eq!(events.len(), 4);
        assert_eq!(events[3], Event::Connect);
    }

    #[test]
    fn waiting_migration_trips_the_breaker() {
        let options = SessionOptions::new().waiting_error_limit(Some(2)).unwrap();
        let harness = Harness::with_options(options);
        let old = harness.connect_ready();

        old.better_path(true);
        harness.settle();
        let new = harness.next_transport();

        new.set_state(TransportState::Waiting(posix(PosixError::ConnectionRefused)));
        harness.settle();
        assert_eq!(harness.session.state(), SessionState::Migrating);
        assert_eq!(old.cancel_count(), 0);

        new.set_state(TransportState::Waiting(posix(PosixError::ConnectionRefused)));
        harness.settle();

        assert_eq!(harness.delegate.events(), vec![
            Event::Connect,
            Event::Error(posix(PosixError::ConnectionRefused)),
            Event::Error(posix(PosixError::ConnectionRefused)),
            Event::Migration(Err(posix(PosixError::ConnectionRefused))),
            Event::Error(posix(PosixError::ConnectionRefused)),
        ]);
        assert_eq!(old.cancel_count(), 1);
        assert_eq!(new.cancel_count(), 1);
        assert_eq!(harness.session.state(), SessionState::Failed);
    }

    #[test]
    fn delegate_is_held_weakly() {
        let harness = Harness::new();
        let control = harness.connect_ready();

        let replacement = Arc::new(RecordingDelegate::default());
        harness.session.set_delegate(Arc::downgrade(&replacement)).unwrap();
        assert!(control.deliver(Received::message(b"one".to_vec(), FrameMetadata::new(Opcode::Text))));
        harness.settle();
        assert_eq!(replacement.events(), vec![Event::Text("one".to_string())]);

        drop(replacement);
        assert!(control.deliver(Received::message(b"two".to_vec(), FrameMetadata::new(Opcode::Text))));
        harness.settle();
        assert_eq!(harness.delegate.events(), vec![Event::Connect]);
    }

    #[test]
    fn retired_connection_waits_for_in_flight_sends() {
        let options = SessionOptions::new().teardown_grace(Duration::from_secs(60));
        let harness = Harness::with_options(options);
        let control = harness.connect_ready();

        harness.session.send_text("in flight").unwrap();
        control.set_state(TransportState::Failed(posix(PosixError::ConnectionReset)));
        harness.settle();
        assert_eq!(control.cancel_count(), 0);

        control.complete_send(0, None);
        harness.settle();
        assert_eq!(control.cancel_count(), 1);
    }

    #[test]
    fn dropping_the_session_cancels_the_transport() {
        let harness = Harness::new();
        let control = harness.connect_ready();
        let handle = harness.session.handle();

        drop(harness);
        assert!(wait_until(|| control.cancel_count() == 1));
        assert!(wait_until(|| handle.connect().is_err()));
    }
}
