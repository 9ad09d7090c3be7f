//! Scripted transport and recording delegate for driving a real session event loop in tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use crossbeam_channel::{unbounded, Receiver, Sender};
use tungstenite::protocol::frame::coding::CloseCode;
use crate::error::TransportError;
use super::endpoint::Endpoint;
use super::options::SessionOptions;
use super::session::{S9WebSocketSession, SessionHandle};
use super::transport::{OutgoingFrame, PongHandler, ReceiveCompletion, Received, SendCompletion, Transport, TransportEvents, TransportFactory, TransportState};
use super::types::{FrameMetadata, MigrationResult, S9WebSocketDelegate};

// ============================================================================
// MockTransport
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SentFrame {
    pub(crate) payload: Option<Vec<u8>>,
    pub(crate) metadata: FrameMetadata,
}

#[derive(Default)]
struct MockState {
    events: Option<TransportEvents>,
    sent: Vec<SentFrame>,
    send_completions: Vec<Option<SendCompletion>>,
    pong_handlers: VecDeque<PongHandler>,
    receives: VecDeque<ReceiveCompletion>,
    starts: usize,
    cancels: usize,
}

pub(crate) struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub(crate) fn new() -> (MockTransport, MockControl) {
        let state = Arc::new(Mutex::new(MockState::default()));
        (MockTransport { state: Arc::clone(&state) }, MockControl { state })
    }
}

impl Transport for MockTransport {
    fn bind(&mut self, events: TransportEvents) {
        self.state.lock().unwrap().events = Some(events);
    }

    fn start(&mut self) {
        self.state.lock().unwrap().starts += 1;
    }

    fn send(&mut self, frame: OutgoingFrame, completion: SendCompletion) {
        let mut state = self.state.lock().unwrap();
        state.sent.push(SentFrame { payload: frame.payload, metadata: frame.metadata });
        state.send_completions.push(Some(completion));
        if let Some(handler) = frame.pong_handler {
            state.pong_handlers.push_back(handler);
        }
    }

    fn receive_one(&mut self, completion: ReceiveCompletion) {
        self.state.lock().unwrap().receives.push_back(completion);
    }

    fn cancel(&mut self) {
        self.state.lock().unwrap().cancels += 1;
    }
}

/// Test side of a [`MockTransport`]. Callbacks are always invoked without holding the lock.
#[derive(Clone)]
pub(crate) struct MockControl {
    state: Arc<Mutex<MockState>>,
}

impl MockControl {
    fn events(&self) -> TransportEvents {
        self.state.lock().unwrap().events.clone().expect("transport not bound")
    }

    pub(crate) fn set_state(&self, state: TransportState) {
        self.events().state_changed(state);
    }

    pub(crate) fn viability(&self, is_viable: bool) {
        self.events().viability_changed(is_viable);
    }

    pub(crate) fn better_path(&self, is_available: bool) {
        self.events().better_path_changed(is_available);
    }

    /// Completes the oldest outstanding receive. Returns false if none was armed.
    pub(crate) fn deliver(&self, received: Received) -> bool {
        let completion = self.state.lock().unwrap().receives.pop_front();
        match completion {
            Some(completion) => {
                completion(received);
                true
            },
            None => false,
        }
    }

    pub(crate) fn pending_receives(&self) -> usize {
        self.state.lock().unwrap().receives.len()
    }

    pub(crate) fn sent_frames(&self) -> Vec<SentFrame> {
        self.state.lock().unwrap().sent.clone()
    }

    pub(crate) fn complete_send(&self, index: usize, error: Option<TransportError>) {
        let completion = self.state.lock().unwrap().send_completions.get_mut(index).and_then(Option::take);
        completion.expect("no outstanding send at index")(error);
    }

    /// Answers the oldest outstanding ping.
    pub(crate) fn answer_ping(&self, result: Result<(), TransportError>) {
        let handler = self.state.lock().unwrap().pong_handlers.pop_front();
        handler.expect("no outstanding ping")(result);
    }

    pub(crate) fn start_count(&self) -> usize {
        self.state.lock().unwrap().starts
    }

    pub(crate) fn cancel_count(&self) -> usize {
        self.state.lock().unwrap().cancels
    }
}

/// Hands the control of every transport it makes to the test.
pub(crate) struct MockFactory {
    controls: Sender<MockControl>,
}

impl MockFactory {
    pub(crate) fn new() -> (MockFactory, Receiver<MockControl>) {
        let (controls, rx) = unbounded();
        (MockFactory { controls }, rx)
    }
}

impl TransportFactory for MockFactory {
    fn make_transport(&mut self, _endpoint: &Endpoint, _options: &SessionOptions) -> Box<dyn Transport> {
        let (transport, control) = MockTransport::new();
        let _ = self.controls.send(control);
        Box::new(transport)
    }
}

// ============================================================================
// RecordingDelegate
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Event {
    Connect,
    Disconnect(CloseCode, Option<Vec<u8>>),
    Error(TransportError),
    Pong,
    Text(String),
    Binary(Vec<u8>),
    Viability(bool),
    Migration(MigrationResult),
}

#[derive(Default)]
pub(crate) struct RecordingDelegate {
    events: Mutex<Vec<Event>>,
}

impl RecordingDelegate {
    pub(crate) fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub(crate) fn disconnects(&self) -> usize {
        self.events().iter().filter(|e| matches!(e, Event::Disconnect(..))).count()
    }

    fn record(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}

impl S9WebSocketDelegate for RecordingDelegate {
    fn on_connect(&self, _session: &SessionHandle) {
        self.record(Event::Connect);
    }

    fn on_disconnect(&self, _session: &SessionHandle, close_code: CloseCode, reason: Option<&[u8]>) {
        self.record(Event::Disconnect(close_code, reason.map(<[u8]>::to_vec)));
    }

    fn on_error(&self, _session: &SessionHandle, error: &TransportError) {
        self.record(Event::Error(error.clone()));
    }

    fn on_pong(&self, _session: &SessionHandle) {
        self.record(Event::Pong);
    }

    fn on_text_message(&self, _session: &SessionHandle, text: &str) {
        self.record(Event::Text(text.to_string()));
    }

    fn on_binary_message(&self, _session: &SessionHandle, data: &[u8]) {
        self.record(Event::Binary(data.to_vec()));
    }

    fn on_viability_change(&self, _session: &SessionHandle, is_viable: bool) {
        self.record(Event::Viability(is_viable));
    }

    fn on_migration(&self, result: MigrationResult) {
        self.record(Event::Migration(result));
    }
}

// ============================================================================
// Harness
// ============================================================================

/// A session wired to a [`MockFactory`] and a [`RecordingDelegate`].
pub(crate) struct Harness {
    pub(crate) session: S9WebSocketSession,
    pub(crate) delegate: Arc<RecordingDelegate>,
    controls: Receiver<MockControl>,
}

impl Harness {
    pub(crate) fn new() -> Harness {
        Self::with_options(SessionOptions::new())
    }

    pub(crate) fn with_options(options: SessionOptions) -> Harness {
        let (factory, controls) = MockFactory::new();
        let endpoint = Endpoint::parse("ws://localhost:9001").unwrap();
        let session = S9WebSocketSession::with_transport(endpoint, options, factory).unwrap();
        let delegate = Arc::new(RecordingDelegate::default());
        session.set_delegate(Arc::downgrade(&delegate)).unwrap();
        Harness { session, delegate, controls }
    }

    /// The transport made for the next connection.
    pub(crate) fn next_transport(&self) -> MockControl {
        self.controls.recv_timeout(Duration::from_secs(5)).expect("no transport was made")
    }

    pub(crate) fn no_new_transport(&self) -> bool {
        self.controls.try_recv().is_err()
    }

    /// Connects and drives the transport to Ready.
    pub(crate) fn connect_ready(&self) -> MockControl {
        self.session.connect().unwrap();
        let control = self.next_transport();
        control.set_state(TransportState::Ready);
        self.settle();
        control
    }

    pub(crate) fn settle(&self) {
        self.session.settle();
    }
}
