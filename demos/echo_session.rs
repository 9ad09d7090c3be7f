//! Echo session example.
//!
//! Starts the bundled broadcast server on a local port, connects a session to it, echoes
//! a few messages back and forth with keepalive pings running, then disconnects.

use s9_websocket_session::{CloseCode, S9WebSocketDelegate, S9WebSocketServer, S9WebSocketSession, SessionHandle, SessionOptions, TransportError};
use crossbeam_channel::{bounded, Sender};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct EchoDelegate {
    message_count: AtomicUsize,
    done: Sender<()>,
}

impl S9WebSocketDelegate for EchoDelegate {
    fn on_connect(&self, session: &SessionHandle) {
        println!("Connected");
        session.send_text("Hello from s9_websocket_session!").ok();
    }

    fn on_disconnect(&self, _session: &SessionHandle, close_code: CloseCode, reason: Option<&[u8]>) {
        let reason = reason.map(String::from_utf8_lossy);
        println!("Disconnected with {:?}, reason: {:?}", close_code, reason);
        self.done.send(()).ok();
    }

    fn on_error(&self, _session: &SessionHandle, error: &TransportError) {
        eprintln!("Error: {}", error);
    }

    fn on_pong(&self, _session: &SessionHandle) {
        println!("Pong");
    }

    fn on_text_message(&self, session: &SessionHandle, text: &str) {
        println!("Received: {}", text);
        let count = self.message_count.fetch_add(1, Ordering::Relaxed) + 1;

        if count <= 3 {
            // The first message is the server's welcome
            session.send_text(&format!("Echoed: {}", text)).ok();
        } else {
            println!("Closing session...");
            session.disconnect().ok();
        }
    }

    fn on_binary_message(&self, _session: &SessionHandle, data: &[u8]) {
        println!("Received binary: {:?}", data);
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let mut server = S9WebSocketServer::bind("127.0.0.1:0")?;
    server.start()?;
    println!("Server listening on {}", server.uri());

    let (done_tx, done_rx) = bounded(1);
    let delegate = Arc::new(EchoDelegate {
        message_count: AtomicUsize::new(0),
        done: done_tx,
    });

    // Configure with 10ms sleep between reads, to save CPU cycles
    let options = SessionOptions::new()
        .spin_wait_duration(Some(Duration::from_millis(10)))?;

    let session = S9WebSocketSession::new(&server.uri(), options)?;
    session.set_delegate(Arc::downgrade(&delegate))?;
    session.ping_interval(Duration::from_millis(250))?;
    session.connect()?;

    done_rx.recv_timeout(Duration::from_secs(10))?;

    drop(session);
    server.stop();
    println!("Done");
    Ok(())
}
