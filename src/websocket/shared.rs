use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::TcpStream;
use tungstenite::stream::MaybeTlsStream;
use tungstenite::{Bytes, ClientRequestBuilder, Error, HandshakeError, Message, Utf8Bytes, WebSocket};
use tungstenite::handshake::client::Response;
use tungstenite::protocol::frame::coding::CloseCode;
use tungstenite::protocol::CloseFrame;
use crate::error::TransportError;
use super::endpoint::Endpoint;
use super::options::SharedOptions;
use super::transport::Received;
use super::types::{FrameMetadata, Opcode};

// ============================================================================
// Shared Internal Helpers
// ============================================================================

/// Control flow indicator for event loops
pub(crate) enum ControlFlow {
    Continue,
    Break,
}

/// Establishes WebSocket connection with optional custom headers.
/// TCP connect failures surface as [`Error::Io`] so callers can tell them from handshake failures.
pub(crate) fn connect_socket(endpoint: &Endpoint, headers: &HashMap<String, String>) -> Result<(WebSocket<MaybeTlsStream<TcpStream>>, Response), Error> {
    let mut builder = ClientRequestBuilder::new(endpoint.uri().clone());
    for (key, value) in headers {
        builder = builder.with_header(key, value);
    }

    let stream = TcpStream::connect((endpoint.host(), endpoint.port()))?;
    let (sock, response) = tungstenite::client_tls(builder, stream).map_err(|e| match e {
        HandshakeError::Failure(e) => e,
        HandshakeError::Interrupted(_) => Error::Io(std::io::ErrorKind::WouldBlock.into()),
    })?;
    trace_on_connected(&response);

    Ok((sock, response))
}

/// Configures socket for non-blocking operation with TCP_NODELAY
pub(crate) fn configure_non_blocking(socket: &mut WebSocket<MaybeTlsStream<TcpStream>>, options: &SharedOptions) -> std::io::Result<()> {
    let stream = match socket.get_mut() {
        MaybeTlsStream::Plain(stream) => stream,
        MaybeTlsStream::NativeTls(stream) => stream.get_mut(),
        _ => return Ok(()),
    };

    stream.set_nonblocking(true)?;

    if let Some(nodelay) = options.nodelay {
        stream.set_nodelay(nodelay)?;
    }
    if let Some(ttl) = options.ttl {
        stream.set_ttl(ttl)?;
    }

    Ok(())
}

/// No data available right now; expected in non-blocking mode
#[inline]
pub(crate) fn is_would_block(error: &Error) -> bool {
    match error {
        Error::Io(io_err) => matches!(io_err.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut),
        _ => false,
    }
}

/// Connection ended without an error, e.g. after the close handshake
#[inline]
pub(crate) fn is_clean_closure(error: &Error) -> bool {
    matches!(error, Error::ConnectionClosed | Error::AlreadyClosed)
}

/// Connect failures that may succeed later, e.g. while the server is still starting
pub(crate) fn is_retryable_connect_error(error: &Error) -> bool {
    match error {
        Error::Io(io_err) => !matches!(io_err.kind(), std::io::ErrorKind::InvalidInput | std::io::ErrorKind::InvalidData),
        _ => false,
    }
}

/// Writes one frame to the WebSocket. A full socket buffer is not an error, the frame
/// stays queued inside tungstenite and goes out with the next flush.
pub(crate) fn write_frame<S: Read + Write>(socket: &mut WebSocket<S>, payload: Option<Vec<u8>>, metadata: &FrameMetadata) -> Result<(), TransportError> {
    let payload = payload.unwrap_or_default();
    let result = match metadata.opcode {
        Opcode::Text => match String::from_utf8(payload) {
            Ok(text) => socket.send(Message::text(text)),
            Err(_) => return Err(TransportError::Protocol("Text payload is not valid UTF-8".to_string())),
        },
        Opcode::Binary => socket.send(Message::Binary(payload.into())),
        Opcode::Ping => socket.send(Message::Ping(payload.into())),
        Opcode::Pong => socket.send(Message::Pong(payload.into())),
        Opcode::Close => {
            let code = metadata.close_code.unwrap_or(CloseCode::Normal);
            let reason = Utf8Bytes::from(String::from_utf8_lossy(&payload).into_owned());
            socket.close(Some(CloseFrame { code, reason }))
        },
        Opcode::Continuation => return Err(TransportError::Protocol("Continuation frames cannot be sent directly".to_string())),
    };

    match result {
        Ok(()) => {
            if tracing::enabled!(tracing::Level::TRACE) {
                tracing::trace!("Sent {:?} frame", metadata.opcode);
            }
            Ok(())
        },
        Err(e) if is_would_block(&e) => Ok(()),
        Err(e) => {
            tracing::error!("Error sending {:?} frame: {}", metadata.opcode, e);
            Err(TransportError::from(e))
        }
    }
}

/// Maps an inbound data or close message to what a session receives.
/// Control frames other than close are handled by the transport itself.
pub(crate) fn into_received(message: Message) -> Option<Received> {
    match message {
        Message::Text(text) => {
            trace_on_text_message(&text);
            Some(Received::message(text.as_bytes().to_vec(), FrameMetadata::new(Opcode::Text)))
        },
        Message::Binary(bytes) => {
            trace_on_binary_message(&bytes);
            Some(Received::message(bytes.to_vec(), FrameMetadata::new(Opcode::Binary)))
        },
        Message::Close(close_frame) => {
            trace_on_close_frame(&close_frame);
            let (code, reason) = match close_frame {
                Some(frame) => (frame.code, frame.reason.as_bytes().to_vec()),
                None => (CloseCode::Status, Vec::new()),
            };
            Some(Received::message(reason, FrameMetadata::close(code)))
        },
        Message::Ping(bytes) => {
            trace_on_ping_message(&bytes);
            None
        },
        Message::Pong(bytes) => {
            trace_on_pong_message(&bytes);
            None
        },
        Message::Frame(_) => {
            trace_on_frame();
            None
        }
    }
}

/// Closes WebSocket connection with context logging
pub(crate) fn close_websocket_with_logging<S: Read + Write>(socket: &mut WebSocket<S>, context: &str) {
    if socket.can_write() {
        socket.close(None)
            .and_then(|_| socket.flush())
            .map(|_| {
                tracing::trace!("Connection close successfully requested for context: {}", context);
            })
            .unwrap_or_else(|e| {
                if !is_would_block(&e) && !is_clean_closure(&e) {
                    tracing::error!("Error on connection close request for context {}: {}", context, e);
                }
            });
    }
}

/// Traces connection establishment
pub(crate) fn trace_on_connected(response: &Response) {
    if tracing::enabled!(tracing::Level::TRACE) {
        tracing::trace!("Connected to the server");
        tracing::trace!("Response HTTP code: {}", response.status());
        tracing::trace!("Response contains the following headers:");
        for (header, _value) in response.headers() {
            tracing::trace!("* {header}");
        }
    }
}

/// Traces text message receipt
#[inline]
pub(crate) fn trace_on_text_message(message: &Utf8Bytes) {
    if tracing::enabled!(tracing::Level::TRACE) {
        tracing::trace!("Received text message: {}", message);
    }
}

/// Traces binary message receipt
#[inline]
pub(crate) fn trace_on_binary_message(bytes: &Bytes) {
    if tracing::enabled!(tracing::Level::TRACE) {
        tracing::trace!("Received binary message: {:?}", bytes);
    }
}

/// Traces connection close frame receipt
pub(crate) fn trace_on_close_frame(close_frame: &Option<CloseFrame>) {
    if tracing::enabled!(tracing::Level::TRACE) {
        match close_frame {
            Some(reason) => {
                tracing::trace!("Connection closed with reason: {}", reason)
            },
            None => {
                tracing::trace!("Connection closed without reason")
            },
        }
    }
}

/// Traces ping message receipt
#[inline]
pub(crate) fn trace_on_ping_message(bytes: &Bytes) {
    if tracing::enabled!(tracing::Level::TRACE) {
        tracing::trace!("Received ping frame: {}", String::from_utf8_lossy(bytes));
    }
}

/// Traces pong message receipt
#[inline]
pub(crate) fn trace_on_pong_message(bytes: &Bytes) {
    if tracing::enabled!(tracing::Level::TRACE) {
        tracing::trace!("Received pong frame: {}", String::from_utf8_lossy(bytes));
    }
}

/// Traces frame message receipt
#[inline]
pub(crate) fn trace_on_frame() {
    if tracing::enabled!(tracing::Level::TRACE) {
        tracing::trace!("Received frame from server");
    }
}
