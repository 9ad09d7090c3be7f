//! Decides what a raw transport error means for the session.

use crate::error::{PosixError, TransportError};

/// Reason attached to disconnections the session did not ask for.
pub(crate) const UNEXPECTED_DISCONNECTION_REASON: &str = "The websocket disconnected unexpectedly";

/// `NotConnected` and `Canceled` are the expected echo of an intentional disconnect and
/// are swallowed while one is in progress. Everything else reaches the delegate.
pub fn should_report(error: &TransportError, intentional_disconnect: bool) -> bool {
    let expected_on_disconnect = matches!(
        error.posix_code(),
        Some(PosixError::NotConnected) | Some(PosixError::Canceled)
    );
    !(expected_on_disconnect && intentional_disconnect)
}

/// Errors that mean the connection is gone.
pub fn is_disconnection(error: &TransportError) -> bool {
    matches!(
        error.posix_code(),
        Some(PosixError::TimedOut)
            | Some(PosixError::NotConnected)
            | Some(PosixError::Canceled)
            | Some(PosixError::NetworkDown)
            | Some(PosixError::ConnectionAborted)
    )
}
