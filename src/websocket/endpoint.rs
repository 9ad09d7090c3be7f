use std::fmt;
use std::str::FromStr;
use tungstenite::http::Uri;
use crate::error::{S9Result, S9WebSocketError};

/// A validated `ws://` or `wss://` endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    uri: Uri,
}

impl Endpoint {
    pub fn parse(uri: &str) -> S9Result<Endpoint> {
        let parsed = Uri::from_str(uri).map_err(|e| {
            tracing::error!("Error parsing WebSocket URI {}: {}", uri, e);
            S9WebSocketError::InvalidUri(e.to_string())
        })?;

        match parsed.scheme_str() {
            Some("ws") | Some("wss") => {},
            _ => return Err(S9WebSocketError::InvalidUri(format!("Unsupported scheme in {}", uri))),
        }
        if parsed.host().is_none() {
            return Err(S9WebSocketError::InvalidUri(format!("Missing host in {}", uri)));
        }

        Ok(Endpoint { uri: parsed })
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// Host without IPv6 brackets, ready for socket address resolution.
    pub fn host(&self) -> &str {
        let host = self.uri.host().unwrap_or_default();
        host.trim_start_matches('[').trim_end_matches(']')
    }

    /// Explicit port, or the scheme's default.
    pub fn port(&self) -> u16 {
        self.uri.port_u16().unwrap_or(if self.is_secure() { 443 } else { 80 })
    }

    /// `wss://` endpoints negotiate TLS.
    pub fn is_secure(&self) -> bool {
        self.uri.scheme_str() == Some("wss")
    }
}

impl FromStr for Endpoint {
    type Err = S9WebSocketError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Endpoint::parse(s)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.uri)
    }
}
