use std::collections::HashMap;
use std::time::Duration;
use crate::error::{S9Result, S9WebSocketError};

// ============================================================================
// Configuration options
// ============================================================================

pub(crate) const DEFAULT_WAITING_ERROR_LIMIT: u32 = 20;
pub(crate) const DEFAULT_TEARDOWN_GRACE: Duration = Duration::from_millis(100);
pub(crate) const DEFAULT_MIGRATION_GRACE: Duration = Duration::from_millis(100);
pub(crate) const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(1);
pub(crate) const DEFAULT_SPIN_WAIT: Duration = Duration::from_millis(1);

/// Socket level options applied by the tungstenite transport.
#[derive(Debug, Clone, Default)]
pub(crate) struct SharedOptions {
    pub(crate) spin_wait_duration: Option<Duration>,
    pub(crate) nodelay: Option<bool>,
    pub(crate) ttl: Option<u32>,
}

/// Configuration options for a [`S9WebSocketSession`](crate::S9WebSocketSession).
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub(crate) shared: SharedOptions,
    pub(crate) headers: HashMap<String, String>,
    pub(crate) connect_automatically: bool,
    pub(crate) waiting_error_limit: Option<u32>,
    pub(crate) teardown_grace: Duration,
    pub(crate) migration_grace: Duration,
    pub(crate) reconnect_interval: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        SessionOptions {
            shared: SharedOptions {
                spin_wait_duration: Some(DEFAULT_SPIN_WAIT),
                ..SharedOptions::default()
            },
            headers: HashMap::new(),
            connect_automatically: false,
            waiting_error_limit: Some(DEFAULT_WAITING_ERROR_LIMIT),
            teardown_grace: DEFAULT_TEARDOWN_GRACE,
            migration_grace: DEFAULT_MIGRATION_GRACE,
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
        }
    }
}

impl SessionOptions {
    /// Creates a new `SessionOptions` builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the duration the transport worker waits after each socket read.
    /// Must be None or greater than zero
    /// None turns the worker into a hot spinning loop.
    pub fn spin_wait_duration(mut self, duration: Option<Duration>) -> S9Result<Self> {
        if let Some(duration) = duration {
            if duration.is_zero() {
                return Err(S9WebSocketError::InvalidConfiguration("Spin wait duration cannot be zero".to_string()));
            }
        }
        self.shared.spin_wait_duration = duration;
        Ok(self)
    }

    /// Enables or disables the `TCP_NODELAY` option for messages to be sent.
    pub fn nodelay(mut self, nodelay: bool) -> Self {
        self.shared.nodelay = Some(nodelay);
        self
    }

    /// Sets the TTL (Time To Live, # of hops) for the socket.
    /// None for the system default
    pub fn ttl(mut self, ttl: Option<u32>) -> S9Result<Self> {
        self.shared.ttl = ttl;
        Ok(self)
    }

    /// Adds an HTTP header to the upgrade request.
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Connect as soon as the session is created.
    pub fn connect_automatically(mut self, connect: bool) -> Self {
        self.connect_automatically = connect;
        self
    }

    /// Number of consecutive `Waiting` errors after which the connection is torn down.
    /// None disables the limit, must otherwise be greater than zero.
    pub fn waiting_error_limit(mut self, limit: Option<u32>) -> S9Result<Self> {
        if limit == Some(0) {
            return Err(S9WebSocketError::InvalidConfiguration("Waiting error limit cannot be zero".to_string()));
        }
        self.waiting_error_limit = limit;
        Ok(self)
    }

    /// Upper bound for how long a torn down transport may finish in-flight sends before it is cancelled.
    pub fn teardown_grace(mut self, grace: Duration) -> Self {
        self.teardown_grace = grace;
        self
    }

    /// Upper bound for how long the previous transport lingers once a migration resolved.
    pub fn migration_grace(mut self, grace: Duration) -> Self {
        self.migration_grace = grace;
        self
    }

    /// Delay between connection attempts while the transport is waiting for a usable path.
    pub fn reconnect_interval(mut self, interval: Duration) -> S9Result<Self> {
        if interval.is_zero() {
            return Err(S9WebSocketError::InvalidConfiguration("Reconnect interval cannot be zero".to_string()));
        }
        self.reconnect_interval = interval;
        Ok(self)
    }
}
