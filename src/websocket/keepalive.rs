use std::time::{Duration, Instant};
use crossbeam_channel::{never, tick, Receiver};

/// The single repeating ping ticker of a session.
#[derive(Debug, Default)]
pub(crate) struct Keepalive {
    ticker: Option<Receiver<Instant>>,
}

impl Keepalive {
    /// Drops any previous ticker before installing the new one.
    pub(crate) fn install(&mut self, interval: Duration) {
        self.invalidate();
        if tracing::enabled!(tracing::Level::DEBUG) {
            tracing::debug!("Installing keepalive ping every {:?}", interval);
        }
        self.ticker = Some(tick(interval));
    }

    pub(crate) fn invalidate(&mut self) {
        if self.ticker.take().is_some() {
            tracing::trace!("Keepalive ticker invalidated");
        }
    }

    /// A receiver for `select!`; never fires while no ticker is installed.
    pub(crate) fn receiver(&self) -> Receiver<Instant> {
        self.ticker.clone().unwrap_or_else(never)
    }
}
