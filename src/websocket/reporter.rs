use tungstenite::protocol::frame::coding::CloseCode;

/// A disconnection notification waiting to be delivered.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PendingDisconnection {
    pub(crate) close_code: CloseCode,
    pub(crate) reason: Option<Vec<u8>>,
    generation: u64,
}

/// Holds at most one pending disconnection report and makes sure a disconnect episode is
/// reported exactly once.
///
/// Scheduling replaces whatever was pending. Every schedule gets a new generation, so a
/// delivery queued for an older report becomes a no-op once it has been superseded.
#[derive(Debug, Default)]
pub(crate) struct DisconnectionReporter {
    pending: Option<PendingDisconnection>,
    generation: u64,
    reported: bool,
}

impl DisconnectionReporter {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Returns the generation to deliver later, or None if this episode was already reported.
    pub(crate) fn schedule(&mut self, close_code: CloseCode, reason: Option<Vec<u8>>) -> Option<u64> {
        if self.reported {
            if tracing::enabled!(tracing::Level::TRACE) {
                tracing::trace!("Disconnection already reported, ignoring close code {:?}", close_code);
            }
            return None;
        }
        self.generation += 1;
        if let Some(previous) = self.pending.replace(PendingDisconnection { close_code, reason, generation: self.generation }) {
            tracing::trace!("Cancelled pending disconnection report with close code {:?}", previous.close_code);
        }
        Some(self.generation)
    }

    pub(crate) fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Takes the pending report for delivery, ending the episode.
    pub(crate) fn take(&mut self) -> Option<PendingDisconnection> {
        let pending = self.pending.take()?;
        self.reported = true;
        Some(pending)
    }

    /// Like [`take`](Self::take), but only if `generation` is still the pending one.
    pub(crate) fn take_generation(&mut self, generation: u64) -> Option<PendingDisconnection> {
        match &self.pending {
            Some(pending) if pending.generation == generation => self.take(),
            _ => None,
        }
    }

    pub(crate) fn cancel(&mut self) {
        self.pending = None;
    }

    /// A connection was opened or became ready: the next disconnection is a new episode.
    pub(crate) fn begin_episode(&mut self) {
        self.cancel();
        self.reported = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_schedule_wins() {
        let mut reporter = DisconnectionReporter::new();
        let first = reporter.schedule(CloseCode::Normal, None).unwrap();
        let second = reporter.schedule(CloseCode::Away, Some(b"bye".to_vec())).unwrap();

        assert!(reporter.take_generation(first).is_none());
        let delivered = reporter.take_generation(second).unwrap();
        assert_eq!(delivered.close_code, CloseCode::Away);
        assert_eq!(delivered.reason.as_deref(), Some(&b"bye"[..]));
        assert!(!reporter.is_pending());
    }

    #[test]
    fn episode_is_reported_once() {
        let mut reporter = DisconnectionReporter::new();
        reporter.schedule(CloseCode::Normal, None);
        assert!(reporter.take().is_some());

        assert_eq!(reporter.schedule(CloseCode::Away, None), None);
        assert!(reporter.take().is_none());

        reporter.begin_episode();
        assert!(reporter.schedule(CloseCode::Away, None).is_some());
        assert!(reporter.take().is_some());
    }

    #[test]
    fn cancel_drops_pending_without_ending_episode() {
        let mut reporter = DisconnectionReporter::new();
        let generation = reporter.schedule(CloseCode::Policy, None).unwrap();
        reporter.cancel();
        assert!(reporter.take_generation(generation).is_none());
        assert!(reporter.schedule(CloseCode::Policy, None).is_some());
    }
}
