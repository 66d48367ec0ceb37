use std::time::Duration;
use tokio::time::Instant;

/// Tracks the highest fully committed height of a worker and decides when a
/// progress signal is due.
#[derive(Debug)]
pub struct ProgressTracker {
    last_confirmed: Option<u64>,
    last_reported: Option<u64>,
    last_emit: Option<Instant>,
    interval: Duration,
}

impl ProgressTracker {
    pub fn new(interval: Duration) -> Self {
        Self {
            last_confirmed: None,
            last_reported: None,
            last_emit: None,
            interval,
        }
    }

    /// Marks `height` committed. Returns the height to report when the
    /// cadence allows a signal.
    pub fn confirm(&mut self, height: u64, now: Instant) -> Option<u64> {
        self.last_confirmed = Some(height);

        let due = match self.last_emit {
            None => true,
            Some(at) => now.saturating_duration_since(at) >= self.interval,
        };
        if !due {
            return None;
        }

        self.last_emit = Some(now);
        self.last_reported = Some(height);
        Some(height)
    }

    /// Confirmed height not yet reported, if any.
    pub fn flush(&mut self) -> Option<u64> {
        if self.last_confirmed == self.last_reported {
            return None;
        }
        self.last_reported = self.last_confirmed;
        self.last_confirmed
    }

    pub fn last_confirmed(&self) -> Option<u64> {
        self.last_confirmed
    }
}
