//! # Loss Detection
//!
//! Tracks the link's cumulative dropped-packet counter and reports when it
//! has grown by more than a small hysteresis since the previous check. The
//! stored baseline is updated on every successful check, including quiet
//! ones, so counter jitter never accumulates into a false loss event.

use tracing::warn;

use crate::stats::{StatsError, StatsSource};

/// Default number of dropped packets absorbed as counter noise.
pub const DEFAULT_LOSS_HYSTERESIS: u64 = 4;

#[derive(Debug, Clone)]
pub struct LossDetector {
    previous_dropped: u64,
    hysteresis: u64,
}

impl LossDetector {
    pub fn new(hysteresis: u64) -> Self {
        Self {
            previous_dropped: 0,
            hysteresis,
        }
    }

    /// Dropped count recorded at the last successful check.
    pub fn previous_dropped(&self) -> u64 {
        self.previous_dropped
    }

    /// Feeds the current cumulative dropped count.
    ///
    /// Returns the increase when it exceeds the hysteresis, otherwise 0. A
    /// counter that went backwards (stats source reset) reads as no loss.
    pub fn observe(&mut self, current_dropped: u64) -> u64 {
        let delta = current_dropped.saturating_sub(self.previous_dropped);
        self.previous_dropped = current_dropped;
        if delta > self.hysteresis {
            delta
        } else {
            0
        }
    }

    /// Samples `source` and applies [`LossDetector::observe`].
    ///
    /// On failure the baseline is left untouched and the error is returned
    /// so the caller can skip the period.
    pub fn check<S: StatsSource + ?Sized>(&mut self, source: &mut S) -> Result<u64, StatsError> {
        let counters = source.sample()?;
        Ok(self.observe(counters.dropped_packets))
    }

    /// Re-baselines against the current counter without reporting loss.
    /// Failures are logged and leave the baseline unchanged.
    pub fn prime<S: StatsSource + ?Sized>(&mut self, source: &mut S) {
        match source.sample() {
            Ok(counters) => self.previous_dropped = counters.dropped_packets,
            Err(e) => warn!(error = %e, "loss baseline refresh failed"),
        }
    }
}

impl Default for LossDetector {
    fn default() -> Self {
        Self::new(DEFAULT_LOSS_HYSTERESIS)
    }
}
