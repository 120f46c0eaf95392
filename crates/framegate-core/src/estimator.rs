//! # Bandwidth Estimation
//!
//! Turns cumulative byte counters into instantaneous throughput and tracks
//! the highest value seen during calibration. The resulting
//! [`BandwidthCeiling`] is the link's momentary usable capacity under
//! current contention, not a theoretical maximum.

use serde::Serialize;
use std::time::Duration;
use tracing::{debug, warn};

use crate::clock::{Clock, StopSignal};
use crate::stats::StatsSource;

/// One byte-counter reading and the (clock) time it was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BandwidthSample {
    pub at: Duration,
    pub sent_bytes: u64,
}

/// Throughput between two samples in Mbps.
///
/// A counter that went backwards (reset or wrap) yields 0 rather than a
/// negative rate, as does a pair with no elapsed time.
pub fn throughput_mbps(prev: &BandwidthSample, cur: &BandwidthSample) -> f64 {
    let elapsed = cur.at.saturating_sub(prev.at).as_secs_f64();
    if elapsed <= 0.0 {
        return 0.0;
    }
    let delta = cur.sent_bytes.saturating_sub(prev.sent_bytes);
    delta as f64 * 8.0 / (elapsed * 1_000_000.0)
}

/// Highest throughput observed during calibration, in Mbps.
///
/// Never negative. Zero is a valid, degenerate ceiling (idle link during
/// calibration) that drives the admission budget to zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, PartialOrd, Serialize)]
pub struct BandwidthCeiling(f64);

impl BandwidthCeiling {
    pub fn from_mbps(mbps: f64) -> Self {
        if mbps.is_finite() && mbps > 0.0 {
            Self(mbps)
        } else {
            Self(0.0)
        }
    }

    pub fn mbps(&self) -> f64 {
        self.0
    }

    pub fn is_degenerate(&self) -> bool {
        self.0 <= 0.0
    }
}

/// Running max-throughput tracker over consecutive samples.
#[derive(Debug, Default)]
pub struct BandwidthEstimator {
    last: Option<BandwidthSample>,
    max_mbps: f64,
    pairs: usize,
}

impl BandwidthEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a sample. Returns the throughput against the previous sample,
    /// or `None` if this sample only establishes a baseline.
    pub fn observe(&mut self, sample: BandwidthSample) -> Option<f64> {
        let rate = self.last.map(|prev| throughput_mbps(&prev, &sample));
        self.last = Some(sample);
        if let Some(mbps) = rate {
            self.pairs += 1;
            if mbps > self.max_mbps {
                self.max_mbps = mbps;
            }
        }
        rate
    }

    /// Forgets the baseline so the next sample starts a fresh pair. Used
    /// after a failed read so a delta never spans the gap.
    pub fn drop_baseline(&mut self) {
        self.last = None;
    }

    /// Number of throughput values computed so far.
    pub fn pairs(&self) -> usize {
        self.pairs
    }

    pub fn ceiling(&self) -> BandwidthCeiling {
        BandwidthCeiling::from_mbps(self.max_mbps)
    }
}

/// Samples `source` every `poll_interval` for `total_duration` and returns
/// the maximum throughput seen.
///
/// Blocking, one-shot. Failed reads are logged and skipped. Returns early
/// (with whatever was measured so far) if `stop` fires.
pub fn measure_ceiling<S, C>(
    source: &mut S,
    clock: &C,
    stop: &StopSignal,
    poll_interval: Duration,
    total_duration: Duration,
) -> BandwidthCeiling
where
    S: StatsSource + ?Sized,
    C: Clock + ?Sized,
{
    let mut estimator = BandwidthEstimator::new();
    let start = clock.now();

    take_sample(source, clock, &mut estimator);
    while clock.now().saturating_sub(start) < total_duration {
        if clock.pause(poll_interval, stop) {
            debug!("calibration interrupted by stop");
            break;
        }
        if let Some(mbps) = take_sample(source, clock, &mut estimator) {
            debug!(throughput_mbps = mbps, "calibration sample");
        }
    }

    let ceiling = estimator.ceiling();
    debug!(
        ceiling_mbps = ceiling.mbps(),
        pairs = estimator.pairs(),
        "calibration finished"
    );
    ceiling
}

fn take_sample<S, C>(source: &mut S, clock: &C, estimator: &mut BandwidthEstimator) -> Option<f64>
where
    S: StatsSource + ?Sized,
    C: Clock + ?Sized,
{
    match source.sample() {
        Ok(counters) => estimator.observe(BandwidthSample {
            at: clock.now(),
            sent_bytes: counters.sent_bytes,
        }),
        Err(e) => {
            warn!(error = %e, "calibration sample failed, skipping");
            estimator.drop_baseline();
            None
        }
    }
}
