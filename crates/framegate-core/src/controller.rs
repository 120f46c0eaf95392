//! # Rate Controller
//!
//! Loss-driven AIMD control of the admission budget.
//!
//! ## Phases
//!
//! `Calibrating` measures the bandwidth ceiling once; `Steady` then runs one
//! iteration per control period until stopped:
//!
//! 1. Check the dropped-packet counter for an increase beyond hysteresis.
//! 2. Loss: `k ← k × decrease_factor`.
//! 3. No loss and `k < increase_gate`: `k ← k + max(increase_step, min_increase_step)`.
//! 4. `k ← max(k, k_floor)`.
//! 5. Publish `k × ceiling_mbps × window_scale` bytes per window.
//!
//! The loss magnitude only matters as a yes/no signal. The admission window
//! (short) is decoupled from the control period (long) so the law reacts to
//! sustained loss, not to a single noisy window.

use serde::Serialize;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

use crate::clock::{Clock, StopSignal};
use crate::config::{CalibrationConfig, ControlConfig};
use crate::estimator::{measure_ceiling, BandwidthCeiling};
use crate::loss::LossDetector;
use crate::state::AdmissionState;
use crate::stats::StatsSource;

/// Controller lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum ControllerPhase {
    #[default]
    Idle,
    Calibrating,
    Steady,
    Stopped,
}

impl ControllerPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControllerPhase::Idle => "idle",
            ControllerPhase::Calibrating => "calibrating",
            ControllerPhase::Steady => "steady",
            ControllerPhase::Stopped => "stopped",
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            ControllerPhase::Idle => 0,
            ControllerPhase::Calibrating => 1,
            ControllerPhase::Steady => 2,
            ControllerPhase::Stopped => 3,
        }
    }
}

/// The AIMD law on the damping factor `k`.
#[derive(Debug, Clone)]
pub struct DampingLaw {
    k: f64,
    decrease_factor: f64,
    increase_step: f64,
    k_floor: f64,
    increase_gate: f64,
}

impl DampingLaw {
    /// Starts at `k = 1.0`. The configured step is raised to the minimum
    /// step so `k` always recovers.
    pub fn new(config: &ControlConfig) -> Self {
        Self {
            k: 1.0,
            decrease_factor: config.decrease_factor,
            increase_step: config.increase_step.max(config.min_increase_step),
            k_floor: config.k_floor,
            increase_gate: config.increase_gate,
        }
    }

    pub fn k(&self) -> f64 {
        self.k
    }

    /// Applies one period's outcome and returns the new `k`.
    pub fn step(&mut self, loss_detected: bool) -> f64 {
        if loss_detected {
            self.k *= self.decrease_factor;
        } else if self.k < self.increase_gate {
            self.k += self.increase_step;
        }
        self.k = self.k.max(self.k_floor);
        self.k
    }
}

/// Budget in bytes per window for damping factor `k`.
pub fn rate_limit_bytes(k: f64, ceiling: BandwidthCeiling, window_scale: f64) -> u64 {
    let bytes = k * ceiling.mbps() * window_scale;
    if bytes.is_finite() && bytes > 0.0 {
        bytes.round() as u64
    } else {
        0
    }
}

/// Diagnostic view of the controller, refreshed every period.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ControllerSnapshot {
    pub phase: ControllerPhase,
    pub k: f64,
    pub ceiling_mbps: f64,
    pub rate_limit_bytes: u64,
    pub periods: u64,
    pub loss_events: u64,
    pub last_loss_delta: u64,
    pub stats_failures: u64,
}

/// Owns the control state (`k`, loss baseline, ceiling) and writes the
/// budget into the shared admission state.
pub struct RateController<S, C, A>
where
    S: StatsSource,
    C: Clock,
    A: AdmissionState + ?Sized,
{
    control: ControlConfig,
    calibration: CalibrationConfig,
    source: S,
    clock: C,
    state: Arc<A>,
    law: DampingLaw,
    loss: LossDetector,
    ceiling: BandwidthCeiling,
    snapshot: Arc<Mutex<ControllerSnapshot>>,
}

impl<S, C, A> RateController<S, C, A>
where
    S: StatsSource,
    C: Clock,
    A: AdmissionState + ?Sized,
{
    pub fn new(
        control: ControlConfig,
        calibration: CalibrationConfig,
        source: S,
        clock: C,
        state: Arc<A>,
    ) -> Self {
        let law = DampingLaw::new(&control);
        let loss = LossDetector::new(control.loss_hysteresis);
        let snapshot = ControllerSnapshot {
            k: law.k(),
            rate_limit_bytes: state.rate_limit(),
            ..ControllerSnapshot::default()
        };
        Self {
            control,
            calibration,
            source,
            clock,
            state,
            law,
            loss,
            ceiling: BandwidthCeiling::default(),
            snapshot: Arc::new(Mutex::new(snapshot)),
        }
    }

    /// Shared handle to the diagnostic snapshot.
    pub fn snapshot_handle(&self) -> Arc<Mutex<ControllerSnapshot>> {
        self.snapshot.clone()
    }

    pub fn snapshot(&self) -> ControllerSnapshot {
        self.snapshot
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn k(&self) -> f64 {
        self.law.k()
    }

    pub fn ceiling(&self) -> BandwidthCeiling {
        self.ceiling
    }

    /// Runs calibration then the steady loop until `stop` fires.
    pub fn run(mut self, stop: StopSignal) {
        self.calibrate(&stop);
        if stop.is_stopped() {
            self.set_phase(ControllerPhase::Stopped);
            return;
        }
        while !self.clock.pause(self.control.control_period, &stop) {
            self.step();
        }
        self.set_phase(ControllerPhase::Stopped);
        info!(k = self.law.k(), "rate controller stopped");
    }

    /// Publishes the provisional budget, measures the ceiling and enters
    /// `Steady`. Loss accumulated during calibration is not counted.
    pub fn calibrate(&mut self, stop: &StopSignal) -> BandwidthCeiling {
        self.set_phase(ControllerPhase::Calibrating);
        self.state
            .publish_rate_limit(self.control.initial_rate_limit_bytes);
        self.update_snapshot(|s| s.rate_limit_bytes = self.control.initial_rate_limit_bytes);
        info!(
            provisional_rate_limit = self.control.initial_rate_limit_bytes,
            duration_ms = self.calibration.duration.as_millis() as u64,
            "calibrating bandwidth ceiling"
        );

        self.loss.prime(&mut self.source);
        let ceiling = measure_ceiling(
            &mut self.source,
            &self.clock,
            stop,
            self.calibration.poll_interval,
            self.calibration.duration,
        );
        self.loss.prime(&mut self.source);

        self.start_steady(ceiling);
        ceiling
    }

    /// Enters `Steady` with a known ceiling and publishes the budget for
    /// the current `k`.
    pub fn start_steady(&mut self, ceiling: BandwidthCeiling) -> u64 {
        self.ceiling = ceiling;
        if ceiling.is_degenerate() {
            warn!("calibration measured no throughput; admission budget is zero");
        } else {
            info!(
                ceiling_mbps = ceiling.mbps(),
                "bandwidth ceiling calibrated"
            );
        }
        self.set_phase(ControllerPhase::Steady);
        let limit = self.publish();
        self.update_snapshot(|s| s.ceiling_mbps = ceiling.mbps());
        limit
    }

    /// One steady-state control iteration.
    ///
    /// Returns the published budget, or `None` if the stats read failed and
    /// the period was skipped (budget left as is).
    pub fn step(&mut self) -> Option<u64> {
        let delta = match self.loss.check(&mut self.source) {
            Ok(delta) => delta,
            Err(e) => {
                warn!(error = %e, "stats read failed, skipping control period");
                self.update_snapshot(|s| s.stats_failures += 1);
                return None;
            }
        };

        let k = self.law.step(delta > 0);
        let limit = self.publish();
        if delta > 0 {
            info!(
                loss_delta = delta,
                k,
                rate_limit_bytes = limit,
                "loss detected, backing off"
            );
        } else {
            info!(k, rate_limit_bytes = limit, "control period");
        }
        self.update_snapshot(|s| {
            s.periods += 1;
            s.last_loss_delta = delta;
            if delta > 0 {
                s.loss_events += 1;
            }
        });
        Some(limit)
    }

    fn publish(&self) -> u64 {
        let limit = rate_limit_bytes(self.law.k(), self.ceiling, self.control.window_scale());
        self.state.publish_rate_limit(limit);
        let k = self.law.k();
        self.update_snapshot(|s| {
            s.k = k;
            s.rate_limit_bytes = limit;
        });
        limit
    }

    fn set_phase(&self, phase: ControllerPhase) {
        self.update_snapshot(|s| s.phase = phase);
    }

    fn update_snapshot(&self, f: impl FnOnce(&mut ControllerSnapshot)) {
        let mut snap = self.snapshot.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut snap);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::state::SharedAdmissionState;
    use crate::test_util::ScriptedStats;
    use std::time::Duration;

    fn control() -> ControlConfig {
        ControlConfig {
            decrease_factor: 0.8,
            increase_step: 0.05,
            ..ControlConfig::default()
        }
    }

    #[test]
    fn law_decreases_on_loss() {
        let mut law = DampingLaw::new(&control());
        assert!((law.step(true) - 0.8).abs() < 1e-12);
        assert!((law.step(true) - 0.64).abs() < 1e-12);
    }

    #[test]
    fn law_increases_until_gate() {
        let mut law = DampingLaw::new(&control());
        law.step(true);
        law.step(true);
        let mut prev = law.k();
        let mut steps = 0;
        while law.k() < 1.05 {
            let k = law.step(false);
            assert!(k > prev);
            prev = k;
            steps += 1;
            assert!(steps < 100);
        }
        // Gate reached: further quiet periods hold k.
        let held = law.k();
        assert_eq!(law.step(false), held);
        assert!(held < 1.05 + 0.05 + 1e-9);
    }

    #[test]
    fn law_respects_minimum_step() {
        let cfg = ControlConfig {
            increase_step: 0.001,
            ..control()
        };
        let mut law = DampingLaw::new(&cfg);
        law.step(true);
        assert!((law.step(false) - 0.81).abs() < 1e-12);
    }

    #[test]
    fn law_never_below_floor() {
        let mut law = DampingLaw::new(&ControlConfig {
            decrease_factor: 0.1,
            ..control()
        });
        for _ in 0..50 {
            assert!(law.step(true) >= 0.1);
        }
        assert!((law.k() - 0.1).abs() < 1e-12);
    }

    #[test]
    fn rate_limit_scaling() {
        let ceiling = BandwidthCeiling::from_mbps(10.0);
        assert_eq!(rate_limit_bytes(1.0, ceiling, 25_000.0), 250_000);
        assert_eq!(rate_limit_bytes(0.8, ceiling, 25_000.0), 200_000);
        assert_eq!(
            rate_limit_bytes(1.0, BandwidthCeiling::default(), 25_000.0),
            0
        );
    }

    #[test]
    fn step_publishes_budget_and_counts_loss() {
        let state = Arc::new(SharedAdmissionState::new(0));
        let stats = ScriptedStats::new();
        stats.push_dropped(0);
        stats.push_dropped(50);
        stats.push_dropped(51);
        let mut ctl = RateController::new(
            control(),
            CalibrationConfig::default(),
            stats,
            ManualClock::new(),
            state.clone(),
        );
        assert_eq!(ctl.start_steady(BandwidthCeiling::from_mbps(10.0)), 250_000);
        assert_eq!(state.rate_limit(), 250_000);

        // First check only baselines at 0.
        assert_eq!(ctl.step(), Some(262_500));
        assert_eq!(ctl.step(), Some(210_000));
        assert_eq!(state.rate_limit(), 210_000);

        let snap = ctl.snapshot();
        assert_eq!(snap.phase, ControllerPhase::Steady);
        assert_eq!(snap.periods, 2);
        assert_eq!(snap.loss_events, 1);
        assert_eq!(snap.last_loss_delta, 50);
        assert_eq!(snap.rate_limit_bytes, 210_000);
    }

    /// Collects formatted log output for assertions.
    #[derive(Clone, Default)]
    struct LogBuffer(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for LogBuffer {
        type Writer = LogBuffer;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[test]
    fn every_period_is_reported_at_info() {
        let logs = LogBuffer::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(logs.clone())
            .with_max_level(tracing::Level::INFO)
            .with_ansi(false)
            .finish();

        // First check only baselines; the second sees 40 new drops.
        let stats = ScriptedStats::new();
        stats.push_dropped(0);
        stats.push_dropped(40);
        let mut ctl = RateController::new(
            control(),
            CalibrationConfig::default(),
            stats,
            ManualClock::new(),
            Arc::new(SharedAdmissionState::new(0)),
        );
        tracing::subscriber::with_default(subscriber, || {
            ctl.start_steady(BandwidthCeiling::from_mbps(10.0));
            ctl.step();
            ctl.step();
        });

        let out = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
        let quiet = out.lines().filter(|l| l.contains("control period")).count();
        assert_eq!(quiet, 1, "{out}");
        assert!(out.contains("loss detected, backing off"), "{out}");
        assert!(out.contains("rate_limit_bytes=262500"), "{out}");
    }

    #[test]
    fn stats_failure_skips_period() {
        let state = Arc::new(SharedAdmissionState::new(0));
        let stats = ScriptedStats::new();
        stats.push_failure();
        let mut ctl = RateController::new(
            control(),
            CalibrationConfig::default(),
            stats,
            ManualClock::new(),
            state.clone(),
        );
        ctl.start_steady(BandwidthCeiling::from_mbps(10.0));
        assert_eq!(ctl.step(), None);
        assert_eq!(ctl.k(), 1.0);
        assert_eq!(state.rate_limit(), 250_000);
        assert_eq!(ctl.snapshot().stats_failures, 1);
    }

    #[test]
    fn calibrate_measures_ceiling_and_ignores_calibration_loss() {
        let state = Arc::new(SharedAdmissionState::new(0));
        let stats = ScriptedStats::new();
        // Priming read, four calibration reads one second apart (10 Mbps),
        // priming read.
        stats.push(0, 0);
        stats.push(0, 0);
        stats.push(1_250_000, 100);
        stats.push(2_500_000, 200);
        stats.push(3_750_000, 300);
        stats.push(3_750_000, 300);
        let clock = ManualClock::new();
        let mut ctl = RateController::new(
            control(),
            CalibrationConfig {
                poll_interval: Duration::from_secs(1),
                duration: Duration::from_secs(3),
            },
            stats,
            clock.clone(),
            state.clone(),
        );
        let ceiling = ctl.calibrate(&StopSignal::new());
        assert!((ceiling.mbps() - 10.0).abs() < 1e-9);
        assert_eq!(clock.now(), Duration::from_secs(3));
        assert_eq!(state.rate_limit(), 250_000);

        // Loss counter is still 300 (script exhausted, repeats last value).
        assert_eq!(ctl.step(), Some(262_500));
        assert_eq!(ctl.snapshot().loss_events, 0);
    }

    #[test]
    fn interrupted_calibration_yields_zero_budget() {
        let state = Arc::new(SharedAdmissionState::new(0));
        let stop = StopSignal::new();
        stop.stop();
        let mut ctl = RateController::new(
            control(),
            CalibrationConfig::default(),
            ScriptedStats::from_bytes(&[0]),
            ManualClock::new(),
            state.clone(),
        );
        let handle = ctl.snapshot_handle();
        // Interrupted calibration ends with a zero ceiling.
        let ceiling = ctl.calibrate(&stop);
        assert!(ceiling.is_degenerate());
        assert_eq!(state.rate_limit(), 0);
        assert_eq!(handle.lock().unwrap().ceiling_mbps, 0.0);
    }

    #[test]
    fn phase_encodings() {
        assert_eq!(ControllerPhase::Calibrating.as_str(), "calibrating");
        assert_eq!(ControllerPhase::Steady.as_u8(), 2);
    }
}
