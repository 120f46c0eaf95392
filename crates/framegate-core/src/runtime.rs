use crate::classify::{PacketClassifier, PacketMeta};
use crate::clock::{Clock, MonotonicClock, StopSignal};
use crate::config::AdmissionConfig;
use crate::controller::{ControllerSnapshot, RateController};
use crate::filter::{AdmissionFilter, Verdict};
use crate::metrics::{MetricsServer, MetricsSource};
use crate::state::SharedAdmissionState;
use crate::stats::StatsSource;
use crate::window::WindowResetClock;
use anyhow::Context;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::thread;
use tracing::{info, warn};

/// Owns the admission state and the two periodic actors that drive it.
///
/// A `framegate-controller` thread runs calibration and then the AIMD loop;
/// a `framegate-window` thread zeroes the window counter every admission
/// window. The packet path calls [`AdmissionRuntime::decide`] (or uses
/// [`AdmissionRuntime::filter`] directly) from any thread.
///
/// Dropping the runtime stops both threads and any metrics server.
pub struct AdmissionRuntime {
    stop: StopSignal,
    filter: Arc<AdmissionFilter<SharedAdmissionState>>,
    controller: Arc<Mutex<ControllerSnapshot>>,
    handles: Vec<thread::JoinHandle<()>>,
    metrics_server: Option<MetricsServer>,
}

impl AdmissionRuntime {
    /// Starts the runtime on the monotonic clock. Also starts the metrics
    /// server when `metrics.bind` is configured.
    pub fn start<S>(config: &AdmissionConfig, source: S) -> anyhow::Result<Self>
    where
        S: StatsSource + 'static,
    {
        let mut runtime = Self::with_clock(config, source, MonotonicClock::new())?;
        if let Some(addr) = config.metrics.bind {
            let bound = runtime
                .start_metrics_server(addr)
                .with_context(|| format!("Failed to bind metrics server on {addr}"))?;
            info!(%bound, "metrics endpoint available at /metrics");
        }
        Ok(runtime)
    }

    /// Starts the runtime on an arbitrary clock.
    pub fn with_clock<S, C>(config: &AdmissionConfig, source: S, clock: C) -> anyhow::Result<Self>
    where
        S: StatsSource + 'static,
        C: Clock + Clone + 'static,
    {
        let state = Arc::new(SharedAdmissionState::new(config.control.initial_rate_limit_bytes));
        let filter = Arc::new(AdmissionFilter::new(state.clone()));
        let controller = RateController::new(
            config.control.clone(),
            config.calibration.clone(),
            source,
            clock.clone(),
            state.clone(),
        );
        let window = WindowResetClock::new(clock, config.control.window, state);

        let mut runtime = Self {
            stop: StopSignal::new(),
            filter,
            controller: controller.snapshot_handle(),
            handles: Vec::with_capacity(2),
            metrics_server: None,
        };

        // A failed spawn drops `runtime`, which stops whatever already started.
        let stop = runtime.stop.clone();
        runtime.handles.push(
            thread::Builder::new()
                .name("framegate-controller".into())
                .spawn(move || controller.run(stop))
                .context("Failed to spawn controller thread")?,
        );
        let stop = runtime.stop.clone();
        runtime.handles.push(
            thread::Builder::new()
                .name("framegate-window".into())
                .spawn(move || {
                    window.run(stop);
                })
                .context("Failed to spawn window reset thread")?,
        );

        info!(
            flow_port = config.flow.dst_port,
            window_ms = config.control.window.as_millis() as u64,
            control_period_ms = config.control.control_period.as_millis() as u64,
            "admission runtime started"
        );
        Ok(runtime)
    }

    pub fn filter(&self) -> &Arc<AdmissionFilter<SharedAdmissionState>> {
        &self.filter
    }

    pub fn state(&self) -> &Arc<SharedAdmissionState> {
        self.filter.state()
    }

    /// Decides on one classified packet.
    pub fn decide(&self, packet: &PacketMeta) -> Verdict {
        self.filter.decide(packet)
    }

    /// Classifies and decides on one raw packet.
    pub fn admit<P: PacketClassifier + ?Sized>(&self, classifier: &P, packet: &[u8]) -> Verdict {
        self.filter.admit(classifier, packet)
    }

    /// Returns a snapshot of the controller (thread-safe clone).
    pub fn snapshot(&self) -> ControllerSnapshot {
        self.controller
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Shared handle to the controller snapshot for external polling.
    pub fn snapshot_handle(&self) -> Arc<Mutex<ControllerSnapshot>> {
        self.controller.clone()
    }

    /// Start a Prometheus-compatible HTTP metrics server on the given address.
    ///
    /// Calling this multiple times replaces the previous server. Returns the
    /// actual bound address (useful when binding to port 0).
    pub fn start_metrics_server(&mut self, addr: SocketAddr) -> std::io::Result<SocketAddr> {
        if let Some(mut old) = self.metrics_server.take() {
            old.stop();
        }
        let server = MetricsServer::start(
            addr,
            MetricsSource {
                controller: self.controller.clone(),
                filter: self.filter.clone(),
            },
        )?;
        let bound = server.addr();
        self.metrics_server = Some(server);
        Ok(bound)
    }

    pub fn is_running(&self) -> bool {
        !self.stop.is_stopped()
    }

    /// Stops both actors and the metrics server. Idempotent.
    pub fn shutdown(&mut self) {
        if let Some(mut server) = self.metrics_server.take() {
            server.stop();
        }
        self.stop.stop();
        for handle in self.handles.drain(..) {
            let name = handle.thread().name().unwrap_or("unnamed").to_string();
            if handle.join().is_err() {
                warn!(thread = %name, "admission thread panicked");
            }
        }
    }
}

impl Drop for AdmissionRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}
