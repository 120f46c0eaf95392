//! # Prometheus Metrics
//!
//! Renders controller, admission state and filter counters in Prometheus
//! text exposition format and provides a lightweight HTTP server for
//! scraping (`/metrics`), plus a JSON status view (`/status`).

use crate::controller::ControllerSnapshot;
use crate::filter::{AdmissionFilter, FilterStats};
use crate::state::{SharedAdmissionState, StateSnapshot};
use std::fmt::Write;
use std::io::{Read, Write as IoWrite};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tracing::debug;

fn gauge(out: &mut String, name: &str, help: &str, value: impl std::fmt::Display) {
    writeln!(out, "# HELP {name} {help}").unwrap();
    writeln!(out, "# TYPE {name} gauge").unwrap();
    writeln!(out, "{name} {value}").unwrap();
}

fn counter(out: &mut String, name: &str, help: &str, value: u64) {
    writeln!(out, "# HELP {name} {help}").unwrap();
    writeln!(out, "# TYPE {name} counter").unwrap();
    writeln!(out, "{name} {value}").unwrap();
}

/// Render one scrape worth of metrics.
pub fn render_prometheus(
    controller: &ControllerSnapshot,
    state: &StateSnapshot,
    filter: &FilterStats,
) -> String {
    let mut out = String::with_capacity(2048);

    // ── Controller ──────────────────────────────────────────────

    writeln!(
        out,
        "# HELP framegate_controller_phase Controller phase encoded as integer (0=idle..3=stopped)."
    )
    .unwrap();
    writeln!(out, "# TYPE framegate_controller_phase gauge").unwrap();
    writeln!(
        out,
        "framegate_controller_phase{{phase=\"{}\"}} {}",
        controller.phase.as_str(),
        controller.phase.as_u8()
    )
    .unwrap();

    gauge(
        &mut out,
        "framegate_damping_factor",
        "Current damping factor k.",
        format_args!("{:.4}", controller.k),
    );
    // `+ 0.0` normalizes negative zero for clean formatting.
    gauge(
        &mut out,
        "framegate_ceiling_mbps",
        "Bandwidth ceiling measured during calibration.",
        format_args!("{:.3}", controller.ceiling_mbps + 0.0),
    );
    counter(
        &mut out,
        "framegate_control_periods_total",
        "Control periods evaluated.",
        controller.periods,
    );
    counter(
        &mut out,
        "framegate_loss_events_total",
        "Control periods that observed loss above the hysteresis.",
        controller.loss_events,
    );
    gauge(
        &mut out,
        "framegate_last_loss_delta",
        "Dropped-packet delta seen in the last control period.",
        controller.last_loss_delta,
    );
    counter(
        &mut out,
        "framegate_stats_failures_total",
        "Link statistics reads that failed.",
        controller.stats_failures,
    );

    // ── Admission state ─────────────────────────────────────────

    gauge(
        &mut out,
        "framegate_rate_limit_bytes",
        "Published byte budget per admission window.",
        state.rate_limit,
    );
    gauge(
        &mut out,
        "framegate_window_bytes",
        "Bytes admitted in the current window.",
        state.window_bytes,
    );
    gauge(
        &mut out,
        "framegate_drop_in_progress",
        "Whether the flow is discarding a frame (1) or passing (0).",
        u8::from(state.drop_in_progress),
    );

    // ── Filter ──────────────────────────────────────────────────

    counter(
        &mut out,
        "framegate_passed_packets_total",
        "Target-flow packets forwarded.",
        filter.passed_packets,
    );
    counter(
        &mut out,
        "framegate_passed_bytes_total",
        "Target-flow bytes forwarded.",
        filter.passed_bytes,
    );
    counter(
        &mut out,
        "framegate_dropped_packets_total",
        "Target-flow packets discarded.",
        filter.dropped_packets,
    );
    counter(
        &mut out,
        "framegate_dropped_bytes_total",
        "Target-flow bytes discarded.",
        filter.dropped_bytes,
    );
    counter(
        &mut out,
        "framegate_dropped_frames_total",
        "Frames discarded in full.",
        filter.dropped_frames,
    );
    counter(
        &mut out,
        "framegate_bypassed_packets_total",
        "Packets outside the target flow.",
        filter.bypassed_packets,
    );

    out
}

/// Serialize one status snapshot as JSON for `GET /status`.
///
/// Produces `{"controller": {...}, "state": {...}, "filter": {...},
/// "timestamp_ms": ...}` with the controller phase as its lowercase name.
pub fn to_status_json(
    controller: &ControllerSnapshot,
    state: &StateSnapshot,
    filter: &FilterStats,
) -> String {
    let now_ms = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;

    serde_json::json!({
        "controller": {
            "phase": controller.phase.as_str(),
            "k": controller.k,
            "ceiling_mbps": controller.ceiling_mbps,
            "rate_limit_bytes": controller.rate_limit_bytes,
            "periods": controller.periods,
            "loss_events": controller.loss_events,
            "last_loss_delta": controller.last_loss_delta,
            "stats_failures": controller.stats_failures,
        },
        "state": state,
        "filter": filter,
        "timestamp_ms": now_ms,
    })
    .to_string()
}

/// Everything a scrape reads. Cheap to clone.
#[derive(Clone)]
pub struct MetricsSource {
    pub controller: Arc<Mutex<ControllerSnapshot>>,
    pub filter: Arc<AdmissionFilter<SharedAdmissionState>>,
}

impl MetricsSource {
    fn controller(&self) -> ControllerSnapshot {
        self.controller
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn render(&self) -> String {
        render_prometheus(
            &self.controller(),
            &self.filter.state().snapshot(),
            &self.filter.stats(),
        )
    }

    pub fn status_json(&self) -> String {
        to_status_json(
            &self.controller(),
            &self.filter.state().snapshot(),
            &self.filter.stats(),
        )
    }
}

/// A lightweight HTTP server that serves `/metrics` for Prometheus scraping.
pub struct MetricsServer {
    running: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
    addr: SocketAddr,
}

impl MetricsServer {
    /// Start the metrics server on the given address.
    pub fn start(bind_addr: SocketAddr, source: MetricsSource) -> std::io::Result<Self> {
        let listener = TcpListener::bind(bind_addr)?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let running = Arc::new(AtomicBool::new(true));
        let running_clone = running.clone();

        let handle = thread::Builder::new()
            .name("framegate-metrics".into())
            .spawn(move || serve_loop(listener, source, running_clone))?;

        debug!(%addr, "metrics server listening");
        Ok(MetricsServer {
            running,
            handle: Some(handle),
            addr,
        })
    }

    /// The address the server is actually listening on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for MetricsServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn serve_loop(listener: TcpListener, source: MetricsSource, running: Arc<AtomicBool>) {
    while running.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, _)) => handle_connection(stream, &source),
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(50));
            }
            Err(_) => {
                thread::sleep(Duration::from_millis(100));
            }
        }
    }
}

fn handle_connection(mut stream: TcpStream, source: &MetricsSource) {
    // Accepted sockets may inherit non-blocking mode on some platforms.
    let _ = stream.set_nonblocking(false);
    let _ = stream.set_read_timeout(Some(Duration::from_secs(2)));
    let _ = stream.set_write_timeout(Some(Duration::from_secs(2)));

    let mut buf = [0u8; 1024];
    let n = match stream.read(&mut buf) {
        Ok(n) => n,
        Err(_) => return,
    };
    let request = String::from_utf8_lossy(&buf[..n]);

    let reply = if request.starts_with("GET /metrics") {
        Some(("text/plain; version=0.0.4; charset=utf-8", source.render()))
    } else if request.starts_with("GET /status") {
        Some(("application/json", source.status_json()))
    } else {
        None
    };

    if let Some((content_type, body)) = reply {
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nContent-Length: {}\r\n\
             Connection: close\r\n\r\n{}",
            content_type,
            body.len(),
            body
        );
        let _ = stream.write_all(response.as_bytes());
    } else {
        let response = "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
        let _ = stream.write_all(response.as_bytes());
    }
}
