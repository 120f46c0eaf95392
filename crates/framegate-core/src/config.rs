use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::classify::{FlowMatch, Protocol};

pub const CONFIG_VERSION: u32 = 1;

// ─── Raw TOML input ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AdmissionConfigInput {
    pub version: u32,
    pub flow: Option<FlowConfigInput>,
    pub control: ControlConfigInput,
    pub calibration: CalibrationConfigInput,
    pub stats: StatsConfigInput,
    pub metrics: MetricsConfigInput,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FlowConfigInput {
    pub protocol: Option<Protocol>,
    pub dst_addr: Option<String>,
    pub dst_port: Option<u16>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ControlConfigInput {
    pub decrease_factor: Option<f64>,
    pub increase_step: Option<f64>,
    pub min_increase_step: Option<f64>,
    pub k_floor: Option<f64>,
    pub increase_gate: Option<f64>,
    pub loss_hysteresis: Option<u64>,
    pub control_period_ms: Option<u64>,
    pub window_ms: Option<u64>,
    pub initial_rate_limit_bytes: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CalibrationConfigInput {
    pub poll_interval_ms: Option<u64>,
    pub duration_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StatsConfigInput {
    pub backend: Option<StatsBackend>,
    pub interface: Option<String>,
    pub qdisc_index: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MetricsConfigInput {
    pub bind: Option<String>,
}

// ─── Resolved configuration ─────────────────────────────────────────────────

/// Tunables of the AIMD control law and the admission window.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlConfig {
    /// Multiplier applied to `k` when loss is detected, in (0, 1).
    pub decrease_factor: f64,
    /// Additive step applied to `k` in loss-free periods.
    pub increase_step: f64,
    /// Lower bound on the additive step so `k` always makes progress.
    pub min_increase_step: f64,
    /// `k` is never allowed below this value.
    pub k_floor: f64,
    /// Additive increase only applies while `k` is below this gate.
    pub increase_gate: f64,
    /// Dropped-packet increases at or below this count are counter noise.
    pub loss_hysteresis: u64,
    /// Controller reaction period.
    pub control_period: Duration,
    /// Admission window over which the byte budget accumulates.
    pub window: Duration,
    /// Budget published before calibration finishes (bytes per window).
    pub initial_rate_limit_bytes: u64,
}

impl ControlConfig {
    /// Bytes per window admitted for each Mbps of rate:
    /// `window_seconds * 1_000_000 / 8`. 25 000 for a 200 ms window.
    pub fn window_scale(&self) -> f64 {
        self.window.as_micros() as f64 / 8.0
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            decrease_factor: 0.8,
            increase_step: 0.05,
            min_increase_step: 0.01,
            k_floor: 0.1,
            increase_gate: 1.05,
            loss_hysteresis: 4,
            control_period: Duration::from_secs(2),
            window: Duration::from_millis(200),
            initial_rate_limit_bytes: 1_250_000,
        }
    }
}

/// Ceiling calibration schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalibrationConfig {
    pub poll_interval: Duration,
    pub duration: Duration,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1000),
            duration: Duration::from_millis(15_000),
        }
    }
}

/// Where link counters come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatsBackend {
    /// `/sys/class/net/<iface>/statistics/*`
    #[default]
    Sysfs,
    /// `tc -s qdisc show dev <iface>`
    Qdisc,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsConfig {
    pub backend: StatsBackend,
    pub interface: String,
    /// Which `Sent` line of the qdisc dump to read (0-based).
    pub qdisc_index: usize,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            backend: StatsBackend::Sysfs,
            interface: "phy1-ap0".to_string(),
            qdisc_index: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MetricsConfig {
    pub bind: Option<SocketAddr>,
}

/// Fully validated startup configuration. No hot reload.
#[derive(Debug, Clone, PartialEq)]
pub struct AdmissionConfig {
    pub version: u32,
    pub flow: FlowMatch,
    pub control: ControlConfig,
    pub calibration: CalibrationConfig,
    pub stats: StatsConfig,
    pub metrics: MetricsConfig,
}

impl AdmissionConfigInput {
    pub fn resolve(self) -> Result<AdmissionConfig> {
        let version = if self.version == 0 {
            CONFIG_VERSION
        } else {
            self.version
        };
        if version != CONFIG_VERSION {
            bail!("Unsupported config version {}", version);
        }

        let Some(flow) = self.flow else {
            bail!("Missing [flow] section");
        };
        let flow = resolve_flow(flow)?;
        let control = resolve_control(self.control)?;

        let cal_defaults = CalibrationConfig::default();
        let calibration = CalibrationConfig {
            poll_interval: self
                .calibration
                .poll_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(cal_defaults.poll_interval),
            duration: self
                .calibration
                .duration_ms
                .map(Duration::from_millis)
                .unwrap_or(cal_defaults.duration),
        };
        if calibration.poll_interval.is_zero() {
            bail!("calibration.poll_interval_ms must be > 0");
        }
        if calibration.duration < calibration.poll_interval {
            bail!("calibration.duration_ms must cover at least one poll interval");
        }

        let stats_defaults = StatsConfig::default();
        let interface = self
            .stats
            .interface
            .map(|iface| iface.trim().to_string())
            .unwrap_or(stats_defaults.interface);
        if interface.is_empty() {
            bail!("stats.interface must not be empty");
        }
        let stats = StatsConfig {
            backend: self.stats.backend.unwrap_or(stats_defaults.backend),
            interface,
            qdisc_index: self.stats.qdisc_index.unwrap_or(stats_defaults.qdisc_index),
        };

        let bind = match self.metrics.bind.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(addr) => Some(
                addr.parse::<SocketAddr>()
                    .with_context(|| format!("Invalid metrics.bind address {:?}", addr))?,
            ),
        };

        Ok(AdmissionConfig {
            version,
            flow,
            control,
            calibration,
            stats,
            metrics: MetricsConfig { bind },
        })
    }
}

fn resolve_flow(input: FlowConfigInput) -> Result<FlowMatch> {
    let Some(dst_port) = input.dst_port else {
        bail!("flow.dst_port is required");
    };
    let dst_addr = match input.dst_addr.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(addr) => Some(
            addr.parse::<Ipv4Addr>()
                .with_context(|| format!("Invalid flow.dst_addr {:?}", addr))?,
        ),
    };
    Ok(FlowMatch {
        protocol: input.protocol.unwrap_or(Protocol::Udp),
        dst_addr,
        dst_port,
    })
}

fn resolve_control(input: ControlConfigInput) -> Result<ControlConfig> {
    let defaults = ControlConfig::default();

    let Some(decrease_factor) = input.decrease_factor else {
        bail!("control.decrease_factor is required");
    };
    if !(decrease_factor > 0.0 && decrease_factor < 1.0) {
        bail!(
            "control.decrease_factor must be in (0, 1), got {}",
            decrease_factor
        );
    }
    let Some(increase_step) = input.increase_step else {
        bail!("control.increase_step is required");
    };
    if !(increase_step >= 0.0) || !increase_step.is_finite() {
        bail!("control.increase_step must be >= 0, got {}", increase_step);
    }

    let control = ControlConfig {
        decrease_factor,
        increase_step,
        min_increase_step: input
            .min_increase_step
            .unwrap_or(defaults.min_increase_step)
            .max(0.0),
        k_floor: input.k_floor.unwrap_or(defaults.k_floor),
        increase_gate: input.increase_gate.unwrap_or(defaults.increase_gate),
        loss_hysteresis: input.loss_hysteresis.unwrap_or(defaults.loss_hysteresis),
        control_period: input
            .control_period_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.control_period),
        window: input
            .window_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.window),
        initial_rate_limit_bytes: input
            .initial_rate_limit_bytes
            .unwrap_or(defaults.initial_rate_limit_bytes),
    };

    if !(control.k_floor > 0.0) {
        bail!("control.k_floor must be > 0, got {}", control.k_floor);
    }
    if control.increase_gate < control.k_floor {
        bail!(
            "control.increase_gate ({}) must not be below k_floor ({})",
            control.increase_gate,
            control.k_floor
        );
    }
    if control.control_period.is_zero() {
        bail!("control.control_period_ms must be > 0");
    }
    if control.window.is_zero() {
        bail!("control.window_ms must be > 0");
    }
    Ok(control)
}

impl AdmissionConfig {
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let parsed: AdmissionConfigInput = toml::from_str(input).context("Invalid config TOML")?;
        parsed.resolve()
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::from_toml_str(&text)
    }
}
