//! # framegate-core
//!
//! Congestion-responsive admission control for a single RTP video flow.
//!
//! A loss-driven AIMD controller scales a calibrated bandwidth ceiling into a
//! per-window byte budget. A per-packet filter enforces that budget, and it
//! only ever starts or stops dropping on frame boundaries, so a frame is
//! forwarded either whole or not at all.
//!
//! ## Crate structure
//!
//! - [`clock`]: Monotonic/manual time sources and the shared stop signal
//! - [`config`]: TOML configuration (raw input → resolved config)
//! - [`stats`]: Link counter sources (sysfs, `tc` qdisc output)
//! - [`estimator`]: Throughput estimation and ceiling calibration
//! - [`loss`]: Dropped-packet delta detection with hysteresis
//! - [`controller`]: AIMD damping-factor control loop
//! - [`state`]: Shared admission state (atomics)
//! - [`window`]: Admission window reset clock
//! - [`classify`]: Ethernet/IPv4/UDP/RTP packet classification
//! - [`filter`]: Frame-boundary-aware pass/drop decision
//! - [`runtime`]: Thread wiring for the controller and reset clock
//! - [`metrics`]: Prometheus exposition and HTTP scrape endpoint
//! - [`test_util`]: Scripted collaborators for tests and benches

pub mod classify;
pub mod clock;
pub mod config;
pub mod controller;
pub mod estimator;
pub mod filter;
pub mod loss;
pub mod metrics;
pub mod runtime;
pub mod state;
pub mod stats;
pub mod test_util;
pub mod window;
