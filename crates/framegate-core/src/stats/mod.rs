//! # Link Counter Sources
//!
//! The controller only needs three cumulative counters for the monitored
//! interface: bytes sent, packets sent, packets dropped. Every backend
//! implements [`StatsSource`] and reports failures as [`StatsError`], which
//! callers treat as "no new information" and retry on the next period.

pub mod qdisc;
pub mod sysfs;

use serde::Serialize;
use thiserror::Error;

use crate::config::{StatsBackend, StatsConfig};

pub use qdisc::QdiscStats;
pub use sysfs::SysfsStats;

/// Cumulative transmit counters read from the link.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LinkCounters {
    pub sent_bytes: u64,
    pub sent_packets: u64,
    pub dropped_packets: u64,
}

/// Failure to read link counters. Always transient.
#[derive(Debug, Error)]
pub enum StatsError {
    #[error("stats source unavailable: {0}")]
    Io(#[from] std::io::Error),
    #[error("unparseable stats output: {0}")]
    Parse(String),
    #[error("stats command exited with {status}: {stderr}")]
    CommandFailed { status: i32, stderr: String },
}

/// Synchronous, read-only query of cumulative link counters.
pub trait StatsSource: Send {
    fn sample(&mut self) -> Result<LinkCounters, StatsError>;
}

impl<S: StatsSource + ?Sized> StatsSource for Box<S> {
    fn sample(&mut self) -> Result<LinkCounters, StatsError> {
        (**self).sample()
    }
}

/// Builds the backend selected in the configuration.
pub fn from_config(config: &StatsConfig) -> Box<dyn StatsSource> {
    match config.backend {
        StatsBackend::Sysfs => Box::new(SysfsStats::new(&config.interface)),
        StatsBackend::Qdisc => Box::new(QdiscStats::new(&config.interface, config.qdisc_index)),
    }
}
