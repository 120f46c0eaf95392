//! # Shared Admission State
//!
//! Three values shared by the rate controller, the admission filter and the
//! window reset clock. Every field is an independent atomic: no lock is ever
//! held across a packet decision, so the packet path never waits on the
//! controller. Readers must treat each load as a fresh snapshot.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Read/write capability over the admission state.
///
/// The filter, the controller and the reset clock are written against this
/// trait so the enforcement point can live anywhere that can expose these
/// operations (in-process atomics, a kernel map, a test double).
pub trait AdmissionState: Send + Sync {
    /// Bytes admitted in the current window.
    fn window_bytes(&self) -> u64;
    /// Atomically adds `bytes` to the window counter. Returns the new total.
    fn add_window_bytes(&self, bytes: u64) -> u64;
    /// Zeroes the window counter.
    fn reset_window(&self);
    fn drop_in_progress(&self) -> bool;
    fn set_drop_in_progress(&self, dropping: bool);
    /// Current budget in bytes per window.
    fn rate_limit(&self) -> u64;
    fn publish_rate_limit(&self, bytes_per_window: u64);
}

/// In-process admission state backed by atomics.
#[derive(Debug, Default)]
pub struct SharedAdmissionState {
    window_bytes: AtomicU64,
    drop_in_progress: AtomicBool,
    rate_limit: AtomicU64,
}

impl SharedAdmissionState {
    pub fn new(initial_rate_limit: u64) -> Self {
        Self {
            window_bytes: AtomicU64::new(0),
            drop_in_progress: AtomicBool::new(false),
            rate_limit: AtomicU64::new(initial_rate_limit),
        }
    }

    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            window_bytes: self.window_bytes(),
            drop_in_progress: self.drop_in_progress(),
            rate_limit: self.rate_limit(),
        }
    }
}

impl AdmissionState for SharedAdmissionState {
    fn window_bytes(&self) -> u64 {
        self.window_bytes.load(Ordering::Acquire)
    }

    fn add_window_bytes(&self, bytes: u64) -> u64 {
        self.window_bytes.fetch_add(bytes, Ordering::AcqRel) + bytes
    }

    fn reset_window(&self) {
        self.window_bytes.store(0, Ordering::Release);
    }

    fn drop_in_progress(&self) -> bool {
        self.drop_in_progress.load(Ordering::Acquire)
    }

    fn set_drop_in_progress(&self, dropping: bool) {
        self.drop_in_progress.store(dropping, Ordering::Release);
    }

    fn rate_limit(&self) -> u64 {
        self.rate_limit.load(Ordering::Acquire)
    }

    fn publish_rate_limit(&self, bytes_per_window: u64) {
        self.rate_limit.store(bytes_per_window, Ordering::Release);
    }
}

/// Point-in-time copy of the state for diagnostics. Fields are loaded
/// independently and may not be mutually consistent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StateSnapshot {
    pub window_bytes: u64,
    pub drop_in_progress: bool,
    pub rate_limit: u64,
}
