//! # Admission Filter
//!
//! Per-packet pass/drop decision for the target flow. O(1), lock-free,
//! never blocks.
//!
//! ## Frame integrity
//!
//! Dropping only ever starts and stops on a frame boundary (RTP marker):
//!
//! ```text
//!            over budget on a boundary packet
//!            (packet itself still forwarded)
//!   PASSING ───────────────────────────────────▶ DROPPING_FRAME
//!      ▲                                              │
//!      │      boundary packet that fits the budget    │
//!      └──────────────── (dropped too) ◀──────────────┘
//! ```
//!
//! The packet that commits to dropping closes the current frame, so the
//! whole of the next frame is discarded. Once dropping, every packet is
//! discarded up to and including a boundary that would have fit the budget;
//! the frame after it is evaluated fresh.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::classify::{PacketClassifier, PacketMeta};
use crate::state::AdmissionState;

/// Outcome for one packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    Drop,
}

/// Per-flow filter phase, persisted as the state's drop-in-progress flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FlowPhase {
    Passing,
    DroppingFrame,
}

impl FlowPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlowPhase::Passing => "passing",
            FlowPhase::DroppingFrame => "dropping_frame",
        }
    }
}

/// Decision counters, for diagnostics only.
#[derive(Debug, Default)]
pub struct FilterCounters {
    passed_packets: AtomicU64,
    passed_bytes: AtomicU64,
    dropped_packets: AtomicU64,
    dropped_bytes: AtomicU64,
    dropped_frames: AtomicU64,
    bypassed_packets: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FilterStats {
    pub passed_packets: u64,
    pub passed_bytes: u64,
    pub dropped_packets: u64,
    pub dropped_bytes: u64,
    /// Frames discarded in full (boundary packets dropped).
    pub dropped_frames: u64,
    /// Non-target packets that skipped the filter.
    pub bypassed_packets: u64,
}

impl FilterCounters {
    pub fn snapshot(&self) -> FilterStats {
        FilterStats {
            passed_packets: self.passed_packets.load(Ordering::Relaxed),
            passed_bytes: self.passed_bytes.load(Ordering::Relaxed),
            dropped_packets: self.dropped_packets.load(Ordering::Relaxed),
            dropped_bytes: self.dropped_bytes.load(Ordering::Relaxed),
            dropped_frames: self.dropped_frames.load(Ordering::Relaxed),
            bypassed_packets: self.bypassed_packets.load(Ordering::Relaxed),
        }
    }
}

/// Frame-boundary-aware admission filter over any [`AdmissionState`].
pub struct AdmissionFilter<S: AdmissionState + ?Sized> {
    state: Arc<S>,
    counters: FilterCounters,
}

impl<S: AdmissionState + ?Sized> AdmissionFilter<S> {
    pub fn new(state: Arc<S>) -> Self {
        Self {
            state,
            counters: FilterCounters::default(),
        }
    }

    pub fn state(&self) -> &Arc<S> {
        &self.state
    }

    pub fn phase(&self) -> FlowPhase {
        if self.state.drop_in_progress() {
            FlowPhase::DroppingFrame
        } else {
            FlowPhase::Passing
        }
    }

    pub fn stats(&self) -> FilterStats {
        self.counters.snapshot()
    }

    /// Classifies `packet` and decides on it.
    pub fn admit<C: PacketClassifier + ?Sized>(&self, classifier: &C, packet: &[u8]) -> Verdict {
        self.decide(&classifier.classify(packet))
    }

    /// Decides on one packet. Non-target packets always pass.
    pub fn decide(&self, packet: &PacketMeta) -> Verdict {
        if !packet.matches_target_flow {
            self.counters
                .bypassed_packets
                .fetch_add(1, Ordering::Relaxed);
            return Verdict::Pass;
        }
        let verdict = self.decide_target(packet.size, packet.is_frame_boundary);
        self.count(verdict, packet);
        verdict
    }

    fn decide_target(&self, size: u64, boundary: bool) -> Verdict {
        let state = &*self.state;

        if state.drop_in_progress() {
            let over_budget = state.window_bytes().saturating_add(size) > state.rate_limit();
            if !over_budget && boundary {
                // Last packet of the discarded frame; the next frame is
                // evaluated fresh.
                state.set_drop_in_progress(false);
            }
            return Verdict::Drop;
        }

        if boundary && state.window_bytes().saturating_add(size) > state.rate_limit() {
            // The current frame is already on the wire; commit to dropping
            // the next one in full. This packet is still forwarded.
            state.set_drop_in_progress(true);
        }
        state.add_window_bytes(size);
        Verdict::Pass
    }

    fn count(&self, verdict: Verdict, packet: &PacketMeta) {
        let c = &self.counters;
        match verdict {
            Verdict::Pass => {
                c.passed_packets.fetch_add(1, Ordering::Relaxed);
                c.passed_bytes.fetch_add(packet.size, Ordering::Relaxed);
            }
            Verdict::Drop => {
                c.dropped_packets.fetch_add(1, Ordering::Relaxed);
                c.dropped_bytes.fetch_add(packet.size, Ordering::Relaxed);
                if packet.is_frame_boundary {
                    c.dropped_frames.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }
}
