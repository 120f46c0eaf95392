//! Scripted collaborators for tests and benches.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::stats::{LinkCounters, StatsError, StatsSource};

enum Step {
    Counters(LinkCounters),
    Failure,
}

#[derive(Default)]
struct Script {
    steps: VecDeque<Step>,
    last: LinkCounters,
    taken: usize,
}

/// Stats source that replays a queued script of readings.
///
/// Once the script runs out, the last successful reading repeats (an idle
/// link with no further loss). Clones share the same script, so a test can
/// keep queueing readings while a runtime thread consumes them.
#[derive(Clone, Default)]
pub struct ScriptedStats {
    script: Arc<Mutex<Script>>,
}

impl ScriptedStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script of byte counters with no packets or drops.
    pub fn from_bytes(bytes: &[u64]) -> Self {
        let stats = Self::new();
        for &b in bytes {
            stats.push_bytes(b);
        }
        stats
    }

    pub fn push_counters(&self, counters: LinkCounters) {
        self.lock().steps.push_back(Step::Counters(counters));
    }

    pub fn push(&self, sent_bytes: u64, dropped_packets: u64) {
        self.push_counters(LinkCounters {
            sent_bytes,
            sent_packets: sent_bytes / 1200,
            dropped_packets,
        });
    }

    pub fn push_bytes(&self, sent_bytes: u64) {
        self.push(sent_bytes, 0);
    }

    pub fn push_dropped(&self, dropped_packets: u64) {
        self.push(0, dropped_packets);
    }

    /// Queues one failed read.
    pub fn push_failure(&self) {
        self.lock().steps.push_back(Step::Failure);
    }

    /// Number of `sample()` calls served so far.
    pub fn samples_taken(&self) -> usize {
        self.lock().taken
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl StatsSource for ScriptedStats {
    fn sample(&mut self) -> Result<LinkCounters, StatsError> {
        let mut script = self.lock();
        script.taken += 1;
        match script.steps.pop_front() {
            Some(Step::Counters(c)) => {
                script.last = c;
                Ok(c)
            }
            Some(Step::Failure) => Err(StatsError::Parse("scripted failure".into())),
            None => Ok(script.last),
        }
    }
}
