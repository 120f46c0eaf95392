use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::clock::{Clock, StopSignal};
use crate::state::AdmissionState;

/// Zeroes the admission window counter on a fixed period.
///
/// Independent of the controller: it never reads the budget or the drop
/// flag, and its period is the admission window, not the control period.
pub struct WindowResetClock<C: Clock, A: AdmissionState + ?Sized> {
    clock: C,
    period: Duration,
    state: Arc<A>,
    resets: u64,
}

impl<C: Clock, A: AdmissionState + ?Sized> WindowResetClock<C, A> {
    pub fn new(clock: C, period: Duration, state: Arc<A>) -> Self {
        Self {
            clock,
            period,
            state,
            resets: 0,
        }
    }

    pub fn resets(&self) -> u64 {
        self.resets
    }

    /// Opens a fresh window.
    pub fn tick(&mut self) {
        self.state.reset_window();
        self.resets += 1;
    }

    /// Ticks every period until `stop` fires.
    pub fn run(mut self, stop: StopSignal) -> u64 {
        while !self.clock.pause(self.period, &stop) {
            self.tick();
        }
        debug!(resets = self.resets, "window reset clock stopped");
        self.resets
    }
}
