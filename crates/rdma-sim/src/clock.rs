use std::time::Duration;

use rdma_qp::Clock;

/// Virtual time: every `now()` advances by a fixed step and `pause` advances by the requested
/// amount, so polling deadlines expire after a predictable number of register reads.
#[derive(Debug, Clone, Copy)]
pub struct SimClock {
    now: Duration,
    step: Duration,
}

impl SimClock {
    pub const DEFAULT_STEP: Duration = Duration::from_micros(1);

    pub fn new() -> Self {
        Self::with_step(Self::DEFAULT_STEP)
    }

    pub fn with_step(step: Duration) -> Self {
        Self {
            now: Duration::ZERO,
            step,
        }
    }

    /// Current virtual time without advancing it.
    pub fn peek(&self) -> Duration {
        self.now
    }
}

impl Default for SimClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SimClock {
    fn now(&mut self) -> Duration {
        self.now += self.step;
        self.now
    }

    fn pause(&mut self, d: Duration) {
        self.now += d;
    }
}
