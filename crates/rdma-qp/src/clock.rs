use std::time::{Duration, Instant};

/// Monotonic time source used for polling deadlines and backoff.
pub trait Clock {
    /// Time since an arbitrary, fixed origin.
    fn now(&mut self) -> Duration;

    /// Waits roughly `d`. Busy-polling callers pass zero between register reads.
    fn pause(&mut self, d: Duration);
}

impl<T: Clock + ?Sized> Clock for &mut T {
    fn now(&mut self) -> Duration {
        (**self).now()
    }

    fn pause(&mut self, d: Duration) {
        (**self).pause(d)
    }
}

/// Host wall clock.
#[derive(Debug, Clone, Copy)]
pub struct StdClock {
    origin: Instant,
}

impl StdClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for StdClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for StdClock {
    fn now(&mut self) -> Duration {
        self.origin.elapsed()
    }

    fn pause(&mut self, d: Duration) {
        if d.is_zero() {
            std::hint::spin_loop();
        } else {
            std::thread::sleep(d);
        }
    }
}

/// Free-running counter with a known frequency (the A53 generic timer on the board).
pub struct CounterClock<F> {
    counts_per_second: u64,
    origin: u64,
    read: F,
}

impl<F: FnMut() -> u64> CounterClock<F> {
    pub fn new(counts_per_second: u64, mut read: F) -> Self {
        let origin = read();
        Self {
            counts_per_second: counts_per_second.max(1),
            origin,
            read,
        }
    }

    pub fn counts_per_second(&self) -> u64 {
        self.counts_per_second
    }

    pub fn ticks(&mut self) -> u64 {
        (self.read)().wrapping_sub(self.origin)
    }

    pub fn ticks_to_duration(&self, ticks: u64) -> Duration {
        let cps = self.counts_per_second as u128;
        let nanos = ticks as u128 * 1_000_000_000 / cps;
        Duration::from_nanos(nanos.min(u64::MAX as u128) as u64)
    }
}

impl<F: FnMut() -> u64> Clock for CounterClock<F> {
    fn now(&mut self) -> Duration {
        let ticks = self.ticks();
        self.ticks_to_duration(ticks)
    }

    fn pause(&mut self, d: Duration) {
        let until = self.now().saturating_add(d);
        while self.now() < until {
            std::hint::spin_loop();
        }
    }
}

/// A wall-clock budget started at a known instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    start: Duration,
    budget: Duration,
}

impl Deadline {
    pub fn after<C: Clock + ?Sized>(clock: &mut C, budget: Duration) -> Self {
        Self {
            start: clock.now(),
            budget,
        }
    }

    pub fn elapsed(&self, now: Duration) -> Duration {
        now.saturating_sub(self.start)
    }

    pub fn expired(&self, now: Duration) -> bool {
        self.elapsed(now) >= self.budget
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn counter_clock_converts_ticks() {
        let counter = Cell::new(1_000u64);
        let mut clock = CounterClock::new(100_000_000, || counter.get());
        counter.set(1_000 + 50_000_000);
        assert_eq!(clock.now(), Duration::from_millis(500));
    }

    #[test]
    fn deadline_expires_after_budget() {
        let counter = Cell::new(0u64);
        let mut clock = CounterClock::new(1_000, || counter.get());
        let deadline = Deadline::after(&mut clock, Duration::from_millis(10));
        counter.set(9);
        assert!(!deadline.expired(clock.now()));
        counter.set(10);
        assert!(deadline.expired(clock.now()));
        assert_eq!(deadline.elapsed(clock.now()), Duration::from_millis(10));
    }
}
