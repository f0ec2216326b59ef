use std::fmt;
use std::time::Duration;

/// Bytes moved over an interval measured in counter ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Throughput {
    pub bytes: u64,
    pub ticks: u64,
    pub counts_per_second: u64,
}

impl Throughput {
    pub fn from_ticks(bytes: u64, ticks: u64, counts_per_second: u64) -> Self {
        Self {
            bytes,
            ticks,
            counts_per_second,
        }
    }

    /// Nanosecond ticks.
    pub fn from_duration(bytes: u64, elapsed: Duration) -> Self {
        let ticks = elapsed.as_nanos().min(u64::MAX as u128) as u64;
        Self::from_ticks(bytes, ticks, 1_000_000_000)
    }

    pub fn micros(&self) -> u64 {
        if self.counts_per_second == 0 {
            return 0;
        }
        (self.ticks as u128 * 1_000_000 / self.counts_per_second as u128) as u64
    }

    /// MiB per second scaled by 1000. Zero when no time elapsed.
    pub fn mib_per_sec_x1000(&self) -> u64 {
        if self.ticks == 0 {
            return 0;
        }
        let num = self.bytes as u128 * self.counts_per_second as u128 * 1000;
        let den = self.ticks as u128 * 1024 * 1024;
        (num / den).min(u64::MAX as u128) as u64
    }
}

impl fmt::Display for Throughput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let x1000 = self.mib_per_sec_x1000();
        write!(f, "{}.{:03} MB/s", x1000 / 1000, x1000 % 1000)
    }
}
