use std::path::Path;
use std::time::Duration;

use rdma_mem::Region;
use serde::{Deserialize, Serialize};

use crate::entry::{COMPLETION_ENTRY_SIZE, SUBMIT_ENTRY_SIZE};
use crate::error::ConfigError;
use crate::ring::Ring;

/// Names a JSON file holding a [`QueuePairConfig`].
pub const CONFIG_ENV: &str = "RDMA_QP_CONFIG";

pub const REFERENCE_SQ_BASE: u64 = 0x1000_0000;
pub const REFERENCE_REMOTE_BASE: u64 = 0x2000_0000;
pub const REFERENCE_PAYLOAD_BASE: u64 = 0x3000_0000;
pub const REFERENCE_CQ_BASE: u64 = 0x4000_0000;
pub const REFERENCE_CAPACITY: u32 = 4;
pub const REFERENCE_BUFFER_LEN: u64 = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RingConfig {
    pub base: u64,
    pub capacity: u32,
}

/// Polling deadlines and the session's retry schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PollPolicy {
    /// Budget for SQ_HEAD to move after a doorbell.
    pub drain_timeout_us: u64,
    /// Budget for CQ_TAIL to move once the descriptor was consumed.
    pub completion_timeout_us: u64,
    /// Pause between consecutive cursor reads; zero spins.
    pub poll_interval_us: u64,
    /// Additional polling rounds after a timeout before it is surfaced.
    pub max_retries: u32,
    pub backoff_initial_us: u64,
    pub backoff_max_us: u64,
    /// Budget for the Ethernet link to report up during bring-up.
    pub link_timeout_ms: u64,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            drain_timeout_us: 100_000,
            completion_timeout_us: 100_000,
            poll_interval_us: 0,
            max_retries: 3,
            backoff_initial_us: 100,
            backoff_max_us: 10_000,
            link_timeout_ms: 10_000,
        }
    }
}

impl PollPolicy {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_micros(self.drain_timeout_us)
    }

    pub fn completion_timeout(&self) -> Duration {
        Duration::from_micros(self.completion_timeout_us)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_micros(self.poll_interval_us)
    }

    pub fn link_timeout(&self) -> Duration {
        Duration::from_millis(self.link_timeout_ms)
    }

    /// Pause before retry `attempt` (0-based): doubles from the initial value up to the cap.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let us = self
            .backoff_initial_us
            .saturating_mul(factor)
            .min(self.backoff_max_us.max(self.backoff_initial_us));
        Duration::from_micros(us)
    }
}

/// Everything the driver needs to know about one deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueuePairConfig {
    pub sq: RingConfig,
    pub cq: RingConfig,
    /// Source buffer; every `local_key` range must fall inside it.
    pub payload: Region,
    /// Destination buffer; every `remote_key` range must fall inside it.
    pub remote: Region,
    #[serde(default)]
    pub poll: PollPolicy,
}

impl QueuePairConfig {
    /// The layout used by the loopback board bring-up.
    pub fn reference() -> Self {
        Self {
            sq: RingConfig {
                base: REFERENCE_SQ_BASE,
                capacity: REFERENCE_CAPACITY,
            },
            cq: RingConfig {
                base: REFERENCE_CQ_BASE,
                capacity: REFERENCE_CAPACITY,
            },
            payload: Region::new(REFERENCE_PAYLOAD_BASE, REFERENCE_BUFFER_LEN),
            remote: Region::new(REFERENCE_REMOTE_BASE, REFERENCE_BUFFER_LEN),
            poll: PollPolicy::default(),
        }
    }

    pub fn sq_ring(&self) -> Ring {
        Ring::new(self.sq.base, self.sq.capacity, SUBMIT_ENTRY_SIZE as u64)
    }

    pub fn cq_ring(&self) -> Ring {
        Ring::new(self.cq.base, self.cq.capacity, COMPLETION_ENTRY_SIZE as u64)
    }

    /// Completions that may be outstanding at once without the CQ overflowing or an SQ slot
    /// being reused before its completion was released.
    pub fn outstanding_budget(&self) -> u32 {
        self.sq.capacity.min(self.cq.capacity).saturating_sub(1)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_ring("SQ", self.sq, SUBMIT_ENTRY_SIZE as u64)?;
        check_ring("CQ", self.cq, COMPLETION_ENTRY_SIZE as u64)?;

        let windows = [
            ("SQ", self.sq_ring().region()),
            ("CQ", self.cq_ring().region()),
            ("payload", self.payload),
            ("remote", self.remote),
        ];
        for (name, region) in windows {
            if region.is_empty() {
                return Err(ConfigError::EmptyRegion { name });
            }
            if region.end().is_none() {
                return Err(ConfigError::RegionWraps {
                    name,
                    base: region.base,
                    len: region.len,
                });
            }
        }
        for (i, &(a, ra)) in windows.iter().enumerate() {
            for &(b, rb) in &windows[i + 1..] {
                if ra.overlaps(&rb) {
                    return Err(ConfigError::Overlap { a, b });
                }
            }
        }

        if self.poll.backoff_initial_us == 0 {
            return Err(ConfigError::ZeroBackoff);
        }
        Ok(())
    }

    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let cfg: Self = serde_json::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::from_json_str(&raw)
    }

    /// Loads the file named by `RDMA_QP_CONFIG`, or the reference layout when it is unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::from_file(Path::new(&path)),
            None => Ok(Self::reference()),
        }
    }

    pub fn to_json_pretty(&self) -> String {
        // Plain data with string keys; serialization cannot fail.
        serde_json::to_string_pretty(self).unwrap_or_default()
    }
}

fn check_ring(ring: &'static str, cfg: RingConfig, entry_size: u64) -> Result<(), ConfigError> {
    if cfg.capacity < 2 || !cfg.capacity.is_power_of_two() {
        return Err(ConfigError::InvalidCapacity {
            ring,
            capacity: cfg.capacity,
        });
    }
    if cfg.base % entry_size != 0 {
        return Err(ConfigError::Misaligned {
            ring,
            base: cfg.base,
            align: entry_size,
        });
    }
    Ok(())
}
