use std::time::Duration;

use rdma_mem::Region;
use thiserror::Error;

use crate::controller::ControllerState;
use crate::dma::MemoryFault;
use crate::endpoint::{EndpointError, LinkError};
use crate::regs::Reg;

pub type Result<T> = std::result::Result<T, QueueError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferSide {
    Source,
    Destination,
}

impl std::fmt::Display for BufferSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BufferSide::Source => f.write_str("source"),
            BufferSide::Destination => f.write_str("destination"),
        }
    }
}

/// Errors from validating a [`crate::QueuePairConfig`] or loading one from disk.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{ring} capacity {capacity} must be a power of two of at least 2")]
    InvalidCapacity { ring: &'static str, capacity: u32 },

    #[error("{ring} base 0x{base:x} is not aligned to {align} bytes")]
    Misaligned {
        ring: &'static str,
        base: u64,
        align: u64,
    },

    #[error("{name} window is empty")]
    EmptyRegion { name: &'static str },

    #[error("{name} window 0x{base:x}+0x{len:x} wraps the address space")]
    RegionWraps {
        name: &'static str,
        base: u64,
        len: u64,
    },

    #[error("{a} and {b} windows overlap")]
    Overlap { a: &'static str, b: &'static str },

    #[error("retry backoff must be non-zero")]
    ZeroBackoff,

    #[error("failed to read {path}: {message}")]
    Io { path: String, message: String },

    #[error("invalid configuration JSON: {0}")]
    Parse(String),
}

/// Why a session could not be brought up.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BringUpError {
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error(transparent)]
    Endpoint(#[from] EndpointError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    /// A hardware cursor did not move before the deadline.
    #[error("{cursor} stuck at {last} after {waited:?}")]
    Timeout {
        cursor: Reg,
        last: u32,
        waited: Duration,
    },

    /// Submitting would overwrite a slot whose completion has not been released.
    #[error(
        "submission stalled at slot {slot}: sq_head={sq_head}, {outstanding} outstanding of {budget}"
    )]
    Stall {
        slot: u32,
        sq_head: u32,
        outstanding: u32,
        budget: u32,
    },

    #[error(
        "destination mismatch for request 0x{id:08x} at offset 0x{offset:x}: expected 0x{expected:02x}, found 0x{actual:02x}"
    )]
    DataMismatch {
        id: u32,
        offset: u64,
        expected: u8,
        actual: u8,
    },

    #[error("bring-up failed: {0}")]
    ConfigurationFailure(#[from] BringUpError),

    #[error("{side} range 0x{addr:x}+0x{len:x} is outside 0x{:x}+0x{:x}", .region.base, .region.len)]
    OutOfBounds {
        side: BufferSide,
        addr: u64,
        len: u64,
        region: Region,
    },

    #[error("{op} is not valid in state {state:?}")]
    InvalidState {
        op: &'static str,
        state: ControllerState,
    },

    #[error(transparent)]
    InvalidConfig(#[from] ConfigError),

    /// The engine reported a non-zero completion status. The code is not interpreted.
    #[error("request 0x{id:08x} in slot {slot} failed with hardware status 0x{status:02x}")]
    Hardware { slot: u32, id: u32, status: u8 },

    #[error("completion in slot {slot} echoes id 0x{actual:08x}, submitted 0x{expected:08x}")]
    IdMismatch { slot: u32, expected: u32, actual: u32 },

    #[error("completion in CQ slot {cq_slot} (id 0x{original_id:08x}) arrived with nothing in flight")]
    UnexpectedCompletion { cq_slot: u32, original_id: u32 },

    #[error("request 0x{id:08x} moved {sent} of {requested} bytes")]
    ShortTransfer { id: u32, requested: u64, sent: u64 },

    #[error("cannot acknowledge up to {requested}: head={head}, last observed tail={observed_tail}")]
    InvalidAcknowledge {
        requested: u32,
        head: u32,
        observed_tail: u32,
    },

    #[error("{reg} reads {value}, outside ring of {capacity}")]
    CursorOutOfRange { reg: Reg, value: u32, capacity: u32 },

    #[error(transparent)]
    Memory(#[from] MemoryFault),

    #[error("session was aborted by an earlier failure")]
    SessionAborted,
}

impl QueueError {
    /// Failures after which the session must not issue further work.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            QueueError::Stall { .. }
                | QueueError::DataMismatch { .. }
                | QueueError::IdMismatch { .. }
                | QueueError::UnexpectedCompletion { .. }
                | QueueError::CursorOutOfRange { .. }
        )
    }
}
