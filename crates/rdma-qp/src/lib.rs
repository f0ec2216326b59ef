//! Driver for the data mover's submission/completion ring protocol.
//!
//! Software builds 64-byte descriptors in the SQ, cleans them to DDR and rings the doorbell by
//! writing SQ_TAIL. The engine drains descriptors (advancing SQ_HEAD), copies payload to the
//! destination and posts 32-byte records to the CQ (advancing CQ_TAIL). Software invalidates
//! and reads those records, checks the destination, and releases them by writing CQ_HEAD.
//!
//! Layers, bottom up:
//! - [`entry`]: descriptor and completion layouts.
//! - [`regs`], [`dma`]: register and memory access traits implemented by a board.
//! - [`QueuePairController`]: cursor bookkeeping and the register sequence.
//! - [`TransferSession`]: bring-up, retries, verification and abort policy.
//!
//! [`platform`] binds the traits to real hardware; the `rdma-sim` crate binds them to a model.

pub mod clock;
pub mod config;
pub mod controller;
pub mod dma;
pub mod endpoint;
pub mod entry;
pub mod error;
pub mod ordering;
pub mod platform;
pub mod regs;
pub mod ring;
pub mod session;
pub mod throughput;

pub use clock::{Clock, CounterClock, Deadline, StdClock};
pub use config::{PollPolicy, QueuePairConfig, RingConfig, CONFIG_ENV};
pub use controller::{
    Completion, CompletionBatch, CompletionPoll, ControllerState, Drained, QueuePairController,
    SubmitTicket,
};
pub use dma::{Barrier, DmaMemory, MemoryFault};
pub use endpoint::{
    endpoint_index, program_mac_pair, BramEndpointTable, EndpointEntry, EndpointError,
    EndpointTable, LinkError, LinkLayer, MacAddress, WordBus,
};
pub use entry::{CompletionEntry, Opcode, SubmitEntry};
pub use error::{BringUpError, BufferSide, ConfigError, QueueError, Result};
pub use regs::{CtrlFlags, Reg, RegisterIo};
pub use session::{BringUp, Endpoint, TransferReport, TransferSession};
pub use throughput::Throughput;
