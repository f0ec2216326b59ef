//! Host-side model of the board for exercising the `rdma-qp` driver without hardware.

mod board;
mod clock;
mod engine;
mod peripherals;

pub use board::{BusEvent, SimBoard, SimError};
pub use clock::SimClock;
pub use engine::{status, DataMoverEngine, EngineFault, EngineStats, EngineTiming};
pub use peripherals::{LinkBehaviour, SimBram, SimLink};
