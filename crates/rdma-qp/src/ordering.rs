//! Cache maintenance around hand-offs between the CPU and the engine.
//!
//! The engine does not snoop the CPU's data cache, so every buffer crosses the boundary
//! through one of these two helpers:
//!
//! - [`publish`]: CPU-written bytes (descriptors, payload) are cleaned to DDR, then a store
//!   barrier orders them before the doorbell.
//! - [`acquire`]: after a cursor read shows the engine wrote something, a load barrier is
//!   issued and the lines are invalidated so the next read goes to DDR.

use rdma_mem::{Region, CACHE_LINE_SIZE};

use crate::dma::{Barrier, DmaMemory, MemoryFault};

pub fn line_span(addr: u64, len: u64) -> Region {
    Region::new(addr, len).align_outward(CACHE_LINE_SIZE)
}

pub fn publish<M: DmaMemory + ?Sized>(mem: &mut M, addr: u64, len: u64) -> Result<(), MemoryFault> {
    if len == 0 {
        return Ok(());
    }
    let span = line_span(addr, len);
    mem.flush_range(span.base, span.len)?;
    mem.barrier(Barrier::Store);
    Ok(())
}

pub fn acquire<M: DmaMemory + ?Sized>(mem: &mut M, addr: u64, len: u64) -> Result<(), MemoryFault> {
    if len == 0 {
        return Ok(());
    }
    mem.barrier(Barrier::Load);
    let span = line_span(addr, len);
    mem.invalidate_range(span.base, span.len)
}
