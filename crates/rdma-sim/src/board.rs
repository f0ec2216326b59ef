use rdma_mem::{CacheMode, DataCache, PhysMemoryError, Region, SparseMemory};
use rdma_qp::{Barrier, DmaMemory, MemoryFault, QueuePairConfig, Reg, RegisterIo};
use thiserror::Error;

use crate::engine::DataMoverEngine;

const DDR_GRANULE: u64 = 1 << 20;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SimError {
    #[error("DDR backing: {0}")]
    Memory(#[from] PhysMemoryError),
    #[error("configured windows extend past the 64-bit address space")]
    AddressSpace,
}

/// Bus traffic seen by the board, in program order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusEvent {
    RegRead(Reg, u32),
    RegWrite(Reg, u32),
    Flush { addr: u64, len: u64 },
    Invalidate { addr: u64, len: u64 },
    Barrier(Barrier),
}

/// Host stand-in for the board: sparse DDR, a write-back CPU cache in front of it and the
/// data mover behind the register block.
///
/// Every register read lets the engine take one step first, so polling loops observe progress
/// the way they would on silicon. The engine always works on DDR directly; only
/// [`DmaMemory`] accesses go through the cache.
pub struct SimBoard {
    ddr: SparseMemory,
    cache: DataCache,
    engine: DataMoverEngine,
    trace: Option<Vec<BusEvent>>,
    last_bus_error: Option<PhysMemoryError>,
}

impl SimBoard {
    pub fn new(ddr_size: u64, cache_mode: CacheMode) -> Result<Self, SimError> {
        Ok(Self {
            ddr: SparseMemory::new(ddr_size)?,
            cache: DataCache::new(cache_mode),
            engine: DataMoverEngine::new(),
            trace: None,
            last_bus_error: None,
        })
    }

    /// A board with enough DDR to back every ring and buffer window in `config`.
    pub fn for_config(config: &QueuePairConfig, cache_mode: CacheMode) -> Result<Self, SimError> {
        let windows = [
            config.sq_ring().region(),
            config.cq_ring().region(),
            config.payload,
            config.remote,
        ];
        let mut top = 0u64;
        for w in windows {
            top = top.max(w.end().ok_or(SimError::AddressSpace)?);
        }
        let size = top
            .checked_next_multiple_of(DDR_GRANULE)
            .ok_or(SimError::AddressSpace)?;
        Self::new(size, cache_mode)
    }

    pub fn engine(&self) -> &DataMoverEngine {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut DataMoverEngine {
        &mut self.engine
    }

    pub fn cache(&self) -> &DataCache {
        &self.cache
    }

    /// Maps `region` non-cacheable for the CPU.
    pub fn mark_uncached(&mut self, region: Region) {
        self.cache.mark_uncached(region);
    }

    /// DDR contents as the engine sees them.
    pub fn ddr(&self) -> &SparseMemory {
        &self.ddr
    }

    pub fn ddr_mut(&mut self) -> &mut SparseMemory {
        &mut self.ddr
    }

    /// Starts recording [`BusEvent`]s, discarding anything recorded before.
    pub fn start_trace(&mut self) {
        self.trace = Some(Vec::new());
    }

    pub fn take_trace(&mut self) -> Vec<BusEvent> {
        self.trace.take().unwrap_or_default()
    }

    /// The last DDR error the engine hit while fetching or posting ring entries.
    pub fn last_bus_error(&self) -> Option<&PhysMemoryError> {
        self.last_bus_error.as_ref()
    }

    fn record(&mut self, event: BusEvent) {
        if let Some(trace) = &mut self.trace {
            trace.push(event);
        }
    }

    fn step_engine(&mut self) {
        if let Err(err) = self.engine.tick(&mut self.ddr) {
            tracing::error!(error = %err, "engine bus error");
            self.last_bus_error = Some(err);
        }
    }
}

impl RegisterIo for SimBoard {
    fn read32(&mut self, reg: Reg) -> u32 {
        self.step_engine();
        let value = self.engine.mmio_read(reg.offset());
        self.record(BusEvent::RegRead(reg, value));
        value
    }

    fn write32(&mut self, reg: Reg, value: u32) {
        self.record(BusEvent::RegWrite(reg, value));
        self.engine.mmio_write(reg.offset(), value);
    }
}

impl DmaMemory for SimBoard {
    fn read(&mut self, addr: u64, dst: &mut [u8]) -> Result<(), MemoryFault> {
        self.cache.read(&self.ddr, addr, dst)?;
        Ok(())
    }

    fn write(&mut self, addr: u64, src: &[u8]) -> Result<(), MemoryFault> {
        self.cache.write(&mut self.ddr, addr, src)?;
        Ok(())
    }

    fn flush_range(&mut self, addr: u64, len: u64) -> Result<(), MemoryFault> {
        self.record(BusEvent::Flush { addr, len });
        self.cache.flush_range(&mut self.ddr, addr, len)?;
        Ok(())
    }

    fn invalidate_range(&mut self, addr: u64, len: u64) -> Result<(), MemoryFault> {
        self.record(BusEvent::Invalidate { addr, len });
        self.cache.invalidate_range(&mut self.ddr, addr, len)?;
        Ok(())
    }

    fn barrier(&mut self, kind: Barrier) {
        self.record(BusEvent::Barrier(kind));
    }
}
