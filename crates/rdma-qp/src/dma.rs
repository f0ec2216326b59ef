use thiserror::Error;

use rdma_mem::PhysMemoryError;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemoryFault {
    #[error("access outside mapped DDR: addr=0x{addr:x} len={len}")]
    Unmapped { addr: u64, len: usize },
    #[error(transparent)]
    Phys(#[from] PhysMemoryError),
}

/// Ordering point requested from the memory system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Barrier {
    /// Prior stores (including cache maintenance) complete before later stores, e.g. the
    /// doorbell write.
    Store,
    /// Later loads are not satisfied before prior loads, e.g. cursor reads.
    Load,
    Full,
}

/// The CPU's view of DDR shared with a non-coherent DMA engine.
///
/// `read`/`write` go through the data cache. The maintenance operations work on whole cache
/// lines; implementations widen the range as needed.
pub trait DmaMemory {
    fn read(&mut self, addr: u64, dst: &mut [u8]) -> Result<(), MemoryFault>;

    fn write(&mut self, addr: u64, src: &[u8]) -> Result<(), MemoryFault>;

    /// Clean and invalidate: dirty lines reach DDR, then are dropped.
    fn flush_range(&mut self, addr: u64, len: u64) -> Result<(), MemoryFault>;

    /// Drop lines so the next read observes DDR.
    fn invalidate_range(&mut self, addr: u64, len: u64) -> Result<(), MemoryFault>;

    fn barrier(&mut self, kind: Barrier);

    fn fill(&mut self, addr: u64, len: u64, byte: u8) -> Result<(), MemoryFault> {
        const CHUNK: usize = 4096;
        let buf = [byte; CHUNK];
        let mut cur = addr;
        let mut remaining = len;
        while remaining > 0 {
            let take = remaining.min(CHUNK as u64) as usize;
            self.write(cur, &buf[..take])?;
            cur += take as u64;
            remaining -= take as u64;
        }
        Ok(())
    }
}

impl<T: DmaMemory + ?Sized> DmaMemory for &mut T {
    fn read(&mut self, addr: u64, dst: &mut [u8]) -> Result<(), MemoryFault> {
        (**self).read(addr, dst)
    }

    fn write(&mut self, addr: u64, src: &[u8]) -> Result<(), MemoryFault> {
        (**self).write(addr, src)
    }

    fn flush_range(&mut self, addr: u64, len: u64) -> Result<(), MemoryFault> {
        (**self).flush_range(addr, len)
    }

    fn invalidate_range(&mut self, addr: u64, len: u64) -> Result<(), MemoryFault> {
        (**self).invalidate_range(addr, len)
    }

    fn barrier(&mut self, kind: Barrier) {
        (**self).barrier(kind)
    }
}
