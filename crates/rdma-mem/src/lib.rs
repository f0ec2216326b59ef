//! Physical memory for the RDMA data mover workspace.
//!
//! - [`PhysicalMemory`]: DDR as the bus sees it (what the DMA engine reads and writes).
//! - [`DataCache`]: the CPU's write-back, non-coherent view in front of it.
//! - [`Region`]: a contiguous physical window (ring buffers, payload, remote buffer).

mod cache;
mod phys;
mod region;

pub use cache::{CacheMode, CacheStats, DataCache, CACHE_LINE_SIZE};
pub use phys::{DenseMemory, PhysMemoryError, PhysMemoryResult, PhysicalMemory, SparseMemory};
pub use region::Region;
