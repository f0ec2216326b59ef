use thiserror::Error;

/// Errors returned by [`PhysicalMemory`] backends.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PhysMemoryError {
    /// The requested address range is outside the physical address space.
    #[error("physical memory access out of range: paddr=0x{paddr:x} len={len} size=0x{size:x}")]
    OutOfRange { paddr: u64, len: usize, size: u64 },
    /// The requested size cannot be represented by the current platform's `usize`.
    #[error("physical memory size {size} does not fit in usize")]
    SizeTooLarge { size: u64 },
    /// The chosen chunk size is invalid (zero or not a power of two).
    #[error("invalid physical memory chunk size {chunk_size}")]
    InvalidChunkSize { chunk_size: usize },
}

pub type PhysMemoryResult<T> = Result<T, PhysMemoryError>;

/// DDR as seen from the bus: no cache, every access reaches the backing store.
///
/// Both the DMA engine and the CPU's cache fills/write-backs go through this trait.
pub trait PhysicalMemory {
    fn size(&self) -> u64;

    fn read_into(&self, paddr: u64, dst: &mut [u8]) -> PhysMemoryResult<()>;

    fn write_from(&mut self, paddr: u64, src: &[u8]) -> PhysMemoryResult<()>;

    fn read_u32_le(&self, paddr: u64) -> PhysMemoryResult<u32> {
        let mut buf = [0u8; 4];
        self.read_into(paddr, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn read_u64_le(&self, paddr: u64) -> PhysMemoryResult<u64> {
        let mut buf = [0u8; 8];
        self.read_into(paddr, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn write_u32_le(&mut self, paddr: u64, value: u32) -> PhysMemoryResult<()> {
        self.write_from(paddr, &value.to_le_bytes())
    }

    fn write_u64_le(&mut self, paddr: u64, value: u64) -> PhysMemoryResult<()> {
        self.write_from(paddr, &value.to_le_bytes())
    }

    /// Copies `len` bytes inside the address space, as a DMA engine would.
    fn copy_within(&mut self, src: u64, dst: u64, len: usize) -> PhysMemoryResult<()> {
        let mut bounce = vec![0u8; len];
        self.read_into(src, &mut bounce)?;
        self.write_from(dst, &bounce)
    }
}

pub(crate) fn check_range(size: u64, paddr: u64, len: usize) -> PhysMemoryResult<()> {
    let end = paddr
        .checked_add(len as u64)
        .ok_or(PhysMemoryError::OutOfRange { paddr, len, size })?;
    if end > size {
        return Err(PhysMemoryError::OutOfRange { paddr, len, size });
    }
    Ok(())
}

/// Dense (contiguous) physical memory. Only practical for small address spaces.
#[derive(Debug, Clone)]
pub struct DenseMemory {
    data: Box<[u8]>,
}

impl DenseMemory {
    pub fn new(size: u64) -> PhysMemoryResult<Self> {
        let size_usize =
            usize::try_from(size).map_err(|_| PhysMemoryError::SizeTooLarge { size })?;
        Ok(Self {
            data: vec![0u8; size_usize].into_boxed_slice(),
        })
    }

    #[inline]
    fn range_to_usize(&self, paddr: u64, len: usize) -> PhysMemoryResult<(usize, usize)> {
        check_range(self.size(), paddr, len)?;
        // `check_range` guarantees `paddr + len <= data.len()`, which fits in usize.
        let start = paddr as usize;
        Ok((start, start + len))
    }
}

impl PhysicalMemory for DenseMemory {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_into(&self, paddr: u64, dst: &mut [u8]) -> PhysMemoryResult<()> {
        let (start, end) = self.range_to_usize(paddr, dst.len())?;
        dst.copy_from_slice(&self.data[start..end]);
        Ok(())
    }

    fn write_from(&mut self, paddr: u64, src: &[u8]) -> PhysMemoryResult<()> {
        let (start, end) = self.range_to_usize(paddr, src.len())?;
        self.data[start..end].copy_from_slice(src);
        Ok(())
    }

    fn copy_within(&mut self, src: u64, dst: u64, len: usize) -> PhysMemoryResult<()> {
        let (src_start, src_end) = self.range_to_usize(src, len)?;
        let (dst_start, _) = self.range_to_usize(dst, len)?;
        self.data.copy_within(src_start..src_end, dst_start);
        Ok(())
    }
}

/// Sparse physical memory backed by lazily-allocated fixed-size chunks.
///
/// The reference deployment places its rings and buffers at 0x1000_0000..0x4000_0000, so a
/// board model needs a 2 GiB address space of which only a few hundred KiB are ever touched.
/// Unallocated chunks read as zero.
#[derive(Debug, Clone)]
pub struct SparseMemory {
    size: u64,
    chunk_shift: u32,
    chunks: Vec<Option<Box<[u8]>>>,
}

impl SparseMemory {
    pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

    pub fn new(size: u64) -> PhysMemoryResult<Self> {
        Self::with_chunk_size(size, Self::DEFAULT_CHUNK_SIZE)
    }

    pub fn with_chunk_size(size: u64, chunk_size: usize) -> PhysMemoryResult<Self> {
        if chunk_size == 0 || !chunk_size.is_power_of_two() {
            return Err(PhysMemoryError::InvalidChunkSize { chunk_size });
        }
        let chunk_size_u64 = chunk_size as u64;
        let chunk_count_u64 = size
            .checked_add(chunk_size_u64 - 1)
            .ok_or(PhysMemoryError::SizeTooLarge { size })?
            / chunk_size_u64;
        let chunk_count = usize::try_from(chunk_count_u64)
            .map_err(|_| PhysMemoryError::SizeTooLarge { size })?;
        Ok(Self {
            size,
            chunk_shift: chunk_size.trailing_zeros(),
            chunks: vec![None; chunk_count],
        })
    }

    fn chunk_size(&self) -> usize {
        1usize << self.chunk_shift
    }

    /// Number of chunks that have been materialized by writes.
    pub fn allocated_chunks(&self) -> usize {
        self.chunks.iter().filter(|c| c.is_some()).count()
    }

    #[inline]
    fn chunk_index(&self, paddr: u64) -> (usize, usize) {
        let chunk = (paddr >> self.chunk_shift) as usize;
        let offset = (paddr & (self.chunk_size() as u64 - 1)) as usize;
        (chunk, offset)
    }

    fn ensure_chunk(&mut self, chunk: usize) -> PhysMemoryResult<&mut [u8]> {
        let chunk_size = self.chunk_size();
        let size = self.size;
        let slot = self
            .chunks
            .get_mut(chunk)
            .ok_or(PhysMemoryError::OutOfRange {
                paddr: (chunk as u64) * (chunk_size as u64),
                len: 1,
                size,
            })?;
        Ok(slot.get_or_insert_with(|| vec![0u8; chunk_size].into_boxed_slice()))
    }
}

impl PhysicalMemory for SparseMemory {
    fn size(&self) -> u64 {
        self.size
    }

    fn read_into(&self, paddr: u64, dst: &mut [u8]) -> PhysMemoryResult<()> {
        check_range(self.size, paddr, dst.len())?;
        let mut remaining = dst;
        let mut cur = paddr;

        while !remaining.is_empty() {
            let (chunk_idx, chunk_off) = self.chunk_index(cur);
            let take = (self.chunk_size() - chunk_off).min(remaining.len());

            match self.chunks.get(chunk_idx).and_then(|c| c.as_ref()) {
                Some(chunk) => {
                    remaining[..take].copy_from_slice(&chunk[chunk_off..chunk_off + take])
                }
                None => remaining[..take].fill(0),
            }

            cur += take as u64;
            remaining = &mut remaining[take..];
        }

        Ok(())
    }

    fn write_from(&mut self, paddr: u64, src: &[u8]) -> PhysMemoryResult<()> {
        check_range(self.size, paddr, src.len())?;
        let mut remaining = src;
        let mut cur = paddr;

        while !remaining.is_empty() {
            let (chunk_idx, chunk_off) = self.chunk_index(cur);
            let take = (self.chunk_size() - chunk_off).min(remaining.len());

            let chunk = self.ensure_chunk(chunk_idx)?;
            chunk[chunk_off..chunk_off + take].copy_from_slice(&remaining[..take]);

            cur += take as u64;
            remaining = &remaining[take..];
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dense_read_write_primitives() {
        let mut mem = DenseMemory::new(64).unwrap();

        mem.write_u32_le(4, 0x3344_5566).unwrap();
        mem.write_u64_le(9, 0x7788_99aa_bbcc_ddee).unwrap();

        assert_eq!(mem.read_u32_le(4).unwrap(), 0x3344_5566);
        assert_eq!(mem.read_u64_le(9).unwrap(), 0x7788_99aa_bbcc_ddee);
    }

    #[test]
    fn dense_copy_within_handles_overlap() {
        let mut mem = DenseMemory::new(16).unwrap();
        mem.write_from(0, &[1, 2, 3, 4, 5, 6]).unwrap();
        mem.copy_within(0, 2, 6).unwrap();

        let mut out = [0u8; 8];
        mem.read_into(0, &mut out).unwrap();
        assert_eq!(out, [1, 2, 1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn sparse_unallocated_reads_return_zero() {
        let mem = SparseMemory::with_chunk_size(128, 16).unwrap();
        assert_eq!(mem.read_u32_le(4).unwrap(), 0);
        assert_eq!(mem.read_u64_le(8).unwrap(), 0);
        assert_eq!(mem.allocated_chunks(), 0);
    }

    #[test]
    fn sparse_bulk_read_write_cross_chunk_boundary() {
        let mut mem = SparseMemory::with_chunk_size(64, 16).unwrap();

        // 8 bytes starting at 12 straddle chunks 0 and 1.
        let src = [1u8, 2, 3, 4, 5, 6, 7, 8];
        mem.write_from(12, &src).unwrap();

        let mut dst = [0u8; 8];
        mem.read_into(12, &mut dst).unwrap();
        assert_eq!(dst, src);
        assert_eq!(mem.allocated_chunks(), 2);
    }

    #[test]
    fn sparse_covers_reference_deployment_addresses() {
        let mut mem = SparseMemory::new(0x8000_0000).unwrap();
        mem.write_u32_le(0x4000_0000, 0xdead_beef).unwrap();
        mem.write_u32_le(0x1000_0000, 0x0001_0001).unwrap();

        assert_eq!(mem.read_u32_le(0x4000_0000).unwrap(), 0xdead_beef);
        assert_eq!(mem.read_u32_le(0x1000_0000).unwrap(), 0x0001_0001);
        assert_eq!(mem.allocated_chunks(), 2);
    }

    #[test]
    fn sparse_rejects_non_power_of_two_chunks() {
        assert_eq!(
            SparseMemory::with_chunk_size(64, 24).unwrap_err(),
            PhysMemoryError::InvalidChunkSize { chunk_size: 24 }
        );
    }

    #[test]
    fn out_of_range_returns_error_without_panicking() {
        let mut dense = DenseMemory::new(16).unwrap();
        assert!(matches!(
            dense.read_u32_le(14),
            Err(PhysMemoryError::OutOfRange { .. })
        ));
        assert!(matches!(
            dense.write_u64_le(12, 0),
            Err(PhysMemoryError::OutOfRange { .. })
        ));

        let sparse = SparseMemory::with_chunk_size(16, 8).unwrap();
        assert!(matches!(
            sparse.read_into(u64::MAX - 1, &mut [0u8; 2]),
            Err(PhysMemoryError::OutOfRange { .. })
        ));
    }
}
