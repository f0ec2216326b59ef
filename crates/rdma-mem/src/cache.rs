//! Model of a write-back, non-coherent CPU data cache in front of DDR.
//!
//! The data mover reads and writes DDR directly and never snoops the CPU cache. This model
//! reproduces the consequences on a host:
//!
//! - CPU stores land in cache lines and only reach DDR on [`DataCache::flush_range`].
//! - CPU loads hit whatever line is resident, even if the engine rewrote DDR underneath it,
//!   until the line is dropped with [`DataCache::invalidate_range`].
//!
//! There is no capacity limit and no eviction: a line stays resident (and stale) until it is
//! explicitly maintained, which is the worst case the driver has to be correct against.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

use crate::phys::{PhysMemoryResult, PhysicalMemory};
use crate::region::Region;

/// Cortex-A53 data cache line size.
pub const CACHE_LINE_SIZE: u64 = 64;

const LINE_MASK: u64 = CACHE_LINE_SIZE - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum CacheMode {
    /// Write-allocate, write-back. The configuration the TX benchmark ran with.
    #[default]
    WriteBack,
    /// D-cache disabled: every access goes straight to DDR (the RX bring-up program's setup).
    Disabled,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Dirty lines written back to DDR by a flush or an edge-line clean.
    pub writebacks: u64,
    /// Lines dropped by flush or invalidate.
    pub dropped: u64,
    /// Dirty lines discarded without write-back.
    pub discarded_dirty: u64,
}

#[derive(Debug, Clone)]
struct Line {
    data: [u8; CACHE_LINE_SIZE as usize],
    dirty: bool,
}

#[derive(Debug, Clone, Default)]
pub struct DataCache {
    mode: CacheMode,
    lines: BTreeMap<u64, Line>,
    uncached: Vec<Region>,
    stats: CacheStats,
}

impl DataCache {
    pub fn new(mode: CacheMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    pub fn mode(&self) -> CacheMode {
        self.mode
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    /// Maps `region` non-cacheable. The window is widened to whole lines; any resident lines
    /// inside it are dropped without write-back.
    pub fn mark_uncached(&mut self, region: Region) {
        let region = region.align_outward(CACHE_LINE_SIZE);
        for addr in self.resident_in(region) {
            if self.lines.remove(&addr).is_some() {
                self.stats.dropped += 1;
            }
        }
        self.uncached.push(region);
    }

    pub fn is_resident(&self, paddr: u64) -> bool {
        self.lines.contains_key(&(paddr & !LINE_MASK))
    }

    pub fn dirty_lines(&self) -> usize {
        self.lines.values().filter(|l| l.dirty).count()
    }

    fn bypasses(&self, line_addr: u64) -> bool {
        self.mode == CacheMode::Disabled || self.uncached.iter().any(|r| r.contains(line_addr, 1))
    }

    fn line_mut(
        &mut self,
        ddr: &dyn PhysicalMemory,
        line_addr: u64,
    ) -> PhysMemoryResult<&mut Line> {
        match self.lines.entry(line_addr) {
            Entry::Occupied(line) => {
                self.stats.hits += 1;
                Ok(line.into_mut())
            }
            Entry::Vacant(slot) => {
                self.stats.misses += 1;
                let mut data = [0u8; CACHE_LINE_SIZE as usize];
                ddr.read_into(line_addr, &mut data)?;
                Ok(slot.insert(Line { data, dirty: false }))
            }
        }
    }

    /// CPU load.
    pub fn read(
        &mut self,
        ddr: &dyn PhysicalMemory,
        paddr: u64,
        dst: &mut [u8],
    ) -> PhysMemoryResult<()> {
        let mut cur = paddr;
        let mut remaining = dst;
        while !remaining.is_empty() {
            let line_addr = cur & !LINE_MASK;
            let off = (cur - line_addr) as usize;
            let take = (CACHE_LINE_SIZE as usize - off).min(remaining.len());
            if self.bypasses(line_addr) {
                ddr.read_into(cur, &mut remaining[..take])?;
            } else {
                let line = self.line_mut(ddr, line_addr)?;
                remaining[..take].copy_from_slice(&line.data[off..off + take]);
            }
            cur += take as u64;
            remaining = &mut remaining[take..];
        }
        Ok(())
    }

    /// CPU store.
    pub fn write(
        &mut self,
        ddr: &mut dyn PhysicalMemory,
        paddr: u64,
        src: &[u8],
    ) -> PhysMemoryResult<()> {
        let mut cur = paddr;
        let mut remaining = src;
        while !remaining.is_empty() {
            let line_addr = cur & !LINE_MASK;
            let off = (cur - line_addr) as usize;
            let take = (CACHE_LINE_SIZE as usize - off).min(remaining.len());
            if self.bypasses(line_addr) {
                ddr.write_from(cur, &remaining[..take])?;
            } else {
                let line = self.line_mut(ddr, line_addr)?;
                line.data[off..off + take].copy_from_slice(&remaining[..take]);
                line.dirty = true;
            }
            cur += take as u64;
            remaining = &remaining[take..];
        }
        Ok(())
    }

    /// Clean and invalidate (`DC CIVAC`) every line touching `[paddr, paddr + len)`.
    pub fn flush_range(
        &mut self,
        ddr: &mut dyn PhysicalMemory,
        paddr: u64,
        len: u64,
    ) -> PhysMemoryResult<()> {
        let span = Region::new(paddr, len).align_outward(CACHE_LINE_SIZE);
        let addrs = self.resident_in(span);
        for addr in addrs {
            if let Some(line) = self.lines.remove(&addr) {
                if line.dirty {
                    ddr.write_from(addr, &line.data)?;
                    self.stats.writebacks += 1;
                }
                self.stats.dropped += 1;
            }
        }
        tracing::trace!(paddr, len, "dcache flush");
        Ok(())
    }

    /// Invalidate (`DC IVAC`) every line touching `[paddr, paddr + len)`.
    ///
    /// Lines only partially covered by the range are cleaned first so that neighbouring data
    /// sharing the line is not lost; fully covered dirty lines are discarded.
    pub fn invalidate_range(
        &mut self,
        ddr: &mut dyn PhysicalMemory,
        paddr: u64,
        len: u64,
    ) -> PhysMemoryResult<()> {
        let exact = Region::new(paddr, len);
        let span = exact.align_outward(CACHE_LINE_SIZE);
        for addr in self.resident_in(span) {
            let partial = !exact.contains(addr, CACHE_LINE_SIZE);
            if let Some(line) = self.lines.remove(&addr) {
                if line.dirty {
                    if partial {
                        ddr.write_from(addr, &line.data)?;
                        self.stats.writebacks += 1;
                    } else {
                        self.stats.discarded_dirty += 1;
                    }
                }
                self.stats.dropped += 1;
            }
        }
        tracing::trace!(paddr, len, "dcache invalidate");
        Ok(())
    }

    /// Writes back every dirty line and empties the cache.
    pub fn flush_all(&mut self, ddr: &mut dyn PhysicalMemory) -> PhysMemoryResult<()> {
        let lines = std::mem::take(&mut self.lines);
        for (addr, line) in lines {
            if line.dirty {
                ddr.write_from(addr, &line.data)?;
                self.stats.writebacks += 1;
            }
            self.stats.dropped += 1;
        }
        Ok(())
    }

    fn resident_in(&self, span: Region) -> Vec<u64> {
        let end = span.end().unwrap_or(u64::MAX);
        self.lines.range(span.base..end).map(|(a, _)| *a).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phys::DenseMemory;

    fn ddr() -> DenseMemory {
        DenseMemory::new(0x1000).unwrap()
    }

    #[test]
    fn stores_stay_in_cache_until_flushed() {
        let mut ddr = ddr();
        let mut cache = DataCache::new(CacheMode::WriteBack);

        cache.write(&mut ddr, 0x100, &[0xaa; 8]).unwrap();
        assert_eq!(ddr.read_u32_le(0x100).unwrap(), 0);

        cache.flush_range(&mut ddr, 0x100, 8).unwrap();
        assert_eq!(ddr.read_u32_le(0x100).unwrap(), 0xaaaa_aaaa);
        assert!(!cache.is_resident(0x100));
        assert_eq!(cache.stats().writebacks, 1);
    }

    #[test]
    fn resident_line_hides_device_writes_until_invalidated() {
        let mut ddr = ddr();
        let mut cache = DataCache::new(CacheMode::WriteBack);

        let mut buf = [0u8; 4];
        cache.read(&ddr, 0x200, &mut buf).unwrap();
        assert_eq!(buf, [0; 4]);

        // The "device" writes DDR directly.
        ddr.write_u32_le(0x200, 0x1234_5678).unwrap();

        cache.read(&ddr, 0x200, &mut buf).unwrap();
        assert_eq!(u32::from_le_bytes(buf), 0, "stale line must still be served");

        cache.invalidate_range(&mut ddr, 0x200, 4).unwrap();
        cache.read(&ddr, 0x200, &mut buf).unwrap();
        assert_eq!(u32::from_le_bytes(buf), 0x1234_5678);
    }

    #[test]
    fn invalidate_cleans_partially_covered_dirty_lines() {
        let mut ddr = ddr();
        let mut cache = DataCache::new(CacheMode::WriteBack);

        // Dirty the whole line at 0x300, then invalidate only its second half.
        cache.write(&mut ddr, 0x300, &[0x11; 64]).unwrap();
        cache.invalidate_range(&mut ddr, 0x320, 0x20).unwrap();

        assert_eq!(ddr.read_u32_le(0x300).unwrap(), 0x1111_1111);
        assert_eq!(cache.stats().discarded_dirty, 0);

        // A fully covered dirty line is discarded.
        cache.write(&mut ddr, 0x400, &[0x22; 64]).unwrap();
        cache.invalidate_range(&mut ddr, 0x400, 64).unwrap();
        assert_eq!(ddr.read_u32_le(0x400).unwrap(), 0);
        assert_eq!(cache.stats().discarded_dirty, 1);
    }

    #[test]
    fn uncached_regions_and_disabled_mode_bypass_lines() {
        let mut ddr = ddr();
        let mut cache = DataCache::new(CacheMode::WriteBack);
        cache.mark_uncached(Region::new(0x800, 0x100));

        cache.write(&mut ddr, 0x810, &[0x5a; 4]).unwrap();
        assert_eq!(ddr.read_u32_le(0x810).unwrap(), 0x5a5a_5a5a);
        assert!(!cache.is_resident(0x810));

        let mut off = DataCache::new(CacheMode::Disabled);
        off.write(&mut ddr, 0x10, &[1, 2, 3, 4]).unwrap();
        assert_eq!(ddr.read_u32_le(0x10).unwrap(), 0x0403_0201);
        assert_eq!(off.dirty_lines(), 0);
    }

    #[test]
    fn accesses_spanning_lines_touch_each_line() {
        let mut ddr = ddr();
        let mut cache = DataCache::new(CacheMode::WriteBack);

        cache.write(&mut ddr, 0x3c, &[7u8; 8]).unwrap();
        assert!(cache.is_resident(0x00) && cache.is_resident(0x40));
        assert_eq!(cache.dirty_lines(), 2);

        cache.flush_all(&mut ddr).unwrap();
        let mut out = [0u8; 8];
        ddr.read_into(0x3c, &mut out).unwrap();
        assert_eq!(out, [7u8; 8]);
    }
}
