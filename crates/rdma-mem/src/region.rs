/// A physically contiguous window `[base, base + len)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Region {
    pub base: u64,
    pub len: u64,
}

impl Region {
    pub const fn new(base: u64, len: u64) -> Self {
        Self { base, len }
    }

    /// One past the last byte, or `None` if the window wraps the address space.
    pub fn end(&self) -> Option<u64> {
        self.base.checked_add(self.len)
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns true if `[addr, addr + len)` lies entirely inside this window.
    ///
    /// Zero-length ranges are contained when `addr` is inside the window or at its end.
    pub fn contains(&self, addr: u64, len: u64) -> bool {
        let (Some(end), Some(range_end)) = (self.end(), addr.checked_add(len)) else {
            return false;
        };
        addr >= self.base && range_end <= end
    }

    pub fn overlaps(&self, other: &Region) -> bool {
        if self.is_empty() || other.is_empty() {
            return false;
        }
        let a_end = self.end().unwrap_or(u64::MAX);
        let b_end = other.end().unwrap_or(u64::MAX);
        self.base < b_end && other.base < a_end
    }

    /// Byte offset of `addr` from the start of the window.
    pub fn offset_of(&self, addr: u64) -> Option<u64> {
        if self.contains(addr, 0) {
            Some(addr - self.base)
        } else {
            None
        }
    }

    /// Widens the window outwards to multiples of `align` (a power of two).
    pub fn align_outward(&self, align: u64) -> Region {
        debug_assert!(align.is_power_of_two());
        let start = self.base & !(align - 1);
        let end = self.end().unwrap_or(u64::MAX);
        let end = end.checked_add(align - 1).map_or(u64::MAX & !(align - 1), |e| e & !(align - 1));
        Region::new(start, end - start)
    }
}
