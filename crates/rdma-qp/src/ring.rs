use rdma_mem::Region;

/// Geometry of one circular queue in DDR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ring {
    pub base: u64,
    pub capacity: u32,
    pub entry_size: u64,
}

impl Ring {
    pub const fn new(base: u64, capacity: u32, entry_size: u64) -> Self {
        Self {
            base,
            capacity,
            entry_size,
        }
    }

    pub fn region(&self) -> Region {
        Region::new(self.base, self.capacity as u64 * self.entry_size)
    }

    pub fn slot_addr(&self, slot: u32) -> u64 {
        self.base + (slot % self.capacity) as u64 * self.entry_size
    }

    pub fn advance(&self, cursor: u32, by: u32) -> u32 {
        ((cursor as u64 + by as u64) % self.capacity as u64) as u32
    }

    /// Number of slots from `from` forward to `to`.
    pub fn distance(&self, from: u32, to: u32) -> u32 {
        let cap = self.capacity;
        ((to % cap) + cap - (from % cap)) % cap
    }

    pub fn is_full(&self, head: u32, tail: u32) -> bool {
        self.advance(tail, 1) == head % self.capacity
    }

    /// Slots `from..to` in ring order.
    pub fn slots(&self, from: u32, to: u32) -> impl Iterator<Item = u32> + '_ {
        let n = self.distance(from, to);
        (0..n).map(move |i| self.advance(from, i))
    }

    /// Memory covered by slots `from..to`: one window, or two if the range wraps.
    pub fn spans(&self, from: u32, to: u32) -> Vec<Region> {
        let n = self.distance(from, to) as u64;
        if n == 0 {
            return Vec::new();
        }
        let first = (from % self.capacity) as u64;
        let until_end = self.capacity as u64 - first;
        if n <= until_end {
            vec![Region::new(self.slot_addr(from), n * self.entry_size)]
        } else {
            vec![
                Region::new(self.slot_addr(from), until_end * self.entry_size),
                Region::new(self.base, (n - until_end) * self.entry_size),
            ]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_and_empty() {
        let ring = Ring::new(0x1000_0000, 4, 64);
        assert!(!ring.is_full(0, 0));
        assert!(ring.is_full(0, 3));
        assert!(ring.is_full(2, 1));
        assert!(!ring.is_full(2, 0));
    }

    #[test]
    fn distance_wraps() {
        let ring = Ring::new(0, 4, 32);
        assert_eq!(ring.distance(3, 1), 2);
        assert_eq!(ring.distance(1, 1), 0);
        assert_eq!(ring.slots(3, 1).collect::<Vec<_>>(), vec![3, 0]);
    }

    #[test]
    fn spans_split_on_wrap() {
        let ring = Ring::new(0x4000_0000, 4, 32);
        assert_eq!(ring.spans(1, 3), vec![Region::new(0x4000_0020, 64)]);
        assert_eq!(
            ring.spans(3, 2),
            vec![
                Region::new(0x4000_0060, 32),
                Region::new(0x4000_0000, 64)
            ]
        );
        assert!(ring.spans(2, 2).is_empty());
    }
}
