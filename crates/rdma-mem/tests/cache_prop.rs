use proptest::prelude::*;
use rdma_mem::{CacheMode, DataCache, DenseMemory, PhysicalMemory, SparseMemory};

const SPACE: u64 = 4096;

#[derive(Debug, Clone)]
struct StoreOp {
    paddr: u64,
    data: Vec<u8>,
}

fn store_strategy() -> impl Strategy<Value = StoreOp> {
    (0u64..SPACE - 1).prop_flat_map(|paddr| {
        let max = (SPACE - paddr).min(200) as usize;
        prop::collection::vec(any::<u8>(), 1..=max).prop_map(move |data| StoreOp { paddr, data })
    })
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 64,
        .. ProptestConfig::default()
    })]

    #[test]
    fn cpu_view_matches_reference_and_flush_makes_ddr_agree(ops in prop::collection::vec(store_strategy(), 1..24)) {
        let mut ddr = DenseMemory::new(SPACE).unwrap();
        let mut cache = DataCache::new(CacheMode::WriteBack);
        let mut reference = vec![0u8; SPACE as usize];

        for op in &ops {
            cache.write(&mut ddr, op.paddr, &op.data).unwrap();
            let start = op.paddr as usize;
            reference[start..start + op.data.len()].copy_from_slice(&op.data);
        }

        let mut cpu_view = vec![0u8; SPACE as usize];
        cache.read(&ddr, 0, &mut cpu_view).unwrap();
        prop_assert_eq!(&cpu_view, &reference);

        cache.flush_range(&mut ddr, 0, SPACE).unwrap();
        let mut bus_view = vec![0u8; SPACE as usize];
        ddr.read_into(0, &mut bus_view).unwrap();
        prop_assert_eq!(&bus_view, &reference);
        prop_assert_eq!(cache.dirty_lines(), 0);
    }

    #[test]
    fn sparse_and_dense_agree(ops in prop::collection::vec(store_strategy(), 1..24)) {
        let mut dense = DenseMemory::new(SPACE).unwrap();
        let mut sparse = SparseMemory::with_chunk_size(SPACE, 256).unwrap();

        for op in &ops {
            dense.write_from(op.paddr, &op.data).unwrap();
            sparse.write_from(op.paddr, &op.data).unwrap();
        }

        let mut a = vec![0u8; SPACE as usize];
        let mut b = vec![0u8; SPACE as usize];
        dense.read_into(0, &mut a).unwrap();
        sparse.read_into(0, &mut b).unwrap();
        prop_assert_eq!(a, b);
    }
}
