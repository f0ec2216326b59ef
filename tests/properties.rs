mod harness;

use harness::{config, controller, pattern, session};
use proptest::prelude::*;
use rdma_mem::PhysicalMemory;
use rdma_qp::{Reg, RegisterIo, SubmitEntry};

#[derive(Debug, Clone)]
struct Transfer {
    id: u32,
    src: u64,
    dst: u64,
    len: u64,
    seed: u8,
}

prop_compose! {
    fn arb_transfer()(
        id in any::<u32>(),
        src in 0u64..(64 << 10),
        dst in 0u64..(64 << 10),
        len in 1u64..=8192,
        seed in any::<u8>(),
    ) -> Transfer {
        Transfer { id, src, dst, len, seed }
    }
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 48, .. ProptestConfig::default() })]

    #[test]
    fn completions_echo_ids_and_destination_matches_source(
        transfers in prop::collection::vec(arb_transfer(), 1..12)
    ) {
        let cfg = config();
        let remote = cfg.remote.base;
        let mut s = session(cfg);
        for t in &transfers {
            let data = pattern(t.len as usize, t.seed);
            s.stage_payload(t.src, &data).unwrap();
            let report = s.write(t.id, t.src, t.dst, t.len).unwrap();
            prop_assert_eq!(report.id, t.id);
            prop_assert_eq!(report.bytes, t.len);

            let mut landed = vec![0u8; t.len as usize];
            s.controller().hardware().ddr().read_into(remote + t.dst, &mut landed).unwrap();
            prop_assert_eq!(landed, data);
        }
    }

    #[test]
    fn cursors_advance_by_one_modulo_capacity(
        capacity_log2 in 1u32..=5,
        count in 1usize..40,
    ) {
        let mut cfg = config();
        let capacity = 1u32 << capacity_log2;
        cfg.sq.capacity = capacity;
        cfg.cq.capacity = capacity;
        let mut s = session(cfg);
        for i in 0..count {
            let before = s.controller().sq_tail();
            let report = s.write(i as u32, 0, 0, 32).unwrap();
            prop_assert_eq!(report.slot, before);
            prop_assert_eq!(s.controller().sq_tail(), (before + 1) % capacity);
            prop_assert_eq!(s.controller().cq_head(), s.controller().sq_tail());
            prop_assert_eq!(s.controller().outstanding(), 0);
        }
    }

    #[test]
    fn acknowledging_the_current_head_again_is_a_no_op(
        rounds in 1usize..8,
        repeats in 1usize..4,
    ) {
        let cfg = config();
        let (payload, remote) = (cfg.payload.base, cfg.remote.base);
        let mut qp = controller(cfg.clone());
        for i in 0..rounds {
            let ticket = qp.submit(&SubmitEntry::write(i as u32, payload, remote, 16)).unwrap();
            let batch = qp
                .wait_for_completion(ticket.cq_tail_before, cfg.poll.completion_timeout())
                .unwrap();
            qp.acknowledge(batch.new_tail).unwrap();

            let head = qp.cq_head();
            let state = qp.state();
            qp.hardware_mut().start_trace();
            for _ in 0..repeats {
                qp.acknowledge(batch.new_tail).unwrap();
            }
            prop_assert!(qp.hardware_mut().take_trace().is_empty());
            prop_assert_eq!(qp.cq_head(), head);
            prop_assert_eq!(qp.state(), state);
            prop_assert_eq!(qp.hardware_mut().read32(Reg::CqHead), head);
        }
    }
}
