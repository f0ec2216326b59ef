//! Behavioural model of the data mover.
//!
//! The model follows the ring protocol only; it says nothing about how the RTL is built.
//! - Writing CTRL.GLOBAL_ENABLE (0 -> 1) latches the ring bases and sizes and resets both
//!   hardware cursors.
//! - Each [`DataMoverEngine::tick`] consumes at most one descriptor between SQ_HEAD and SQ_TAIL
//!   (copying the payload straight in DDR) and then posts as many pending completions as the
//!   CQ has room for.
//! - A descriptor is only consumed when a CQ slot will be free for its completion, so an
//!   unacknowledged CQ holds SQ_HEAD back.

use std::collections::VecDeque;

use rdma_mem::{PhysMemoryResult, PhysicalMemory};
use rdma_qp::entry::{decode_submit, encode_completion, COMPLETION_ENTRY_SIZE, SUBMIT_ENTRY_SIZE};
use rdma_qp::{CompletionEntry, CtrlFlags, Opcode, Reg, SubmitEntry};

/// Status codes the model reports. The driver treats every non-zero value as opaque.
pub mod status {
    pub const SUCCESS: u8 = 0x00;
    pub const INVALID_OPCODE: u8 = 0x01;
    pub const DMA_ERROR: u8 = 0x02;
}

/// Latency in register reads (ticks).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EngineTiming {
    /// Ticks a descriptor sits in the SQ before it is consumed.
    pub polls_before_drain: u32,
    /// Ticks between consuming a descriptor and posting its completion.
    pub polls_before_complete: u32,
}

/// Misbehaviour injected into the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EngineFault {
    #[default]
    None,
    /// Never consumes descriptors.
    Hang,
    /// Ignores the SQ for this many ticks, then recovers.
    HangFor(u32),
    /// Consumes descriptors but never posts completions.
    DropCompletions,
    /// Skips the copy and completes with this status.
    FailStatus(u8),
    /// Flips the first destination byte after copying.
    CorruptCopy,
    /// Echoes a different `original_id`.
    WrongId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EngineStats {
    pub descriptors: u64,
    pub completions: u64,
    pub bytes_copied: u64,
    /// Ticks on which a descriptor was waiting but the CQ had no room.
    pub backpressure_ticks: u64,
}

#[derive(Debug, Clone, Copy)]
struct QueueState {
    base: u64,
    size: u32,
}

#[derive(Debug, Clone, Copy)]
struct PendingCompletion {
    entry: CompletionEntry,
    ready_in: u32,
}

pub struct DataMoverEngine {
    ctrl: u32,
    sq_base: u64,
    sq_size: u32,
    cq_base: u64,
    cq_size: u32,
    sq_tail: u32,
    cq_head: u32,

    sq: Option<QueueState>,
    cq: Option<QueueState>,
    sq_head: u32,
    cq_tail: u32,

    pending: VecDeque<PendingCompletion>,
    drain_wait: u32,
    timing: EngineTiming,
    fault: EngineFault,
    stats: EngineStats,
}

impl Default for DataMoverEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl DataMoverEngine {
    pub fn new() -> Self {
        Self {
            ctrl: 0,
            sq_base: 0,
            sq_size: 0,
            cq_base: 0,
            cq_size: 0,
            sq_tail: 0,
            cq_head: 0,
            sq: None,
            cq: None,
            sq_head: 0,
            cq_tail: 0,
            pending: VecDeque::new(),
            drain_wait: 0,
            timing: EngineTiming::default(),
            fault: EngineFault::None,
            stats: EngineStats::default(),
        }
    }

    pub fn set_timing(&mut self, timing: EngineTiming) {
        self.timing = timing;
        self.drain_wait = timing.polls_before_drain;
    }

    pub fn set_fault(&mut self, fault: EngineFault) {
        self.fault = fault;
    }

    pub fn fault(&self) -> EngineFault {
        self.fault
    }

    pub fn stats(&self) -> EngineStats {
        self.stats
    }

    pub fn is_enabled(&self) -> bool {
        CtrlFlags::from_bits_retain(self.ctrl).contains(CtrlFlags::GLOBAL_ENABLE)
    }

    pub fn mmio_read(&self, offset: u64) -> u32 {
        let Some(reg) = Reg::from_offset(offset) else {
            return 0;
        };
        match reg {
            Reg::Ctrl => self.ctrl,
            Reg::SqBaseLo => self.sq_base as u32,
            Reg::SqBaseHi => (self.sq_base >> 32) as u32,
            Reg::SqSize => self.sq_size,
            Reg::SqHead => self.sq_head,
            Reg::SqTail => self.sq_tail,
            Reg::CqBaseLo => self.cq_base as u32,
            Reg::CqBaseHi => (self.cq_base >> 32) as u32,
            Reg::CqSize => self.cq_size,
            Reg::CqHead => self.cq_head,
            Reg::CqTail => self.cq_tail,
            Reg::SqDoorbell | Reg::CqDoorbell => 0,
        }
    }

    pub fn mmio_write(&mut self, offset: u64, value: u32) {
        let Some(reg) = Reg::from_offset(offset) else {
            return;
        };
        match reg {
            Reg::Ctrl => {
                let was = self.is_enabled();
                self.ctrl = value;
                match (was, self.is_enabled()) {
                    (false, true) => self.enable(),
                    (true, false) => self.disable(),
                    _ => {}
                }
            }
            Reg::SqBaseLo => self.sq_base = (self.sq_base & !0xffff_ffff) | value as u64,
            Reg::SqBaseHi => self.sq_base = (self.sq_base & 0xffff_ffff) | (value as u64) << 32,
            Reg::SqSize => self.sq_size = value,
            Reg::SqTail => self.sq_tail = value,
            Reg::CqBaseLo => self.cq_base = (self.cq_base & !0xffff_ffff) | value as u64,
            Reg::CqBaseHi => self.cq_base = (self.cq_base & 0xffff_ffff) | (value as u64) << 32,
            Reg::CqSize => self.cq_size = value,
            Reg::CqHead => self.cq_head = value,
            Reg::SqHead | Reg::CqTail | Reg::SqDoorbell | Reg::CqDoorbell => {}
        }
    }

    fn enable(&mut self) {
        let valid = |size: u32| size >= 2 && size.is_power_of_two();
        if !valid(self.sq_size) || !valid(self.cq_size) {
            tracing::warn!(
                sq_size = self.sq_size,
                cq_size = self.cq_size,
                "engine enabled with invalid ring sizes; idling"
            );
            self.sq = None;
            self.cq = None;
            return;
        }
        self.sq = Some(QueueState {
            base: self.sq_base,
            size: self.sq_size,
        });
        self.cq = Some(QueueState {
            base: self.cq_base,
            size: self.cq_size,
        });
        self.sq_head = 0;
        self.cq_tail = 0;
        self.pending.clear();
        self.drain_wait = self.timing.polls_before_drain;
    }

    fn disable(&mut self) {
        self.sq = None;
        self.cq = None;
        self.pending.clear();
    }

    /// Advances the engine by one step. DDR errors while fetching a descriptor or posting a
    /// completion are bus errors and are returned; copy errors become a completion status.
    pub fn tick(&mut self, ddr: &mut dyn PhysicalMemory) -> PhysMemoryResult<()> {
        let (Some(sq), Some(cq)) = (self.sq, self.cq) else {
            return Ok(());
        };
        if !self.is_enabled() {
            return Ok(());
        }

        for p in self.pending.iter_mut() {
            p.ready_in = p.ready_in.saturating_sub(1);
        }
        self.drain_one(sq, cq, ddr)?;
        self.post_ready(cq, ddr)
    }

    fn drain_one(
        &mut self,
        sq: QueueState,
        cq: QueueState,
        ddr: &mut dyn PhysicalMemory,
    ) -> PhysMemoryResult<()> {
        match self.fault {
            EngineFault::Hang => return Ok(()),
            EngineFault::HangFor(n) => {
                self.fault = if n <= 1 {
                    EngineFault::None
                } else {
                    EngineFault::HangFor(n - 1)
                };
                return Ok(());
            }
            _ => {}
        }

        let tail = self.sq_tail % sq.size;
        if self.sq_head == tail {
            return Ok(());
        }
        if self.drain_wait > 0 {
            self.drain_wait -= 1;
            return Ok(());
        }

        let used = (self.cq_tail + cq.size - self.cq_head % cq.size) % cq.size;
        if used + self.pending.len() as u32 >= cq.size - 1 {
            self.stats.backpressure_ticks += 1;
            return Ok(());
        }

        let slot = self.sq_head;
        let addr = sq.base + slot as u64 * SUBMIT_ENTRY_SIZE as u64;
        let desc = decode_submit(ddr, addr)?;
        let entry = self.execute(slot, &desc, ddr);
        tracing::trace!(slot, id = desc.id, status = entry.status, "descriptor consumed");

        self.stats.descriptors += 1;
        self.sq_head = (self.sq_head + 1) % sq.size;
        self.drain_wait = self.timing.polls_before_drain;
        if self.fault != EngineFault::DropCompletions {
            self.pending.push_back(PendingCompletion {
                entry,
                ready_in: self.timing.polls_before_complete,
            });
        }
        Ok(())
    }

    fn execute(
        &mut self,
        slot: u32,
        desc: &SubmitEntry,
        ddr: &mut dyn PhysicalMemory,
    ) -> CompletionEntry {
        let mut entry = CompletionEntry {
            wqe_id: slot,
            opcode: desc.opcode.raw() as u8,
            original_id: desc.id,
            original_length: desc.length as u32,
            ..CompletionEntry::default()
        };
        if self.fault == EngineFault::WrongId {
            entry.original_id = !desc.id;
        }
        if let EngineFault::FailStatus(code) = self.fault {
            entry.status = code;
            return entry;
        }
        if desc.opcode != Opcode::Write {
            entry.status = status::INVALID_OPCODE;
            return entry;
        }

        let size = ddr.size();
        let fits = |addr: u64| addr.checked_add(desc.length).is_some_and(|end| end <= size);
        if !fits(desc.local_key) || !fits(desc.remote_key) {
            tracing::debug!(slot, id = desc.id, "copy outside DDR");
            entry.status = status::DMA_ERROR;
            return entry;
        }
        let copied = ddr.copy_within(desc.local_key, desc.remote_key, desc.length as usize);
        if let Err(err) = copied {
            tracing::debug!(slot, id = desc.id, error = %err, "copy failed");
            entry.status = status::DMA_ERROR;
            return entry;
        }

        entry.bytes_sent = desc.length;
        self.stats.bytes_copied += desc.length;
        if self.fault == EngineFault::CorruptCopy && desc.length > 0 {
            let mut b = [0u8; 1];
            if ddr.read_into(desc.remote_key, &mut b).is_ok() {
                let _ = ddr.write_from(desc.remote_key, &[b[0] ^ 0xff]);
            }
        }
        entry
    }

    fn post_ready(&mut self, cq: QueueState, ddr: &mut dyn PhysicalMemory) -> PhysMemoryResult<()> {
        while let Some(front) = self.pending.front() {
            if front.ready_in > 0 {
                break;
            }
            let next_tail = (self.cq_tail + 1) % cq.size;
            if next_tail == self.cq_head % cq.size {
                // CQ full; the driver must release entries first.
                break;
            }
            let addr = cq.base + self.cq_tail as u64 * COMPLETION_ENTRY_SIZE as u64;
            encode_completion(ddr, addr, &front.entry)?;
            self.cq_tail = next_tail;
            self.stats.completions += 1;
            self.pending.pop_front();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rdma_mem::DenseMemory;

    const SQ: u64 = 0x1000;
    const CQ: u64 = 0x2000;
    const SRC: u64 = 0x4000;
    const DST: u64 = 0x8000;

    fn enabled_engine(size: u32) -> DataMoverEngine {
        let mut engine = DataMoverEngine::new();
        engine.mmio_write(Reg::SqBaseLo.offset(), SQ as u32);
        engine.mmio_write(Reg::SqSize.offset(), size);
        engine.mmio_write(Reg::CqBaseLo.offset(), CQ as u32);
        engine.mmio_write(Reg::CqSize.offset(), size);
        engine.mmio_write(Reg::Ctrl.offset(), 1);
        engine
    }

    fn put_desc(mem: &mut DenseMemory, slot: u32, desc: &SubmitEntry) {
        mem.write_from(SQ + slot as u64 * 64, &desc.to_bytes()).unwrap();
    }

    fn read_cqe(mem: &DenseMemory, slot: u32) -> CompletionEntry {
        let mut raw = [0u8; 32];
        mem.read_into(CQ + slot as u64 * 32, &mut raw).unwrap();
        CompletionEntry::from_bytes(&raw)
    }

    #[test]
    fn doorbell_drains_copies_and_completes() {
        let mut mem = DenseMemory::new(0x10000).unwrap();
        mem.write_from(SRC, &[0xab; 64]).unwrap();
        let mut engine = enabled_engine(4);
        put_desc(&mut mem, 0, &SubmitEntry::write(0x0001_0001, SRC, DST, 64));

        engine.mmio_write(Reg::SqTail.offset(), 1);
        engine.tick(&mut mem).unwrap();

        assert_eq!(engine.mmio_read(Reg::SqHead.offset()), 1);
        assert_eq!(engine.mmio_read(Reg::CqTail.offset()), 1);
        let cqe = read_cqe(&mem, 0);
        assert_eq!(cqe.wqe_id, 0);
        assert_eq!(cqe.original_id, 0x0001_0001);
        assert_eq!(cqe.original_length, 64);
        assert_eq!(cqe.bytes_sent, 64);
        assert!(cqe.is_success());
        assert_eq!(mem.read_u32_le(DST + 60).unwrap(), 0xabab_abab);
    }

    #[test]
    fn full_cq_holds_back_the_sq() {
        let mut mem = DenseMemory::new(0x10000).unwrap();
        let mut engine = enabled_engine(4);
        for slot in 0..3 {
            put_desc(&mut mem, slot, &SubmitEntry::write(slot, SRC, DST, 4));
        }
        engine.mmio_write(Reg::SqTail.offset(), 3);
        for _ in 0..3 {
            engine.tick(&mut mem).unwrap();
        }
        assert_eq!(engine.mmio_read(Reg::CqTail.offset()), 3);

        put_desc(&mut mem, 3, &SubmitEntry::write(3, SRC, DST, 4));
        engine.mmio_write(Reg::SqTail.offset(), 0);
        engine.tick(&mut mem).unwrap();
        assert_eq!(engine.mmio_read(Reg::SqHead.offset()), 3);
        assert_eq!(engine.stats().backpressure_ticks, 1);

        engine.mmio_write(Reg::CqHead.offset(), 3);
        engine.tick(&mut mem).unwrap();
        assert_eq!(engine.mmio_read(Reg::SqHead.offset()), 0);
        assert_eq!(engine.mmio_read(Reg::CqTail.offset()), 0);
        assert_eq!(read_cqe(&mem, 3).original_id, 3);
    }

    #[test]
    fn unknown_opcode_and_bad_address_report_status() {
        let mut mem = DenseMemory::new(0x10000).unwrap();
        let mut engine = enabled_engine(4);
        let mut odd = SubmitEntry::write(1, SRC, DST, 4);
        odd.opcode = Opcode::Other(7);
        put_desc(&mut mem, 0, &odd);
        put_desc(&mut mem, 1, &SubmitEntry::write(2, SRC, 0xffff_0000, 4));
        engine.mmio_write(Reg::SqTail.offset(), 2);
        engine.tick(&mut mem).unwrap();
        engine.tick(&mut mem).unwrap();

        assert_eq!(read_cqe(&mem, 0).status, status::INVALID_OPCODE);
        assert_eq!(read_cqe(&mem, 1).status, status::DMA_ERROR);
        assert_eq!(read_cqe(&mem, 1).bytes_sent, 0);
    }

    #[test]
    fn latency_delays_cursor_movement() {
        let mut mem = DenseMemory::new(0x10000).unwrap();
        let mut engine = enabled_engine(4);
        engine.set_timing(EngineTiming {
            polls_before_drain: 2,
            polls_before_complete: 1,
        });
        put_desc(&mut mem, 0, &SubmitEntry::write(1, SRC, DST, 4));
        engine.mmio_write(Reg::SqTail.offset(), 1);

        engine.tick(&mut mem).unwrap();
        engine.tick(&mut mem).unwrap();
        assert_eq!(engine.mmio_read(Reg::SqHead.offset()), 0);
        engine.tick(&mut mem).unwrap();
        assert_eq!(engine.mmio_read(Reg::SqHead.offset()), 1);
        assert_eq!(engine.mmio_read(Reg::CqTail.offset()), 0);
        engine.tick(&mut mem).unwrap();
        assert_eq!(engine.mmio_read(Reg::CqTail.offset()), 1);
    }

    #[test]
    fn disabled_engine_ignores_doorbells_and_cursor_writes() {
        let mut mem = DenseMemory::new(0x10000).unwrap();
        let mut engine = DataMoverEngine::new();
        engine.mmio_write(Reg::SqTail.offset(), 1);
        engine.mmio_write(Reg::SqHead.offset(), 3);
        engine.tick(&mut mem).unwrap();
        assert_eq!(engine.mmio_read(Reg::SqHead.offset()), 0);
        assert!(!engine.is_enabled());
    }

    #[test]
    fn hang_for_recovers() {
        let mut mem = DenseMemory::new(0x10000).unwrap();
        let mut engine = enabled_engine(4);
        engine.set_fault(EngineFault::HangFor(2));
        put_desc(&mut mem, 0, &SubmitEntry::write(1, SRC, DST, 4));
        engine.mmio_write(Reg::SqTail.offset(), 1);
        engine.tick(&mut mem).unwrap();
        engine.tick(&mut mem).unwrap();
        assert_eq!(engine.mmio_read(Reg::SqHead.offset()), 0);
        engine.tick(&mut mem).unwrap();
        assert_eq!(engine.mmio_read(Reg::SqHead.offset()), 1);
        assert_eq!(engine.fault(), EngineFault::None);
    }
}
