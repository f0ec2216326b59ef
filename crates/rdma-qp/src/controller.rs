//! Queue-pair controller: owns the software cursors and drives the data mover's register
//! block.
//!
//! Every operation takes `&mut self`; a controller is driven from one thread and there is no
//! interrupt path. Completion is observed by polling SQ_HEAD and CQ_TAIL against deadlines
//! taken from the [`Clock`].

use std::collections::VecDeque;
use std::time::Duration;

use crate::clock::{Clock, Deadline};
use crate::config::QueuePairConfig;
use crate::dma::DmaMemory;
use crate::entry::{decode_completion, encode_submit, CompletionEntry, Opcode, SubmitEntry};
use crate::error::{BufferSide, QueueError, Result};
use crate::ordering::{acquire, publish};
use crate::regs::{CtrlFlags, Reg, RegisterIo};
use crate::ring::Ring;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Uninitialized,
    Configured,
    Enabled,
    /// Doorbell rung, SQ_HEAD not yet seen moving.
    Submitting,
    AwaitingCompletion,
    /// Every completion so far has been released.
    Acknowledged,
}

impl ControllerState {
    fn is_enabled(self) -> bool {
        matches!(
            self,
            ControllerState::Enabled
                | ControllerState::Submitting
                | ControllerState::AwaitingCompletion
                | ControllerState::Acknowledged
        )
    }
}

/// Returned by a successful [`QueuePairController::submit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmitTicket {
    pub slot: u32,
    pub id: u32,
    /// Value written to SQ_TAIL.
    pub new_tail: u32,
    /// SQ_HEAD observed just before the doorbell; pass to `poll_for_drain`.
    pub head_before: u32,
    /// CQ_TAIL last observed before the doorbell; pass to `poll_for_completion`.
    pub cq_tail_before: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Drained(pub u32);

/// One decoded CQ record, paired with the request it should answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    /// CQ slot the record was read from.
    pub cq_slot: u32,
    pub entry: CompletionEntry,
    /// The submission in flight at this position, if any.
    pub request: Option<SubmitEntry>,
    /// SQ slot that submission was written to.
    pub sq_slot: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionBatch {
    pub completions: Vec<Completion>,
    pub new_tail: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionPoll {
    Pending,
    Ready(CompletionBatch),
}

#[derive(Debug, Clone, Copy)]
struct InFlight {
    slot: u32,
    entry: SubmitEntry,
}

pub struct QueuePairController<H, C> {
    hw: H,
    clock: C,
    config: QueuePairConfig,
    sq: Ring,
    cq: Ring,
    state: ControllerState,

    sq_tail: u32,
    sq_head_seen: u32,
    cq_head: u32,
    cq_tail_seen: u32,
    /// Submitted, completion not yet released, oldest first.
    in_flight: VecDeque<InFlight>,
}

impl<H, C> QueuePairController<H, C>
where
    H: RegisterIo + DmaMemory,
    C: Clock,
{
    /// The configuration is validated here; the registers are untouched until `configure`.
    pub fn new(hw: H, clock: C, config: QueuePairConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            sq: config.sq_ring(),
            cq: config.cq_ring(),
            hw,
            clock,
            config,
            state: ControllerState::Uninitialized,
            sq_tail: 0,
            sq_head_seen: 0,
            cq_head: 0,
            cq_tail_seen: 0,
            in_flight: VecDeque::new(),
        })
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn config(&self) -> &QueuePairConfig {
        &self.config
    }

    pub fn sq_tail(&self) -> u32 {
        self.sq_tail
    }

    pub fn cq_head(&self) -> u32 {
        self.cq_head
    }

    pub fn observed_cq_tail(&self) -> u32 {
        self.cq_tail_seen
    }

    pub fn outstanding(&self) -> u32 {
        self.in_flight.len() as u32
    }

    pub fn hardware(&self) -> &H {
        &self.hw
    }

    pub fn hardware_mut(&mut self) -> &mut H {
        &mut self.hw
    }

    pub fn clock_mut(&mut self) -> &mut C {
        &mut self.clock
    }

    /// Simultaneous access for callers that stage buffers and time them.
    pub fn parts_mut(&mut self) -> (&mut H, &mut C) {
        (&mut self.hw, &mut self.clock)
    }

    pub fn into_parts(self) -> (H, C) {
        (self.hw, self.clock)
    }

    /// Programs ring bases and sizes and resets the software cursors.
    pub fn configure(
        &mut self,
        sq_base: u64,
        sq_capacity: u32,
        cq_base: u64,
        cq_capacity: u32,
    ) -> Result<()> {
        if !self.in_flight.is_empty() {
            return Err(QueueError::InvalidState {
                op: "configure",
                state: self.state,
            });
        }

        let mut candidate = self.config.clone();
        candidate.sq.base = sq_base;
        candidate.sq.capacity = sq_capacity;
        candidate.cq.base = cq_base;
        candidate.cq.capacity = cq_capacity;
        candidate.validate()?;

        // Registers must not be latched by a running engine while half-programmed.
        let ctrl = CtrlFlags::from_bits_retain(self.hw.read32(Reg::Ctrl));
        if ctrl.contains(CtrlFlags::GLOBAL_ENABLE) {
            self.hw
                .write32(Reg::Ctrl, (ctrl - CtrlFlags::GLOBAL_ENABLE).bits());
        }

        self.hw.write32(Reg::SqBaseLo, sq_base as u32);
        self.hw.write32(Reg::SqBaseHi, (sq_base >> 32) as u32);
        self.hw.write32(Reg::SqSize, sq_capacity);
        self.hw.write32(Reg::CqBaseLo, cq_base as u32);
        self.hw.write32(Reg::CqBaseHi, (cq_base >> 32) as u32);
        self.hw.write32(Reg::CqSize, cq_capacity);
        self.hw.write32(Reg::SqTail, 0);
        self.hw.write32(Reg::CqHead, 0);

        self.config = candidate;
        self.sq = self.config.sq_ring();
        self.cq = self.config.cq_ring();
        self.sq_tail = 0;
        self.sq_head_seen = 0;
        self.cq_head = 0;
        self.cq_tail_seen = 0;
        self.state = ControllerState::Configured;

        tracing::debug!(
            sq_base = format_args!("{sq_base:#x}"),
            sq_capacity,
            cq_base = format_args!("{cq_base:#x}"),
            cq_capacity,
            "queue pair configured"
        );
        Ok(())
    }

    /// `configure` with the rings from the controller's configuration.
    pub fn configure_from_config(&mut self) -> Result<()> {
        let (sq, cq) = (self.config.sq, self.config.cq);
        self.configure(sq.base, sq.capacity, cq.base, cq.capacity)
    }

    /// Sets CTRL.GLOBAL_ENABLE, preserving the other bits.
    pub fn global_enable(&mut self) -> Result<()> {
        if self.state == ControllerState::Uninitialized {
            return Err(QueueError::InvalidState {
                op: "global_enable",
                state: self.state,
            });
        }
        let ctrl = CtrlFlags::from_bits_retain(self.hw.read32(Reg::Ctrl));
        if !ctrl.contains(CtrlFlags::GLOBAL_ENABLE) {
            self.hw
                .write32(Reg::Ctrl, (ctrl | CtrlFlags::GLOBAL_ENABLE).bits());
            tracing::debug!(ctrl = ctrl.bits(), "global enable set");
        }
        if self.state == ControllerState::Configured {
            self.state = ControllerState::Enabled;
        }
        Ok(())
    }

    fn check_bounds(&self, entry: &SubmitEntry) -> Result<()> {
        let checks = [
            (BufferSide::Source, entry.local_key, self.config.payload),
            (BufferSide::Destination, entry.remote_key, self.config.remote),
        ];
        for (side, addr, region) in checks {
            if !region.contains(addr, entry.length) {
                tracing::warn!(id = entry.id, %side, addr, len = entry.length, "request out of bounds");
                return Err(QueueError::OutOfBounds {
                    side,
                    addr,
                    len: entry.length,
                    region,
                });
            }
        }
        Ok(())
    }

    fn read_cursor(&mut self, reg: Reg, ring: Ring) -> Result<u32> {
        let value = self.hw.read32(reg);
        if value >= ring.capacity {
            tracing::error!(%reg, value, capacity = ring.capacity, "cursor out of range");
            return Err(QueueError::CursorOutOfRange {
                reg,
                value,
                capacity: ring.capacity,
            });
        }
        Ok(value)
    }

    /// Writes `entry` into the next SQ slot and rings the doorbell.
    ///
    /// The source range of a WRITE is cleaned to DDR along with the descriptor. Nothing
    /// reaches the engine when the request is out of bounds or the ring has no slot whose
    /// completion was released.
    pub fn submit(&mut self, entry: &SubmitEntry) -> Result<SubmitTicket> {
        if !self.state.is_enabled() {
            return Err(QueueError::InvalidState {
                op: "submit",
                state: self.state,
            });
        }
        self.check_bounds(entry)?;

        let slot = self.sq_tail;
        let sq_head = self.read_cursor(Reg::SqHead, self.sq)?;
        self.sq_head_seen = sq_head;
        let outstanding = self.outstanding();
        let budget = self.config.outstanding_budget();
        if outstanding >= budget || self.sq.is_full(sq_head, self.sq_tail) {
            tracing::error!(slot, sq_head, outstanding, budget, "submission ring stalled");
            return Err(QueueError::Stall {
                slot,
                sq_head,
                outstanding,
                budget,
            });
        }

        if entry.opcode == Opcode::Write {
            publish(&mut self.hw, entry.local_key, entry.length)?;
        }
        let addr = self.sq.slot_addr(slot);
        encode_submit(&mut self.hw, addr, entry)?;
        publish(&mut self.hw, addr, self.sq.entry_size)?;

        let new_tail = self.sq.advance(slot, 1);
        self.hw.write32(Reg::SqTail, new_tail);
        self.sq_tail = new_tail;
        self.in_flight.push_back(InFlight {
            slot,
            entry: *entry,
        });
        self.state = ControllerState::Submitting;

        tracing::debug!(slot, id = entry.id, new_tail, "doorbell");
        Ok(SubmitTicket {
            slot,
            id: entry.id,
            new_tail,
            head_before: sq_head,
            cq_tail_before: self.cq_tail_seen,
        })
    }

    /// Spins on SQ_HEAD until it differs from `expected_head`.
    ///
    /// A moved head only means the descriptor was consumed, not that the copy finished.
    pub fn poll_for_drain(&mut self, expected_head: u32, timeout: Duration) -> Result<Drained> {
        if !self.state.is_enabled() {
            return Err(QueueError::InvalidState {
                op: "poll_for_drain",
                state: self.state,
            });
        }
        let interval = self.config.poll.poll_interval();
        let deadline = Deadline::after(&mut self.clock, timeout);
        loop {
            let head = self.read_cursor(Reg::SqHead, self.sq)?;
            if head != expected_head {
                self.sq_head_seen = head;
                if self.state == ControllerState::Submitting {
                    self.state = ControllerState::AwaitingCompletion;
                }
                return Ok(Drained(head));
            }
            let now = self.clock.now();
            if deadline.expired(now) {
                let waited = deadline.elapsed(now);
                tracing::warn!(last = head, ?waited, "SQ_HEAD did not advance");
                return Err(QueueError::Timeout {
                    cursor: Reg::SqHead,
                    last: head,
                    waited,
                });
            }
            self.clock.pause(interval);
        }
    }

    /// Reads CQ_TAIL once. If it moved past `expected_cq_tail`, the new slots are invalidated
    /// and decoded in ring order.
    pub fn poll_for_completion(&mut self, expected_cq_tail: u32) -> Result<CompletionPoll> {
        if !self.state.is_enabled() {
            return Err(QueueError::InvalidState {
                op: "poll_for_completion",
                state: self.state,
            });
        }
        let tail = self.read_cursor(Reg::CqTail, self.cq)?;
        if tail == expected_cq_tail {
            return Ok(CompletionPoll::Pending);
        }

        for span in self.cq.spans(expected_cq_tail, tail) {
            acquire(&mut self.hw, span.base, span.len)?;
        }

        let cq = self.cq;
        let mut completions = Vec::with_capacity(cq.distance(expected_cq_tail, tail) as usize);
        for cq_slot in cq.slots(expected_cq_tail, tail) {
            let entry = decode_completion(&mut self.hw, cq.slot_addr(cq_slot))?;
            let position = cq.distance(self.cq_head, cq_slot) as usize;
            let in_flight = self.in_flight.get(position).copied();
            if let Some(f) = in_flight {
                if f.slot != entry.wqe_id {
                    tracing::warn!(
                        expected_slot = f.slot,
                        wqe_id = entry.wqe_id,
                        "completion for unexpected SQ slot"
                    );
                }
            }
            completions.push(Completion {
                cq_slot,
                entry,
                request: in_flight.map(|f| f.entry),
                sq_slot: in_flight.map(|f| f.slot),
            });
        }

        self.cq_tail_seen = tail;
        if self.state == ControllerState::Submitting {
            self.state = ControllerState::AwaitingCompletion;
        }
        tracing::debug!(from = expected_cq_tail, to = tail, n = completions.len(), "completions");
        Ok(CompletionPoll::Ready(CompletionBatch {
            completions,
            new_tail: tail,
        }))
    }

    /// [`Self::poll_for_completion`] until a batch arrives or `timeout` passes.
    pub fn wait_for_completion(
        &mut self,
        expected_cq_tail: u32,
        timeout: Duration,
    ) -> Result<CompletionBatch> {
        let interval = self.config.poll.poll_interval();
        let deadline = Deadline::after(&mut self.clock, timeout);
        loop {
            if let CompletionPoll::Ready(batch) = self.poll_for_completion(expected_cq_tail)? {
                return Ok(batch);
            }
            let now = self.clock.now();
            if deadline.expired(now) {
                let waited = deadline.elapsed(now);
                tracing::warn!(last = expected_cq_tail, ?waited, "CQ_TAIL did not advance");
                return Err(QueueError::Timeout {
                    cursor: Reg::CqTail,
                    last: expected_cq_tail,
                    waited,
                });
            }
            self.clock.pause(interval);
        }
    }

    /// Releases completions up to `new_cq_tail` by writing CQ_HEAD.
    ///
    /// Repeating the current head is a no-op. Releasing past the last observed CQ_TAIL is
    /// rejected.
    pub fn acknowledge(&mut self, new_cq_tail: u32) -> Result<()> {
        if !self.state.is_enabled() {
            return Err(QueueError::InvalidState {
                op: "acknowledge",
                state: self.state,
            });
        }
        if new_cq_tail == self.cq_head {
            return Ok(());
        }
        let released = self.cq.distance(self.cq_head, new_cq_tail);
        let observed = self.cq.distance(self.cq_head, self.cq_tail_seen);
        if new_cq_tail >= self.cq.capacity || released > observed {
            tracing::warn!(
                requested = new_cq_tail,
                head = self.cq_head,
                observed_tail = self.cq_tail_seen,
                "rejected acknowledge"
            );
            return Err(QueueError::InvalidAcknowledge {
                requested: new_cq_tail,
                head: self.cq_head,
                observed_tail: self.cq_tail_seen,
            });
        }

        self.hw.write32(Reg::CqHead, new_cq_tail);
        self.cq_head = new_cq_tail;
        for _ in 0..released {
            self.in_flight.pop_front();
        }
        self.state = if self.in_flight.is_empty() {
            ControllerState::Acknowledged
        } else {
            ControllerState::AwaitingCompletion
        };
        tracing::debug!(cq_head = new_cq_tail, released, "acknowledged");
        Ok(())
    }
}
