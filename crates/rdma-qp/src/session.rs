//! Transfer policy above the controller.
//!
//! A [`TransferSession`] only exists once the link is up, the endpoint table is programmed and
//! the queue pair is enabled. It stages payload bytes, runs one WRITE at a time through the
//! rings, retries cursor timeouts with exponential backoff and checks the destination against
//! the source before releasing the completion. Stalls and corrupted transfers abort the
//! session for good.

use std::net::Ipv4Addr;
use std::time::Duration;

use crate::clock::Clock;
use crate::controller::{Completion, CompletionBatch, QueuePairController, SubmitTicket};
use crate::dma::DmaMemory;
use crate::endpoint::{bring_up_link, EndpointTable, LinkLayer, MacAddress};
use crate::entry::SubmitEntry;
use crate::error::{BringUpError, BufferSide, QueueError, Result};
use crate::ordering::{acquire, publish};
use crate::regs::RegisterIo;

const VERIFY_CHUNK: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    pub ip: Ipv4Addr,
    pub mac: MacAddress,
}

/// Link and endpoint-table programming performed before the rings are touched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BringUp {
    pub local_mac: MacAddress,
    pub endpoints: Vec<Endpoint>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferReport {
    pub id: u32,
    pub slot: u32,
    pub bytes: u64,
    /// Extra polling rounds needed before SQ_HEAD and CQ_TAIL moved.
    pub retries: u32,
    pub elapsed: Duration,
}

pub struct TransferSession<H, C> {
    qp: QueuePairController<H, C>,
    verify: bool,
    aborted: Option<QueueError>,
}

impl<H, C> TransferSession<H, C>
where
    H: RegisterIo + DmaMemory,
    C: Clock,
{
    /// Brings the link up, programs every endpoint, then configures and enables the queue
    /// pair. Any collaborator failure is a `ConfigurationFailure` and no session is returned.
    pub fn establish<L, T>(
        mut qp: QueuePairController<H, C>,
        link: &mut L,
        table: &mut T,
        plan: &BringUp,
    ) -> Result<Self>
    where
        L: LinkLayer + ?Sized,
        T: EndpointTable + ?Sized,
    {
        let link_timeout = qp.config().poll.link_timeout();
        bring_up_link(link, qp.clock_mut(), plan.local_mac, link_timeout)
            .map_err(|e| QueueError::ConfigurationFailure(BringUpError::Link(e)))?;

        for ep in &plan.endpoints {
            table
                .write_entry(ep.ip, ep.mac, plan.local_mac)
                .map_err(|e| QueueError::ConfigurationFailure(BringUpError::Endpoint(e)))?;
        }

        Self::start(qp)
    }

    /// Configures and enables the queue pair without any link-side bring-up (loopback).
    pub fn start(mut qp: QueuePairController<H, C>) -> Result<Self> {
        qp.configure_from_config()?;
        qp.global_enable()?;
        tracing::info!(
            sq_capacity = qp.config().sq.capacity,
            cq_capacity = qp.config().cq.capacity,
            "transfer session ready"
        );
        Ok(Self {
            qp,
            verify: true,
            aborted: None,
        })
    }

    /// Turns destination verification on or off (the throughput run skips it).
    pub fn set_verify(&mut self, verify: bool) {
        self.verify = verify;
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.is_some()
    }

    /// The failure that aborted the session, if any.
    pub fn abort_reason(&self) -> Option<&QueueError> {
        self.aborted.as_ref()
    }

    pub fn controller(&self) -> &QueuePairController<H, C> {
        &self.qp
    }

    pub fn controller_mut(&mut self) -> &mut QueuePairController<H, C> {
        &mut self.qp
    }

    pub fn into_controller(self) -> QueuePairController<H, C> {
        self.qp
    }

    fn ensure_live(&self) -> Result<()> {
        if self.aborted.is_some() {
            return Err(QueueError::SessionAborted);
        }
        Ok(())
    }

    fn fail(&mut self, err: QueueError) -> QueueError {
        if err.is_fatal() && self.aborted.is_none() {
            tracing::error!(error = %err, "aborting transfer session");
            self.aborted = Some(err.clone());
        }
        err
    }

    /// Copies `bytes` into the payload window at `offset` and cleans them to DDR.
    pub fn stage_payload(&mut self, offset: u64, bytes: &[u8]) -> Result<()> {
        self.ensure_live()?;
        let region = self.qp.config().payload;
        let addr = region.base.saturating_add(offset);
        let len = bytes.len() as u64;
        if !region.contains(addr, len) {
            return Err(QueueError::OutOfBounds {
                side: BufferSide::Source,
                addr,
                len,
                region,
            });
        }
        let hw = self.qp.hardware_mut();
        hw.write(addr, bytes)?;
        publish(hw, addr, len)?;
        Ok(())
    }

    /// Zeroes `len` bytes of the destination window at `offset` and cleans them to DDR, so no
    /// dirty line can later be written back over what the engine delivers.
    pub fn clear_destination(&mut self, offset: u64, len: u64) -> Result<()> {
        self.ensure_live()?;
        let region = self.qp.config().remote;
        let addr = region.base.saturating_add(offset);
        if !region.contains(addr, len) {
            return Err(QueueError::OutOfBounds {
                side: BufferSide::Destination,
                addr,
                len,
                region,
            });
        }
        let hw = self.qp.hardware_mut();
        hw.fill(addr, len, 0)?;
        publish(hw, addr, len)?;
        Ok(())
    }

    /// WRITE `len` bytes from payload offset `src` to remote offset `dst`.
    pub fn write(&mut self, id: u32, src: u64, dst: u64, len: u64) -> Result<TransferReport> {
        let cfg = self.qp.config();
        let entry = SubmitEntry::write(
            id,
            cfg.payload.base.saturating_add(src),
            cfg.remote.base.saturating_add(dst),
            len,
        );
        self.execute(&entry)
    }

    /// Runs one request to completion: submit, wait for drain and for the completion paired
    /// with this request, check it and the destination bytes, release the CQ slot.
    ///
    /// Completions that belong to earlier requests which timed out are settled and released
    /// on the way; they never stand in for this request's completion.
    pub fn execute(&mut self, entry: &SubmitEntry) -> Result<TransferReport> {
        self.ensure_live()?;
        let started = self.qp.clock_mut().now();

        let ticket = self.qp.submit(entry).map_err(|e| self.fail(e))?;
        let mut retries = 0;
        self.drain(&ticket, &mut retries).map_err(|e| self.fail(e))?;

        loop {
            let batch = self.completion(&mut retries).map_err(|e| self.fail(e))?;
            let mut own = None;
            for completion in &batch.completions {
                if completion.sq_slot == Some(ticket.slot) {
                    own = Some(completion);
                } else {
                    self.settle_late(completion).map_err(|e| self.fail(e))?;
                }
            }
            let Some(own) = own else {
                self.qp.acknowledge(batch.new_tail)?;
                continue;
            };

            let verify = self.verify;
            return match self.check_completion(own, verify) {
                Err(e) if e.is_fatal() => Err(self.fail(e)),
                Err(e) => {
                    // A failed request still occupies a CQ slot; release it so the ring moves on.
                    self.qp.acknowledge(batch.new_tail)?;
                    Err(e)
                }
                Ok(bytes) => {
                    self.qp.acknowledge(batch.new_tail)?;
                    let elapsed = self.qp.clock_mut().now().saturating_sub(started);
                    tracing::debug!(id = entry.id, slot = ticket.slot, bytes, retries, ?elapsed, "transfer complete");
                    Ok(TransferReport {
                        id: entry.id,
                        slot: ticket.slot,
                        bytes,
                        retries,
                        elapsed,
                    })
                }
            };
        }
    }

    fn backoff(&mut self, attempt: u32) {
        let pause = self.qp.config().poll.backoff(attempt);
        tracing::warn!(attempt = attempt + 1, ?pause, "cursor timeout, backing off");
        self.qp.clock_mut().pause(pause);
    }

    fn drain(&mut self, ticket: &SubmitTicket, retries: &mut u32) -> Result<()> {
        let policy = self.qp.config().poll;
        let mut attempt = 0;
        loop {
            match self.qp.poll_for_drain(ticket.head_before, policy.drain_timeout()) {
                Ok(_) => return Ok(()),
                Err(QueueError::Timeout { .. }) if attempt < policy.max_retries => {
                    self.backoff(attempt);
                    attempt += 1;
                    *retries += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Waits for CQ_TAIL to move past the last observed value.
    fn completion(&mut self, retries: &mut u32) -> Result<CompletionBatch> {
        let policy = self.qp.config().poll;
        let mut attempt = 0;
        loop {
            let from = self.qp.observed_cq_tail();
            match self.qp.wait_for_completion(from, policy.completion_timeout()) {
                Ok(batch) => return Ok(batch),
                Err(QueueError::Timeout { .. }) if attempt < policy.max_retries => {
                    self.backoff(attempt);
                    attempt += 1;
                    *retries += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// A completion for a request whose caller already got a timeout. Pairing failures still
    /// abort; anything else is logged and released. The source window may have been restaged
    /// since, so the destination bytes are not compared.
    fn settle_late(&mut self, c: &Completion) -> Result<()> {
        match self.check_completion(c, false) {
            Ok(bytes) => {
                tracing::info!(cq_slot = c.cq_slot, id = c.entry.original_id, bytes, "late completion released");
                Ok(())
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                tracing::warn!(cq_slot = c.cq_slot, error = %e, "late completion failed");
                Ok(())
            }
        }
    }

    fn check_completion(&mut self, c: &Completion, verify: bool) -> Result<u64> {
        let Some(request) = c.request else {
            tracing::error!(cq_slot = c.cq_slot, original_id = c.entry.original_id, "completion with nothing in flight");
            return Err(QueueError::UnexpectedCompletion {
                cq_slot: c.cq_slot,
                original_id: c.entry.original_id,
            });
        };
        if c.entry.original_id != request.id {
            return Err(QueueError::IdMismatch {
                slot: c.entry.wqe_id,
                expected: request.id,
                actual: c.entry.original_id,
            });
        }
        if !c.entry.is_success() {
            tracing::warn!(id = request.id, status = c.entry.status, "hardware reported failure");
            return Err(QueueError::Hardware {
                slot: c.entry.wqe_id,
                id: request.id,
                status: c.entry.status,
            });
        }
        if c.entry.bytes_sent != request.length {
            return Err(QueueError::ShortTransfer {
                id: request.id,
                requested: request.length,
                sent: c.entry.bytes_sent,
            });
        }
        if verify {
            self.verify_destination(&request)?;
        }
        Ok(c.entry.bytes_sent)
    }

    fn verify_destination(&mut self, request: &SubmitEntry) -> Result<()> {
        let hw = self.qp.hardware_mut();
        acquire(hw, request.remote_key, request.length)?;

        let mut src = vec![0u8; VERIFY_CHUNK];
        let mut dst = vec![0u8; VERIFY_CHUNK];
        let mut offset = 0u64;
        while offset < request.length {
            let n = (request.length - offset).min(VERIFY_CHUNK as u64) as usize;
            hw.read(request.local_key + offset, &mut src[..n])?;
            hw.read(request.remote_key + offset, &mut dst[..n])?;
            if let Some(i) = src[..n].iter().zip(&dst[..n]).position(|(a, b)| a != b) {
                return Err(QueueError::DataMismatch {
                    id: request.id,
                    offset: offset + i as u64,
                    expected: src[i],
                    actual: dst[i],
                });
            }
            offset += n as u64;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueuePairConfig;
    use crate::dma::{Barrier, MemoryFault};
    use crate::entry::CompletionEntry;
    use crate::regs::Reg;
    use std::collections::HashMap;

    /// Answers the doorbell by jumping both cursors; completions are placed by the test.
    #[derive(Default)]
    struct ScriptedHw {
        regs: HashMap<u32, u32>,
        mem: HashMap<u64, u8>,
        cq_tail_on_doorbell: u32,
    }

    impl ScriptedHw {
        fn put(&mut self, addr: u64, bytes: &[u8]) {
            for (i, b) in bytes.iter().enumerate() {
                self.mem.insert(addr + i as u64, *b);
            }
        }
    }

    impl RegisterIo for ScriptedHw {
        fn read32(&mut self, reg: Reg) -> u32 {
            self.regs.get(&reg.index()).copied().unwrap_or(0)
        }

        fn write32(&mut self, reg: Reg, value: u32) {
            if reg == Reg::SqTail && value != 0 {
                self.regs.insert(Reg::SqHead.index(), value);
                self.regs.insert(Reg::CqTail.index(), self.cq_tail_on_doorbell);
            }
            if !reg.is_hardware_owned() {
                self.regs.insert(reg.index(), value);
            }
        }
    }

    impl DmaMemory for ScriptedHw {
        fn read(&mut self, addr: u64, dst: &mut [u8]) -> std::result::Result<(), MemoryFault> {
            for (i, b) in dst.iter_mut().enumerate() {
                *b = self.mem.get(&(addr + i as u64)).copied().unwrap_or(0);
            }
            Ok(())
        }

        fn write(&mut self, addr: u64, src: &[u8]) -> std::result::Result<(), MemoryFault> {
            self.put(addr, src);
            Ok(())
        }

        fn flush_range(&mut self, _: u64, _: u64) -> std::result::Result<(), MemoryFault> {
            Ok(())
        }

        fn invalidate_range(&mut self, _: u64, _: u64) -> std::result::Result<(), MemoryFault> {
            Ok(())
        }

        fn barrier(&mut self, _: Barrier) {}
    }

    #[derive(Default)]
    struct StepClock(Duration);

    impl Clock for StepClock {
        fn now(&mut self) -> Duration {
            self.0 += Duration::from_micros(1);
            self.0
        }

        fn pause(&mut self, d: Duration) {
            self.0 += d;
        }
    }

    fn completion(wqe_id: u32, original_id: u32, bytes: u64) -> CompletionEntry {
        CompletionEntry {
            wqe_id,
            opcode: 1,
            bytes_sent: bytes,
            original_id,
            original_length: bytes as u32,
            ..Default::default()
        }
    }

    fn scripted_session(cq_tail_on_doorbell: u32) -> TransferSession<ScriptedHw, StepClock> {
        let hw = ScriptedHw {
            cq_tail_on_doorbell,
            ..Default::default()
        };
        let qp =
            QueuePairController::new(hw, StepClock::default(), QueuePairConfig::reference()).unwrap();
        TransferSession::start(qp).unwrap()
    }

    #[test]
    fn completion_beyond_everything_in_flight_aborts() {
        let mut s = scripted_session(2);
        let cq_base = s.controller().config().cq.base;
        let hw = s.controller_mut().hardware_mut();
        hw.put(cq_base, &completion(0, 5, 16).to_bytes());
        hw.put(cq_base + 32, &completion(1, 0x99, 16).to_bytes());

        let err = s.write(5, 0, 0, 16).unwrap_err();
        assert_eq!(
            err,
            QueueError::UnexpectedCompletion {
                cq_slot: 1,
                original_id: 0x99
            }
        );
        assert!(s.is_aborted());
        assert_eq!(s.write(6, 0, 0, 16), Err(QueueError::SessionAborted));
    }

    #[test]
    fn report_comes_from_the_paired_completion() {
        let mut s = scripted_session(1);
        let cq_base = s.controller().config().cq.base;
        s.controller_mut()
            .hardware_mut()
            .put(cq_base, &completion(0, 7, 48).to_bytes());

        let report = s.write(7, 0, 0, 48).unwrap();
        assert_eq!((report.id, report.slot, report.bytes), (7, 0, 48));
        assert_eq!(s.controller().outstanding(), 0);
        assert_eq!(s.controller().cq_head(), 1);
    }
}
