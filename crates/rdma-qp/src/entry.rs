//! Binary layouts of the ring entries shared with the data mover.
//!
//! Both layouts are little-endian. Decoding never fails: every bit pattern is a valid entry,
//! and fields the engine leaves reserved are carried through unchanged.

use rdma_mem::{PhysMemoryResult, PhysicalMemory};

use crate::dma::{DmaMemory, MemoryFault};

pub const SUBMIT_ENTRY_SIZE: usize = 64;
pub const COMPLETION_ENTRY_SIZE: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    /// Copy `length` bytes from `local_key` to `remote_key`.
    Write,
    Other(u16),
}

impl Opcode {
    pub const WRITE_RAW: u16 = 0x0001;

    pub const fn raw(self) -> u16 {
        match self {
            Opcode::Write => Self::WRITE_RAW,
            Opcode::Other(v) => v,
        }
    }
}

impl From<u16> for Opcode {
    fn from(raw: u16) -> Self {
        match raw {
            Self::WRITE_RAW => Opcode::Write,
            other => Opcode::Other(other),
        }
    }
}

/// One 64-byte SQ descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmitEntry {
    /// Caller-chosen work request id, echoed back as `original_id`.
    pub id: u32,
    pub opcode: Opcode,
    pub flags: u16,
    /// Source physical address.
    pub local_key: u64,
    /// Destination physical address.
    pub remote_key: u64,
    pub length: u64,
}

impl SubmitEntry {
    pub fn write(id: u32, local_key: u64, remote_key: u64, length: u64) -> Self {
        Self {
            id,
            opcode: Opcode::Write,
            flags: 0,
            local_key,
            remote_key,
            length,
        }
    }

    pub fn to_bytes(&self) -> [u8; SUBMIT_ENTRY_SIZE] {
        let mut out = [0u8; SUBMIT_ENTRY_SIZE];
        out[0..4].copy_from_slice(&self.id.to_le_bytes());
        out[4..6].copy_from_slice(&self.opcode.raw().to_le_bytes());
        out[6..8].copy_from_slice(&self.flags.to_le_bytes());
        out[8..16].copy_from_slice(&self.local_key.to_le_bytes());
        out[16..24].copy_from_slice(&self.remote_key.to_le_bytes());
        out[24..28].copy_from_slice(&(self.length as u32).to_le_bytes());
        out[28..32].copy_from_slice(&((self.length >> 32) as u32).to_le_bytes());
        // 32..64 stays zero.
        out
    }

    pub fn from_bytes(bytes: &[u8; SUBMIT_ENTRY_SIZE]) -> Self {
        let length_lo = le_u32(bytes, 24);
        let length_hi = le_u32(bytes, 28);
        Self {
            id: le_u32(bytes, 0),
            opcode: Opcode::from(le_u16(bytes, 4)),
            flags: le_u16(bytes, 6),
            local_key: le_u64(bytes, 8),
            remote_key: le_u64(bytes, 16),
            length: (length_hi as u64) << 32 | length_lo as u64,
        }
    }
}

/// One 32-byte CQ record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CompletionEntry {
    /// SQ ring slot that completed. Not the submitter's id; see `original_id`.
    pub wqe_id: u32,
    /// 0 on success, otherwise an engine-specific failure code.
    pub status: u8,
    pub opcode: u8,
    /// Bits 31:16 of word 1.
    pub word1_reserved: u16,
    pub bytes_sent: u64,
    pub original_id: u32,
    /// Low 32 bits of the requested length.
    pub original_length: u32,
    pub reserved: u64,
}

impl CompletionEntry {
    pub const STATUS_SUCCESS: u8 = 0;

    pub fn is_success(&self) -> bool {
        self.status == Self::STATUS_SUCCESS
    }

    pub fn to_bytes(&self) -> [u8; COMPLETION_ENTRY_SIZE] {
        let mut out = [0u8; COMPLETION_ENTRY_SIZE];
        out[0..4].copy_from_slice(&self.wqe_id.to_le_bytes());
        let word1 = (self.word1_reserved as u32) << 16
            | (self.opcode as u32) << 8
            | self.status as u32;
        out[4..8].copy_from_slice(&word1.to_le_bytes());
        out[8..16].copy_from_slice(&self.bytes_sent.to_le_bytes());
        out[16..20].copy_from_slice(&self.original_id.to_le_bytes());
        out[20..24].copy_from_slice(&self.original_length.to_le_bytes());
        out[24..32].copy_from_slice(&self.reserved.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8; COMPLETION_ENTRY_SIZE]) -> Self {
        let word1 = le_u32(bytes, 4);
        Self {
            wqe_id: le_u32(bytes, 0),
            status: (word1 & 0xff) as u8,
            opcode: ((word1 >> 8) & 0xff) as u8,
            word1_reserved: (word1 >> 16) as u16,
            bytes_sent: le_u64(bytes, 8),
            original_id: le_u32(bytes, 16),
            original_length: le_u32(bytes, 20),
            reserved: le_u64(bytes, 24),
        }
    }
}

fn le_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([bytes[at], bytes[at + 1]])
}

fn le_u32(bytes: &[u8], at: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(b)
}

fn le_u64(bytes: &[u8], at: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(b)
}

/// Stores `entry` at `addr` through the CPU's view of memory. The caller flushes it.
pub fn encode_submit<M: DmaMemory + ?Sized>(
    mem: &mut M,
    addr: u64,
    entry: &SubmitEntry,
) -> Result<(), MemoryFault> {
    mem.write(addr, &entry.to_bytes())
}

/// Loads the completion at `addr` through the CPU's view of memory. The caller invalidates
/// the slot first.
pub fn decode_completion<M: DmaMemory + ?Sized>(
    mem: &mut M,
    addr: u64,
) -> Result<CompletionEntry, MemoryFault> {
    let mut bytes = [0u8; COMPLETION_ENTRY_SIZE];
    mem.read(addr, &mut bytes)?;
    Ok(CompletionEntry::from_bytes(&bytes))
}

/// Engine side: fetches a descriptor straight from DDR.
pub fn decode_submit(ddr: &dyn PhysicalMemory, addr: u64) -> PhysMemoryResult<SubmitEntry> {
    let mut bytes = [0u8; SUBMIT_ENTRY_SIZE];
    ddr.read_into(addr, &mut bytes)?;
    Ok(SubmitEntry::from_bytes(&bytes))
}

/// Engine side: posts a completion record straight to DDR.
pub fn encode_completion(
    ddr: &mut dyn PhysicalMemory,
    addr: u64,
    entry: &CompletionEntry,
) -> PhysMemoryResult<()> {
    ddr.write_from(addr, &entry.to_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn submit_layout_matches_descriptor_words() {
        let entry = SubmitEntry::write(0x0001_0001, 0x3000_0000, 0x2000_0000, 4096);
        let bytes = entry.to_bytes();

        assert_eq!(&bytes[0..4], &[0x01, 0x00, 0x01, 0x00]);
        assert_eq!(&bytes[4..6], &[0x01, 0x00]);
        assert_eq!(&bytes[6..8], &[0x00, 0x00]);
        assert_eq!(&bytes[8..16], &0x3000_0000u64.to_le_bytes());
        assert_eq!(&bytes[16..24], &0x2000_0000u64.to_le_bytes());
        assert_eq!(&bytes[24..28], &4096u32.to_le_bytes());
        assert_eq!(&bytes[28..32], &[0; 4]);
        assert!(bytes[32..].iter().all(|&b| b == 0));
    }

    #[test]
    fn completion_word1_packs_status_and_opcode() {
        let mut raw = [0u8; COMPLETION_ENTRY_SIZE];
        raw[0..4].copy_from_slice(&2u32.to_le_bytes());
        raw[4..8].copy_from_slice(&0xbeef_0105u32.to_le_bytes());
        raw[8..12].copy_from_slice(&4096u32.to_le_bytes());
        raw[16..20].copy_from_slice(&0x0003_0003u32.to_le_bytes());
        raw[20..24].copy_from_slice(&4096u32.to_le_bytes());

        let cqe = CompletionEntry::from_bytes(&raw);
        assert_eq!(cqe.wqe_id, 2);
        assert_eq!(cqe.status, 0x05);
        assert_eq!(cqe.opcode, 0x01);
        assert_eq!(cqe.word1_reserved, 0xbeef);
        assert_eq!(cqe.bytes_sent, 4096);
        assert_eq!(cqe.original_id, 0x0003_0003);
        assert!(!cqe.is_success());
        assert_eq!(cqe.to_bytes(), raw);
    }

    #[test]
    fn unknown_opcodes_survive_decode() {
        let mut entry = SubmitEntry::write(7, 0, 0, 0);
        entry.opcode = Opcode::Other(0x00ff);
        let decoded = SubmitEntry::from_bytes(&entry.to_bytes());
        assert_eq!(decoded.opcode, Opcode::Other(0x00ff));
        assert_eq!(Opcode::from(1), Opcode::Write);
    }

    prop_compose! {
        fn arb_submit()(
            id in any::<u32>(),
            opcode in any::<u16>(),
            flags in any::<u16>(),
            local_key in any::<u64>(),
            remote_key in any::<u64>(),
            length in any::<u64>(),
        ) -> SubmitEntry {
            SubmitEntry { id, opcode: Opcode::from(opcode), flags, local_key, remote_key, length }
        }
    }

    proptest! {
        #[test]
        fn submit_entry_round_trips(entry in arb_submit()) {
            prop_assert_eq!(SubmitEntry::from_bytes(&entry.to_bytes()), entry);
        }

        #[test]
        fn completion_decode_preserves_every_byte(raw in prop::array::uniform32(any::<u8>())) {
            prop_assert_eq!(CompletionEntry::from_bytes(&raw).to_bytes(), raw);
        }
    }
}
