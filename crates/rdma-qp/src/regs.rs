//! Data mover AXI-Lite register block.
//!
//! All registers are 32 bits wide and live at `index * 4` from the block base.

use bitflags::bitflags;

/// Bytes of register space decoded by the data mover.
pub const REGISTER_BLOCK_LEN: u64 = 0x60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reg {
    Ctrl,
    SqBaseLo,
    SqBaseHi,
    SqSize,
    /// Written by hardware as it drains the SQ.
    SqHead,
    /// Software doorbell.
    SqTail,
    /// Decoded but unused; the doorbell is a write to `SqTail`.
    SqDoorbell,
    CqBaseLo,
    CqBaseHi,
    CqSize,
    /// Software acknowledge.
    CqHead,
    /// Written by hardware as it posts completions.
    CqTail,
    CqDoorbell,
}

impl Reg {
    pub const ALL: [Reg; 13] = [
        Reg::Ctrl,
        Reg::SqBaseLo,
        Reg::SqBaseHi,
        Reg::SqSize,
        Reg::SqHead,
        Reg::SqTail,
        Reg::SqDoorbell,
        Reg::CqBaseLo,
        Reg::CqBaseHi,
        Reg::CqSize,
        Reg::CqHead,
        Reg::CqTail,
        Reg::CqDoorbell,
    ];

    pub const fn index(self) -> u32 {
        match self {
            Reg::Ctrl => 0,
            Reg::SqBaseLo => 8,
            Reg::SqBaseHi => 9,
            Reg::SqSize => 10,
            Reg::SqHead => 11,
            Reg::SqTail => 12,
            Reg::SqDoorbell => 13,
            Reg::CqBaseLo => 16,
            Reg::CqBaseHi => 17,
            Reg::CqSize => 18,
            Reg::CqHead => 19,
            Reg::CqTail => 20,
            Reg::CqDoorbell => 21,
        }
    }

    pub const fn offset(self) -> u64 {
        self.index() as u64 * 4
    }

    pub fn from_offset(offset: u64) -> Option<Reg> {
        if offset % 4 != 0 {
            return None;
        }
        Reg::ALL.into_iter().find(|r| r.offset() == offset)
    }

    /// Registers whose value is owned by the engine; software writes are ignored.
    pub const fn is_hardware_owned(self) -> bool {
        matches!(self, Reg::SqHead | Reg::CqTail)
    }

    pub const fn name(self) -> &'static str {
        match self {
            Reg::Ctrl => "CTRL",
            Reg::SqBaseLo => "SQ_BASE_LO",
            Reg::SqBaseHi => "SQ_BASE_HI",
            Reg::SqSize => "SQ_SIZE",
            Reg::SqHead => "SQ_HEAD",
            Reg::SqTail => "SQ_TAIL",
            Reg::SqDoorbell => "SQ_DOORBELL",
            Reg::CqBaseLo => "CQ_BASE_LO",
            Reg::CqBaseHi => "CQ_BASE_HI",
            Reg::CqSize => "CQ_SIZE",
            Reg::CqHead => "CQ_HEAD",
            Reg::CqTail => "CQ_TAIL",
            Reg::CqDoorbell => "CQ_DOORBELL",
        }
    }
}

impl std::fmt::Display for Reg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct CtrlFlags: u32 {
        const GLOBAL_ENABLE = 1 << 0;
        // Present in the register map, never driven by this driver (completions are polled).
        const IRQ_ACK = 1 << 1;
    }
}

/// 32-bit access to the register block.
///
/// `&mut self` on reads too: reading a hardware-owned cursor is an observable bus transaction,
/// and the host board model advances its engine on each one.
pub trait RegisterIo {
    fn read32(&mut self, reg: Reg) -> u32;
    fn write32(&mut self, reg: Reg, value: u32);
}

impl<T: RegisterIo + ?Sized> RegisterIo for &mut T {
    fn read32(&mut self, reg: Reg) -> u32 {
        (**self).read32(reg)
    }

    fn write32(&mut self, reg: Reg, value: u32) {
        (**self).write32(reg, value)
    }
}
