//! Bindings for running on the board: physical addresses are identity-mapped, the register
//! block is device memory and DDR is cached write-back.
//!
//! Cache maintenance uses the AArch64 `DC` instructions by virtual address (64-byte lines on
//! the Cortex-A53). Other targets only get compiler/CPU fences, which is enough for a
//! cache-coherent host but not for the real engine.

use rdma_mem::{Region, CACHE_LINE_SIZE};

use crate::dma::{Barrier, DmaMemory, MemoryFault};
use crate::endpoint::WordBus;
use crate::regs::{Reg, RegisterIo};

/// A window of 32-bit device registers (the data mover's AXI-Lite block, or a BRAM
/// controller).
#[derive(Debug)]
pub struct MmioRegisters {
    base: *mut u32,
}

impl MmioRegisters {
    /// # Safety
    ///
    /// `base` must be the identity-mapped address of a device window at least
    /// [`crate::regs::REGISTER_BLOCK_LEN`] bytes long (or covering every offset later passed to
    /// [`WordBus`]), mapped as device memory, and not aliased by another live handle.
    pub unsafe fn new(base: usize) -> Self {
        Self {
            base: base as *mut u32,
        }
    }

    fn word_ptr(&self, offset: u64) -> *mut u32 {
        self.base.wrapping_byte_add(offset as usize)
    }
}

impl RegisterIo for MmioRegisters {
    fn read32(&mut self, reg: Reg) -> u32 {
        // SAFETY: `new`'s contract covers the whole register block.
        unsafe { self.word_ptr(reg.offset()).read_volatile() }
    }

    fn write32(&mut self, reg: Reg, value: u32) {
        // SAFETY: as above.
        unsafe { self.word_ptr(reg.offset()).write_volatile(value) }
    }
}

impl WordBus for MmioRegisters {
    fn read_word(&mut self, offset: u64) -> u32 {
        // SAFETY: `new`'s contract covers every offset used through `WordBus`.
        unsafe { self.word_ptr(offset & !3).read_volatile() }
    }

    fn write_word(&mut self, offset: u64, value: u32) {
        // SAFETY: as above.
        unsafe { self.word_ptr(offset & !3).write_volatile(value) }
    }
}

/// DDR shared with the engine, accessed through the CPU's (cached) identity mapping.
#[derive(Debug)]
pub struct IdentityMappedDdr {
    windows: Vec<Region>,
}

impl IdentityMappedDdr {
    /// # Safety
    ///
    /// Every window must be identity-mapped normal memory, reserved for the rings and
    /// buffers, and not otherwise referenced by Rust code for the lifetime of the value.
    pub unsafe fn new(windows: Vec<Region>) -> Self {
        Self { windows }
    }

    fn check(&self, addr: u64, len: usize) -> Result<(), MemoryFault> {
        if self.windows.iter().any(|w| w.contains(addr, len as u64)) {
            Ok(())
        } else {
            Err(MemoryFault::Unmapped { addr, len })
        }
    }
}

impl DmaMemory for IdentityMappedDdr {
    fn read(&mut self, addr: u64, dst: &mut [u8]) -> Result<(), MemoryFault> {
        self.check(addr, dst.len())?;
        let src = addr as usize as *const u8;
        for (i, b) in dst.iter_mut().enumerate() {
            // SAFETY: `check` keeps the access inside a window `new` vouched for.
            *b = unsafe { src.add(i).read_volatile() };
        }
        Ok(())
    }

    fn write(&mut self, addr: u64, src: &[u8]) -> Result<(), MemoryFault> {
        self.check(addr, src.len())?;
        let dst = addr as usize as *mut u8;
        for (i, b) in src.iter().enumerate() {
            // SAFETY: as above.
            unsafe { dst.add(i).write_volatile(*b) };
        }
        Ok(())
    }

    fn flush_range(&mut self, addr: u64, len: u64) -> Result<(), MemoryFault> {
        let span = Region::new(addr, len).align_outward(CACHE_LINE_SIZE);
        let mut line = span.base;
        while line < span.base + span.len {
            arch::clean_invalidate_line(line);
            line += CACHE_LINE_SIZE;
        }
        arch::dsb_sy();
        Ok(())
    }

    fn invalidate_range(&mut self, addr: u64, len: u64) -> Result<(), MemoryFault> {
        let exact = Region::new(addr, len);
        let span = exact.align_outward(CACHE_LINE_SIZE);
        let mut line = span.base;
        while line < span.base + span.len {
            // Lines shared with bytes outside the range are cleaned, not discarded.
            if exact.contains(line, CACHE_LINE_SIZE) {
                arch::invalidate_line(line);
            } else {
                arch::clean_invalidate_line(line);
            }
            line += CACHE_LINE_SIZE;
        }
        arch::dsb_sy();
        Ok(())
    }

    fn barrier(&mut self, kind: Barrier) {
        match kind {
            Barrier::Store => arch::dsb_st(),
            Barrier::Load => arch::dsb_ld(),
            Barrier::Full => arch::dsb_sy(),
        }
    }
}

#[cfg(target_arch = "aarch64")]
mod arch {
    use std::arch::asm;

    #[inline(always)]
    pub fn clean_invalidate_line(addr: u64) {
        // SAFETY: cache maintenance by VA has no memory-safety effect on Rust-visible data.
        unsafe { asm!("dc civac, {addr}", addr = in(reg) addr, options(nostack, preserves_flags)) }
    }

    #[inline(always)]
    pub fn invalidate_line(addr: u64) {
        // SAFETY: only called for lines wholly inside a DMA window.
        unsafe { asm!("dc ivac, {addr}", addr = in(reg) addr, options(nostack, preserves_flags)) }
    }

    #[inline(always)]
    pub fn dsb_sy() {
        // SAFETY: barrier only.
        unsafe { asm!("dsb sy", options(nostack, preserves_flags)) }
    }

    #[inline(always)]
    pub fn dsb_st() {
        // SAFETY: barrier only.
        unsafe { asm!("dsb st", options(nostack, preserves_flags)) }
    }

    #[inline(always)]
    pub fn dsb_ld() {
        // SAFETY: barrier only.
        unsafe { asm!("dsb ld", options(nostack, preserves_flags)) }
    }
}

#[cfg(not(target_arch = "aarch64"))]
mod arch {
    use std::sync::atomic::{fence, Ordering};

    #[inline(always)]
    pub fn clean_invalidate_line(_addr: u64) {}

    #[inline(always)]
    pub fn invalidate_line(_addr: u64) {}

    #[inline(always)]
    pub fn dsb_sy() {
        fence(Ordering::SeqCst);
    }

    #[inline(always)]
    pub fn dsb_st() {
        fence(Ordering::Release);
    }

    #[inline(always)]
    pub fn dsb_ld() {
        fence(Ordering::Acquire);
    }
}
