use bitflags::bitflags;
use vie_mmu::PagingSource;
use vie_x86::{CpuMode, Gpr, SegmentReg};

use crate::error::Fault;

bitflags! {
    /// Architectural RFLAGS bits the emulator reads or writes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RFlags: u64 {
        const CF = 1 << 0;
        /// Reserved bit that always reads as 1.
        const FIXED1 = 1 << 1;
        const PF = 1 << 2;
        const AF = 1 << 4;
        const ZF = 1 << 6;
        const SF = 1 << 7;
        const TF = 1 << 8;
        const IF = 1 << 9;
        const DF = 1 << 10;
        const OF = 1 << 11;
        const AC = 1 << 18;

        const _ = !0;
    }
}

/// Visible part of a segment register.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub selector: u16,
    pub base: u64,
}

/// The virtual CPU the emulator operates on.
///
/// Implementations are backed by whatever holds the guest register file (a
/// VMCS/VMCB mirror, a test fixture). Guest physical memory comes in through
/// the [`PagingSource`] supertrait.
pub trait VCpu: PagingSource {
    fn mode(&self) -> CpuMode;
    fn cpl(&self) -> u8;

    /// Full 64-bit value of a general-purpose register.
    fn gpr(&self, reg: Gpr) -> u64;
    fn set_gpr(&mut self, reg: Gpr, value: u64);

    fn rip(&self) -> u64;
    fn set_rip(&mut self, rip: u64);

    fn rflags(&self) -> u64;
    fn set_rflags(&mut self, rflags: u64);

    fn segment(&self, seg: SegmentReg) -> Segment;
    /// Load a segment register the way `MOV Sreg`/`POP Sreg` would, including
    /// whatever descriptor checks the implementation performs.
    fn load_segment(&mut self, seg: SegmentReg, selector: u16) -> Result<(), Fault>;

    fn control_register(&self, index: u8) -> Result<u64, Fault>;
    fn set_control_register(&mut self, index: u8, value: u64) -> Result<(), Fault>;
    fn debug_register(&self, index: u8) -> Result<u64, Fault>;
    fn set_debug_register(&mut self, index: u8, value: u64) -> Result<(), Fault>;

    /// Whether an exception can be injected into the guest right now.
    fn can_inject_exception(&self) -> bool;
}

#[inline]
pub(crate) fn mask_for_width(width: u8) -> u64 {
    match width {
        1 => 0xff,
        2 => 0xffff,
        4 => 0xffff_ffff,
        _ => u64::MAX,
    }
}

/// Read the low `width` bytes of `reg`.
pub(crate) fn read_gpr<V: VCpu + ?Sized>(cpu: &V, reg: Gpr, width: u8) -> u64 {
    cpu.gpr(reg) & mask_for_width(width)
}

/// Read AH/CH/DH/BH.
pub(crate) fn read_gpr_high8<V: VCpu + ?Sized>(cpu: &V, reg: Gpr) -> u64 {
    (cpu.gpr(reg) >> 8) & 0xff
}

/// Write the low `width` bytes of `reg`.
///
/// 8- and 16-bit writes merge into the old value. 32-bit writes zero-extend
/// in 64-bit mode and merge otherwise.
pub(crate) fn write_gpr<V: VCpu + ?Sized>(cpu: &mut V, reg: Gpr, width: u8, value: u64) {
    let value = match width {
        8 => value,
        4 if cpu.mode() == CpuMode::Bit64 => value & 0xffff_ffff,
        _ => {
            let mask = mask_for_width(width);
            (cpu.gpr(reg) & !mask) | (value & mask)
        }
    };
    cpu.set_gpr(reg, value);
}

pub(crate) fn write_gpr_high8<V: VCpu + ?Sized>(cpu: &mut V, reg: Gpr, value: u64) {
    let old = cpu.gpr(reg);
    cpu.set_gpr(reg, (old & !0xff00) | ((value & 0xff) << 8));
}
