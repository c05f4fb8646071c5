//! x86/x86-64 decoding for the instruction emulator.
//!
//! `iced-x86` does the byte-level work; this crate turns its output into a
//! small neutral model ([`Instruction`], [`Operand`], [`Mnemonic`]) so the rest
//! of the emulator does not depend on `iced-x86` directly.

mod decoder;
mod inst;
mod mnemonic;
mod regs;

pub use decoder::{DecodeError, Decoder, MAX_INST_LEN};
pub use inst::{
    AddressSize, Instruction, MemoryOperand, Operand, OperandKind, OperandList, RepPrefix,
    MAX_OPERANDS,
};
pub use mnemonic::Mnemonic;
pub use regs::{Gpr, RegisterId, SegmentReg};

/// Code size of the vCPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum CpuMode {
    /// Real mode, virtual-8086 mode, or 16-bit protected mode.
    Bit16,
    /// 32-bit protected mode or compatibility mode.
    Bit32,
    /// 64-bit long mode.
    Bit64,
}

impl CpuMode {
    #[inline]
    pub const fn bitness(self) -> u32 {
        match self {
            CpuMode::Bit16 => 16,
            CpuMode::Bit32 => 32,
            CpuMode::Bit64 => 64,
        }
    }

    #[inline]
    pub const fn ip_mask(self) -> u64 {
        match self {
            CpuMode::Bit16 => 0xffff,
            CpuMode::Bit32 => 0xffff_ffff,
            CpuMode::Bit64 => u64::MAX,
        }
    }

    #[inline]
    pub const fn default_address_size(self) -> AddressSize {
        match self {
            CpuMode::Bit16 => AddressSize::A16,
            CpuMode::Bit32 => AddressSize::A32,
            CpuMode::Bit64 => AddressSize::A64,
        }
    }

    #[inline]
    pub const fn default_operand_size(self) -> u8 {
        match self {
            CpuMode::Bit16 => 2,
            CpuMode::Bit32 | CpuMode::Bit64 => 4,
        }
    }

    /// Stack address size in bytes. SS.B is not consulted: 32-bit code is
    /// assumed to run on a 32-bit stack.
    #[inline]
    pub const fn stack_size(self) -> u8 {
        match self {
            CpuMode::Bit16 => 2,
            CpuMode::Bit32 => 4,
            CpuMode::Bit64 => 8,
        }
    }
}

/// CPU vendor whose decoding quirks to follow.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum CpuVendor {
    #[default]
    Intel,
    Amd,
}
