use core::fmt;

use crate::regs::{Gpr, RegisterId, SegmentReg};
use crate::Mnemonic;

/// Most operands any materialized instruction carries (e.g. 3-operand IMUL
/// plus slack for implicit operands).
pub const MAX_OPERANDS: usize = 4;

/// Effective address size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum AddressSize {
    A16,
    A32,
    A64,
}

impl AddressSize {
    #[inline]
    pub const fn bytes(self) -> u8 {
        match self {
            AddressSize::A16 => 2,
            AddressSize::A32 => 4,
            AddressSize::A64 => 8,
        }
    }

    #[inline]
    pub const fn mask(self) -> u64 {
        match self {
            AddressSize::A16 => 0xffff,
            AddressSize::A32 => 0xffff_ffff,
            AddressSize::A64 => u64::MAX,
        }
    }
}

/// Repeat prefix as it applies to the decoded instruction.
///
/// Only string instructions carry anything but [`RepPrefix::None`]; F2/F3 on
/// other opcodes are mandatory prefixes or ignored.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RepPrefix {
    #[default]
    None,
    Rep,
    /// REPE/REPZ on CMPS/SCAS.
    RepEquals,
    /// REPNE/REPNZ on CMPS/SCAS.
    RepNotEquals,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MemoryOperand {
    /// Access width in bytes (0 when the instruction never touches memory, LEA).
    pub width: u8,
    pub segment: SegmentReg,
    pub base: Option<Gpr>,
    pub index: Option<Gpr>,
    pub scale: u8,
    /// Already masked to `address_size`. RIP-relative operands carry the
    /// absolute target here and no base.
    pub displacement: i64,
    pub address_size: AddressSize,
}

impl MemoryOperand {
    /// Segment offset of the operand, given the current GPR values.
    pub fn offset(&self, mut gpr: impl FnMut(Gpr) -> u64) -> u64 {
        let mut ea = self.displacement as u64;
        if let Some(base) = self.base {
            ea = ea.wrapping_add(gpr(base));
        }
        if let Some(index) = self.index {
            ea = ea.wrapping_add(gpr(index).wrapping_mul(u64::from(self.scale)));
        }
        ea & self.address_size.mask()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum OperandKind {
    Register { width: u8, id: RegisterId },
    SegmentRegister { id: SegmentReg },
    Memory(MemoryOperand),
    Immediate { width: u8, value: u64 },
    FarPointer { selector: u16, offset: u64 },
}

/// One operand plus the scalar it was read into / will be written from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Operand {
    pub kind: OperandKind,
    pub value: u64,
}

impl Default for Operand {
    fn default() -> Self {
        Self::new(OperandKind::Immediate { width: 0, value: 0 })
    }
}

impl Operand {
    #[inline]
    pub const fn new(kind: OperandKind) -> Self {
        Self { kind, value: 0 }
    }

    /// Width in bytes.
    pub fn width(&self) -> u8 {
        match self.kind {
            OperandKind::Register { width, .. } => width,
            OperandKind::SegmentRegister { .. } => 2,
            OperandKind::Memory(mem) => mem.width,
            OperandKind::Immediate { width, .. } => width,
            OperandKind::FarPointer { .. } => 0,
        }
    }

    #[inline]
    pub fn memory(&self) -> Option<&MemoryOperand> {
        match &self.kind {
            OperandKind::Memory(mem) => Some(mem),
            _ => None,
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            OperandKind::Register { width, id } => write!(f, "{id}:{width}"),
            OperandKind::SegmentRegister { id } => write!(f, "{id}"),
            OperandKind::Memory(mem) => {
                write!(f, "{}:[", mem.segment)?;
                let mut first = true;
                if let Some(base) = mem.base {
                    write!(f, "{base}")?;
                    first = false;
                }
                if let Some(index) = mem.index {
                    if !first {
                        f.write_str("+")?;
                    }
                    write!(f, "{index}*{}", mem.scale)?;
                    first = false;
                }
                if mem.displacement != 0 || first {
                    if !first {
                        f.write_str("+")?;
                    }
                    write!(f, "{:#x}", mem.displacement as u64 & mem.address_size.mask())?;
                }
                f.write_str("]")
            }
            OperandKind::Immediate { value, .. } => write!(f, "{value:#x}"),
            OperandKind::FarPointer { selector, offset } => write!(f, "{selector:#x}:{offset:#x}"),
        }
    }
}

/// Fixed-capacity, inline operand storage for one instruction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OperandList {
    ops: [Operand; MAX_OPERANDS],
    len: u8,
}

impl OperandList {
    #[track_caller]
    pub fn push(&mut self, op: Operand) {
        let len = self.len as usize;
        assert!(len < MAX_OPERANDS, "decoding assumptions violated: more than {MAX_OPERANDS} operands");
        self.ops[len] = op;
        self.len += 1;
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn as_slice(&self) -> &[Operand] {
        &self.ops[..self.len as usize]
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [Operand] {
        &mut self.ops[..self.len as usize]
    }
}

/// A decoded instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    pub mnemonic: Mnemonic,
    /// Length in bytes; for invalid byte streams, how many bytes were examined.
    pub length: u8,
    /// Address the instruction was decoded at.
    pub ip: u64,
    pub operands: OperandList,
    pub far_branch: bool,
    pub lock: bool,
    pub rep: RepPrefix,
    pub segment_override: Option<SegmentReg>,
    pub address_size: AddressSize,
    /// Effective operand size in bytes.
    pub operand_size: u8,
    /// Stack address size in bytes.
    pub stack_size: u8,
}

impl Instruction {
    #[inline]
    pub fn operand_count(&self) -> usize {
        self.operands.len()
    }

    /// Operand `idx`. Asking for an operand the instruction does not have is a
    /// programming error.
    #[track_caller]
    pub fn operand(&self, idx: usize) -> &Operand {
        match self.operands.as_slice().get(idx) {
            Some(op) => op,
            None => panic!(
                "decoding assumptions violated: {:?} has no operand {idx}",
                self.mnemonic
            ),
        }
    }

    #[track_caller]
    pub fn operand_mut(&mut self, idx: usize) -> &mut Operand {
        let mnemonic = self.mnemonic;
        match self.operands.as_mut_slice().get_mut(idx) {
            Some(op) => op,
            None => panic!("decoding assumptions violated: {mnemonic:?} has no operand {idx}"),
        }
    }

    #[inline]
    pub fn operands(&self) -> &[Operand] {
        self.operands.as_slice()
    }

    /// Address of the following instruction, wrapped to `ip_mask`.
    #[inline]
    pub fn next_ip(&self, ip_mask: u64) -> u64 {
        self.ip.wrapping_add(u64::from(self.length)) & ip_mask
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.rep {
            RepPrefix::None => {}
            RepPrefix::Rep => f.write_str("rep ")?,
            RepPrefix::RepEquals => f.write_str("repe ")?,
            RepPrefix::RepNotEquals => f.write_str("repne ")?,
        }
        write!(f, "{:?}", self.mnemonic)?;
        for (i, op) in self.operands().iter().enumerate() {
            f.write_str(if i == 0 { " " } else { ", " })?;
            write!(f, "{op}")?;
        }
        Ok(())
    }
}
