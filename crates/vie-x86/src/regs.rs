//! Neutral register identifiers.

use core::fmt;

/// General-purpose register, numbered the way ModRM/REX encode them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum Gpr {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Gpr {
    pub const ALL: [Gpr; 16] = [
        Gpr::Rax,
        Gpr::Rcx,
        Gpr::Rdx,
        Gpr::Rbx,
        Gpr::Rsp,
        Gpr::Rbp,
        Gpr::Rsi,
        Gpr::Rdi,
        Gpr::R8,
        Gpr::R9,
        Gpr::R10,
        Gpr::R11,
        Gpr::R12,
        Gpr::R13,
        Gpr::R14,
        Gpr::R15,
    ];

    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Stack and frame pointers default to the SS segment.
    #[inline]
    pub const fn is_stack_pointer(self) -> bool {
        matches!(self, Gpr::Rsp | Gpr::Rbp)
    }
}

impl fmt::Display for Gpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Gpr::Rax => "rax",
            Gpr::Rcx => "rcx",
            Gpr::Rdx => "rdx",
            Gpr::Rbx => "rbx",
            Gpr::Rsp => "rsp",
            Gpr::Rbp => "rbp",
            Gpr::Rsi => "rsi",
            Gpr::Rdi => "rdi",
            Gpr::R8 => "r8",
            Gpr::R9 => "r9",
            Gpr::R10 => "r10",
            Gpr::R11 => "r11",
            Gpr::R12 => "r12",
            Gpr::R13 => "r13",
            Gpr::R14 => "r14",
            Gpr::R15 => "r15",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum SegmentReg {
    Es = 0,
    Cs = 1,
    Ss = 2,
    Ds = 3,
    Fs = 4,
    Gs = 5,
}

impl SegmentReg {
    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for SegmentReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SegmentReg::Es => "es",
            SegmentReg::Cs => "cs",
            SegmentReg::Ss => "ss",
            SegmentReg::Ds => "ds",
            SegmentReg::Fs => "fs",
            SegmentReg::Gs => "gs",
        };
        f.write_str(s)
    }
}

/// Register named by a [`crate::OperandKind::Register`] operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RegisterId {
    /// Low `width` bytes of a general-purpose register.
    Gpr(Gpr),
    /// AH/CH/DH/BH: bits 8..16 of RAX/RCX/RDX/RBX.
    GprHigh8(Gpr),
    /// CRn.
    Control(u8),
    /// DRn.
    Debug(u8),
}

impl fmt::Display for RegisterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegisterId::Gpr(gpr) => write!(f, "{gpr}"),
            RegisterId::GprHigh8(gpr) => write!(f, "{gpr}.h"),
            RegisterId::Control(n) => write!(f, "cr{n}"),
            RegisterId::Debug(n) => write!(f, "dr{n}"),
        }
    }
}
