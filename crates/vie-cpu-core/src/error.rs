use thiserror::Error;
use vie_mmu::{GP_VECTOR, PF_VECTOR};

/// An architectural exception raised while emulating an instruction.
///
/// The emulator only reports these; delivering them is up to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
#[error("exception vector {vector} (error code {error_code:?}, address {address:#x})")]
pub struct Fault {
    pub vector: u8,
    pub error_code: Option<u32>,
    /// Faulting linear address for #PF (the value destined for CR2); 0 otherwise.
    pub address: u64,
}

impl Fault {
    pub const INVALID_OPCODE: u8 = 6;

    #[inline]
    pub const fn new(vector: u8, error_code: Option<u32>) -> Self {
        Self {
            vector,
            error_code,
            address: 0,
        }
    }

    /// #GP(0).
    #[inline]
    pub const fn gp0() -> Self {
        Self::new(GP_VECTOR, Some(0))
    }

    /// #UD.
    #[inline]
    pub const fn ud() -> Self {
        Self::new(Self::INVALID_OPCODE, None)
    }

    #[inline]
    pub const fn page_fault(address: u64, error_code: u32) -> Self {
        Self {
            vector: PF_VECTOR,
            error_code: Some(error_code),
            address,
        }
    }

    #[inline]
    pub const fn is_page_fault(&self) -> bool {
        self.vector == PF_VECTOR
    }
}

/// Failure of a guarded guest memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AccessError {
    #[error("unsupported access size {0}")]
    UnsupportedSize(usize),
    #[error("access of {len} bytes at {linear:#x} wraps the address space")]
    AddressOverflow { linear: u64, len: usize },
    #[error("translation of {linear:#x} failed: {fault}")]
    Translation { linear: u64, fault: Fault },
}

/// Why executing a decoded instruction stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ExecError {
    #[error(transparent)]
    Fault(#[from] Fault),
    /// The instruction is known, but this form of it is not emulated.
    #[error("unsupported instruction form: {0}")]
    Unsupported(&'static str),
}

impl From<AccessError> for ExecError {
    fn from(err: AccessError) -> Self {
        match err {
            AccessError::Translation { fault, .. } => ExecError::Fault(fault),
            // A wrapping linear range is a non-canonical access.
            AccessError::AddressOverflow { .. } => ExecError::Fault(Fault::gp0()),
            AccessError::UnsupportedSize(_) => ExecError::Unsupported("memory access size"),
        }
    }
}

/// Rejected [`crate::EmulatorConfig`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("max_phys_bits must be in 32..=52 (got {0})")]
    MaxPhysBits(u8),
}
