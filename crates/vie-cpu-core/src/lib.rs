//! Software emulation of the guest instructions a hypervisor intercepts.
//!
//! [`Emulator`] decodes one instruction at the guest's IP, applies it to a
//! [`VCpu`] through guarded, page-table-aware memory accesses ([`PagingBus`])
//! and reports the outcome as an [`EmulationStatus`]. Faults are reported,
//! never injected.

mod config;
mod emulator;
mod error;
mod operand;
mod paging_bus;
mod vcpu;

pub mod interp;

pub use config::EmulatorConfig;
pub use emulator::{EmulationStatus, Emulator, FaultDisposition};
pub use error::{AccessError, ConfigError, ExecError, Fault};
pub use operand::{effective_offset, OperandAccess};
pub use paging_bus::{PagingBus, MAX_ACCESS_SIZE, PAGE_SIZE};
pub use vcpu::{RFlags, Segment, VCpu};

pub use vie_mmu;
pub use vie_x86;
