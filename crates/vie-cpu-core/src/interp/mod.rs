//! Instruction semantics.
//!
//! [`exec`] applies one decoded instruction to the vCPU. It never advances IP
//! itself; the emulator decides that from the returned [`Flow`] and the
//! repeat prefix.

pub mod alu;
mod control;
mod data;
pub(crate) mod string;

use vie_x86::{Instruction, Mnemonic};

use crate::error::ExecError;
use crate::paging_bus::PagingBus;
use crate::vcpu::VCpu;

/// Where execution continues after an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Fall through to the next instruction.
    Next,
    /// The instruction loaded IP with this value.
    Jump(u64),
}

/// Mnemonics [`exec`] handles.
pub fn is_implemented(mnemonic: Mnemonic) -> bool {
    use Mnemonic::*;
    matches!(
        mnemonic,
        Mov | Movzx
            | Movsx
            | Movsxd
            | Lea
            | Xchg
            | Push
            | Pop
            | Add
            | Adc
            | Sub
            | Sbb
            | And
            | Or
            | Xor
            | Cmp
            | Test
            | Inc
            | Dec
            | Neg
            | Not
            | Movsb
            | Movsw
            | Movsd
            | Movsq
            | Stosb
            | Stosw
            | Stosd
            | Stosq
            | Lodsb
            | Lodsw
            | Lodsd
            | Lodsq
            | Cmpsb
            | Cmpsw
            | Cmpsd
            | Cmpsq
            | Scasb
            | Scasw
            | Scasd
            | Scasq
            | Clc
            | Stc
            | Cmc
            | Cld
            | Std
            | Nop
            | Jmp
            | Call
            | Ret
    )
}

pub fn exec<V: VCpu>(inst: &mut Instruction, bus: &mut PagingBus<'_, V>) -> Result<Flow, ExecError> {
    use Mnemonic::*;
    match inst.mnemonic {
        Mov | Movzx | Movsx | Movsxd => data::exec_mov(inst, bus)?,
        Lea => data::exec_lea(inst, bus)?,
        Xchg => data::exec_xchg(inst, bus)?,
        Push => control::exec_push(inst, bus)?,
        Pop => control::exec_pop(inst, bus)?,

        Add | Adc | Sub | Sbb | And | Or | Xor | Cmp | Test => alu::exec_binary(inst, bus)?,
        Inc | Dec | Neg | Not => alu::exec_unary(inst, bus)?,

        m if m.is_string() && !matches!(m, Insb | Insw | Insd | Outsb | Outsw | Outsd) => {
            string::exec_string(inst, bus)?
        }

        Clc | Stc | Cmc | Cld | Std => control::exec_flag_op(inst.mnemonic, bus.cpu_mut()),
        Nop => {}

        Jmp => return control::exec_jmp(inst, bus),
        Call => return control::exec_call(inst, bus),
        Ret => return control::exec_ret(inst, bus),

        _ => return Err(ExecError::Unsupported("mnemonic")),
    }
    Ok(Flow::Next)
}
