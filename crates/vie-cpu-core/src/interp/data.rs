use vie_x86::{Instruction, Mnemonic, OperandKind};

use crate::error::ExecError;
use crate::interp::alu::sign_extend;
use crate::operand::{effective_offset, OperandAccess};
use crate::paging_bus::PagingBus;
use crate::vcpu::VCpu;

/// MOV MOVZX MOVSX MOVSXD.
pub(super) fn exec_mov<V: VCpu>(
    inst: &mut Instruction,
    bus: &mut PagingBus<'_, V>,
) -> Result<(), ExecError> {
    let src_width = inst.operand(1).width();
    let mut value = inst.operand_mut(1).read(bus)?;
    if matches!(inst.mnemonic, Mnemonic::Movsx | Mnemonic::Movsxd) {
        value = sign_extend(value, src_width);
    }
    let dst = inst.operand_mut(0);
    dst.value = value;
    dst.write(bus)
}

pub(super) fn exec_lea<V: VCpu>(
    inst: &mut Instruction,
    bus: &mut PagingBus<'_, V>,
) -> Result<(), ExecError> {
    let OperandKind::Memory(mem) = inst.operand(1).kind else {
        return Err(ExecError::Unsupported("lea without a memory operand"));
    };
    let offset = effective_offset(&mem, bus.cpu());
    let dst = inst.operand_mut(0);
    dst.value = offset;
    dst.write(bus)
}

pub(super) fn exec_xchg<V: VCpu>(
    inst: &mut Instruction,
    bus: &mut PagingBus<'_, V>,
) -> Result<(), ExecError> {
    let a = inst.operand_mut(0).read(bus)?;
    let b = inst.operand_mut(1).read(bus)?;
    // Operand 0 is the r/m side; storing it first means a faulting memory
    // write leaves the register untouched.
    let first = inst.operand_mut(0);
    first.value = b;
    first.write(bus)?;
    let second = inst.operand_mut(1);
    second.value = a;
    second.write(bus)
}
