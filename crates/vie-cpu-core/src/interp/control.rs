use vie_x86::{AddressSize, CpuMode, Gpr, Instruction, Mnemonic, OperandKind, SegmentReg};

use crate::error::ExecError;
use crate::interp::Flow;
use crate::operand::OperandAccess;
use crate::paging_bus::PagingBus;
use crate::vcpu::{self, mask_for_width, RFlags, VCpu};

fn stack_address_size(stack_size: u8) -> AddressSize {
    match stack_size {
        2 => AddressSize::A16,
        4 => AddressSize::A32,
        _ => AddressSize::A64,
    }
}

/// Operand size of near CALL/RET and of pushes that have no natural width.
///
/// 64-bit mode defaults to 8 bytes. For near branches the decoder has already
/// settled whether 0x66 applies on this vendor.
fn stack_operand_size(inst: &Instruction, mode: CpuMode) -> u8 {
    match mode {
        CpuMode::Bit64 if inst.operand_size != 2 => 8,
        _ => inst.operand_size,
    }
}

fn push_value<V: VCpu>(
    inst: &Instruction,
    bus: &mut PagingBus<'_, V>,
    size: u8,
    value: u64,
) -> Result<(), ExecError> {
    let stack = stack_address_size(inst.stack_size);
    let sp = vcpu::read_gpr(bus.cpu(), Gpr::Rsp, inst.stack_size);
    let new_sp = sp.wrapping_sub(u64::from(size)) & stack.mask();
    let bytes = value.to_le_bytes();
    bus.write_logical(SegmentReg::Ss, new_sp, stack, &bytes[..size as usize])?;
    vcpu::write_gpr(bus.cpu_mut(), Gpr::Rsp, inst.stack_size, new_sp);
    Ok(())
}

/// Reads the top of stack; returns the value and the stack pointer after the pop.
fn peek_pop<V: VCpu>(
    inst: &Instruction,
    bus: &mut PagingBus<'_, V>,
    size: u8,
) -> Result<(u64, u64), ExecError> {
    let stack = stack_address_size(inst.stack_size);
    let sp = vcpu::read_gpr(bus.cpu(), Gpr::Rsp, inst.stack_size);
    let mut bytes = [0u8; 8];
    bus.read_logical(SegmentReg::Ss, sp, stack, &mut bytes[..size as usize])?;
    let new_sp = sp.wrapping_add(u64::from(size)) & stack.mask();
    Ok((u64::from_le_bytes(bytes), new_sp))
}

fn element_size(inst: &Instruction, mode: CpuMode) -> u8 {
    match inst.operand(0).kind {
        OperandKind::SegmentRegister { .. } => stack_operand_size(inst, mode),
        _ => inst.operand(0).width(),
    }
}

pub(super) fn exec_push<V: VCpu>(
    inst: &mut Instruction,
    bus: &mut PagingBus<'_, V>,
) -> Result<(), ExecError> {
    let mode = bus.cpu().mode();
    let size = element_size(inst, mode);
    let value = inst.operand_mut(0).read(bus)?;
    push_value(inst, bus, size, value)
}

pub(super) fn exec_pop<V: VCpu>(
    inst: &mut Instruction,
    bus: &mut PagingBus<'_, V>,
) -> Result<(), ExecError> {
    let mode = bus.cpu().mode();
    let size = element_size(inst, mode);
    let (value, new_sp) = peek_pop(inst, bus, size)?;

    // A memory destination addressed through rSP sees the incremented value.
    let old_sp = bus.cpu().gpr(Gpr::Rsp);
    vcpu::write_gpr(bus.cpu_mut(), Gpr::Rsp, inst.stack_size, new_sp);
    let dst = inst.operand_mut(0);
    dst.value = value;
    if let Err(err) = dst.write(bus) {
        bus.cpu_mut().set_gpr(Gpr::Rsp, old_sp);
        return Err(err);
    }
    Ok(())
}

fn branch_target<V: VCpu>(
    inst: &mut Instruction,
    bus: &mut PagingBus<'_, V>,
) -> Result<u64, ExecError> {
    if inst.far_branch {
        return Err(ExecError::Unsupported("far branch"));
    }
    let mode = bus.cpu().mode();
    let size = stack_operand_size(inst, mode);
    let target = inst.operand_mut(0).read(bus)?;
    Ok(target & mask_for_width(size) & mode.ip_mask())
}

pub(super) fn exec_jmp<V: VCpu>(
    inst: &mut Instruction,
    bus: &mut PagingBus<'_, V>,
) -> Result<Flow, ExecError> {
    Ok(Flow::Jump(branch_target(inst, bus)?))
}

pub(super) fn exec_call<V: VCpu>(
    inst: &mut Instruction,
    bus: &mut PagingBus<'_, V>,
) -> Result<Flow, ExecError> {
    let target = branch_target(inst, bus)?;
    let mode = bus.cpu().mode();
    let size = stack_operand_size(inst, mode);
    let return_ip = inst.next_ip(mode.ip_mask());
    push_value(inst, bus, size, return_ip)?;
    Ok(Flow::Jump(target))
}

pub(super) fn exec_ret<V: VCpu>(
    inst: &mut Instruction,
    bus: &mut PagingBus<'_, V>,
) -> Result<Flow, ExecError> {
    let mode = bus.cpu().mode();
    let size = stack_operand_size(inst, mode);
    let (target, mut new_sp) = peek_pop(inst, bus, size)?;
    if inst.operand_count() == 1 {
        let release = inst.operand_mut(0).read(bus)?;
        new_sp = new_sp.wrapping_add(release) & stack_address_size(inst.stack_size).mask();
    }
    vcpu::write_gpr(bus.cpu_mut(), Gpr::Rsp, inst.stack_size, new_sp);
    Ok(Flow::Jump(target & mask_for_width(size) & mode.ip_mask()))
}

/// CLC STC CMC CLD STD.
pub(super) fn exec_flag_op<V: VCpu>(mnemonic: Mnemonic, cpu: &mut V) {
    let mut rflags = RFlags::from_bits_retain(cpu.rflags());
    match mnemonic {
        Mnemonic::Clc => rflags.remove(RFlags::CF),
        Mnemonic::Stc => rflags.insert(RFlags::CF),
        Mnemonic::Cmc => rflags.toggle(RFlags::CF),
        Mnemonic::Cld => rflags.remove(RFlags::DF),
        Mnemonic::Std => rflags.insert(RFlags::DF),
        other => unreachable!("{other:?} is not a flag instruction"),
    }
    cpu.set_rflags(rflags.bits());
}
