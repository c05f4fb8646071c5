use vie_x86::{MemoryOperand, Operand, OperandKind, RegisterId};

use crate::error::ExecError;
use crate::paging_bus::PagingBus;
use crate::vcpu::{self, mask_for_width, VCpu};

/// Reading and writing decoded operands against a vCPU.
///
/// `read` loads the operand into [`Operand::value`] (masked to the operand's
/// width); `write` stores `value` back.
pub trait OperandAccess {
    fn read<V: VCpu>(&mut self, bus: &mut PagingBus<'_, V>) -> Result<u64, ExecError>;
    fn write<V: VCpu>(&self, bus: &mut PagingBus<'_, V>) -> Result<(), ExecError>;
}

/// Segment offset of a memory operand under the current register values.
pub fn effective_offset<V: VCpu>(mem: &MemoryOperand, cpu: &V) -> u64 {
    mem.offset(|reg| cpu.gpr(reg))
}

fn check_memory_width(width: u8) -> Result<usize, ExecError> {
    match width {
        1 | 2 | 4 | 8 => Ok(width as usize),
        0 => Err(ExecError::Unsupported("memory operand without an access")),
        _ => Err(ExecError::Unsupported("memory operand wider than 8 bytes")),
    }
}

fn read_memory<V: VCpu>(mem: &MemoryOperand, bus: &mut PagingBus<'_, V>) -> Result<u64, ExecError> {
    let len = check_memory_width(mem.width)?;
    let offset = effective_offset(mem, bus.cpu());
    let mut bytes = [0u8; 8];
    bus.read_logical(mem.segment, offset, mem.address_size, &mut bytes[..len])?;
    Ok(u64::from_le_bytes(bytes))
}

fn write_memory<V: VCpu>(
    mem: &MemoryOperand,
    value: u64,
    bus: &mut PagingBus<'_, V>,
) -> Result<(), ExecError> {
    let len = check_memory_width(mem.width)?;
    let offset = effective_offset(mem, bus.cpu());
    let bytes = value.to_le_bytes();
    bus.write_logical(mem.segment, offset, mem.address_size, &bytes[..len])?;
    Ok(())
}

impl OperandAccess for Operand {
    fn read<V: VCpu>(&mut self, bus: &mut PagingBus<'_, V>) -> Result<u64, ExecError> {
        let value = match self.kind {
            OperandKind::Register { width, id } => match id {
                RegisterId::Gpr(reg) => vcpu::read_gpr(bus.cpu(), reg, width),
                RegisterId::GprHigh8(reg) => vcpu::read_gpr_high8(bus.cpu(), reg),
                RegisterId::Control(n) => bus.cpu().control_register(n)? & mask_for_width(width),
                RegisterId::Debug(n) => bus.cpu().debug_register(n)? & mask_for_width(width),
            },
            OperandKind::SegmentRegister { id } => u64::from(bus.cpu().segment(id).selector),
            OperandKind::Memory(mem) => read_memory(&mem, bus)?,
            OperandKind::Immediate { width, value } => value & mask_for_width(width),
            OperandKind::FarPointer { .. } => {
                return Err(ExecError::Unsupported("far pointer operand"))
            }
        };
        self.value = value;
        Ok(value)
    }

    fn write<V: VCpu>(&self, bus: &mut PagingBus<'_, V>) -> Result<(), ExecError> {
        match self.kind {
            OperandKind::Register { width, id } => match id {
                RegisterId::Gpr(reg) => vcpu::write_gpr(bus.cpu_mut(), reg, width, self.value),
                RegisterId::GprHigh8(reg) => vcpu::write_gpr_high8(bus.cpu_mut(), reg, self.value),
                RegisterId::Control(n) => {
                    bus.cpu_mut().set_control_register(n, self.value & mask_for_width(width))?;
                    if matches!(n, 0 | 3 | 4) {
                        tracing::debug!(cr = n, "control register write, flushing TLB");
                        bus.mmu_mut().flush();
                    }
                }
                RegisterId::Debug(n) => {
                    bus.cpu_mut().set_debug_register(n, self.value & mask_for_width(width))?
                }
            },
            OperandKind::SegmentRegister { id } => {
                bus.cpu_mut().load_segment(id, self.value as u16)?
            }
            OperandKind::Memory(mem) => write_memory(&mem, self.value, bus)?,
            OperandKind::Immediate { .. } => {
                return Err(ExecError::Unsupported("write to an immediate operand"))
            }
            OperandKind::FarPointer { .. } => {
                return Err(ExecError::Unsupported("far pointer operand"))
            }
        }
        Ok(())
    }
}
