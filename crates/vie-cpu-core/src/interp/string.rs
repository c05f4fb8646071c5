//! One iteration of MOVS/STOS/LODS/CMPS/SCAS.
//!
//! Repetition is driven by the emulator: each call performs a single element
//! and the count register is handled by the caller.

use vie_x86::{AddressSize, Gpr, Instruction, Mnemonic, OperandKind};

use crate::error::ExecError;
use crate::interp::alu;
use crate::operand::OperandAccess;
use crate::paging_bus::PagingBus;
use crate::vcpu::{self, RFlags, VCpu};

/// CX, ECX or RCX depending on the address size.
pub(crate) fn read_count<V: VCpu + ?Sized>(cpu: &V, addr_size: AddressSize) -> u64 {
    vcpu::read_gpr(cpu, Gpr::Rcx, addr_size.bytes())
}

pub(crate) fn write_count<V: VCpu + ?Sized>(cpu: &mut V, addr_size: AddressSize, value: u64) {
    vcpu::write_gpr(cpu, Gpr::Rcx, addr_size.bytes(), value)
}

fn element_size(mnemonic: Mnemonic) -> u8 {
    match mnemonic {
        Mnemonic::Movsb | Mnemonic::Stosb | Mnemonic::Lodsb | Mnemonic::Cmpsb | Mnemonic::Scasb => 1,
        Mnemonic::Movsw | Mnemonic::Stosw | Mnemonic::Lodsw | Mnemonic::Cmpsw | Mnemonic::Scasw => 2,
        Mnemonic::Movsd | Mnemonic::Stosd | Mnemonic::Lodsd | Mnemonic::Cmpsd | Mnemonic::Scasd => 4,
        Mnemonic::Movsq | Mnemonic::Stosq | Mnemonic::Lodsq | Mnemonic::Cmpsq | Mnemonic::Scasq => 8,
        other => unreachable!("{other:?} is not an emulated string instruction"),
    }
}

/// Step rSI/rDI past the element for every string operand the instruction
/// names, in the direction DF selects.
fn advance_pointers<V: VCpu>(inst: &Instruction, bus: &mut PagingBus<'_, V>) {
    let size = u64::from(element_size(inst.mnemonic));
    let df = RFlags::from_bits_retain(bus.cpu().rflags()).contains(RFlags::DF);
    let delta = if df { size.wrapping_neg() } else { size };

    for op in inst.operands() {
        if let OperandKind::Memory(mem) = op.kind {
            let Some(reg) = mem.base else { continue };
            let width = mem.address_size.bytes();
            let cpu = bus.cpu_mut();
            let next = vcpu::read_gpr(&*cpu, reg, width).wrapping_add(delta);
            vcpu::write_gpr(cpu, reg, width, next);
        }
    }
}

pub(super) fn exec_string<V: VCpu>(
    inst: &mut Instruction,
    bus: &mut PagingBus<'_, V>,
) -> Result<(), ExecError> {
    match inst.mnemonic {
        Mnemonic::Cmpsb
        | Mnemonic::Cmpsw
        | Mnemonic::Cmpsd
        | Mnemonic::Cmpsq
        | Mnemonic::Scasb
        | Mnemonic::Scasw
        | Mnemonic::Scasd
        | Mnemonic::Scasq => {
            // CMPS: [rSI] - [rDI]; SCAS: rAX - [rDI].
            let lhs = inst.operand_mut(0).read(bus)?;
            let rhs = inst.operand_mut(1).read(bus)?;
            let size = element_size(inst.mnemonic);
            let mut rflags = RFlags::from_bits_retain(bus.cpu().rflags());
            alu::sub_with_flags(&mut rflags, lhs, rhs, false, size);
            bus.cpu_mut().set_rflags(rflags.bits());
        }
        _ => {
            // MOVS/STOS/LODS all copy operand 1 into operand 0.
            let value = inst.operand_mut(1).read(bus)?;
            let dst = inst.operand_mut(0);
            dst.value = value;
            dst.write(bus)?;
        }
    }
    advance_pointers(inst, bus);
    Ok(())
}
