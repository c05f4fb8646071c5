use vie_x86::{Instruction, Mnemonic};

use crate::error::ExecError;
use crate::operand::OperandAccess;
use crate::paging_bus::PagingBus;
use crate::vcpu::{mask_for_width, RFlags, VCpu};

fn sign_bit(size: u8) -> u64 {
    1u64 << (u32::from(size) * 8 - 1)
}

fn parity(byte: u8) -> bool {
    byte.count_ones() % 2 == 0
}

pub(crate) fn sign_extend(value: u64, from: u8) -> u64 {
    let shift = 64 - u32::from(from) * 8;
    (((value << shift) as i64) >> shift) as u64
}

fn set_result_flags(rflags: &mut RFlags, result: u64, size: u8) {
    rflags.set(RFlags::ZF, result == 0);
    rflags.set(RFlags::SF, (result & sign_bit(size)) != 0);
    rflags.set(RFlags::PF, parity(result as u8));
}

pub fn sub_with_flags(rflags: &mut RFlags, dest: u64, src: u64, borrow_in: bool, size: u8) -> u64 {
    let mask = mask_for_width(size);
    let dest = dest & mask;
    let src = src & mask;
    let borrow = borrow_in as u64;
    let src2 = src.wrapping_add(borrow) & mask;
    let subtrahend = (src as u128) + (borrow as u128);
    let result = (dest as u128).wrapping_sub(subtrahend) as u64 & mask;

    rflags.set(RFlags::CF, (dest as u128) < subtrahend);
    rflags.set(RFlags::OF, ((dest ^ src2) & (dest ^ result) & sign_bit(size)) != 0);
    rflags.set(RFlags::AF, ((dest ^ src2 ^ result) & 0x10) != 0);
    set_result_flags(rflags, result, size);
    result
}

pub fn add_with_flags(rflags: &mut RFlags, dest: u64, src: u64, carry_in: bool, size: u8) -> u64 {
    let mask = mask_for_width(size);
    let dest = dest & mask;
    let src = src & mask;
    let full = (dest as u128) + (src as u128) + (carry_in as u128);
    let result = (full as u64) & mask;

    rflags.set(RFlags::CF, full > mask as u128);
    rflags.set(RFlags::OF, ((dest ^ result) & (src ^ result) & sign_bit(size)) != 0);
    rflags.set(RFlags::AF, ((dest ^ src ^ result) & 0x10) != 0);
    set_result_flags(rflags, result, size);
    result
}

/// AND/OR/XOR/TEST: CF and OF cleared, AF left alone.
pub fn logic_with_flags(rflags: &mut RFlags, result: u64, size: u8) -> u64 {
    let result = result & mask_for_width(size);
    rflags.remove(RFlags::CF | RFlags::OF);
    set_result_flags(rflags, result, size);
    result
}

/// Two-operand arithmetic and logic: ADD ADC SUB SBB AND OR XOR CMP TEST.
pub(super) fn exec_binary<V: VCpu>(
    inst: &mut Instruction,
    bus: &mut PagingBus<'_, V>,
) -> Result<(), ExecError> {
    let dest = inst.operand_mut(0).read(bus)?;
    let src = inst.operand_mut(1).read(bus)?;
    let size = inst.operand(0).width();

    let mut rflags = RFlags::from_bits_retain(bus.cpu().rflags());
    let carry = rflags.contains(RFlags::CF);
    let result = match inst.mnemonic {
        Mnemonic::Add => add_with_flags(&mut rflags, dest, src, false, size),
        Mnemonic::Adc => add_with_flags(&mut rflags, dest, src, carry, size),
        Mnemonic::Sub | Mnemonic::Cmp => sub_with_flags(&mut rflags, dest, src, false, size),
        Mnemonic::Sbb => sub_with_flags(&mut rflags, dest, src, carry, size),
        Mnemonic::And | Mnemonic::Test => logic_with_flags(&mut rflags, dest & src, size),
        Mnemonic::Or => logic_with_flags(&mut rflags, dest | src, size),
        Mnemonic::Xor => logic_with_flags(&mut rflags, dest ^ src, size),
        other => unreachable!("{other:?} is not a binary ALU op"),
    };

    if !matches!(inst.mnemonic, Mnemonic::Cmp | Mnemonic::Test) {
        let dst = inst.operand_mut(0);
        dst.value = result;
        dst.write(bus)?;
    }
    bus.cpu_mut().set_rflags(rflags.bits());
    Ok(())
}

/// INC DEC NEG NOT.
pub(super) fn exec_unary<V: VCpu>(
    inst: &mut Instruction,
    bus: &mut PagingBus<'_, V>,
) -> Result<(), ExecError> {
    let value = inst.operand_mut(0).read(bus)?;
    let size = inst.operand(0).width();

    let mut rflags = RFlags::from_bits_retain(bus.cpu().rflags());
    let carry = rflags.contains(RFlags::CF);
    let result = match inst.mnemonic {
        Mnemonic::Inc => {
            let r = add_with_flags(&mut rflags, value, 1, false, size);
            rflags.set(RFlags::CF, carry);
            r
        }
        Mnemonic::Dec => {
            let r = sub_with_flags(&mut rflags, value, 1, false, size);
            rflags.set(RFlags::CF, carry);
            r
        }
        Mnemonic::Neg => sub_with_flags(&mut rflags, 0, value, false, size),
        Mnemonic::Not => !value & mask_for_width(size),
        other => unreachable!("{other:?} is not a unary ALU op"),
    };

    let dst = inst.operand_mut(0);
    dst.value = result;
    dst.write(bus)?;
    bus.cpu_mut().set_rflags(rflags.bits());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_sets_carry_and_overflow() {
        let mut f = RFlags::empty();
        assert_eq!(add_with_flags(&mut f, 0xff, 1, false, 1), 0);
        assert!(f.contains(RFlags::CF | RFlags::ZF | RFlags::AF));
        assert!(!f.contains(RFlags::OF));

        let mut f = RFlags::empty();
        assert_eq!(add_with_flags(&mut f, 0x7fff_ffff, 1, false, 4), 0x8000_0000);
        assert!(f.contains(RFlags::OF | RFlags::SF));
        assert!(!f.contains(RFlags::CF));
    }

    #[test]
    fn sub_with_borrow() {
        let mut f = RFlags::empty();
        assert_eq!(sub_with_flags(&mut f, 0, 0, true, 8), u64::MAX);
        assert!(f.contains(RFlags::CF | RFlags::SF));

        let mut f = RFlags::empty();
        assert_eq!(sub_with_flags(&mut f, 0x8000, 1, false, 2), 0x7fff);
        assert!(f.contains(RFlags::OF));
        assert!(!f.contains(RFlags::CF));
    }

    #[test]
    fn logic_clears_carry_and_overflow() {
        let mut f = RFlags::CF | RFlags::OF;
        assert_eq!(logic_with_flags(&mut f, 0x1_0000_0003, 4), 3);
        assert!(!f.intersects(RFlags::CF | RFlags::OF | RFlags::ZF | RFlags::SF));
        assert!(f.contains(RFlags::PF));
    }

    #[test]
    fn sign_extension() {
        assert_eq!(sign_extend(0x80, 1), 0xffff_ffff_ffff_ff80);
        assert_eq!(sign_extend(0x7fff, 2), 0x7fff);
        assert_eq!(sign_extend(0xffff_fffe, 4), u64::MAX - 1);
        assert_eq!(sign_extend(5, 8), 5);
    }
}
