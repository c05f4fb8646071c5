use iced_x86::{Code, DecoderError, DecoderOptions, MemorySize, OpKind, Register};
use thiserror::Error;

use crate::inst::{AddressSize, Instruction, MemoryOperand, Operand, OperandKind, OperandList, RepPrefix};
use crate::regs::{Gpr, RegisterId, SegmentReg};
use crate::{CpuMode, CpuVendor, Mnemonic};

/// Maximum x86 instruction length (architectural limit).
pub const MAX_INST_LEN: usize = 15;

/// Decoding stopped because an instruction byte could not be fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("instruction fetch failed at byte {offset}")]
pub struct DecodeError<F> {
    /// Offset from the instruction start of the byte that could not be read.
    pub offset: usize,
    pub fault: F,
}

/// Turns guest instruction bytes into [`Instruction`]s.
#[derive(Debug, Clone, Copy)]
pub struct Decoder {
    options: u32,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new(CpuVendor::Intel)
    }
}

impl Decoder {
    pub fn new(vendor: CpuVendor) -> Self {
        let options = match vendor {
            CpuVendor::Intel => DecoderOptions::NONE,
            CpuVendor::Amd => DecoderOptions::AMD,
        };
        Self { options }
    }

    /// Decode the instruction at `ip`.
    ///
    /// `fetch` is called with the offset of each byte from `ip` and must read
    /// it with execute access. Bytes are requested one at a time and only as far
    /// as the instruction extends. With `replace_first_byte`, the first fetched
    /// byte is substituted (used when an opcode byte was patched to force an
    /// intercept).
    ///
    /// Byte streams that are not valid instructions decode to
    /// [`Mnemonic::Invalid`]; only fetch failures are errors.
    pub fn decode<F>(
        &self,
        mut fetch: impl FnMut(usize) -> Result<u8, F>,
        ip: u64,
        mode: CpuMode,
        replace_first_byte: Option<u8>,
    ) -> Result<Instruction, DecodeError<F>> {
        let mut bytes = [0u8; MAX_INST_LEN];
        let mut len = 0;
        let mut raw = iced_x86::Instruction::default();

        loop {
            let byte = fetch(len).map_err(|fault| DecodeError { offset: len, fault })?;
            bytes[len] = match (len, replace_first_byte) {
                (0, Some(replacement)) => replacement,
                _ => byte,
            };
            len += 1;

            let mut decoder =
                iced_x86::Decoder::with_ip(mode.bitness(), &bytes[..len], ip, self.options);
            decoder.decode_out(&mut raw);
            match decoder.last_error() {
                DecoderError::NoMoreBytes if len < MAX_INST_LEN => continue,
                DecoderError::None => break,
                _ => {
                    tracing::trace!(ip, len, "invalid instruction bytes");
                    return Ok(invalid(ip, len, mode));
                }
            }
        }

        Ok(build(&raw, &bytes[..raw.len()], ip, mode))
    }

    /// Decode from an in-memory buffer; running off its end is reported as
    /// `DecodeError { fault: () }`.
    pub fn decode_bytes(
        &self,
        bytes: &[u8],
        ip: u64,
        mode: CpuMode,
    ) -> Result<Instruction, DecodeError<()>> {
        self.decode(|offset| bytes.get(offset).copied().ok_or(()), ip, mode, None)
    }
}

fn invalid(ip: u64, len: usize, mode: CpuMode) -> Instruction {
    Instruction {
        mnemonic: Mnemonic::Invalid,
        length: len as u8,
        ip,
        operands: OperandList::default(),
        far_branch: false,
        lock: false,
        rep: RepPrefix::None,
        segment_override: None,
        address_size: mode.default_address_size(),
        operand_size: mode.default_operand_size(),
        stack_size: mode.stack_size(),
    }
}

/// Legacy/REX prefixes in front of the opcode.
#[derive(Debug, Default, Clone, Copy)]
struct Prefixes {
    operand_size: bool,
    address_size: bool,
    rex_w: bool,
}

fn scan_prefixes(bytes: &[u8], mode: CpuMode) -> Prefixes {
    let mut prefixes = Prefixes::default();
    for &b in bytes {
        match b {
            0x66 => prefixes.operand_size = true,
            0x67 => prefixes.address_size = true,
            0x26 | 0x2e | 0x36 | 0x3e | 0x64 | 0x65 | 0xf0 | 0xf2 | 0xf3 => {}
            // REX only counts when it is the last prefix.
            0x40..=0x4f if mode == CpuMode::Bit64 => {
                prefixes.rex_w = b & 0x08 != 0;
                continue;
            }
            _ => break,
        }
        prefixes.rex_w = false;
    }
    prefixes
}

fn build(raw: &iced_x86::Instruction, bytes: &[u8], ip: u64, mode: CpuMode) -> Instruction {
    let mnemonic = Mnemonic::from_iced(raw.mnemonic(), raw.code());
    let prefixes = scan_prefixes(bytes, mode);

    let address_size = match (mode, prefixes.address_size) {
        (CpuMode::Bit16, false) | (CpuMode::Bit32, true) => AddressSize::A16,
        (CpuMode::Bit16, true) | (CpuMode::Bit32, false) | (CpuMode::Bit64, true) => {
            AddressSize::A32
        }
        (CpuMode::Bit64, false) => AddressSize::A64,
    };
    let operand_size = match (mode, prefixes.operand_size) {
        (CpuMode::Bit64, _) if prefixes.rex_w => 8,
        (CpuMode::Bit16, false) | (CpuMode::Bit32, true) | (CpuMode::Bit64, true) => 2,
        _ => 4,
    };

    let segment_override = match raw.segment_prefix() {
        Register::None => None,
        reg => Some(map_segment(reg)),
    };

    let rep = if mnemonic.is_string() {
        match (raw.has_repe_prefix(), raw.has_repne_prefix()) {
            (false, false) => RepPrefix::None,
            _ if !mnemonic.is_compare_string() => RepPrefix::Rep,
            (true, _) => RepPrefix::RepEquals,
            (false, true) => RepPrefix::RepNotEquals,
        }
    } else {
        RepPrefix::None
    };

    let mut inst = Instruction {
        mnemonic,
        length: raw.len() as u8,
        ip,
        operands: OperandList::default(),
        far_branch: matches!(mnemonic, Mnemonic::Retf | Mnemonic::Iret),
        lock: raw.has_lock_prefix(),
        rep,
        segment_override,
        address_size,
        operand_size,
        stack_size: mode.stack_size(),
    };

    // Operands are only materialized for mnemonics we know: the mapping tables
    // below assume the register set those instructions can name.
    if !mnemonic.is_known() {
        return inst;
    }

    for i in 0..raw.op_count() {
        let kind = convert_operand(raw, i, &inst);
        if matches!(kind, OperandKind::FarPointer { .. }) {
            inst.far_branch = true;
        }
        if let OperandKind::Memory(_) = kind {
            if matches!(
                raw.memory_size(),
                MemorySize::SegPtr16 | MemorySize::SegPtr32 | MemorySize::SegPtr64
            ) && matches!(mnemonic, Mnemonic::Jmp | Mnemonic::Call)
            {
                inst.far_branch = true;
            }
        }
        inst.operands.push(Operand::new(kind));
    }
    if let Some(size) = near_branch_operand_size(raw, &inst) {
        inst.operand_size = size;
    }
    inst
}

/// Operand size of a near JMP/CALL/RET as the engine resolved it.
///
/// In 64-bit mode Intel parts ignore 0x66 on near branches while AMD parts
/// honor it, so the prefix bytes alone do not decide the size.
fn near_branch_operand_size(raw: &iced_x86::Instruction, inst: &Instruction) -> Option<u8> {
    match raw.code() {
        Code::Retnw | Code::Retnw_imm16 => Some(2),
        Code::Retnd | Code::Retnd_imm16 => Some(4),
        Code::Retnq | Code::Retnq_imm16 => Some(8),
        _ if matches!(inst.mnemonic, Mnemonic::Jmp | Mnemonic::Call) && !inst.far_branch => {
            inst.operands.as_slice().first().map(Operand::width)
        }
        _ => None,
    }
}

fn convert_operand(raw: &iced_x86::Instruction, idx: u32, inst: &Instruction) -> OperandKind {
    let string_width = || raw.memory_size().size() as u8;
    let string_operand = |segment: SegmentReg, base: Gpr| {
        OperandKind::Memory(MemoryOperand {
            width: string_width(),
            segment,
            base: Some(base),
            index: None,
            scale: 1,
            displacement: 0,
            address_size: inst.address_size,
        })
    };
    let source_segment = inst.segment_override.unwrap_or(SegmentReg::Ds);

    match raw.op_kind(idx) {
        OpKind::Register => map_register(raw.op_register(idx)),
        OpKind::Memory => OperandKind::Memory(map_memory(raw, inst)),

        // String operands: the source honors overrides, ES:rDI never does.
        OpKind::MemorySegSI | OpKind::MemorySegESI | OpKind::MemorySegRSI => {
            string_operand(source_segment, Gpr::Rsi)
        }
        OpKind::MemorySegDI | OpKind::MemorySegEDI | OpKind::MemorySegRDI => {
            string_operand(source_segment, Gpr::Rdi)
        }
        OpKind::MemoryESDI | OpKind::MemoryESEDI | OpKind::MemoryESRDI => {
            string_operand(SegmentReg::Es, Gpr::Rdi)
        }

        OpKind::NearBranch16 => OperandKind::Immediate {
            width: 2,
            value: u64::from(raw.near_branch16()),
        },
        OpKind::NearBranch32 => OperandKind::Immediate {
            width: 4,
            value: u64::from(raw.near_branch32()),
        },
        OpKind::NearBranch64 => OperandKind::Immediate {
            width: 8,
            value: raw.near_branch64(),
        },
        OpKind::FarBranch16 => OperandKind::FarPointer {
            selector: raw.far_branch_selector(),
            offset: u64::from(raw.far_branch16()),
        },
        OpKind::FarBranch32 => OperandKind::FarPointer {
            selector: raw.far_branch_selector(),
            offset: u64::from(raw.far_branch32()),
        },

        OpKind::Immediate8 => imm(1, u64::from(raw.immediate8())),
        OpKind::Immediate8_2nd => imm(1, u64::from(raw.immediate8_2nd())),
        OpKind::Immediate16 => imm(2, u64::from(raw.immediate16())),
        OpKind::Immediate32 => imm(4, u64::from(raw.immediate32())),
        OpKind::Immediate64 => imm(8, raw.immediate64()),
        OpKind::Immediate8to16 => imm(2, raw.immediate8to16() as u16 as u64),
        OpKind::Immediate8to32 => imm(4, raw.immediate8to32() as u32 as u64),
        OpKind::Immediate8to64 => imm(8, raw.immediate8to64() as u64),
        OpKind::Immediate32to64 => imm(8, raw.immediate32to64() as u64),

        other => panic!(
            "decoding assumptions violated: {:?} operand {idx} has kind {other:?}",
            inst.mnemonic
        ),
    }
}

#[inline]
fn imm(width: u8, value: u64) -> OperandKind {
    OperandKind::Immediate { width, value }
}

fn map_memory(raw: &iced_x86::Instruction, inst: &Instruction) -> MemoryOperand {
    let base_reg = raw.memory_base();
    let rip_relative = matches!(base_reg, Register::RIP | Register::EIP);
    let base = if rip_relative {
        // The engine already folded next-IP into the displacement.
        None
    } else {
        gpr_from_register(base_reg)
    };
    let index = gpr_from_register(raw.memory_index());

    let segment = inst.segment_override.unwrap_or(match base {
        Some(gpr) if gpr.is_stack_pointer() => SegmentReg::Ss,
        _ => SegmentReg::Ds,
    });

    let displacement = (raw.memory_displacement64() & inst.address_size.mask()) as i64;

    MemoryOperand {
        width: raw.memory_size().size() as u8,
        segment,
        base,
        index,
        scale: raw.memory_index_scale() as u8,
        displacement,
        address_size: inst.address_size,
    }
}

#[track_caller]
fn map_segment(reg: Register) -> SegmentReg {
    match reg {
        Register::ES => SegmentReg::Es,
        Register::CS => SegmentReg::Cs,
        Register::SS => SegmentReg::Ss,
        Register::DS => SegmentReg::Ds,
        Register::FS => SegmentReg::Fs,
        Register::GS => SegmentReg::Gs,
        other => panic!("decoding assumptions violated: {other:?} is not a segment register"),
    }
}

#[track_caller]
fn gpr_from_register(reg: Register) -> Option<Gpr> {
    let gpr = match reg {
        Register::None => return None,
        Register::AX | Register::EAX | Register::RAX => Gpr::Rax,
        Register::CX | Register::ECX | Register::RCX => Gpr::Rcx,
        Register::DX | Register::EDX | Register::RDX => Gpr::Rdx,
        Register::BX | Register::EBX | Register::RBX => Gpr::Rbx,
        Register::SP | Register::ESP | Register::RSP => Gpr::Rsp,
        Register::BP | Register::EBP | Register::RBP => Gpr::Rbp,
        Register::SI | Register::ESI | Register::RSI => Gpr::Rsi,
        Register::DI | Register::EDI | Register::RDI => Gpr::Rdi,
        Register::R8W | Register::R8D | Register::R8 => Gpr::R8,
        Register::R9W | Register::R9D | Register::R9 => Gpr::R9,
        Register::R10W | Register::R10D | Register::R10 => Gpr::R10,
        Register::R11W | Register::R11D | Register::R11 => Gpr::R11,
        Register::R12W | Register::R12D | Register::R12 => Gpr::R12,
        Register::R13W | Register::R13D | Register::R13 => Gpr::R13,
        Register::R14W | Register::R14D | Register::R14 => Gpr::R14,
        Register::R15W | Register::R15D | Register::R15 => Gpr::R15,
        other => panic!("decoding assumptions violated: {other:?} cannot address memory"),
    };
    Some(gpr)
}

#[track_caller]
fn map_register(reg: Register) -> OperandKind {
    use iced_x86::Register::*;

    let gpr = |width: u8, gpr: Gpr| OperandKind::Register {
        width,
        id: RegisterId::Gpr(gpr),
    };
    let high8 = |gpr: Gpr| OperandKind::Register {
        width: 1,
        id: RegisterId::GprHigh8(gpr),
    };

    match reg {
        AL => gpr(1, Gpr::Rax),
        CL => gpr(1, Gpr::Rcx),
        DL => gpr(1, Gpr::Rdx),
        BL => gpr(1, Gpr::Rbx),
        SPL => gpr(1, Gpr::Rsp),
        BPL => gpr(1, Gpr::Rbp),
        SIL => gpr(1, Gpr::Rsi),
        DIL => gpr(1, Gpr::Rdi),
        R8L => gpr(1, Gpr::R8),
        R9L => gpr(1, Gpr::R9),
        R10L => gpr(1, Gpr::R10),
        R11L => gpr(1, Gpr::R11),
        R12L => gpr(1, Gpr::R12),
        R13L => gpr(1, Gpr::R13),
        R14L => gpr(1, Gpr::R14),
        R15L => gpr(1, Gpr::R15),

        AH => high8(Gpr::Rax),
        CH => high8(Gpr::Rcx),
        DH => high8(Gpr::Rdx),
        BH => high8(Gpr::Rbx),

        AX => gpr(2, Gpr::Rax),
        CX => gpr(2, Gpr::Rcx),
        DX => gpr(2, Gpr::Rdx),
        BX => gpr(2, Gpr::Rbx),
        SP => gpr(2, Gpr::Rsp),
        BP => gpr(2, Gpr::Rbp),
        SI => gpr(2, Gpr::Rsi),
        DI => gpr(2, Gpr::Rdi),
        R8W => gpr(2, Gpr::R8),
        R9W => gpr(2, Gpr::R9),
        R10W => gpr(2, Gpr::R10),
        R11W => gpr(2, Gpr::R11),
        R12W => gpr(2, Gpr::R12),
        R13W => gpr(2, Gpr::R13),
        R14W => gpr(2, Gpr::R14),
        R15W => gpr(2, Gpr::R15),

        EAX => gpr(4, Gpr::Rax),
        ECX => gpr(4, Gpr::Rcx),
        EDX => gpr(4, Gpr::Rdx),
        EBX => gpr(4, Gpr::Rbx),
        ESP => gpr(4, Gpr::Rsp),
        EBP => gpr(4, Gpr::Rbp),
        ESI => gpr(4, Gpr::Rsi),
        EDI => gpr(4, Gpr::Rdi),
        R8D => gpr(4, Gpr::R8),
        R9D => gpr(4, Gpr::R9),
        R10D => gpr(4, Gpr::R10),
        R11D => gpr(4, Gpr::R11),
        R12D => gpr(4, Gpr::R12),
        R13D => gpr(4, Gpr::R13),
        R14D => gpr(4, Gpr::R14),
        R15D => gpr(4, Gpr::R15),

        RAX => gpr(8, Gpr::Rax),
        RCX => gpr(8, Gpr::Rcx),
        RDX => gpr(8, Gpr::Rdx),
        RBX => gpr(8, Gpr::Rbx),
        RSP => gpr(8, Gpr::Rsp),
        RBP => gpr(8, Gpr::Rbp),
        RSI => gpr(8, Gpr::Rsi),
        RDI => gpr(8, Gpr::Rdi),
        R8 => gpr(8, Gpr::R8),
        R9 => gpr(8, Gpr::R9),
        R10 => gpr(8, Gpr::R10),
        R11 => gpr(8, Gpr::R11),
        R12 => gpr(8, Gpr::R12),
        R13 => gpr(8, Gpr::R13),
        R14 => gpr(8, Gpr::R14),
        R15 => gpr(8, Gpr::R15),

        ES | CS | SS | DS | FS | GS => OperandKind::SegmentRegister {
            id: map_segment(reg),
        },

        CR0 | CR1 | CR2 | CR3 | CR4 | CR5 | CR6 | CR7 | CR8 | CR9 | CR10 | CR11 | CR12 | CR13
        | CR14 | CR15 => OperandKind::Register {
            width: 8,
            id: RegisterId::Control(reg.number() as u8),
        },
        DR0 | DR1 | DR2 | DR3 | DR4 | DR5 | DR6 | DR7 | DR8 | DR9 | DR10 | DR11 | DR12 | DR13
        | DR14 | DR15 => OperandKind::Register {
            width: 8,
            id: RegisterId::Debug(reg.number() as u8),
        },

        other => panic!("decoding assumptions violated: unmapped register {other:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_scan_tracks_rex_w_only_when_last() {
        let p = scan_prefixes(&[0x48, 0xff, 0xc0], CpuMode::Bit64);
        assert!(p.rex_w);
        // A legacy prefix after REX cancels it.
        let p = scan_prefixes(&[0x48, 0x66, 0xff, 0xc0], CpuMode::Bit64);
        assert!(!p.rex_w);
        assert!(p.operand_size);
        // 0x48 is DEC EAX outside long mode.
        let p = scan_prefixes(&[0x48], CpuMode::Bit32);
        assert!(!p.rex_w);
    }

    #[test]
    fn segment_table_covers_all_segment_registers() {
        for (reg, seg) in [
            (Register::ES, SegmentReg::Es),
            (Register::CS, SegmentReg::Cs),
            (Register::SS, SegmentReg::Ss),
            (Register::DS, SegmentReg::Ds),
            (Register::FS, SegmentReg::Fs),
            (Register::GS, SegmentReg::Gs),
        ] {
            assert_eq!(map_segment(reg), seg);
        }
    }

    #[test]
    #[should_panic(expected = "decoding assumptions violated")]
    fn unmapped_register_panics() {
        map_register(Register::XMM0);
    }
}
