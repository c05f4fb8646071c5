#![cfg(not(target_arch = "wasm32"))]

use proptest::prelude::*;
use vie_x86::{CpuMode, Decoder, Mnemonic, OperandKind, MAX_INST_LEN};

fn decode_inputs() -> impl Strategy<Value = (CpuMode, u64, Vec<u8>)> {
    let mode = prop_oneof![
        Just(CpuMode::Bit16),
        Just(CpuMode::Bit32),
        Just(CpuMode::Bit64)
    ];
    mode.prop_flat_map(|mode| {
        let ip = match mode {
            CpuMode::Bit16 => (0u64..=0xffff).boxed(),
            CpuMode::Bit32 => (0u64..=0xffff_ffff).boxed(),
            CpuMode::Bit64 => any::<u64>().boxed(),
        };
        let bytes = proptest::collection::vec(any::<u8>(), 1..=MAX_INST_LEN);
        (Just(mode), ip, bytes)
    })
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 4096,
        .. ProptestConfig::default()
    })]

    #[test]
    fn decode_never_panics_on_arbitrary_bytes((mode, ip, bytes) in decode_inputs()) {
        let Ok(inst) = Decoder::default().decode_bytes(&bytes, ip, mode) else {
            // Ran out of bytes mid-instruction.
            return Ok(());
        };

        prop_assert!(inst.length >= 1 && inst.length as usize <= MAX_INST_LEN,
            "length={} mode={:?} bytes={:02x?}", inst.length, mode, bytes);

        if !inst.mnemonic.is_known() {
            prop_assert_eq!(inst.operand_count(), 0);
        }
        if inst.mnemonic == Mnemonic::Invalid {
            return Ok(());
        }

        // Relative branch targets stay inside the mode's IP space.
        let mask = mode.ip_mask();
        for op in inst.operands() {
            if let OperandKind::Memory(mem) = op.kind {
                prop_assert!(matches!(mem.scale, 1 | 2 | 4 | 8));
                prop_assert_eq!(mem.displacement as u64 & !mem.address_size.mask(), 0);
            }
            if matches!(inst.mnemonic, Mnemonic::Jmp | Mnemonic::Call) && !inst.far_branch {
                if let OperandKind::Immediate { value, .. } = op.kind {
                    prop_assert_eq!(value & !mask, 0, "target={:#x} bytes={:02x?}", value, bytes);
                }
            }
        }
    }

    #[test]
    fn decode_with_replaced_first_byte_matches_patched_buffer(
        (mode, ip, bytes) in decode_inputs(),
        first in any::<u8>(),
    ) {
        let mut patched = bytes.clone();
        patched[0] = first;

        let replaced = Decoder::default().decode(
            |offset| bytes.get(offset).copied().ok_or(()),
            ip,
            mode,
            Some(first),
        );
        let direct = Decoder::default().decode_bytes(&patched, ip, mode);
        prop_assert_eq!(replaced, direct);
    }
}
