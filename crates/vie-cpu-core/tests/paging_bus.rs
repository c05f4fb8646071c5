mod common;

use common::{TestVcpu, PTE_RW, PTE_US};
use vie_cpu_core::vie_mmu::{AccessType, VirtualMmu};
use vie_cpu_core::vie_x86::{AddressSize, CpuMode, SegmentReg};
use vie_cpu_core::{AccessError, Fault, PagingBus, Segment};

const PAGE_A: u64 = 0x50_0000;
const PAGE_A_PHYS: u64 = 0x21_0000;
/// Backs the linear page after `PAGE_A` at a non-adjacent physical frame.
const PAGE_B_PHYS: u64 = 0x30_0000;

fn two_pages() -> TestVcpu {
    let mut cpu = TestVcpu::long_mode();
    cpu.map_page(PAGE_A, PAGE_A_PHYS, PTE_RW);
    cpu.map_page(PAGE_A + 0x1000, PAGE_B_PHYS, PTE_RW);
    cpu
}

#[test]
fn crossing_access_is_split_at_the_page_boundary() {
    let mut cpu = two_pages();
    let mut mmu = VirtualMmu::new();
    let mut bus = PagingBus::new(&mut cpu, &mut mmu);

    let mut data: [u8; 16] = core::array::from_fn(|i| i as u8 + 1);
    bus.access(PAGE_A + 0xff8, &mut data, 0, false, None, AccessType::Write)
        .unwrap();

    let mut back = [0u8; 16];
    bus.access(PAGE_A + 0xff8, &mut back, 0, false, None, AccessType::Read)
        .unwrap();
    assert_eq!(back, data);

    assert_eq!(cpu.phys(PAGE_A_PHYS + 0xff8, 8), &data[..8]);
    assert_eq!(cpu.phys(PAGE_B_PHYS, 8), &data[8..]);
}

#[test]
fn failed_second_page_leaves_everything_untouched() {
    let mut cpu = TestVcpu::long_mode();
    cpu.map_page(PAGE_A, PAGE_A_PHYS, PTE_RW);
    let mut mmu = VirtualMmu::new();
    let mut bus = PagingBus::new(&mut cpu, &mut mmu);

    let mut data = [0xabu8; 16];
    let err = bus
        .access(PAGE_A + 0xff8, &mut data, 0, false, None, AccessType::Write)
        .unwrap_err();
    assert_eq!(
        err,
        AccessError::Translation {
            linear: PAGE_A + 0x1000,
            fault: Fault::page_fault(PAGE_A + 0x1000, 0b10),
        }
    );

    let mut buf = [0x5au8; 16];
    assert!(bus
        .access(PAGE_A + 0xff8, &mut buf, 0, false, None, AccessType::Read)
        .is_err());
    assert_eq!(buf, [0x5a; 16]);

    assert_eq!(cpu.phys(PAGE_A_PHYS + 0xff8, 8), &[0; 8]);
}

#[test]
fn rejects_unsupported_sizes_and_wrapping_ranges() {
    let mut cpu = two_pages();
    let mut mmu = VirtualMmu::new();
    let mut bus = PagingBus::new(&mut cpu, &mut mmu);

    for len in [0usize, 3, 5, 12, 32] {
        let mut buf = vec![0u8; len];
        assert_eq!(
            bus.access(PAGE_A, &mut buf, 0, false, None, AccessType::Read),
            Err(AccessError::UnsupportedSize(len))
        );
    }

    let mut buf = [0u8; 8];
    assert_eq!(
        bus.access(u64::MAX - 3, &mut buf, 0, false, None, AccessType::Read),
        Err(AccessError::AddressOverflow {
            linear: u64::MAX - 3,
            len: 8
        })
    );
}

#[test]
fn user_access_to_supervisor_page_faults() {
    let mut cpu = TestVcpu::long_mode();
    cpu.map_page(PAGE_A, PAGE_A_PHYS, PTE_RW);
    cpu.map_page(PAGE_A + 0x1000, PAGE_B_PHYS, PTE_RW | PTE_US);
    let mut mmu = VirtualMmu::new();
    let mut bus = PagingBus::new(&mut cpu, &mut mmu);

    let mut buf = [0u8; 4];
    let err = bus
        .access(PAGE_A, &mut buf, 3, false, None, AccessType::Read)
        .unwrap_err();
    assert_eq!(
        err,
        AccessError::Translation {
            linear: PAGE_A,
            fault: Fault::page_fault(PAGE_A, 0b101),
        }
    );

    // Implicit supervisor accesses ignore CPL.
    bus.access(PAGE_A, &mut buf, 3, true, None, AccessType::Read)
        .unwrap();
    bus.access(PAGE_A + 0x1000, &mut buf, 3, false, None, AccessType::Read)
        .unwrap();
}

#[test]
fn linear_address_applies_segment_bases_by_mode() {
    let mut cpu = TestVcpu::flat(CpuMode::Bit32);
    cpu.segments[SegmentReg::Ds.index()] = Segment {
        selector: 0x10,
        base: 0xffff_f000,
    };
    let mut mmu = VirtualMmu::new();
    let bus = PagingBus::new(&mut cpu, &mut mmu);
    // 32-bit linear addresses wrap at 4 GiB.
    assert_eq!(bus.linear_address(SegmentReg::Ds, 0x2000, AddressSize::A32), 0x1000);
    assert_eq!(bus.linear_address(SegmentReg::Ds, 0x1_0000_0010, AddressSize::A16), 0xffff_f010);

    let mut cpu = TestVcpu::long_mode();
    cpu.segments[SegmentReg::Ds.index()].base = 0x1234_0000;
    cpu.segments[SegmentReg::Gs.index()].base = 0xffff_8000_0000_0000;
    let bus = PagingBus::new(&mut cpu, &mut mmu);
    assert_eq!(bus.linear_address(SegmentReg::Ds, 0x40, AddressSize::A64), 0x40);
    assert_eq!(
        bus.linear_address(SegmentReg::Gs, 0x40, AddressSize::A64),
        0xffff_8000_0000_0040
    );
}

#[test]
fn logical_reads_and_writes_go_through_the_segment() {
    let mut cpu = TestVcpu::flat(CpuMode::Bit16);
    cpu.segments[SegmentReg::Es.index()].base = 0x2_0000;
    let mut mmu = VirtualMmu::new();
    let mut bus = PagingBus::new(&mut cpu, &mut mmu);

    bus.write_logical(SegmentReg::Es, 0x10, AddressSize::A16, &[1, 2])
        .unwrap();
    let mut buf = [0u8; 2];
    bus.read_logical(SegmentReg::Es, 0x10, AddressSize::A16, &mut buf)
        .unwrap();
    assert_eq!(buf, [1, 2]);
    assert_eq!(cpu.phys(0x2_0010, 2), &[1, 2]);
}

#[test]
fn cr3_override_never_leaves_cached_entries() {
    let mut cpu = two_pages();
    let root = cpu.cr[3];
    let mut mmu = VirtualMmu::new();
    let mut bus = PagingBus::new(&mut cpu, &mut mmu);

    let mut buf = [0u8; 8];
    bus.access(PAGE_A, &mut buf, 0, false, None, AccessType::Read)
        .unwrap();
    assert_eq!(bus.mmu_mut().cached_entries(), 1);

    bus.access(PAGE_A, &mut buf, 0, false, Some(root), AccessType::Read)
        .unwrap();
    assert_eq!(bus.mmu_mut().cached_entries(), 0);
}
