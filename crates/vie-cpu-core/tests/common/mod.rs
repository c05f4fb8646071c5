#![allow(dead_code)]

use std::collections::HashMap;

use vie_cpu_core::vie_mmu::{MemoryBus, PagingSource, PagingStateSnapshot};
use vie_cpu_core::vie_x86::{CpuMode, Gpr, SegmentReg};
use vie_cpu_core::{Emulator, EmulatorConfig, Fault, Segment, VCpu};

pub const PTE_P: u64 = 1 << 0;
pub const PTE_RW: u64 = 1 << 1;
pub const PTE_US: u64 = 1 << 2;
pub const PTE_A: u64 = 1 << 5;
pub const PTE_D: u64 = 1 << 6;

pub const CR0_PE: u64 = 1 << 0;
pub const CR0_WP: u64 = 1 << 16;
pub const CR0_PG: u64 = 1 << 31;
pub const CR4_PAE: u64 = 1 << 5;
pub const EFER_LME: u64 = 1 << 8;
pub const EFER_LMA: u64 = 1 << 10;

pub const MEM_SIZE: usize = 4 << 20;

/// Page tables live in the first 1 MiB; test data goes above it.
const TABLE_ARENA_START: u64 = 0x1000;
const TABLE_ARENA_END: u64 = 0x10_0000;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .try_init();
}

/// A register file plus flat guest physical memory.
pub struct TestVcpu {
    pub mem: Vec<u8>,
    pub gprs: [u64; 16],
    pub rip: u64,
    pub rflags: u64,
    pub segments: [Segment; 6],
    pub cr: [u64; 9],
    pub dr: [u64; 8],
    pub efer: u64,
    pub mode: CpuMode,
    pub cpl: u8,
    pub can_inject: bool,
    /// Every `load_segment` call, in order.
    pub segment_loads: Vec<(SegmentReg, u16)>,
    next_table: u64,
    /// Tables already allocated, keyed by (root, level, index path).
    tables: HashMap<(u64, u8, u64), u64>,
}

impl TestVcpu {
    /// Paging disabled: linear == physical.
    pub fn flat(mode: CpuMode) -> Self {
        Self {
            mem: vec![0; MEM_SIZE],
            gprs: [0; 16],
            rip: 0,
            rflags: 0x2,
            segments: [Segment::default(); 6],
            cr: [0; 9],
            dr: [0; 8],
            efer: 0,
            mode,
            cpl: 0,
            can_inject: true,
            segment_loads: Vec::new(),
            next_table: TABLE_ARENA_START,
            tables: HashMap::new(),
        }
    }

    /// 4-level paging with an empty address space rooted at a fresh PML4.
    pub fn long_mode() -> Self {
        let mut cpu = Self::flat(CpuMode::Bit64);
        let root = cpu.alloc_table();
        cpu.cr[0] = CR0_PE | CR0_WP | CR0_PG;
        cpu.cr[3] = root;
        cpu.cr[4] = CR4_PAE;
        cpu.efer = EFER_LME | EFER_LMA;
        cpu
    }

    pub fn emulator(self) -> Emulator<Self> {
        init_tracing();
        Emulator::new(self, EmulatorConfig::default()).unwrap()
    }

    pub fn alloc_table(&mut self) -> u64 {
        let table = self.next_table;
        assert!(table < TABLE_ARENA_END, "page table arena exhausted");
        self.next_table += 0x1000;
        table
    }

    /// Map one 4 KiB page under `root` (the live CR3 when `None`).
    pub fn map_page_in(&mut self, root: Option<u64>, linear: u64, phys: u64, flags: u64) {
        let root = root.unwrap_or(self.cr[3]);
        let mut table = root;
        for (level, shift) in [(4u8, 39u32), (3, 30), (2, 21)] {
            let idx = (linear >> shift) & 0x1ff;
            let entry_addr = table + idx * 8;
            let key = (root, level, linear >> shift);
            let next = match self.tables.get(&key) {
                Some(&next) => next,
                None => {
                    let next = self.alloc_table();
                    self.tables.insert(key, next);
                    self.write_phys_u64(entry_addr, next | PTE_P | PTE_RW | PTE_US);
                    next
                }
            };
            table = next;
        }
        let pte_addr = table + ((linear >> 12) & 0x1ff) * 8;
        self.write_phys_u64(pte_addr, (phys & !0xfff) | flags | PTE_P);
    }

    pub fn map_page(&mut self, linear: u64, phys: u64, flags: u64) {
        self.map_page_in(None, linear, phys, flags);
    }

    /// Leaf entry currently mapping `linear` under the live CR3.
    pub fn pte(&self, linear: u64) -> u64 {
        let mut table = self.cr[3];
        for shift in [39u32, 30, 21] {
            let entry = self.read_phys_u64(table + ((linear >> shift) & 0x1ff) * 8);
            table = entry & 0x000f_ffff_ffff_f000;
        }
        self.read_phys_u64(table + ((linear >> 12) & 0x1ff) * 8)
    }

    pub fn load(&mut self, paddr: u64, bytes: &[u8]) {
        let off = paddr as usize;
        self.mem[off..off + bytes.len()].copy_from_slice(bytes);
    }

    pub fn phys(&self, paddr: u64, len: usize) -> &[u8] {
        let off = paddr as usize;
        &self.mem[off..off + len]
    }

    pub fn write_phys_u64(&mut self, paddr: u64, value: u64) {
        self.load(paddr, &value.to_le_bytes());
    }

    pub fn read_phys_u64(&self, paddr: u64) -> u64 {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(self.phys(paddr, 8));
        u64::from_le_bytes(bytes)
    }

    pub fn set(&mut self, reg: Gpr, value: u64) {
        self.gprs[reg.index()] = value;
    }

    pub fn get(&self, reg: Gpr) -> u64 {
        self.gprs[reg.index()]
    }
}

impl MemoryBus for TestVcpu {
    fn read_u8(&mut self, paddr: u64) -> u8 {
        self.mem.get(paddr as usize).copied().unwrap_or(0xff)
    }

    fn read_u16(&mut self, paddr: u64) -> u16 {
        u16::from_le_bytes([self.read_u8(paddr), self.read_u8(paddr + 1)])
    }

    fn read_u32(&mut self, paddr: u64) -> u32 {
        u32::from(self.read_u16(paddr)) | (u32::from(self.read_u16(paddr + 2)) << 16)
    }

    fn read_u64(&mut self, paddr: u64) -> u64 {
        u64::from(self.read_u32(paddr)) | (u64::from(self.read_u32(paddr + 4)) << 32)
    }

    fn write_u8(&mut self, paddr: u64, value: u8) {
        if let Some(slot) = self.mem.get_mut(paddr as usize) {
            *slot = value;
        }
    }

    fn write_u16(&mut self, paddr: u64, value: u16) {
        for (i, byte) in value.to_le_bytes().into_iter().enumerate() {
            self.write_u8(paddr + i as u64, byte);
        }
    }

    fn write_u32(&mut self, paddr: u64, value: u32) {
        for (i, byte) in value.to_le_bytes().into_iter().enumerate() {
            self.write_u8(paddr + i as u64, byte);
        }
    }

    fn write_u64(&mut self, paddr: u64, value: u64) {
        for (i, byte) in value.to_le_bytes().into_iter().enumerate() {
            self.write_u8(paddr + i as u64, byte);
        }
    }
}

impl PagingSource for TestVcpu {
    fn paging_state(&self) -> PagingStateSnapshot {
        PagingStateSnapshot {
            rflags: self.rflags,
            cr0: self.cr[0],
            cr3: self.cr[3],
            cr4: self.cr[4],
            efer: self.efer,
            cpl: self.cpl,
            pdpte: [0; 4],
        }
    }
}

impl VCpu for TestVcpu {
    fn mode(&self) -> CpuMode {
        self.mode
    }

    fn cpl(&self) -> u8 {
        self.cpl
    }

    fn gpr(&self, reg: Gpr) -> u64 {
        self.gprs[reg.index()]
    }

    fn set_gpr(&mut self, reg: Gpr, value: u64) {
        self.gprs[reg.index()] = value;
    }

    fn rip(&self) -> u64 {
        self.rip
    }

    fn set_rip(&mut self, rip: u64) {
        self.rip = rip;
    }

    fn rflags(&self) -> u64 {
        self.rflags
    }

    fn set_rflags(&mut self, rflags: u64) {
        self.rflags = rflags;
    }

    fn segment(&self, seg: SegmentReg) -> Segment {
        self.segments[seg.index()]
    }

    fn load_segment(&mut self, seg: SegmentReg, selector: u16) -> Result<(), Fault> {
        self.segment_loads.push((seg, selector));
        if selector & 0x4 != 0 {
            // No LDT in these tests.
            return Err(Fault::new(13, Some(u32::from(selector & !0x3))));
        }
        self.segments[seg.index()].selector = selector;
        Ok(())
    }

    fn control_register(&self, index: u8) -> Result<u64, Fault> {
        self.cr.get(index as usize).copied().ok_or(Fault::ud())
    }

    fn set_control_register(&mut self, index: u8, value: u64) -> Result<(), Fault> {
        let slot = self.cr.get_mut(index as usize).ok_or(Fault::ud())?;
        *slot = value;
        Ok(())
    }

    fn debug_register(&self, index: u8) -> Result<u64, Fault> {
        self.dr.get(index as usize).copied().ok_or(Fault::ud())
    }

    fn set_debug_register(&mut self, index: u8, value: u64) -> Result<(), Fault> {
        let slot = self.dr.get_mut(index as usize).ok_or(Fault::ud())?;
        *slot = value;
        Ok(())
    }

    fn can_inject_exception(&self) -> bool {
        self.can_inject
    }
}
