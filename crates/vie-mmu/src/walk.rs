//! Guest page-table walks for the three paging formats.
//!
//! Every walk runs against a [`PagingStateSnapshot`] taken for the current
//! request; nothing here reads control registers on its own. Walks set the
//! accessed bit on every entry they traverse and the dirty bit on the leaf of a
//! successful write, like hardware does.

use crate::tlb::{EntryFlags, PageSize, TlbEntry};
use crate::{AccessType, MemoryBus, PagingStateSnapshot};

pub(crate) const CR0_WP: u64 = 1 << 16;
pub(crate) const CR0_PG: u64 = 1 << 31;

pub(crate) const CR4_PSE: u64 = 1 << 4;
pub(crate) const CR4_PAE: u64 = 1 << 5;
pub(crate) const CR4_SMEP: u64 = 1 << 20;
pub(crate) const CR4_SMAP: u64 = 1 << 21;

pub(crate) const EFER_LMA: u64 = 1 << 10;
pub(crate) const EFER_NXE: u64 = 1 << 11;

pub(crate) const RFLAGS_AC: u64 = 1 << 18;

const PTE_P: u64 = 1 << 0;
const PTE_RW: u64 = 1 << 1;
const PTE_US: u64 = 1 << 2;
const PTE_PWT: u64 = 1 << 3;
const PTE_PCD: u64 = 1 << 4;
const PTE_A: u64 = 1 << 5;
const PTE_D: u64 = 1 << 6;
const PTE_PS: u64 = 1 << 7;
const PTE_NX: u64 = 1 << 63;

/// Bits 13..=21 of a 4 MiB PDE; PSE-36 is not emulated so they must be clear.
const LEGACY32_4MB_RESERVED_MASK: u64 = 0x003f_e000;

/// Bits 52..=58 are ignored by hardware in PAE/long-mode entries.
const IGNORED_AVL_HIGH_MASK: u64 = 0x7f << 52;

const ERR_P: u32 = 1 << 0;
const ERR_W: u32 = 1 << 1;
const ERR_U: u32 = 1 << 2;
const ERR_RSVD: u32 = 1 << 3;
const ERR_ID: u32 = 1 << 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PagingMode {
    Disabled,
    Legacy32,
    Pae,
    Long4,
}

impl PagingMode {
    pub(crate) fn of(state: &PagingStateSnapshot) -> Self {
        if state.cr0 & CR0_PG == 0 {
            PagingMode::Disabled
        } else if state.cr4 & CR4_PAE == 0 {
            PagingMode::Legacy32
        } else if state.efer & EFER_LMA != 0 {
            PagingMode::Long4
        } else {
            PagingMode::Pae
        }
    }
}

/// Who is asking, and for what; decides which permission bits matter.
#[derive(Debug, Clone, Copy)]
pub(crate) struct AccessContext {
    pub(crate) access: AccessType,
    pub(crate) is_user: bool,
    implicit_supervisor: bool,
    wp: bool,
    smep: bool,
    smap: bool,
    alignment_check: bool,
}

impl AccessContext {
    pub(crate) fn new(
        state: &PagingStateSnapshot,
        access: AccessType,
        cpl: u8,
        implicit_supervisor: bool,
    ) -> Self {
        Self {
            access,
            is_user: cpl == 3 && !implicit_supervisor,
            implicit_supervisor,
            wp: state.cr0 & CR0_WP != 0,
            smep: state.cr4 & CR4_SMEP != 0,
            smap: state.cr4 & CR4_SMAP != 0,
            alignment_check: state.rflags & RFLAGS_AC != 0,
        }
    }

    /// #PF error code for this access.
    pub(crate) fn error_code(&self, present: bool, rsvd: bool) -> u32 {
        let mut code = 0;
        if present {
            code |= ERR_P;
        }
        if self.access.is_write() {
            code |= ERR_W;
        }
        if self.is_user {
            code |= ERR_U;
        }
        if rsvd {
            code |= ERR_RSVD;
        }
        if self.access.is_execute() {
            code |= ERR_ID;
        }
        code
    }

    /// Checks effective permissions of a present translation.
    pub(crate) fn check(&self, user: bool, writable: bool, nx: bool) -> Result<(), u32> {
        let denied = if self.is_user {
            !user || (self.access.is_write() && !writable)
        } else {
            let smap_blocked = user
                && self.smap
                && !self.access.is_execute()
                && (self.implicit_supervisor || !self.alignment_check);
            let smep_blocked = user && self.smep && self.access.is_execute();
            (self.access.is_write() && !writable && self.wp) || smap_blocked || smep_blocked
        };

        if denied || (self.access.is_execute() && nx) {
            return Err(self.error_code(true, false));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryKind64 {
    Pml4e,
    PdpteLong,
    PdeLong,
    PteLong,
    PdePae,
    PtePae,
}

/// Effective permissions accumulated from the root down.
#[derive(Debug, Clone, Copy)]
struct Rights {
    user: bool,
    writable: bool,
    nx: bool,
}

impl Rights {
    const ALL: Self = Self {
        user: true,
        writable: true,
        nx: false,
    };

    fn narrow(self, entry: u64, nx_enabled: bool) -> Self {
        Self {
            user: self.user && entry & PTE_US != 0,
            writable: self.writable && entry & PTE_RW != 0,
            nx: self.nx || (nx_enabled && entry & PTE_NX != 0),
        }
    }
}

pub(crate) struct Walker<'a> {
    state: &'a PagingStateSnapshot,
    ctx: AccessContext,
    linear: u64,
    addr_mask: u64,
}

impl<'a> Walker<'a> {
    pub(crate) fn new(
        state: &'a PagingStateSnapshot,
        ctx: AccessContext,
        linear: u64,
        max_phys_bits: u8,
    ) -> Self {
        Self {
            state,
            ctx,
            linear,
            addr_mask: (1u64 << max_phys_bits) - 1,
        }
    }

    fn nx_enabled(&self) -> bool {
        self.state.efer & EFER_NXE != 0
    }

    fn not_present(&self) -> u32 {
        self.ctx.error_code(false, false)
    }

    fn reserved(&self) -> u32 {
        self.ctx.error_code(true, true)
    }

    pub(crate) fn walk(&self, bus: &mut impl MemoryBus, mode: PagingMode) -> Result<TlbEntry, u32> {
        match mode {
            PagingMode::Disabled => unreachable!("identity translations are never walked"),
            PagingMode::Legacy32 => self.walk_legacy32(bus),
            PagingMode::Pae => self.walk_pae(bus),
            PagingMode::Long4 => self.walk_long4(bus),
        }
    }

    fn walk_legacy32(&self, bus: &mut impl MemoryBus) -> Result<TlbEntry, u32> {
        let linear = self.linear;
        let pd_base = self.state.cr3 & 0xffff_f000;
        let pde_addr = pd_base + ((linear >> 22) & 0x3ff) * 4;
        let pde = u64::from(bus.read_u32(pde_addr));
        if pde & PTE_P == 0 {
            return Err(self.not_present());
        }

        // Without CR4.PSE the PS bit is ignored and the PDE names a page table.
        if pde & PTE_PS != 0 && self.state.cr4 & CR4_PSE != 0 {
            if pde & LEGACY32_4MB_RESERVED_MASK != 0 {
                return Err(self.reserved());
            }
            let pde = set_accessed32(bus, pde_addr, pde);
            let rights = Rights::ALL.narrow(pde, false);
            return self.finish(bus, pde_addr, pde, false, rights, PageSize::Size4M, pde & 0xffc0_0000);
        }

        let pde = set_accessed32(bus, pde_addr, pde);
        let pte_addr = (pde & 0xffff_f000) + ((linear >> 12) & 0x3ff) * 4;
        let pte = u64::from(bus.read_u32(pte_addr));
        if pte & PTE_P == 0 {
            return Err(self.not_present());
        }
        let pte = set_accessed32(bus, pte_addr, pte);

        let rights = Rights::ALL.narrow(pde, false).narrow(pte, false);
        self.finish(bus, pte_addr, pte, false, rights, PageSize::Size4K, pte & 0xffff_f000)
    }

    fn walk_pae(&self, bus: &mut impl MemoryBus) -> Result<TlbEntry, u32> {
        let linear = self.linear;

        // PDPTEs come from the snapshot: the CPU loads all four when CR3 is
        // written, so memory may legitimately disagree with what is in use.
        let pdpte = self.state.pdpte[((linear >> 30) & 0x3) as usize];
        if pdpte & PTE_P == 0 {
            return Err(self.not_present());
        }
        let allowed = PTE_P | PTE_PWT | PTE_PCD | (0x7 << 9) | (self.addr_mask & !0xfff);
        if pdpte & !allowed != 0 {
            return Err(self.reserved());
        }

        // The PDPTE carries no U/S or R/W bits in this format.
        let rights = Rights::ALL;

        let pde_addr = (pdpte & self.addr_mask & !0xfff) + ((linear >> 21) & 0x1ff) * 8;
        let pde = self.read_entry64(bus, pde_addr, EntryKind64::PdePae)?;
        let rights = rights.narrow(pde, self.nx_enabled());
        if pde & PTE_PS != 0 {
            let pbase = PageSize::Size2M.base(pde & self.addr_mask);
            return self.finish(bus, pde_addr, pde, true, rights, PageSize::Size2M, pbase);
        }

        let pte_addr = (pde & self.addr_mask & !0xfff) + ((linear >> 12) & 0x1ff) * 8;
        let pte = self.read_entry64(bus, pte_addr, EntryKind64::PtePae)?;
        let rights = rights.narrow(pte, self.nx_enabled());
        let pbase = pte & self.addr_mask & !0xfff;
        self.finish(bus, pte_addr, pte, true, rights, PageSize::Size4K, pbase)
    }

    fn walk_long4(&self, bus: &mut impl MemoryBus) -> Result<TlbEntry, u32> {
        let linear = self.linear;
        let nxe = self.nx_enabled();

        let pml4e_addr = (self.state.cr3 & self.addr_mask & !0xfff) + ((linear >> 39) & 0x1ff) * 8;
        let pml4e = self.read_entry64(bus, pml4e_addr, EntryKind64::Pml4e)?;
        let rights = Rights::ALL.narrow(pml4e, nxe);

        let pdpte_addr = (pml4e & self.addr_mask & !0xfff) + ((linear >> 30) & 0x1ff) * 8;
        let pdpte = self.read_entry64(bus, pdpte_addr, EntryKind64::PdpteLong)?;
        let rights = rights.narrow(pdpte, nxe);
        if pdpte & PTE_PS != 0 {
            let pbase = PageSize::Size1G.base(pdpte & self.addr_mask);
            return self.finish(bus, pdpte_addr, pdpte, true, rights, PageSize::Size1G, pbase);
        }

        let pde_addr = (pdpte & self.addr_mask & !0xfff) + ((linear >> 21) & 0x1ff) * 8;
        let pde = self.read_entry64(bus, pde_addr, EntryKind64::PdeLong)?;
        let rights = rights.narrow(pde, nxe);
        if pde & PTE_PS != 0 {
            let pbase = PageSize::Size2M.base(pde & self.addr_mask);
            return self.finish(bus, pde_addr, pde, true, rights, PageSize::Size2M, pbase);
        }

        let pte_addr = (pde & self.addr_mask & !0xfff) + ((linear >> 12) & 0x1ff) * 8;
        let pte = self.read_entry64(bus, pte_addr, EntryKind64::PteLong)?;
        let rights = rights.narrow(pte, nxe);
        let pbase = pte & self.addr_mask & !0xfff;
        self.finish(bus, pte_addr, pte, true, rights, PageSize::Size4K, pbase)
    }

    /// Reads one 64-bit paging-structure entry, validates it, and sets A.
    fn read_entry64(
        &self,
        bus: &mut impl MemoryBus,
        entry_addr: u64,
        kind: EntryKind64,
    ) -> Result<u64, u32> {
        let entry = bus.read_u64(entry_addr);
        if entry & PTE_P == 0 {
            return Err(self.not_present());
        }
        if self.has_reserved_bits64(entry, kind) {
            return Err(self.reserved());
        }
        if entry & PTE_A == 0 {
            bus.write_u64(entry_addr, entry | PTE_A);
        }
        Ok(entry | PTE_A)
    }

    fn has_reserved_bits64(&self, entry: u64, kind: EntryKind64) -> bool {
        if !self.nx_enabled() && entry & PTE_NX != 0 {
            return true;
        }
        if kind == EntryKind64::Pml4e && entry & PTE_PS != 0 {
            return true;
        }

        let large = entry & PTE_PS != 0;
        let page_align = match kind {
            EntryKind64::PdpteLong if large => PageSize::Size1G.bytes(),
            EntryKind64::PdePae | EntryKind64::PdeLong if large => PageSize::Size2M.bytes(),
            _ => PageSize::Size4K.bytes(),
        };

        // Bit 12 is PAT on large pages, so the low 13 bits are always allowed.
        let mut allowed = (self.addr_mask & !(page_align - 1)) | 0x1fff | IGNORED_AVL_HIGH_MASK;
        if self.nx_enabled() {
            allowed |= PTE_NX;
        }
        entry & !allowed != 0
    }

    /// Permission check on the leaf, D-bit update, and the resulting entry.
    #[allow(clippy::too_many_arguments)]
    fn finish(
        &self,
        bus: &mut impl MemoryBus,
        leaf_addr: u64,
        leaf: u64,
        leaf_is_64: bool,
        rights: Rights,
        page_size: PageSize,
        pbase: u64,
    ) -> Result<TlbEntry, u32> {
        self.ctx.check(rights.user, rights.writable, rights.nx)?;

        let mut dirty = leaf & PTE_D != 0;
        if self.ctx.access.is_write() && !dirty {
            if leaf_is_64 {
                bus.write_u64(leaf_addr, leaf | PTE_D);
            } else {
                bus.write_u32(leaf_addr, (leaf | PTE_D) as u32);
            }
            dirty = true;
        }

        let mut flags = EntryFlags::empty();
        flags.set(EntryFlags::USER, rights.user);
        flags.set(EntryFlags::WRITABLE, rights.writable);
        flags.set(EntryFlags::NX, rights.nx);
        flags.set(EntryFlags::DIRTY, dirty);
        flags.set(EntryFlags::LEAF_64, leaf_is_64);

        Ok(TlbEntry {
            vbase: page_size.base(self.linear),
            pbase,
            page_size,
            leaf_addr,
            flags,
            root: self.state.cr3,
        })
    }
}

fn set_accessed32(bus: &mut impl MemoryBus, entry_addr: u64, entry: u64) -> u64 {
    if entry & PTE_A == 0 {
        bus.write_u32(entry_addr, (entry | PTE_A) as u32);
    }
    entry | PTE_A
}

/// Sets D on a cached leaf the first time it is written through the cache.
pub(crate) fn set_dirty(bus: &mut impl MemoryBus, entry: &TlbEntry) {
    if entry.leaf_is_64() {
        let val = bus.read_u64(entry.leaf_addr);
        bus.write_u64(entry.leaf_addr, val | PTE_D);
    } else {
        let val = bus.read_u32(entry.leaf_addr);
        bus.write_u32(entry.leaf_addr, val | PTE_D as u32);
    }
}

#[inline]
pub(crate) fn is_canonical_48(linear: u64) -> bool {
    // Bits 47..=63 must all match bit 47.
    (((linear >> 47).wrapping_add(1)) & 0x1fffe) == 0
}
