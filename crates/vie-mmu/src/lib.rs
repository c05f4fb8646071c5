//! Linear → physical translation for software-emulated guest accesses.
//!
//! [`VirtualMmu`] walks the guest's own page tables on behalf of the
//! instruction emulator and the surrounding hypervisor. It supports the paging
//! modes a guest can run in:
//! - No paging (identity mapping of the 32-bit linear space)
//! - 32-bit paging (4KB / 4MB pages)
//! - PAE paging (4KB / 2MB pages, PDPTEs taken from the register snapshot)
//! - 4-level long mode paging (4KB / 2MB / 1GB pages) with canonical checks
//!
//! Translations are cached in a tiny per-vCPU TLB whose entries are tagged
//! with the page-table root they were walked under.

mod tlb;
mod walk;

pub use tlb::{PageSize, TLB_CAPACITY};

use tlb::Tlb;
use walk::{AccessContext, PagingMode, Walker};

/// Vector of the page-fault exception.
pub const PF_VECTOR: u8 = 14;
/// Vector of the general-protection exception.
pub const GP_VECTOR: u8 = 13;

/// Guest physical memory, as seen by page walks and the guarded access layer.
pub trait MemoryBus {
    fn read_u8(&mut self, paddr: u64) -> u8;
    fn read_u16(&mut self, paddr: u64) -> u16;
    fn read_u32(&mut self, paddr: u64) -> u32;
    fn read_u64(&mut self, paddr: u64) -> u64;

    fn write_u8(&mut self, paddr: u64, value: u8);
    fn write_u16(&mut self, paddr: u64, value: u16);
    fn write_u32(&mut self, paddr: u64, value: u32);
    fn write_u64(&mut self, paddr: u64, value: u64);

    /// Read a byte slice from physical memory.
    ///
    /// The default implementation falls back to byte-at-a-time reads via
    /// [`MemoryBus::read_u8`].
    #[inline]
    fn read_bytes(&mut self, paddr: u64, dst: &mut [u8]) {
        for (i, slot) in dst.iter_mut().enumerate() {
            *slot = self.read_u8(paddr.wrapping_add(i as u64));
        }
    }

    /// Write a byte slice to physical memory.
    #[inline]
    fn write_bytes(&mut self, paddr: u64, src: &[u8]) {
        for (i, byte) in src.iter().copied().enumerate() {
            self.write_u8(paddr.wrapping_add(i as u64), byte);
        }
    }
}

impl<T: MemoryBus + ?Sized> MemoryBus for &mut T {
    #[inline]
    fn read_u8(&mut self, paddr: u64) -> u8 {
        <T as MemoryBus>::read_u8(&mut **self, paddr)
    }

    #[inline]
    fn read_u16(&mut self, paddr: u64) -> u16 {
        <T as MemoryBus>::read_u16(&mut **self, paddr)
    }

    #[inline]
    fn read_u32(&mut self, paddr: u64) -> u32 {
        <T as MemoryBus>::read_u32(&mut **self, paddr)
    }

    #[inline]
    fn read_u64(&mut self, paddr: u64) -> u64 {
        <T as MemoryBus>::read_u64(&mut **self, paddr)
    }

    #[inline]
    fn write_u8(&mut self, paddr: u64, value: u8) {
        <T as MemoryBus>::write_u8(&mut **self, paddr, value)
    }

    #[inline]
    fn write_u16(&mut self, paddr: u64, value: u16) {
        <T as MemoryBus>::write_u16(&mut **self, paddr, value)
    }

    #[inline]
    fn write_u32(&mut self, paddr: u64, value: u32) {
        <T as MemoryBus>::write_u32(&mut **self, paddr, value)
    }

    #[inline]
    fn write_u64(&mut self, paddr: u64, value: u64) {
        <T as MemoryBus>::write_u64(&mut **self, paddr, value)
    }

    #[inline]
    fn read_bytes(&mut self, paddr: u64, dst: &mut [u8]) {
        <T as MemoryBus>::read_bytes(&mut **self, paddr, dst)
    }

    #[inline]
    fn write_bytes(&mut self, paddr: u64, src: &[u8]) {
        <T as MemoryBus>::write_bytes(&mut **self, paddr, src)
    }
}

/// A vCPU whose paging registers can be snapshotted for a translation.
pub trait PagingSource: MemoryBus {
    fn paging_state(&self) -> PagingStateSnapshot;
}

impl<T: PagingSource + ?Sized> PagingSource for &mut T {
    #[inline]
    fn paging_state(&self) -> PagingStateSnapshot {
        <T as PagingSource>::paging_state(&**self)
    }
}

/// Type of memory access being translated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessType {
    Read,
    Write,
    Execute,
}

impl AccessType {
    #[inline]
    pub fn is_write(self) -> bool {
        matches!(self, AccessType::Write)
    }

    #[inline]
    pub fn is_execute(self) -> bool {
        matches!(self, AccessType::Execute)
    }
}

/// Adjustments to how an access is translated.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AccessOverride {
    /// Treat the access as supervisor-mode even at CPL 3 (descriptor table
    /// reads and similar implicit accesses).
    pub implicit_supervisor: bool,
    /// Translate as if this page-table root were loaded in CR3.
    pub address_space_root: Option<u64>,
}

impl AccessOverride {
    pub const NONE: Self = Self {
        implicit_supervisor: false,
        address_space_root: None,
    };

    pub fn supervisor() -> Self {
        Self {
            implicit_supervisor: true,
            address_space_root: None,
        }
    }

    pub fn with_root(root: u64) -> Self {
        Self {
            implicit_supervisor: false,
            address_space_root: Some(root),
        }
    }
}

/// The guest paging registers that matter for one translation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PagingStateSnapshot {
    pub rflags: u64,
    pub cr0: u64,
    /// CR3, or the override root when one was requested.
    pub cr3: u64,
    pub cr4: u64,
    pub efer: u64,
    pub cpl: u8,
    /// PAE page-directory-pointer entries as last loaded by the CPU.
    pub pdpte: [u64; 4],
}

impl PagingStateSnapshot {
    #[inline]
    pub fn paging_enabled(&self) -> bool {
        self.cr0 & walk::CR0_PG != 0
    }

    #[inline]
    pub fn long_mode_active(&self) -> bool {
        self.efer & walk::EFER_LMA != 0
    }
}

/// Outcome of a linear address translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranslationResult {
    Physical(u64),
    Fault { vector: u8, error_code: u32 },
}

impl TranslationResult {
    #[inline]
    pub fn physical(self) -> Option<u64> {
        match self {
            TranslationResult::Physical(paddr) => Some(paddr),
            TranslationResult::Fault { .. } => None,
        }
    }

    #[inline]
    pub fn is_fault(self) -> bool {
        matches!(self, TranslationResult::Fault { .. })
    }
}

/// TLB bookkeeping counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MmuStats {
    pub lookups: u64,
    pub hits: u64,
    pub misses: u64,
    pub page_walks: u64,
    pub flushes: u64,
}

/// Per-vCPU software MMU with a small translation cache.
#[derive(Debug, Clone)]
pub struct VirtualMmu {
    tlb: Tlb,
    max_phys_bits: u8,
    stats: MmuStats,
}

impl Default for VirtualMmu {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualMmu {
    pub fn new() -> Self {
        Self {
            tlb: Tlb::new(),
            max_phys_bits: 52,
            stats: MmuStats::default(),
        }
    }

    #[track_caller]
    pub fn with_max_phys_bits(bits: u8) -> Self {
        assert!(
            (1..=52).contains(&bits),
            "max_phys_bits must be 1..=52 (got {bits})"
        );
        Self {
            max_phys_bits: bits,
            ..Self::new()
        }
    }

    #[inline]
    pub fn max_phys_bits(&self) -> u8 {
        self.max_phys_bits
    }

    #[inline]
    pub fn stats(&self) -> MmuStats {
        self.stats
    }

    #[inline]
    pub fn reset_stats(&mut self) {
        self.stats = MmuStats::default();
    }

    /// Number of translations currently cached.
    #[inline]
    pub fn cached_entries(&self) -> usize {
        self.tlb.len()
    }

    /// Drops every cached translation.
    ///
    /// Must be called whenever the guest's paging root or paging controls
    /// change (CR0, CR3, CR4 or EFER writes), and before each emulated
    /// instruction: the guest edits its page tables without telling us.
    pub fn flush(&mut self) {
        self.stats.flushes = self.stats.flushes.wrapping_add(1);
        let dropped = self.tlb.len();
        self.tlb.flush();
        tracing::debug!(dropped, "flushed tlb");
    }

    /// INVLPG: drops the translations covering `linear`.
    pub fn invalidate_page(&mut self, linear: u64) {
        let dropped = self.tlb.invalidate(linear);
        tracing::trace!(linear, dropped, "invalidated page");
    }

    /// Translate a linear address using the vCPU's current paging state.
    ///
    /// `cpl` is the privilege level the access is made at; the access counts
    /// as a user access only for CPL 3 without `implicit_supervisor`.
    ///
    /// With `cr3_override`, the cache is flushed both before and after the
    /// walk so entries for the overridden address space never outlive the
    /// call and entries for the active one are never consulted.
    pub fn translate_linear(
        &mut self,
        ctx: &mut impl PagingSource,
        linear: u64,
        implicit_supervisor: bool,
        cpl: u8,
        access: AccessType,
        cr3_override: Option<u64>,
    ) -> TranslationResult {
        if cr3_override.is_some() {
            self.flush();
        }

        let mut state = ctx.paging_state();
        if let Some(root) = cr3_override {
            state.cr3 = root;
        }

        let result = self.translate_with_state(ctx, &state, linear, implicit_supervisor, cpl, access);

        if cr3_override.is_some() {
            self.flush();
        }
        result
    }

    /// [`VirtualMmu::translate_linear`] with the override folded into one value.
    #[inline]
    pub fn translate(
        &mut self,
        ctx: &mut impl PagingSource,
        linear: u64,
        cpl: u8,
        access: AccessType,
        ovr: AccessOverride,
    ) -> TranslationResult {
        self.translate_linear(
            ctx,
            linear,
            ovr.implicit_supervisor,
            cpl,
            access,
            ovr.address_space_root,
        )
    }

    fn translate_with_state(
        &mut self,
        bus: &mut impl MemoryBus,
        state: &PagingStateSnapshot,
        linear: u64,
        implicit_supervisor: bool,
        cpl: u8,
        access: AccessType,
    ) -> TranslationResult {
        let mode = PagingMode::of(state);

        // Without paging (and in the 32-bit paging modes) the linear address
        // space is 32 bits wide.
        let linear = match mode {
            PagingMode::Disabled => return TranslationResult::Physical(linear & 0xffff_ffff),
            PagingMode::Legacy32 | PagingMode::Pae => linear & 0xffff_ffff,
            PagingMode::Long4 => {
                if !walk::is_canonical_48(linear) {
                    return TranslationResult::Fault {
                        vector: GP_VECTOR,
                        error_code: 0,
                    };
                }
                linear
            }
        };

        let access_ctx = AccessContext::new(state, access, cpl, implicit_supervisor);
        self.stats.lookups = self.stats.lookups.wrapping_add(1);

        if let Some(slot) = self.tlb.lookup(linear, state.cr3) {
            if let Some(entry) = self.tlb.entry(slot).copied() {
                self.stats.hits = self.stats.hits.wrapping_add(1);
                if let Err(error_code) = access_ctx.check(entry.user(), entry.writable(), entry.nx()) {
                    return page_fault(error_code);
                }
                if access.is_write() && !entry.dirty() {
                    walk::set_dirty(bus, &entry);
                    self.tlb.set_dirty(slot);
                }
                return TranslationResult::Physical(entry.translate(linear));
            }
        }

        self.stats.misses = self.stats.misses.wrapping_add(1);
        self.stats.page_walks = self.stats.page_walks.wrapping_add(1);

        match Walker::new(state, access_ctx, linear, self.max_phys_bits).walk(bus, mode) {
            Ok(entry) => {
                let paddr = entry.translate(linear);
                self.tlb.insert(entry);
                TranslationResult::Physical(paddr)
            }
            Err(error_code) => {
                tracing::trace!(linear, ?access, error_code, "page walk faulted");
                page_fault(error_code)
            }
        }
    }
}

#[inline]
fn page_fault(error_code: u32) -> TranslationResult {
    TranslationResult::Fault {
        vector: PF_VECTOR,
        error_code,
    }
}
