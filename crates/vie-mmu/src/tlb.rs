use bitflags::bitflags;

/// Number of translations the cache holds.
///
/// The cache only amortizes the page touches of a single emulated instruction
/// (fetch, a couple of operands, maybe a page crossing), so it stays tiny and
/// fully associative.
pub const TLB_CAPACITY: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageSize {
    Size4K,
    Size2M,
    Size4M,
    Size1G,
}

impl PageSize {
    #[inline]
    pub const fn bytes(self) -> u64 {
        match self {
            PageSize::Size4K => 4 * 1024,
            PageSize::Size2M => 2 * 1024 * 1024,
            PageSize::Size4M => 4 * 1024 * 1024,
            PageSize::Size1G => 1024 * 1024 * 1024,
        }
    }

    #[inline]
    pub(crate) const fn base(self, addr: u64) -> u64 {
        addr & !(self.bytes() - 1)
    }
}

bitflags! {
    /// Effective permissions of a cached translation, accumulated over every
    /// paging-structure level.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct EntryFlags: u8 {
        const USER = 1 << 0;
        const WRITABLE = 1 << 1;
        const NX = 1 << 2;
        /// Leaf entry already has D set.
        const DIRTY = 1 << 3;
        /// Leaf entry is 8 bytes wide (PAE / long mode).
        const LEAF_64 = 1 << 4;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TlbEntry {
    pub(crate) vbase: u64,
    pub(crate) pbase: u64,
    pub(crate) page_size: PageSize,
    /// Physical address of the leaf paging-structure entry.
    pub(crate) leaf_addr: u64,
    pub(crate) flags: EntryFlags,
    /// Effective CR3 the walk that produced this entry ran under.
    pub(crate) root: u64,
}

impl TlbEntry {
    #[inline]
    pub(crate) fn covers(&self, linear: u64, root: u64) -> bool {
        self.root == root && self.page_size.base(linear) == self.vbase
    }

    #[inline]
    pub(crate) fn translate(&self, linear: u64) -> u64 {
        self.pbase + (linear - self.vbase)
    }

    #[inline]
    pub(crate) fn user(&self) -> bool {
        self.flags.contains(EntryFlags::USER)
    }

    #[inline]
    pub(crate) fn writable(&self) -> bool {
        self.flags.contains(EntryFlags::WRITABLE)
    }

    #[inline]
    pub(crate) fn nx(&self) -> bool {
        self.flags.contains(EntryFlags::NX)
    }

    #[inline]
    pub(crate) fn dirty(&self) -> bool {
        self.flags.contains(EntryFlags::DIRTY)
    }

    #[inline]
    pub(crate) fn leaf_is_64(&self) -> bool {
        self.flags.contains(EntryFlags::LEAF_64)
    }
}

/// Fully associative translation cache with round-robin replacement.
#[derive(Debug, Clone, Default)]
pub(crate) struct Tlb {
    slots: [Option<TlbEntry>; TLB_CAPACITY],
    next: usize,
}

impl Tlb {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Returns the slot holding a translation for `linear` made under `root`.
    #[inline]
    pub(crate) fn lookup(&self, linear: u64, root: u64) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| slot.is_some_and(|e| e.covers(linear, root)))
    }

    #[inline]
    pub(crate) fn entry(&self, slot: usize) -> Option<&TlbEntry> {
        self.slots.get(slot).and_then(Option::as_ref)
    }

    pub(crate) fn set_dirty(&mut self, slot: usize) {
        if let Some(Some(entry)) = self.slots.get_mut(slot) {
            entry.flags |= EntryFlags::DIRTY;
        }
    }

    pub(crate) fn insert(&mut self, entry: TlbEntry) {
        // Refill in place when the same page was cached before (e.g. after an
        // A/D update), otherwise prefer a free slot before evicting.
        let slot = self
            .slots
            .iter()
            .position(|slot| {
                slot.is_some_and(|e| e.root == entry.root && e.vbase == entry.vbase)
            })
            .or_else(|| self.slots.iter().position(Option::is_none));

        let slot = match slot {
            Some(slot) => slot,
            None => {
                let victim = self.next;
                self.next = (self.next + 1) % TLB_CAPACITY;
                victim
            }
        };
        self.slots[slot] = Some(entry);
    }

    pub(crate) fn flush(&mut self) {
        self.slots = [None; TLB_CAPACITY];
        self.next = 0;
    }

    /// Drops every entry covering `linear`, whatever root it was cached under.
    pub(crate) fn invalidate(&mut self, linear: u64) -> usize {
        let mut dropped = 0;
        for slot in self.slots.iter_mut() {
            if slot.is_some_and(|e| e.page_size.base(linear) == e.vbase) {
                *slot = None;
                dropped += 1;
            }
        }
        dropped
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(vbase: u64, root: u64) -> TlbEntry {
        TlbEntry {
            vbase,
            pbase: vbase + 0x10_0000,
            page_size: PageSize::Size4K,
            leaf_addr: 0,
            flags: EntryFlags::WRITABLE,
            root,
        }
    }

    #[test]
    fn replacement_is_round_robin_once_full() {
        let mut tlb = Tlb::new();
        for i in 0..TLB_CAPACITY as u64 {
            tlb.insert(entry(i * 0x1000, 0));
        }
        assert_eq!(tlb.len(), TLB_CAPACITY);

        tlb.insert(entry(0x10_000, 0));
        assert_eq!(tlb.lookup(0, 0), None);
        assert!(tlb.lookup(0x10_000, 0).is_some());

        tlb.insert(entry(0x11_000, 0));
        assert_eq!(tlb.lookup(0x1000, 0), None);
        assert!(tlb.lookup(0x2000, 0).is_some());
    }

    #[test]
    fn refill_of_same_page_does_not_evict() {
        let mut tlb = Tlb::new();
        tlb.insert(entry(0x1000, 0));
        tlb.insert(entry(0x2000, 0));
        tlb.insert(entry(0x1000, 0));
        assert_eq!(tlb.len(), 2);
    }

    #[test]
    fn root_tag_mismatch_is_a_miss() {
        let mut tlb = Tlb::new();
        tlb.insert(entry(0x4000, 0x1000));
        assert!(tlb.lookup(0x4abc, 0x1000).is_some());
        assert_eq!(tlb.lookup(0x4abc, 0x2000), None);
    }

    #[test]
    fn invalidate_drops_all_roots() {
        let mut tlb = Tlb::new();
        tlb.insert(entry(0x4000, 0x1000));
        tlb.insert(entry(0x4000, 0x2000));
        tlb.insert(entry(0x5000, 0x2000));
        assert_eq!(tlb.invalidate(0x4fff), 2);
        assert_eq!(tlb.len(), 1);
    }
}
