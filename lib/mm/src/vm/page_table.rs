//! Module for manipulating page tables and memory mappings.
//!
//! This module provides a `PageTable` struct that holds the leaf page tables
//! of an address space in memory. Leaf tables are created on demand and are
//! looked up through a directory indexed by the upper bits of the VPN, which
//! plays the role of the middle level of an Sv39 walk.
//!
//! The page table keeps no lock of its own. The owning address space wraps it
//! in its page table lock, and every method here must be called with that
//! lock held.

use alloc::{boxed::Box, collections::btree_map::BTreeMap};

use config::mm::PTE_PER_TABLE;
use systype::{SysError, SysResult};

use crate::address::{PhysPageNum, VirtPageNum};

use super::pte::{PageTableEntry, PteFlags};

/// A leaf page table.
type LeafTable = [PageTableEntry; PTE_PER_TABLE];

/// A data structure for manipulating page tables and memory mappings.
///
/// Entries are written by the memory manager when a page is faulted in or
/// unmapped, and by [`PageTable::mark_accessed`], which stands in for the
/// hardware setting the accessed and dirty bits on a memory access.
#[derive(Debug, Default)]
pub struct PageTable {
    /// Leaf tables keyed by the index of the directory entry pointing at them.
    tables: BTreeMap<usize, Box<LeafTable>>,
    /// Number of single-page TLB flushes issued against this table.
    tlb_flushes: usize,
}

impl PageTable {
    /// Builds a new `PageTable` with no leaf tables.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a mutable reference to a leaf page table entry mapping a given VPN.
    /// This method creates the leaf table if necessary. Note that the returned
    /// entry may be invalid.
    pub fn find_entry_create(&mut self, vpn: VirtPageNum) -> &mut PageTableEntry {
        let table = self
            .tables
            .entry(vpn.table_index())
            .or_insert_with(|| Box::new([PageTableEntry::default(); PTE_PER_TABLE]));
        &mut table[vpn.entry_index()]
    }

    /// Returns a mutable reference to a leaf page table entry mapping a given VPN.
    /// If the leaf table is not present, returns `None`. Note that the returned
    /// entry may be invalid.
    pub fn find_entry(&mut self, vpn: VirtPageNum) -> Option<&mut PageTableEntry> {
        self.tables
            .get_mut(&vpn.table_index())
            .map(|table| &mut table[vpn.entry_index()])
    }

    /// Returns a copy of the entry mapping a given VPN, or `None` if the leaf
    /// table covering it is not present.
    pub fn entry(&self, vpn: VirtPageNum) -> Option<PageTableEntry> {
        self.tables
            .get(&vpn.table_index())
            .map(|table| table[vpn.entry_index()])
    }

    /// Returns whether a leaf table covers the given VPN.
    pub fn has_table(&self, vpn: VirtPageNum) -> bool {
        self.tables.contains_key(&vpn.table_index())
    }

    /// Returns the physical page number mapped at `vpn`, if the entry is valid.
    pub fn lookup(&self, vpn: VirtPageNum) -> Option<PhysPageNum> {
        self.entry(vpn)
            .filter(|pte| pte.is_valid())
            .map(|pte| pte.ppn())
    }

    /// Maps a leaf page by specifying VPN, PPN, and page table entry flags.
    ///
    /// This method does not allocate the frame for the leaf page. A file entry
    /// left at `vpn` is overwritten.
    ///
    /// # Errors
    /// Returns [`SysError::EEXIST`] if `vpn` is already mapped.
    pub fn map_page(&mut self, vpn: VirtPageNum, ppn: PhysPageNum, flags: PteFlags) -> SysResult<()> {
        let entry = self.find_entry_create(vpn);
        if entry.is_valid() {
            return Err(SysError::EEXIST);
        }
        *entry = PageTableEntry::new(ppn, flags | PteFlags::V);
        Ok(())
    }

    /// Stores `pte` at `vpn`, creating the leaf table if necessary.
    pub fn set_entry(&mut self, vpn: VirtPageNum, pte: PageTableEntry) {
        *self.find_entry_create(vpn) = pte;
    }

    /// Clears the accessed bit of the entry at `vpn`, returning whether it was
    /// set. Returns `false` for entries that are not present.
    pub fn test_and_clear_young(&mut self, vpn: VirtPageNum) -> bool {
        match self.find_entry(vpn) {
            Some(entry) if entry.is_valid() => entry.test_and_clear_accessed(),
            _ => false,
        }
    }

    /// Clears the entry at `vpn` and flushes it from the TLB, returning the
    /// old entry so that its dirty bit can be inspected.
    pub fn clear_flush(&mut self, vpn: VirtPageNum) -> PageTableEntry {
        let old = match self.find_entry(vpn) {
            Some(entry) => core::mem::take(entry),
            None => PageTableEntry::default(),
        };
        self.flush_tlb(vpn);
        old
    }

    /// Clears the entry at `vpn` without flushing. Used when the mapping goes
    /// away together with the whole table, or the entry was never present.
    pub fn clear(&mut self, vpn: VirtPageNum) -> PageTableEntry {
        self.find_entry(vpn).map(core::mem::take).unwrap_or_default()
    }

    /// Sets the accessed bit, and the dirty bit if `write`, on the entry at
    /// `vpn` as the MMU would on a memory access.
    ///
    /// Returns `false` if no page is present at `vpn`, which would raise a
    /// page fault on real hardware.
    pub fn mark_accessed(&mut self, vpn: VirtPageNum, write: bool) -> bool {
        let Some(entry) = self.find_entry(vpn) else {
            return false;
        };
        if !entry.is_valid() {
            return false;
        }
        let mut flags = entry.flags() | PteFlags::A;
        if write {
            flags |= PteFlags::D;
        }
        entry.set_flags(flags);
        true
    }

    /// Returns the number of TLB flushes issued so far.
    pub fn tlb_flushes(&self) -> usize {
        self.tlb_flushes
    }

    fn flush_tlb(&mut self, vpn: VirtPageNum) {
        log::trace!("[PageTable::flush_tlb] vpn {:#x}", vpn.to_usize());
        self.tlb_flushes += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vpn(n: usize) -> VirtPageNum {
        VirtPageNum::new(n)
    }

    #[test]
    fn map_and_lookup() {
        let mut pt = PageTable::new();
        assert!(pt.entry(vpn(0x10000)).is_none());
        assert!(!pt.has_table(vpn(0x10000)));

        let ppn = PhysPageNum::new(0x8_0500);
        pt.map_page(vpn(0x10000), ppn, PteFlags::R | PteFlags::U).unwrap();
        assert!(pt.has_table(vpn(0x10001)));
        assert_eq!(pt.lookup(vpn(0x10000)), Some(ppn));
        assert_eq!(pt.lookup(vpn(0x10001)), None);
        assert!(pt.entry(vpn(0x10001)).is_some());
        assert_eq!(
            pt.map_page(vpn(0x10000), ppn, PteFlags::R),
            Err(SysError::EEXIST)
        );
    }

    #[test]
    fn accessed_bit_is_cleared_once() {
        let mut pt = PageTable::new();
        let ppn = PhysPageNum::new(0x8_0500);
        pt.map_page(vpn(7), ppn, PteFlags::R).unwrap();

        assert!(!pt.test_and_clear_young(vpn(7)));
        assert!(pt.mark_accessed(vpn(7), false));
        assert!(pt.test_and_clear_young(vpn(7)));
        assert!(!pt.test_and_clear_young(vpn(7)));
        assert!(!pt.mark_accessed(vpn(8), false));
    }

    #[test]
    fn clear_flush_returns_old_entry() {
        let mut pt = PageTable::new();
        let ppn = PhysPageNum::new(0x8_0500);
        pt.map_page(vpn(7), ppn, PteFlags::R | PteFlags::W).unwrap();
        pt.mark_accessed(vpn(7), true);

        let old = pt.clear_flush(vpn(7));
        assert!(old.is_dirty());
        assert_eq!(old.ppn(), ppn);
        assert_eq!(pt.lookup(vpn(7)), None);
        assert_eq!(pt.tlb_flushes(), 1);
        assert!(pt.clear(vpn(7)).is_none());
    }
}
