//! Reverse mapping of physical pages.
//!
//! Given a physical page, the functions of this module find the page table
//! entries that map it, without walking every address space. Page reclaim
//! uses them to age a page ([`page_referenced`]) and to unmap it from every
//! address space before evicting it ([`try_to_unmap`]).
//!
//! Anonymous pages remember the address space and address they are mapped at.
//! File pages are found through the VMAs on the area lists of their file's
//! [`MappingRegistry`]. For a linear VMA, the address of a page follows from
//! its file offset. Nonlinear VMAs are scanned cluster by cluster instead, see
//! [`file`].
//!
//! None of the functions here ever waits for a lock. The registry lock, the
//! page table locks and the VMA locks are all only tried. A contended lock
//! makes the page look unreferenced, or makes `try_to_unmap` return
//! [`SwapResult::Again`], and the caller comes back later.
//!
//! Lock order: page lock, then registry lock, then page table lock, then the
//! rmap lock of a page.
//!
//! [`MappingRegistry`]: crate::mapping::MappingRegistry

mod anon;
mod file;

use alloc::sync::Arc;

use crate::{
    address::VirtAddr,
    page::{AnonOwner, Page, PageFlags, PageOwner},
    vm::{addr_space::AddrSpace, vm_area::VmArea},
};

/// Outcome of an attempt to unmap a page from every address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapResult {
    /// The page is no longer mapped anywhere.
    Success,
    /// Some mappings may remain. Trying again later may succeed.
    Again,
    /// Some mapping must not, or should not, be removed now.
    Fail,
}

/// Records a new mapping of an anonymous page at `address` in `space`.
///
/// The first mapping makes `space` the owner of the page.
///
/// # Panics
/// Panics if the page is reserved or belongs to a file.
pub fn page_add_anon_rmap(page: &Page, space: &Arc<AddrSpace>, address: VirtAddr) {
    assert!(!page.is_reserved(), "anon rmap on reserved page {:?}", page);

    let mut owner = page.rmap_lock();
    assert!(
        !matches!(*owner, PageOwner::File(_)),
        "anon rmap on file page {:?}",
        page
    );
    if !page.is_mapped() {
        debug_assert!(matches!(*owner, PageOwner::Unowned));
        *owner = PageOwner::Anon(AnonOwner::new(space, address));
        page.zone().inc_mapped();
    }
    page.inc_mapcount();
}

/// Records a new mapping of a file page.
///
/// Pages outside the memory map and reserved pages are not tracked.
///
/// # Panics
/// Panics if the page is anonymous.
pub fn page_add_file_rmap(page: &Page) {
    let owner = page.rmap_lock();
    assert!(
        !matches!(*owner, PageOwner::Anon(_)),
        "file rmap on anon page {:?}",
        page
    );
    if !page.is_valid_frame() || page.is_reserved() {
        return;
    }
    if page.inc_mapcount() == 1 {
        page.zone().inc_mapped();
    }
}

/// Records that one mapping of the page is gone.
///
/// When the last mapping goes, a page-level dirty bit is moved to the page,
/// an anonymous page loses its owner, and the page stops counting as mapped.
///
/// # Panics
/// Panics if the page is reserved or not mapped.
pub fn page_remove_rmap(page: &Page) {
    assert!(!page.is_reserved(), "removing rmap of reserved page {:?}", page);

    let mut owner = page.rmap_lock();
    if !page.is_mapped() {
        log::error!("[page_remove_rmap] mapcount underflow on {:?}", page);
        panic!("page_remove_rmap: mapcount underflow on {:?}", page);
    }
    if page.dec_mapcount() == 0 {
        if page.test_and_clear_hw_dirty() {
            page.set_dirty();
        }
        if matches!(*owner, PageOwner::Anon(_)) {
            *owner = PageOwner::Unowned;
        }
        page.zone().dec_mapped();
    }
}

/// Counts the recent references to a page, clearing the evidence.
///
/// The result counts the page-level accessed bit, the software referenced
/// bit, and every page table entry mapping the page with its accessed bit
/// set. A mapping in a locked, shared VMA counts as one reference and ends
/// the search, as such a page can never be reclaimed.
///
/// The result may be an underestimate if some lock was contended.
pub fn page_referenced(page: &Page) -> usize {
    let mut referenced = 0;
    if page.test_and_clear_young() {
        referenced += 1;
    }
    if page.test_and_clear(PageFlags::REFERENCED) {
        referenced += 1;
    }
    if page.is_mapped() {
        referenced += match page.owner() {
            PageOwner::Anon(anon) => anon::page_referenced_anon(page, &anon),
            PageOwner::File(file) => file::page_referenced_file(page, &file),
            PageOwner::Unowned => 0,
        };
    }
    referenced
}

/// Tries to remove every page table entry mapping the page.
///
/// The caller must hold the page lock. Returns [`SwapResult::Success`] if the
/// page ended up unmapped, whatever happened along the way.
///
/// # Panics
/// Panics if the page is reserved, is not locked, is not mapped, or has no
/// owner to find its mappings through.
pub fn try_to_unmap(page: &Page) -> SwapResult {
    assert!(!page.is_reserved(), "unmapping reserved page {:?}", page);
    assert!(page.is_locked(), "unmapping unlocked page {:?}", page);
    assert!(page.is_mapped(), "unmapping page that is not mapped {:?}", page);

    let ret = match page.owner() {
        PageOwner::Anon(anon) => anon::try_to_unmap_anon(page, &anon),
        PageOwner::File(file) => file::try_to_unmap_file(page, &file),
        PageOwner::Unowned => panic!("mapped page {:?} has no owner", page),
    };
    if !page.is_mapped() {
        return SwapResult::Success;
    }
    ret
}

/// Checks whether `space` maps the page at `address`, and if so counts and
/// clears the accessed bit of the entry.
///
/// `mapcount` is the number of mappings left to find. It is decreased when
/// the mapping is found. `failed` counts the address spaces whose page table
/// lock was contended.
fn page_referenced_one(
    page: &Page,
    space: &AddrSpace,
    address: VirtAddr,
    mapcount: &mut usize,
    failed: &mut usize,
) -> usize {
    let Some(mut page_table) = space.try_page_table() else {
        log::trace!("[page_referenced_one] page table lock busy");
        *failed += 1;
        return 0;
    };
    let vpn = address.page_number();
    match page_table.entry(vpn) {
        Some(pte) if pte.is_valid() && pte.ppn() == page.ppn() => {}
        _ => return 0,
    }
    *mapcount = mapcount.saturating_sub(1);
    page_table.test_and_clear_young(vpn) as usize
}

/// Tries to remove the mapping of the page at `address` in `space`.
///
/// `mapcount` is the number of mappings left to find. It is decreased when
/// the mapping is found, whether or not it is removed.
fn try_to_unmap_one(
    page: &Page,
    area: &VmArea,
    space: &AddrSpace,
    address: VirtAddr,
    mapcount: &mut isize,
) -> SwapResult {
    let Some(mut page_table) = space.try_page_table() else {
        log::trace!("[try_to_unmap_one] page table lock busy");
        return SwapResult::Again;
    };
    let vpn = address.page_number();
    match page_table.entry(vpn) {
        Some(pte) if pte.is_valid() && pte.ppn() == page.ppn() => {}
        _ => return SwapResult::Again,
    }
    *mapcount -= 1;

    // A young entry was used recently; clearing its accessed bit gives it
    // one more round before it is unmapped.
    if area.is_locked_or_reserved() || page_table.test_and_clear_young(vpn) {
        log::trace!(
            "[try_to_unmap_one] keeping {:?} at {:#x}",
            page,
            address.to_usize()
        );
        return SwapResult::Fail;
    }

    let old = page_table.clear_flush(vpn);
    if old.is_dirty() {
        page.set_dirty();
    }
    space.dec_rss();
    page_remove_rmap(page);
    if page.put() {
        log::trace!("[try_to_unmap_one] freeing {:?}", page);
        space.mem().free_page(page);
    }
    SwapResult::Again
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::MemMap;
    use alloc::sync::Arc;
    use config::mm::PAGE_SIZE;
    use systype::memory_flags::{MmapFlags, MmapProt};

    fn world() -> (Arc<MemMap>, Arc<AddrSpace>) {
        let mem = Arc::new(MemMap::with_frames(0x1000, 32));
        let space = AddrSpace::new(mem.clone());
        (mem, space)
    }

    #[test]
    fn file_rmap_counts_mappings() {
        let (mem, _space) = world();
        let page = mem.alloc_page().unwrap();
        page_add_file_rmap(&page);
        page_add_file_rmap(&page);
        assert_eq!(page.mapcount(), 2);
        assert_eq!(mem.nr_mapped(), 1);

        page.set_flags(PageFlags::HW_DIRTY);
        page_remove_rmap(&page);
        assert!(!page.is_dirty());
        page_remove_rmap(&page);
        assert!(page.is_dirty());
        assert!(!page.flags().contains(PageFlags::HW_DIRTY));
        assert_eq!(mem.nr_mapped(), 0);
    }

    #[test]
    fn file_rmap_ignores_untracked_pages() {
        let (mem, _space) = world();
        let reserved = mem.alloc_reserved_page().unwrap();
        page_add_file_rmap(&reserved);
        assert_eq!(reserved.mapcount(), 0);

        let bogus = Page::new(crate::address::PhysPageNum::new(0x10), mem.zone().clone());
        page_add_file_rmap(&bogus);
        assert_eq!(bogus.mapcount(), 0);
        assert_eq!(mem.nr_mapped(), 0);
    }

    #[test]
    fn anon_rmap_sets_and_clears_owner() {
        let (mem, space) = world();
        let page = mem.alloc_page().unwrap();
        page_add_anon_rmap(&page, &space, VirtAddr::new(0x10_0123));
        assert!(page.is_anon());
        assert_eq!(page.index(), 0x10_0000);
        assert_eq!(mem.nr_mapped(), 1);

        page_remove_rmap(&page);
        assert!(!page.is_anon());
        assert!(matches!(page.owner(), PageOwner::Unowned));
        assert_eq!(mem.nr_mapped(), 0);
    }

    #[test]
    #[should_panic]
    fn remove_rmap_underflow_panics() {
        let (mem, _space) = world();
        let page = mem.alloc_page().unwrap();
        page_remove_rmap(&page);
    }

    #[test]
    #[should_panic]
    fn anon_rmap_on_reserved_page_panics() {
        let (mem, space) = world();
        let page = mem.alloc_reserved_page().unwrap();
        page_add_anon_rmap(&page, &space, VirtAddr::new(0x10_0000));
    }

    #[test]
    #[should_panic]
    fn file_rmap_on_anon_page_panics() {
        let (mem, space) = world();
        let page = mem.alloc_page().unwrap();
        page_add_anon_rmap(&page, &space, VirtAddr::new(0x10_0000));
        page_add_file_rmap(&page);
    }

    #[test]
    #[should_panic]
    fn unmapping_unlocked_page_panics() {
        let (mem, _space) = world();
        let page = mem.alloc_page().unwrap();
        page_add_file_rmap(&page);
        try_to_unmap(&page);
    }

    #[test]
    #[should_panic]
    fn unmapping_unmapped_page_panics() {
        let (mem, _space) = world();
        let page = mem.alloc_page().unwrap();
        assert!(page.try_lock_page());
        try_to_unmap(&page);
    }

    #[test]
    fn page_level_bits_count_as_references() {
        let (mem, _space) = world();
        let page = mem.alloc_page().unwrap();
        page.set_flags(PageFlags::HW_YOUNG);
        page.mark_referenced();
        assert_eq!(page_referenced(&page), 2);
        assert_eq!(page_referenced(&page), 0);
    }

    #[test]
    fn anon_page_is_aged_and_unmapped() {
        let (mem, space) = world();
        let va = VirtAddr::new(0x10_0000);
        space
            .mmap_anon(va, 2 * PAGE_SIZE, MmapProt::PROT_READ | MmapProt::PROT_WRITE, MmapFlags::MAP_PRIVATE)
            .unwrap();
        let page = space.fault_anon(va).unwrap();
        page.get();
        space.access(va, true);

        assert_eq!(page_referenced(&page), 1);
        assert_eq!(page_referenced(&page), 0);

        assert!(page.try_lock_page());
        assert_eq!(try_to_unmap(&page), SwapResult::Success);
        page.unlock_page();
        assert!(!page.is_anon());
        assert!(page.is_dirty());
        assert_eq!(space.rss(), 0);
        assert_eq!(mem.nr_mapped(), 0);
        assert_eq!(space.pte(va).map(|pte| pte.is_valid()), Some(false));
    }

    #[test]
    fn young_anon_page_is_kept() {
        let (mem, space) = world();
        let va = VirtAddr::new(0x10_0000);
        space
            .mmap_anon(va, PAGE_SIZE, MmapProt::PROT_READ, MmapFlags::MAP_PRIVATE)
            .unwrap();
        let page = space.fault_anon(va).unwrap();
        space.access(va, false);

        assert!(page.try_lock_page());
        assert_eq!(try_to_unmap(&page), SwapResult::Fail);
        assert_eq!(try_to_unmap(&page), SwapResult::Success);
        page.unlock_page();
        assert_eq!(mem.nr_mapped(), 0);
        // The mapping held the only reference, so the frame goes back.
        assert_eq!(page.count(), 0);
        assert!(mem.pfn_to_page(page.ppn()).is_none());
        assert_eq!(mem.free_frames(), 32);
    }

    #[test]
    fn contended_page_table_defers_anon_unmap() {
        let (mem, space) = world();
        let va = VirtAddr::new(0x10_0000);
        space
            .mmap_anon(va, PAGE_SIZE, MmapProt::PROT_READ, MmapFlags::MAP_PRIVATE)
            .unwrap();
        let page = space.fault_anon(va).unwrap();
        assert!(page.try_lock_page());

        let page_table = space.page_table();
        assert_eq!(try_to_unmap(&page), SwapResult::Again);
        drop(page_table);
        assert_eq!(page.mapcount(), 1);
        assert_eq!(mem.nr_mapped(), 1);
        assert_eq!(try_to_unmap(&page), SwapResult::Success);
        page.unlock_page();
    }
}
