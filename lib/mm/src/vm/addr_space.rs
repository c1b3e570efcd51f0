//! Module for managing virtual address spaces.
//!
//! An address space is a mapping from virtual address space to physical address space,
//! managed by a [`AddrSpace`] struct. It consists of a set of virtual memory areas
//! (VMAs), represented by [`VmArea`] structs, and a page table, represented by a
//! [`PageTable`] struct. Based on the collaboration between VMAs and the page table,
//! this module provides a set of functions to manage the address space for the upper
//! layer, such as mapping a file or anonymous memory into the address space, handling
//! page faults, remapping file pages, and unmapping memory regions.
//!
//! An address space has two locks:
//! - the page table lock, which protects the page table and is taken by the reverse
//!   mapping code to inspect or clear an entry.
//! - the VMA lock, which protects the set of VMAs.
//!
//! The VMA lock, if taken, is always taken before the page table lock.

use alloc::{collections::btree_map::BTreeMap, sync::Arc};
use core::{
    ops::DerefMut,
    sync::atomic::{AtomicUsize, Ordering},
};

use config::mm::PAGE_SIZE;
use mutex::{SpinLock, SpinNoIrqLock};
use systype::{
    SysError, SysResult,
    memory_flags::{MmapFlags, MmapProt},
};

use super::{
    page_table::PageTable,
    pte::PageTableEntry,
    vm_area::{VmArea, VmFlags},
};
use crate::{
    address::{VirtAddr, VirtPageNum},
    mapping::MappingRegistry,
    page::{MemMap, Page, PageOwner},
    rmap::{page_add_anon_rmap, page_add_file_rmap, page_remove_rmap},
};

/// A virtual address space.
///
/// See the module-level documentation for more information.
pub struct AddrSpace {
    /// Page table of the address space.
    page_table: SpinNoIrqLock<PageTable>,
    /// VMAs of the address space.
    vm_areas: SpinLock<BTreeMap<VirtAddr, Arc<VmArea>>>,
    /// Number of non-reserved pages mapped in the address space.
    rss: AtomicUsize,
    /// Where the frames of mapped pages come from.
    mem: Arc<MemMap>,
}

impl AddrSpace {
    /// Creates an empty address space whose pages come from `mem`.
    pub fn new(mem: Arc<MemMap>) -> Arc<Self> {
        Arc::new(Self {
            page_table: SpinNoIrqLock::new(PageTable::new()),
            vm_areas: SpinLock::new(BTreeMap::new()),
            rss: AtomicUsize::new(0),
            mem,
        })
    }

    pub fn mem(&self) -> &Arc<MemMap> {
        &self.mem
    }

    /// Returns the number of non-reserved pages mapped in the address space.
    pub fn rss(&self) -> usize {
        self.rss.load(Ordering::Acquire)
    }

    pub(crate) fn dec_rss(&self) {
        self.rss.fetch_sub(1, Ordering::AcqRel);
    }

    /// Takes the page table lock, waiting for it if necessary.
    pub fn page_table(&self) -> impl DerefMut<Target = PageTable> + '_ {
        self.page_table.lock()
    }

    /// Takes the page table lock if it is free.
    pub fn try_page_table(&self) -> Option<impl DerefMut<Target = PageTable> + '_> {
        self.page_table.try_lock()
    }

    /// Returns a copy of the page table entry at `va`.
    pub fn pte(&self, va: VirtAddr) -> Option<PageTableEntry> {
        self.page_table.lock().entry(va.page_number())
    }

    /// Returns the file offset left in the page table by evicting a page from
    /// a nonlinear VMA at `va`.
    pub fn file_pte_offset(&self, va: VirtAddr) -> Option<usize> {
        self.pte(va).and_then(PageTableEntry::file_offset)
    }

    /// Returns the VMA containing `va`.
    pub fn find_area(&self, va: VirtAddr) -> Option<Arc<VmArea>> {
        find_area_in(&self.vm_areas.lock(), va)
    }

    /// Returns the VMA containing `va` without waiting for the VMA lock.
    /// Returns `None` if the lock is contended or no VMA contains `va`.
    pub(crate) fn try_find_area(&self, va: VirtAddr) -> Option<Arc<VmArea>> {
        let vm_areas = self.vm_areas.try_lock()?;
        find_area_in(&vm_areas, va)
    }

    /// Returns the number of VMAs in the address space.
    pub fn nr_areas(&self) -> usize {
        self.vm_areas.lock().len()
    }

    /// Inserts a VMA into the address space.
    ///
    /// # Errors
    /// Returns [`SysError::EEXIST`] if the VMA overlaps an existing one.
    fn insert_area(&self, area: Arc<VmArea>) -> SysResult<()> {
        let mut vm_areas = self.vm_areas.lock();
        let overlaps_prev = vm_areas
            .range(..=area.start_va())
            .next_back()
            .is_some_and(|(_, prev)| prev.end_va() > area.start_va());
        let overlaps_next = vm_areas
            .range(area.start_va()..)
            .next()
            .is_some_and(|(_, next)| next.start_va() < area.end_va());
        if overlaps_prev || overlaps_next {
            return Err(SysError::EEXIST);
        }
        vm_areas.insert(area.start_va(), area);
        Ok(())
    }

    /// Maps `len` bytes of the file of `registry`, from page offset `pgoff`,
    /// at `start`.
    ///
    /// Pages are brought in lazily by [`AddrSpace::fault_file`].
    ///
    /// # Errors
    /// Returns [`SysError::EINVAL`] if `start` is not page-aligned or `len` is
    /// zero, and [`SysError::EEXIST`] if the range overlaps another mapping.
    pub fn mmap_file(
        self: &Arc<Self>,
        start: VirtAddr,
        len: usize,
        prot: MmapProt,
        flags: MmapFlags,
        registry: &Arc<MappingRegistry>,
        pgoff: usize,
    ) -> SysResult<Arc<VmArea>> {
        let end = checked_range(start, len)?;
        let area = Arc::new(VmArea::new_file_backed(
            start,
            end,
            VmFlags::from_mmap(prot, flags),
            pgoff,
            registry.clone(),
            Arc::downgrade(self),
        ));
        self.insert_area(area.clone())?;
        registry.link(&area);
        log::debug!("[AddrSpace::mmap_file] {:?}", area);
        Ok(area)
    }

    /// Maps `len` bytes of anonymous memory at `start`.
    ///
    /// # Errors
    /// Same as [`AddrSpace::mmap_file`].
    pub fn mmap_anon(
        self: &Arc<Self>,
        start: VirtAddr,
        len: usize,
        prot: MmapProt,
        flags: MmapFlags,
    ) -> SysResult<Arc<VmArea>> {
        let end = checked_range(start, len)?;
        let area = Arc::new(VmArea::new_anonymous(
            start,
            end,
            VmFlags::from_mmap(prot, flags),
            Arc::downgrade(self),
        ));
        self.insert_area(area.clone())?;
        log::debug!("[AddrSpace::mmap_anon] {:?}", area);
        Ok(area)
    }

    /// Handles a page fault at `va` in a file-backed VMA.
    ///
    /// The file page is looked up in the page cache, created if necessary, and
    /// mapped. If the entry at `va` is a file entry left by nonlinear
    /// eviction, the page at the recorded offset is mapped instead of the one
    /// a linear mapping would place there. If a page is already mapped at
    /// `va`, it is returned unchanged.
    ///
    /// # Errors
    /// Returns [`SysError::EFAULT`] if `va` is not in a file-backed VMA, and
    /// [`SysError::ENOMEM`] if a new page cannot be allocated.
    pub fn fault_file(&self, va: VirtAddr) -> SysResult<Arc<Page>> {
        let area = self.find_area(va).ok_or(SysError::EFAULT)?;
        let registry = area.registry().ok_or(SysError::EFAULT)?;
        let vpn = va.page_number();

        let mut page_table = self.page_table.lock();
        let old = page_table.entry(vpn).unwrap_or_default();
        if old.is_valid() {
            return self.mem.pfn_to_page(old.ppn()).ok_or(SysError::EFAULT);
        }
        let pgoff = old
            .file_offset()
            .unwrap_or_else(|| area.linear_page_index(va));
        let page = registry.find_or_create_page(pgoff)?;
        self.install_file_page(&mut page_table, &area, vpn, &page);
        Ok(page)
    }

    /// Handles a page fault at `va` in an anonymous VMA by mapping a fresh
    /// page. If a page is already mapped at `va`, it is returned unchanged.
    ///
    /// # Errors
    /// Returns [`SysError::EFAULT`] if `va` is not in an anonymous VMA, and
    /// [`SysError::ENOMEM`] if a new page cannot be allocated.
    pub fn fault_anon(self: &Arc<Self>, va: VirtAddr) -> SysResult<Arc<Page>> {
        let area = self.find_area(va).ok_or(SysError::EFAULT)?;
        if area.registry().is_some() {
            return Err(SysError::EFAULT);
        }
        let vpn = va.page_number();

        let mut page_table = self.page_table.lock();
        if let Some(ppn) = page_table.lookup(vpn) {
            return self.mem.pfn_to_page(ppn).ok_or(SysError::EFAULT);
        }
        let page = self.mem.alloc_page()?;
        page_table.set_entry(vpn, PageTableEntry::new(page.ppn(), area.pte_flags()));
        self.rss.fetch_add(1, Ordering::AcqRel);
        page_add_anon_rmap(&page, self, va);
        Ok(page)
    }

    /// Maps `page` at `va` in a file-backed VMA.
    ///
    /// This is used for pages that do not come from a page fault, such as
    /// reserved pages shared with a device. Reserved pages are mapped without
    /// being accounted to the address space or the reverse map.
    ///
    /// # Errors
    /// Returns [`SysError::EFAULT`] if `va` is not in a file-backed VMA,
    /// [`SysError::EINVAL`] if `page` is neither reserved nor a file page, and
    /// [`SysError::EEXIST`] if a page is already mapped at `va`.
    pub fn insert_page(&self, va: VirtAddr, page: &Arc<Page>) -> SysResult<()> {
        let area = self.find_area(va).ok_or(SysError::EFAULT)?;
        if area.registry().is_none() {
            return Err(SysError::EFAULT);
        }
        if !page.is_reserved() && !matches!(page.owner(), PageOwner::File(_)) {
            return Err(SysError::EINVAL);
        }
        let vpn = va.page_number();
        let mut page_table = self.page_table.lock();
        if page_table.lookup(vpn).is_some() {
            return Err(SysError::EEXIST);
        }
        self.install_file_page(&mut page_table, &area, vpn, page);
        Ok(())
    }

    /// Maps the page at file offset `pgoff` at `va`, replacing whatever was
    /// mapped there, and marks the VMA nonlinear.
    ///
    /// # Errors
    /// Returns [`SysError::EFAULT`] if `va` is not in a VMA,
    /// [`SysError::EINVAL`] if the VMA is not a shared file mapping, and
    /// [`SysError::ENOMEM`] if a new page cannot be allocated.
    pub fn remap_file_page(&self, va: VirtAddr, pgoff: usize) -> SysResult<Arc<Page>> {
        let area = self.find_area(va).ok_or(SysError::EFAULT)?;
        area.set_nonlinear()?;
        let registry = area.registry().ok_or(SysError::EINVAL)?;
        let page = registry.find_or_create_page(pgoff)?;
        let vpn = va.page_number();

        let mut page_table = self.page_table.lock();
        zap_pte(&mut page_table, &self.mem, &self.rss, vpn);
        self.install_file_page(&mut page_table, &area, vpn, &page);
        log::debug!(
            "[AddrSpace::remap_file_page] va {:#x} -> pgoff {}",
            va.to_usize(),
            pgoff
        );
        Ok(page)
    }

    /// Touches the page mapped at `va`, setting its accessed bit, and its
    /// dirty bit if `write`, as a user access would.
    ///
    /// Returns `false` if no page is mapped at `va`.
    pub fn access(&self, va: VirtAddr, write: bool) -> bool {
        self.page_table.lock().mark_accessed(va.page_number(), write)
    }

    /// Unmaps the page at `va`, if any. A file entry at `va` is cleared too.
    ///
    /// Returns whether a page was unmapped.
    pub fn zap_page(&self, va: VirtAddr) -> bool {
        let mut page_table = self.page_table.lock();
        zap_pte(&mut page_table, &self.mem, &self.rss, va.page_number())
    }

    /// Removes `area` from the address space, unmapping all of its pages.
    ///
    /// # Errors
    /// Returns [`SysError::EINVAL`] if `area` is not a VMA of this address
    /// space.
    pub fn munmap(&self, area: &Arc<VmArea>) -> SysResult<()> {
        {
            let mut vm_areas = self.vm_areas.lock();
            match vm_areas.get(&area.start_va()) {
                Some(found) if Arc::ptr_eq(found, area) => {}
                _ => return Err(SysError::EINVAL),
            }
            vm_areas.remove(&area.start_va());
        }
        zap_area(&mut self.page_table.lock(), &self.mem, &self.rss, area);
        if let Some(registry) = area.registry() {
            registry.unlink(area);
        }
        log::debug!("[AddrSpace::munmap] {:?}", area);
        Ok(())
    }

    fn install_file_page(
        &self,
        page_table: &mut PageTable,
        area: &VmArea,
        vpn: VirtPageNum,
        page: &Arc<Page>,
    ) {
        page_table.set_entry(vpn, PageTableEntry::new(page.ppn(), area.pte_flags()));
        if !page.is_reserved() {
            page.get();
            self.rss.fetch_add(1, Ordering::AcqRel);
        }
        page_add_file_rmap(page);
    }
}

impl Drop for AddrSpace {
    /// Tears down every mapping of the address space.
    fn drop(&mut self) {
        let vm_areas = core::mem::take(self.vm_areas.get_mut());
        let page_table = self.page_table.get_mut();
        for area in vm_areas.values() {
            zap_area(page_table, &self.mem, &self.rss, area);
            if let Some(registry) = area.registry() {
                registry.unlink(area);
            }
        }
    }
}

impl core::fmt::Debug for AddrSpace {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AddrSpace")
            .field("rss", &self.rss())
            .field("nr_areas", &self.vm_areas.lock().len())
            .finish_non_exhaustive()
    }
}

fn find_area_in(vm_areas: &BTreeMap<VirtAddr, Arc<VmArea>>, va: VirtAddr) -> Option<Arc<VmArea>> {
    vm_areas
        .range(..=va)
        .next_back()
        .filter(|(_, area)| area.contains(va))
        .map(|(_, area)| area.clone())
}

fn checked_range(start: VirtAddr, len: usize) -> SysResult<VirtAddr> {
    if !start.is_aligned() || len == 0 {
        return Err(SysError::EINVAL);
    }
    let end = start
        .to_usize()
        .checked_add(len)
        .ok_or(SysError::EINVAL)?;
    Ok(VirtAddr::new(end).round_up())
}

fn zap_area(page_table: &mut PageTable, mem: &MemMap, rss: &AtomicUsize, area: &VmArea) {
    let start = area.start_va().page_number();
    for i in 0..area.size() / PAGE_SIZE {
        zap_pte(page_table, mem, rss, start.add(i));
    }
}

/// Clears the entry at `vpn`, dropping the mapping's share of the page it
/// maps. Returns whether a page was mapped.
fn zap_pte(page_table: &mut PageTable, mem: &MemMap, rss: &AtomicUsize, vpn: VirtPageNum) -> bool {
    let Some(pte) = page_table.entry(vpn) else {
        return false;
    };
    if !pte.is_valid() {
        page_table.clear(vpn);
        return false;
    }
    let old = page_table.clear_flush(vpn);
    let Some(page) = mem.pfn_to_page(old.ppn()) else {
        return true;
    };
    if page.is_reserved() {
        return true;
    }
    if old.is_dirty() {
        page.set_dirty();
    }
    page_remove_rmap(&page);
    rss.fetch_sub(1, Ordering::AcqRel);
    if page.put() {
        mem.free_page(&page);
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn space() -> Arc<AddrSpace> {
        AddrSpace::new(Arc::new(MemMap::with_frames(0x1000, 64)))
    }

    const RW: MmapProt = MmapProt::PROT_READ.union(MmapProt::PROT_WRITE);

    #[test]
    fn overlapping_mappings_are_rejected() {
        let space = space();
        space
            .mmap_anon(VirtAddr::new(0x10_0000), 4 * PAGE_SIZE, RW, MmapFlags::MAP_PRIVATE)
            .unwrap();
        let err = space
            .mmap_anon(VirtAddr::new(0x10_3000), PAGE_SIZE, RW, MmapFlags::MAP_PRIVATE)
            .unwrap_err();
        assert_eq!(err, SysError::EEXIST);
        let err = space
            .mmap_anon(VirtAddr::new(0x0f_f000), 2 * PAGE_SIZE, RW, MmapFlags::MAP_PRIVATE)
            .unwrap_err();
        assert_eq!(err, SysError::EEXIST);
        space
            .mmap_anon(VirtAddr::new(0x10_4000), PAGE_SIZE, RW, MmapFlags::MAP_PRIVATE)
            .unwrap();
        assert_eq!(
            space.mmap_anon(VirtAddr::new(0x20_0001), PAGE_SIZE, RW, MmapFlags::MAP_PRIVATE).unwrap_err(),
            SysError::EINVAL
        );
        assert_eq!(space.nr_areas(), 2);
    }

    #[test]
    fn anon_fault_and_zap() {
        let space = space();
        let va = VirtAddr::new(0x10_0000);
        space.mmap_anon(va, PAGE_SIZE, RW, MmapFlags::MAP_PRIVATE).unwrap();
        let free = space.mem().free_frames();

        let page = space.fault_anon(va).unwrap();
        assert!(Arc::ptr_eq(&space.fault_anon(va).unwrap(), &page));
        assert_eq!(space.rss(), 1);
        assert!(page.is_anon());
        assert_eq!(page.mapcount(), 1);
        assert!(space.access(va, true));

        assert!(space.zap_page(va));
        assert!(!space.zap_page(va));
        assert_eq!(space.rss(), 0);
        assert!(!page.is_mapped());
        assert!(page.is_dirty());
        assert_eq!(space.mem().free_frames(), free);
    }

    #[test]
    fn file_fault_shares_page_cache() {
        let space = space();
        let registry = MappingRegistry::new(space.mem().clone());
        let va = VirtAddr::new(0x10_0000);
        let other = AddrSpace::new(space.mem().clone());
        space
            .mmap_file(va, 2 * PAGE_SIZE, RW, MmapFlags::MAP_SHARED, &registry, 5)
            .unwrap();
        other
            .mmap_file(va, PAGE_SIZE, RW, MmapFlags::MAP_PRIVATE, &registry, 5)
            .unwrap();

        let page = space.fault_file(va).unwrap();
        assert!(Arc::ptr_eq(&other.fault_file(va).unwrap(), &page));
        assert_eq!(page.mapcount(), 2);
        assert_eq!(page.count(), 3);
        assert_eq!(space.mem().nr_mapped(), 1);
        assert_eq!(other.fault_file(va.offset_by(PAGE_SIZE)).unwrap_err(), SysError::EFAULT);
        assert_eq!(other.fault_anon(va).unwrap_err(), SysError::EFAULT);
    }

    #[test]
    fn munmap_drops_mappings_and_links() {
        let space = space();
        let registry = MappingRegistry::new(space.mem().clone());
        let va = VirtAddr::new(0x10_0000);
        let area = space
            .mmap_file(va, 2 * PAGE_SIZE, RW, MmapFlags::MAP_SHARED, &registry, 5)
            .unwrap();
        let page = space.fault_file(va.offset_by(PAGE_SIZE)).unwrap();
        assert_eq!(page.index(), 6);
        assert_eq!(page.count(), 2);
        assert_eq!(registry.lists().len(), 1);

        space.munmap(&area).unwrap();
        assert_eq!(space.munmap(&area).unwrap_err(), SysError::EINVAL);
        assert!(registry.lists().is_empty());
        assert!(!page.is_mapped());
        assert_eq!(page.count(), 1);
        assert_eq!(space.rss(), 0);
    }
}
