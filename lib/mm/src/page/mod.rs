//! Module for managing physical pages.
//!
//! This module defines the [`Page`] struct, the descriptor of a physical page
//! frame. A [`Page`] differs from a bare frame in that it records who uses the
//! frame:
//! - `count` is the number of references held on the page by page caches,
//!   mappings and callers that pinned it.
//! - `mapcount` is the number of page table entries mapping the page.
//! - the owner tells the reverse mapping code where to look for those page
//!   table entries. An anonymous page remembers the address space and the
//!   address it is mapped at. A file page remembers the mapping registry of
//!   its file and its offset in that file.
//!
//! `mapcount` and the owner are protected by the page's rmap lock. The lock is
//! only ever held for a few instructions, and never while waiting on another
//! lock, so it may be taken with a page table lock already held.

pub mod mem_map;

use alloc::sync::{Arc, Weak};
use core::{
    fmt,
    ops::DerefMut,
    sync::atomic::{AtomicU32, AtomicUsize, Ordering},
};

use bitflags::bitflags;
use mutex::SpinLock;

use crate::{
    address::{PhysPageNum, VirtAddr},
    mapping::MappingRegistry,
    vm::addr_space::AddrSpace,
};

pub use mem_map::{MemMap, Zone};

bitflags! {
    /// Status bits of a physical page.
    ///
    /// - `LOCKED`: the page lock. Held by reclaim across `try_to_unmap`.
    /// - `REFERENCED`: software-maintained referenced bit.
    /// - `DIRTY`: the page holds data newer than its backing store.
    /// - `RESERVED`: the frame is not managed by the memory manager and
    ///   must never be unmapped or reclaimed.
    /// - `HW_YOUNG`, `HW_DIRTY`: page-level accessed and dirty bits kept by
    ///   architectures that track them per frame rather than per entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u32 {
        const LOCKED = 1 << 0;
        const REFERENCED = 1 << 1;
        const DIRTY = 1 << 2;
        const RESERVED = 1 << 3;
        const HW_YOUNG = 1 << 8;
        const HW_DIRTY = 1 << 9;
    }
}

/// Where the page table entries mapping a page can be found.
#[derive(Debug, Clone, Default)]
pub enum PageOwner {
    /// Not reachable through the reverse map.
    #[default]
    Unowned,
    /// An anonymous page, mapped in one address space at a known address.
    Anon(AnonOwner),
    /// A page from the page cache of a file.
    File(FileOwner),
}

/// Owner of an anonymous page.
#[derive(Debug, Clone)]
pub struct AnonOwner {
    space: Weak<AddrSpace>,
    address: VirtAddr,
}

impl AnonOwner {
    /// Creates an owner for a page mapped at `address` in `space`.
    pub fn new(space: &Arc<AddrSpace>, address: VirtAddr) -> Self {
        Self {
            space: Arc::downgrade(space),
            address: address.round_down(),
        }
    }

    /// Returns the owning address space, if it is still alive.
    pub fn space(&self) -> Option<Arc<AddrSpace>> {
        self.space.upgrade()
    }

    /// Returns the page-aligned address the page is mapped at.
    pub fn address(&self) -> VirtAddr {
        self.address
    }
}

/// Owner of a file page.
#[derive(Debug, Clone)]
pub struct FileOwner {
    registry: Weak<MappingRegistry>,
    pgoff: usize,
}

impl FileOwner {
    /// Creates an owner for the page at `pgoff` in the file of `registry`.
    pub fn new(registry: &Arc<MappingRegistry>, pgoff: usize) -> Self {
        Self {
            registry: Arc::downgrade(registry),
            pgoff,
        }
    }

    /// Returns the mapping registry of the file, if it is still alive.
    pub fn registry(&self) -> Option<Arc<MappingRegistry>> {
        self.registry.upgrade()
    }

    /// Returns the offset of the page in its file, in pages.
    pub fn pgoff(&self) -> usize {
        self.pgoff
    }
}

/// A physical page in the system.
///
/// See the module-level documentation for more information.
pub struct Page {
    /// Physical page number of the frame.
    ppn: PhysPageNum,
    /// Zone the frame is accounted to.
    zone: Arc<Zone>,
    flags: AtomicU32,
    /// Number of references to the page.
    count: AtomicUsize,
    /// Number of page table entries mapping the page.
    ///
    /// Only changed with the rmap lock held.
    mapcount: AtomicUsize,
    /// The rmap lock and the owner it protects.
    owner: SpinLock<PageOwner>,
}

impl Page {
    /// Creates a descriptor for the frame `ppn` accounted to `zone`, with one
    /// reference held by the caller.
    pub fn new(ppn: PhysPageNum, zone: Arc<Zone>) -> Self {
        Self {
            ppn,
            zone,
            flags: AtomicU32::new(0),
            count: AtomicUsize::new(1),
            mapcount: AtomicUsize::new(0),
            owner: SpinLock::new(PageOwner::Unowned),
        }
    }

    /// Returns the physical page number of the page.
    pub fn ppn(&self) -> PhysPageNum {
        self.ppn
    }

    /// Returns the zone the page is accounted to.
    pub fn zone(&self) -> &Arc<Zone> {
        &self.zone
    }

    /// Returns whether the descriptor describes a frame of its zone.
    pub fn is_valid_frame(&self) -> bool {
        self.zone.contains(self.ppn)
    }

    pub fn flags(&self) -> PageFlags {
        PageFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    pub fn set_flags(&self, flags: PageFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    /// Clears `flag`, returning whether it was set.
    pub fn test_and_clear(&self, flag: PageFlags) -> bool {
        let old = self.flags.fetch_and(!flag.bits(), Ordering::AcqRel);
        old & flag.bits() != 0
    }

    pub fn is_reserved(&self) -> bool {
        self.flags().contains(PageFlags::RESERVED)
    }

    pub fn is_dirty(&self) -> bool {
        self.flags().contains(PageFlags::DIRTY)
    }

    pub fn set_dirty(&self) {
        self.set_flags(PageFlags::DIRTY);
    }

    /// Marks the page as recently used by software.
    pub fn mark_referenced(&self) {
        self.set_flags(PageFlags::REFERENCED);
    }

    /// Takes the page lock without waiting.
    ///
    /// Returns `false` if the page is already locked.
    pub fn try_lock_page(&self) -> bool {
        let old = self.flags.fetch_or(PageFlags::LOCKED.bits(), Ordering::Acquire);
        old & PageFlags::LOCKED.bits() == 0
    }

    /// Releases the page lock.
    pub fn unlock_page(&self) {
        debug_assert!(self.is_locked(), "unlocking an unlocked page");
        self.flags.fetch_and(!PageFlags::LOCKED.bits(), Ordering::Release);
    }

    pub fn is_locked(&self) -> bool {
        self.flags().contains(PageFlags::LOCKED)
    }

    /// Returns the number of references to the page.
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Takes a reference to the page.
    pub fn get(&self) {
        self.count.fetch_add(1, Ordering::AcqRel);
    }

    /// Drops a reference to the page, returning whether it was the last one.
    pub fn put(&self) -> bool {
        let old = self.count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(old > 0, "page {:#x}: reference count underflow", self.ppn.to_usize());
        old == 1
    }

    /// Returns the number of page table entries mapping the page.
    pub fn mapcount(&self) -> usize {
        self.mapcount.load(Ordering::Acquire)
    }

    /// Returns whether any page table entry maps the page.
    pub fn is_mapped(&self) -> bool {
        self.mapcount() != 0
    }

    /// Returns a snapshot of the page owner.
    pub fn owner(&self) -> PageOwner {
        self.owner.lock().clone()
    }

    /// Returns whether the page is an anonymous page.
    pub fn is_anon(&self) -> bool {
        matches!(*self.owner.lock(), PageOwner::Anon(_))
    }

    /// Returns the position of the page within its owner: the file offset in
    /// pages for a file page, the mapped address for an anonymous page.
    pub fn index(&self) -> usize {
        match &*self.owner.lock() {
            PageOwner::Unowned => 0,
            PageOwner::Anon(anon) => anon.address().to_usize(),
            PageOwner::File(file) => file.pgoff(),
        }
    }

    /// Clears the page-level accessed bit, returning whether it was set.
    pub fn test_and_clear_young(&self) -> bool {
        self.test_and_clear(PageFlags::HW_YOUNG)
    }

    /// Clears the page-level dirty bit, returning whether it was set.
    pub fn test_and_clear_hw_dirty(&self) -> bool {
        self.test_and_clear(PageFlags::HW_DIRTY)
    }

    /// Takes the rmap lock, giving access to the owner.
    ///
    /// `mapcount` may only be changed while the returned guard is alive.
    pub(crate) fn rmap_lock(&self) -> impl DerefMut<Target = PageOwner> + '_ {
        self.owner.lock()
    }

    /// Must be called with the rmap lock held.
    pub(crate) fn inc_mapcount(&self) -> usize {
        self.mapcount.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Must be called with the rmap lock held.
    pub(crate) fn dec_mapcount(&self) -> usize {
        self.mapcount.fetch_sub(1, Ordering::AcqRel) - 1
    }

    /// Attaches a fresh page to the page cache of a file.
    ///
    /// # Panics
    /// Panics if the page already has an owner or is mapped.
    pub(crate) fn set_file_owner(&self, owner: FileOwner) {
        let mut slot = self.rmap_lock();
        assert!(
            matches!(*slot, PageOwner::Unowned) && !self.is_mapped(),
            "page {:#x} already in use",
            self.ppn.to_usize()
        );
        *slot = PageOwner::File(owner);
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Page")
            .field("ppn", &format_args!("{:#x}", self.ppn.to_usize()))
            .field("flags", &self.flags())
            .field("count", &self.count())
            .field("mapcount", &self.mapcount())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page() -> Page {
        let zone = Arc::new(Zone::new(0x100..0x200));
        Page::new(PhysPageNum::new(0x100), zone)
    }

    #[test]
    fn page_lock_is_exclusive() {
        let page = page();
        assert!(page.try_lock_page());
        assert!(!page.try_lock_page());
        assert!(page.is_locked());
        page.unlock_page();
        assert!(page.try_lock_page());
    }

    #[test]
    fn test_and_clear_reports_old_state() {
        let page = page();
        page.mark_referenced();
        assert!(page.test_and_clear(PageFlags::REFERENCED));
        assert!(!page.test_and_clear(PageFlags::REFERENCED));
        assert!(!page.test_and_clear_young());
        page.set_flags(PageFlags::HW_YOUNG);
        assert!(page.test_and_clear_young());
    }

    #[test]
    fn reference_count() {
        let page = page();
        assert_eq!(page.count(), 1);
        page.get();
        assert!(!page.put());
        assert!(page.put());
    }

    #[test]
    fn frame_validity_follows_zone() {
        let zone = Arc::new(Zone::new(0x100..0x200));
        assert!(Page::new(PhysPageNum::new(0x1ff), zone.clone()).is_valid_frame());
        assert!(!Page::new(PhysPageNum::new(0x200), zone).is_valid_frame());
    }
}
