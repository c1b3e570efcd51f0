//! Module for the frame allocator and the table of page descriptors.
//!
//! A [`MemMap`] hands out frames from one [`Zone`] and keeps the descriptor of
//! every frame in use, so that a physical page number found in a page table
//! entry can be turned back into its [`Page`].

use alloc::sync::Arc;
use core::{
    ops::Range,
    sync::atomic::{AtomicUsize, Ordering},
};

use hashbrown::HashMap;

use config::mm::{FRAME_COUNT, FRAME_PPN_START};
use id_allocator::{IdAllocator, VecIdAllocator};
use mutex::{SpinLock, SpinNoIrqLock};
use systype::{SysError, SysResult};

use super::{Page, PageFlags};
use crate::address::PhysPageNum;

type FrameAllocator = VecIdAllocator;

/// A contiguous range of frames with its own statistics.
#[derive(Debug)]
pub struct Zone {
    frames: Range<usize>,
    /// Number of pages of this zone mapped by at least one page table entry.
    nr_mapped: AtomicUsize,
}

impl Zone {
    pub fn new(frames: Range<usize>) -> Self {
        Self {
            frames,
            nr_mapped: AtomicUsize::new(0),
        }
    }

    /// Returns whether `ppn` is a frame of this zone.
    pub fn contains(&self, ppn: PhysPageNum) -> bool {
        self.frames.contains(&ppn.to_usize())
    }

    /// Returns the number of mapped pages in the zone.
    pub fn nr_mapped(&self) -> usize {
        self.nr_mapped.load(Ordering::Relaxed)
    }

    pub(crate) fn inc_mapped(&self) {
        self.nr_mapped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn dec_mapped(&self) {
        self.nr_mapped.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Frame allocator together with the descriptors of allocated frames.
pub struct MemMap {
    zone: Arc<Zone>,
    allocator: SpinNoIrqLock<FrameAllocator>,
    pages: SpinLock<HashMap<PhysPageNum, Arc<Page>>>,
}

impl MemMap {
    /// Creates a memory map managing the default frame range.
    pub fn new() -> Self {
        Self::with_frames(FRAME_PPN_START, FRAME_COUNT)
    }

    /// Creates a memory map managing `count` frames starting at `start`.
    pub fn with_frames(start: usize, count: usize) -> Self {
        log::debug!(
            "[MemMap] frames {:#x} - {:#x}",
            start,
            start + count
        );
        Self {
            zone: Arc::new(Zone::new(start..start + count)),
            allocator: SpinNoIrqLock::new(FrameAllocator::new(start, start + count)),
            pages: SpinLock::new(HashMap::new()),
        }
    }

    pub fn zone(&self) -> &Arc<Zone> {
        &self.zone
    }

    /// Returns the number of mapped pages.
    pub fn nr_mapped(&self) -> usize {
        self.zone.nr_mapped()
    }

    /// Returns the number of frames not yet handed out.
    pub fn free_frames(&self) -> usize {
        self.allocator.lock().available()
    }

    /// Allocates a frame and returns its descriptor, holding one reference.
    ///
    /// # Errors
    /// Returns [`SysError::ENOMEM`] if no frame is left.
    pub fn alloc_page(&self) -> SysResult<Arc<Page>> {
        let ppn = self.allocator.lock().alloc().ok_or(SysError::ENOMEM)?;
        let page = Arc::new(Page::new(PhysPageNum::new(ppn), self.zone.clone()));
        self.pages.lock().insert(page.ppn(), page.clone());
        Ok(page)
    }

    /// Allocates a frame that the memory manager must never reclaim, such as
    /// a page shared with a device.
    pub fn alloc_reserved_page(&self) -> SysResult<Arc<Page>> {
        let page = self.alloc_page()?;
        page.set_flags(PageFlags::RESERVED);
        Ok(page)
    }

    /// Returns the descriptor of frame `ppn`, if it is in use.
    pub fn pfn_to_page(&self, ppn: PhysPageNum) -> Option<Arc<Page>> {
        if !self.pfn_valid(ppn) {
            return None;
        }
        self.pages.lock().get(&ppn).cloned()
    }

    /// Returns whether `ppn` is a frame managed by this memory map.
    pub fn pfn_valid(&self, ppn: PhysPageNum) -> bool {
        self.zone.contains(ppn)
    }

    /// Returns the frame of a page whose last reference was dropped.
    pub fn free_page(&self, page: &Page) {
        debug_assert!(!page.is_mapped(), "freeing mapped page {:?}", page);
        debug_assert_eq!(page.count(), 0, "freeing page in use {:?}", page);
        if self.pages.lock().remove(&page.ppn()).is_none() {
            log::warn!("[MemMap::free_page] page {:?} is not ours", page);
            return;
        }
        // SAFETY: the frame was handed out by `alloc_page` and its
        // descriptor has just been dropped from the table.
        unsafe {
            self.allocator.lock().dealloc(page.ppn().to_usize());
        }
    }
}

impl Default for MemMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_lookup_free() {
        let mem = MemMap::with_frames(0x1000, 2);
        let a = mem.alloc_page().unwrap();
        let b = mem.alloc_page().unwrap();
        assert_eq!(mem.alloc_page().unwrap_err(), SysError::ENOMEM);
        assert!(Arc::ptr_eq(&mem.pfn_to_page(a.ppn()).unwrap(), &a));
        assert!(mem.pfn_to_page(PhysPageNum::new(0x2000)).is_none());

        assert!(b.put());
        mem.free_page(&b);
        assert!(mem.pfn_to_page(b.ppn()).is_none());
        assert_eq!(mem.free_frames(), 1);
        assert!(mem.alloc_page().is_ok());
    }

    #[test]
    fn reserved_pages_are_flagged() {
        let mem = MemMap::with_frames(0x1000, 4);
        let page = mem.alloc_reserved_page().unwrap();
        assert!(page.is_reserved());
        assert!(page.is_valid_frame());
    }
}
