//! Module for the per-file mapping registry.
//!
//! A [`MappingRegistry`] belongs to one file. It stores the pages of the file
//! that are in memory (the page cache), and the lists of virtual memory areas
//! that map the file. Areas of private mappings go to the linear list, and
//! areas of shared mappings go to the shared list. Nonlinear areas are always
//! shared, so they are only found on the shared list.
//!
//! The area lists are protected by the registry lock. Mapping and unmapping
//! take it unconditionally. The reverse mapping code only ever tries it, and
//! gives up on the page if it is contended.

use alloc::{
    collections::BTreeMap,
    sync::{Arc, Weak},
    vec::Vec,
};
use core::ops::DerefMut;

use mutex::{SpinLock, SpinNoIrqLock};
use systype::SysResult;

use crate::{
    page::{FileOwner, MemMap, Page},
    vm::vm_area::VmArea,
};

/// Areas mapping a file.
#[derive(Debug, Default)]
pub struct AreaLists {
    linear: Vec<Weak<VmArea>>,
    shared: Vec<Weak<VmArea>>,
}

impl AreaLists {
    /// Areas of private mappings, in the order they were linked.
    pub fn linear(&self) -> impl Iterator<Item = Arc<VmArea>> + '_ {
        self.linear.iter().filter_map(Weak::upgrade)
    }

    /// Areas of shared mappings, in the order they were linked.
    pub fn shared(&self) -> impl Iterator<Item = Arc<VmArea>> + '_ {
        self.shared.iter().filter_map(Weak::upgrade)
    }

    /// Returns whether any area on the shared list is nonlinear.
    pub fn has_nonlinear(&self) -> bool {
        self.shared().any(|area| area.is_nonlinear())
    }

    /// Returns the number of live areas on both lists.
    pub fn len(&self) -> usize {
        self.linear().count() + self.shared().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn list_for(&mut self, area: &VmArea) -> &mut Vec<Weak<VmArea>> {
        if area.is_shared() {
            &mut self.shared
        } else {
            &mut self.linear
        }
    }
}

/// The page cache and area lists of a file.
pub struct MappingRegistry {
    /// Pages of the file keyed by their offset in pages.
    pages: SpinNoIrqLock<BTreeMap<usize, Arc<Page>>>,
    lists: SpinLock<AreaLists>,
    mem: Arc<MemMap>,
}

impl MappingRegistry {
    /// Creates an empty registry whose pages come from `mem`.
    pub fn new(mem: Arc<MemMap>) -> Arc<Self> {
        Arc::new(Self {
            pages: SpinNoIrqLock::new(BTreeMap::new()),
            lists: SpinLock::new(AreaLists::default()),
            mem,
        })
    }

    /// Returns the page at `pgoff`, if it is in the page cache.
    pub fn find_page(&self, pgoff: usize) -> Option<Arc<Page>> {
        self.pages.lock().get(&pgoff).cloned()
    }

    /// Returns the page at `pgoff`, creating it in the page cache if it is
    /// not there. The page cache holds one reference to each of its pages.
    ///
    /// # Errors
    /// Returns [`ENOMEM`] if no frame is left for a new page.
    ///
    /// [`ENOMEM`]: systype::SysError::ENOMEM
    pub fn find_or_create_page(self: &Arc<Self>, pgoff: usize) -> SysResult<Arc<Page>> {
        let mut pages = self.pages.lock();
        if let Some(page) = pages.get(&pgoff) {
            return Ok(page.clone());
        }
        let page = self.mem.alloc_page()?;
        page.set_file_owner(FileOwner::new(self, pgoff));
        pages.insert(pgoff, page.clone());
        log::trace!("[MappingRegistry] pgoff {} -> {:?}", pgoff, page);
        Ok(page)
    }

    /// Returns the number of pages in the page cache.
    pub fn nr_pages(&self) -> usize {
        self.pages.lock().len()
    }

    /// Takes the registry lock, waiting for it if necessary.
    pub fn lists(&self) -> impl DerefMut<Target = AreaLists> + '_ {
        self.lists.lock()
    }

    /// Takes the registry lock if it is free.
    pub fn try_lists(&self) -> Option<impl DerefMut<Target = AreaLists> + '_> {
        self.lists.try_lock()
    }

    /// Adds `area` to the list matching its sharing mode.
    pub fn link(&self, area: &Arc<VmArea>) {
        let mut lists = self.lists();
        let list = lists.list_for(area);
        list.retain(|weak| weak.strong_count() > 0);
        list.push(Arc::downgrade(area));
    }

    /// Removes `area` from the registry.
    pub fn unlink(&self, area: &VmArea) {
        let mut lists = self.lists();
        lists
            .list_for(area)
            .retain(|weak| weak.strong_count() > 0 && !core::ptr::eq(weak.as_ptr(), area));
    }
}

impl core::fmt::Debug for MappingRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MappingRegistry")
            .field("nr_pages", &self.nr_pages())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::PageOwner;

    #[test]
    fn page_cache_creates_each_offset_once() {
        let mem = Arc::new(MemMap::with_frames(0x1000, 8));
        let registry = MappingRegistry::new(mem.clone());
        assert!(registry.find_page(3).is_none());

        let page = registry.find_or_create_page(3).unwrap();
        let again = registry.find_or_create_page(3).unwrap();
        assert!(Arc::ptr_eq(&page, &again));
        assert_eq!(registry.nr_pages(), 1);
        assert_eq!(page.index(), 3);
        assert!(matches!(page.owner(), PageOwner::File(_)));
        assert_eq!(page.count(), 1);
    }

    #[test]
    fn try_lists_fails_while_held() {
        let mem = Arc::new(MemMap::with_frames(0x1000, 8));
        let registry = MappingRegistry::new(mem);
        let held = registry.lists();
        assert!(registry.try_lists().is_none());
        drop(held);
        assert!(registry.try_lists().is_some());
    }
}
