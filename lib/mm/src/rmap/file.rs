//! Reverse mapping of file pages.
//!
//! The VMAs mapping a file are found on the area lists of its registry. A
//! linear VMA maps a given file page at exactly one address, computed from the
//! page offset. A nonlinear VMA may map it anywhere, so it cannot be searched
//! for one page. Instead, `try_to_unmap_file` unmaps clusters of whatever
//! pages a nonlinear VMA maps, until as many entries as the target page has
//! mappings have been removed. Every VMA records where the scan stopped in
//! its cursor, so the next attempt continues from there and every page of the
//! VMA is eventually visited.
//!
//! `page_referenced_file` only checks the address a linear mapping would use,
//! nonlinear VMAs included. A page a nonlinear VMA maps anywhere else is aged
//! by the cluster scan, which spares young entries.
//!
//! Dropping the last reference to an address space unlinks its VMAs, which
//! takes the registry lock. The address spaces found during a walk are
//! therefore kept in a [`Pinned`] set that outlives the registry guard.

use alloc::{sync::Arc, vec::Vec};
use core::cmp::{max, min};

use config::mm::{CLUSTER_MASK, CLUSTER_SIZE, PAGE_SIZE};
use simdebug::when_debug;

use super::{SwapResult, page_referenced_one, page_remove_rmap, try_to_unmap_one};
use crate::{
    address::VirtAddr,
    page::{FileOwner, Page},
    vm::{
        addr_space::AddrSpace,
        pte::PageTableEntry,
        vm_area::{VmArea, VmFlags},
    },
};

pub(super) fn page_referenced_file(page: &Page, owner: &FileOwner) -> usize {
    let Some(registry) = owner.registry() else {
        return 0;
    };
    let mut pinned = Pinned::default();
    let Some(lists) = registry.try_lists() else {
        log::trace!("[page_referenced_file] registry lock busy");
        return 0;
    };

    let mut referenced = 0;
    let mut mapcount = page.mapcount();
    let mut failed = 0;

    for area in lists.linear().chain(lists.shared()) {
        let Some(space) = pinned.owner(&area) else {
            continue;
        };
        if space.rss() == 0 {
            continue;
        }
        let Some(address) = area.vma_address(owner.pgoff()) else {
            continue;
        };
        if area.flags().contains(VmFlags::LOCKED | VmFlags::MAYSHARE) {
            return referenced + 1;
        }
        referenced += page_referenced_one(page, &space, address, &mut mapcount, &mut failed);
        if mapcount == 0 {
            return referenced;
        }
    }

    when_debug!({
        if mapcount != 0 && failed == 0 && !lists.has_nonlinear() {
            log::warn!(
                "[page_referenced_file] {:?}: {} mappings not found",
                page,
                mapcount
            );
        }
    });
    referenced
}

pub(super) fn try_to_unmap_file(page: &Page, owner: &FileOwner) -> SwapResult {
    let Some(registry) = owner.registry() else {
        return SwapResult::Again;
    };
    let mut pinned = Pinned::default();
    let Some(lists) = registry.try_lists() else {
        log::trace!("[try_to_unmap_file] registry lock busy");
        return SwapResult::Again;
    };

    let mut ret = SwapResult::Again;
    let mut mapcount = page.mapcount() as isize;
    let mut max_nl_cursor = 0;
    let mut max_nl_size = 0;

    for area in lists.linear() {
        let Some(result) = unmap_linear(page, &area, owner.pgoff(), &mut mapcount, &mut pinned)
        else {
            continue;
        };
        ret = result;
        if ret == SwapResult::Fail || mapcount <= 0 {
            return ret;
        }
    }

    for area in lists.shared() {
        if area.is_nonlinear() {
            if !area.is_locked_or_reserved() {
                max_nl_cursor = max(max_nl_cursor, area.nonlinear_cursor());
                max_nl_size = max(max_nl_size, area.size());
            }
            continue;
        }
        let Some(result) = unmap_linear(page, &area, owner.pgoff(), &mut mapcount, &mut pinned)
        else {
            continue;
        };
        ret = result;
        if ret == SwapResult::Fail || mapcount <= 0 {
            return ret;
        }
    }

    if max_nl_size == 0 {
        return ret;
    }

    // Nothing else tells where in the nonlinear VMAs the page is mapped, so
    // unmap that many entries from them, a cluster at a time.
    mapcount = page.mapcount() as isize;
    if mapcount == 0 {
        return ret;
    }

    max_nl_size = (max_nl_size + CLUSTER_SIZE - 1) & CLUSTER_MASK;
    if max_nl_cursor == 0 {
        max_nl_cursor = CLUSTER_SIZE;
    }

    loop {
        for area in lists.shared().filter(|area| eligible_nonlinear(area)) {
            let Some(space) = pinned.owner(&area) else {
                continue;
            };
            let mut cursor = area.nonlinear_cursor();
            while space.rss() > 0 && cursor < max_nl_cursor && cursor < area.size() {
                ret = try_to_unmap_cluster(cursor, &mut mapcount, &area, &space);
                if ret == SwapResult::Fail {
                    break;
                }
                cursor += CLUSTER_SIZE;
                area.set_nonlinear_cursor(cursor);
                if mapcount <= 0 {
                    return ret;
                }
            }
            if ret != SwapResult::Fail {
                area.set_nonlinear_cursor(max_nl_cursor);
            }
            ret = SwapResult::Again;
        }
        max_nl_cursor += CLUSTER_SIZE;
        if max_nl_cursor > max_nl_size {
            break;
        }
    }

    // Every nonlinear VMA has been swept through once without finding all the
    // mappings; start over from the beginning next time.
    for area in lists.shared().filter(|area| eligible_nonlinear(area)) {
        area.set_nonlinear_cursor(0);
    }
    log::debug!("[try_to_unmap_file] nonlinear sweep of {:?} complete", registry);
    ret
}

/// Strong references to the address spaces met during a walk of the area
/// lists. Declared before the registry guard, so that it is dropped after it.
#[derive(Default)]
struct Pinned(Vec<Arc<AddrSpace>>);

impl Pinned {
    fn owner(&mut self, area: &VmArea) -> Option<Arc<AddrSpace>> {
        let space = area.owner()?;
        if !self.0.iter().any(|pinned| Arc::ptr_eq(pinned, &space)) {
            self.0.push(space.clone());
        }
        Some(space)
    }
}

fn eligible_nonlinear(area: &VmArea) -> bool {
    area.is_nonlinear() && !area.is_locked_or_reserved()
}

/// Unmaps the page from a linear VMA. Returns `None` if the VMA cannot map
/// the page.
fn unmap_linear(
    page: &Page,
    area: &VmArea,
    pgoff: usize,
    mapcount: &mut isize,
    pinned: &mut Pinned,
) -> Option<SwapResult> {
    let space = pinned.owner(area)?;
    if space.rss() == 0 {
        return None;
    }
    let address = area.vma_address(pgoff)?;
    Some(try_to_unmap_one(page, area, &space, address, mapcount))
}

/// Unmaps the pages of one cluster of a nonlinear VMA, starting at `cursor`
/// bytes into the VMA, sparing young entries.
///
/// Returns [`SwapResult::Fail`] if the page table lock is contended, so that
/// the VMA keeps its cursor and is skipped for the rest of this attempt.
///
/// An unmapped page whose offset differs from the one a linear mapping would
/// have at its address leaves a file entry behind, so that the next fault
/// there brings back the same file page.
fn try_to_unmap_cluster(
    cursor: usize,
    mapcount: &mut isize,
    area: &VmArea,
    space: &AddrSpace,
) -> SwapResult {
    let Some(mut page_table) = space.try_page_table() else {
        log::trace!("[try_to_unmap_cluster] page table lock busy");
        return SwapResult::Fail;
    };

    let start = area.start_va().to_usize();
    let address = (start + cursor) & CLUSTER_MASK;
    let end = min(address + CLUSTER_SIZE, area.end_va().to_usize());
    let address = max(address, start);

    let first = VirtAddr::new(address).page_number();
    if !page_table.has_table(first) {
        return SwapResult::Again;
    }

    for i in 0..(end - address) / PAGE_SIZE {
        let vpn = first.add(i);
        let Some(pte) = page_table.entry(vpn) else {
            continue;
        };
        if !pte.is_valid() {
            continue;
        }
        let Some(page) = space.mem().pfn_to_page(pte.ppn()) else {
            continue;
        };
        assert!(!page.is_anon(), "anon page {:?} in nonlinear area", page);
        if page.is_reserved() {
            continue;
        }
        if page_table.test_and_clear_young(vpn) {
            continue;
        }

        let old = page_table.clear_flush(vpn);
        let index = page.index();
        if index != area.linear_page_index(vpn.address()) {
            page_table.set_entry(vpn, PageTableEntry::new_file(index));
        }
        if old.is_dirty() {
            page.set_dirty();
        }
        page_remove_rmap(&page);
        if page.put() {
            space.mem().free_page(&page);
        }
        space.dec_rss();
        *mapcount -= 1;
    }
    SwapResult::Again
}
