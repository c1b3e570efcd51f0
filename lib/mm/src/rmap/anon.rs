//! Reverse mapping of anonymous pages.
//!
//! An anonymous page is mapped in the address space that faulted it in, at
//! the address recorded in its owner. Both functions look at that single
//! mapping.

use super::{SwapResult, page_referenced_one, try_to_unmap_one};
use crate::page::{AnonOwner, Page};

pub(super) fn page_referenced_anon(page: &Page, owner: &AnonOwner) -> usize {
    let Some(space) = owner.space() else {
        return 0;
    };
    if space.rss() == 0 {
        return 0;
    }
    let mut mapcount = page.mapcount();
    let mut failed = 0;
    page_referenced_one(page, &space, owner.address(), &mut mapcount, &mut failed)
}

pub(super) fn try_to_unmap_anon(page: &Page, owner: &AnonOwner) -> SwapResult {
    let Some(space) = owner.space() else {
        return SwapResult::Again;
    };
    if space.rss() == 0 {
        return SwapResult::Again;
    }
    let Some(area) = space.try_find_area(owner.address()) else {
        log::trace!(
            "[try_to_unmap_anon] no area at {:#x} or area lock busy",
            owner.address().to_usize()
        );
        return SwapResult::Again;
    };
    let mut mapcount = page.mapcount() as isize;
    try_to_unmap_one(page, &area, &space, owner.address(), &mut mapcount)
}
