#![allow(dead_code)]

use std::sync::Arc;

use config::mm::PAGE_SIZE;
use mm::{
    address::VirtAddr,
    mapping::MappingRegistry,
    page::{MemMap, Page},
    vm::{addr_space::AddrSpace, vm_area::VmArea},
};
use systype::memory_flags::{MmapFlags, MmapProt};

struct StdoutLog;

#[crate_interface::impl_interface]
impl logger::LogInterface for StdoutLog {
    fn print_log(record: &log::Record) {
        println!(
            "\u{1B}[{}m[{:>5}] {}\u{1B}[0m",
            logger::level2color(record.level()),
            record.level(),
            record.args()
        );
    }
}

pub const BASE: usize = 0x1000_0000;
pub const RW: MmapProt = MmapProt::PROT_READ.union(MmapProt::PROT_WRITE);

pub fn init() -> Arc<MemMap> {
    logger::init();
    Arc::new(MemMap::with_frames(0x8_0000, 1024))
}

pub fn va(addr: usize) -> VirtAddr {
    VirtAddr::new(addr)
}

/// Maps `pages` pages of `file` from offset `pgoff` at `start` in `space`.
pub fn map_file(
    space: &Arc<AddrSpace>,
    start: usize,
    pages: usize,
    flags: MmapFlags,
    file: &Arc<MappingRegistry>,
    pgoff: usize,
) -> Arc<VmArea> {
    space
        .mmap_file(va(start), pages * PAGE_SIZE, RW, flags, file, pgoff)
        .unwrap()
}

/// Holds the page lock until dropped.
pub struct PageLocked<'a>(&'a Page);

pub fn lock(page: &Page) -> PageLocked<'_> {
    assert!(page.try_lock_page());
    PageLocked(page)
}

impl Drop for PageLocked<'_> {
    fn drop(&mut self) {
        self.0.unlock_page();
    }
}

pub fn is_present(space: &AddrSpace, addr: usize) -> bool {
    space.pte(va(addr)).is_some_and(|pte| pte.is_valid())
}

pub fn is_young(space: &AddrSpace, addr: usize) -> bool {
    space.pte(va(addr)).is_some_and(|pte| pte.is_accessed())
}
