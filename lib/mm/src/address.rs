//! Address types and utilities for Sv39.
//!
//! This module provides types for virtual addresses, as well as physical and
//! virtual page numbers. It also provides functions for converting between
//! these types.

use config::mm::{PAGE_SIZE, PPN_WIDTH_SV39, PTE_PER_TABLE, VA_WIDTH_SV39, VPN_WIDTH_SV39};

/// An address in virtual memory defined in Sv39.
///
/// A virtual address is a 39-bit integer representing a location in virtual
/// memory. The upper 25 bits of the address must be the same as bit 38.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VirtAddr {
    addr: usize,
}

impl VirtAddr {
    /// Creates a new `VirtAddr` from the given address.
    ///
    /// According to the RISC-V Sv39 specification, only the lower 39 bits of
    /// a virtual address are used, and the upper 25 bits must be the same as
    /// bit 38.
    ///
    /// # Panics
    ///
    /// This function panics if the upper 25 bits of the address are not the same
    /// as bit 38.
    pub fn new(addr: usize) -> Self {
        let tmp = addr as isize >> VA_WIDTH_SV39;
        debug_assert!(
            tmp == 0 || tmp == -1,
            "invalid virtual address: 0x{:x}",
            addr
        );
        VirtAddr { addr }
    }

    /// Gets the inner `usize` address.
    pub fn to_usize(self) -> usize {
        self.addr
    }

    /// Gets the offset within the page where the address resides.
    pub fn page_offset(self) -> usize {
        self.addr % PAGE_SIZE
    }

    /// Returns whether the address is page-aligned.
    pub fn is_aligned(self) -> bool {
        self.page_offset() == 0
    }

    /// Gets the page number where the address resides.
    pub fn page_number(self) -> VirtPageNum {
        let vpn_mask = (1 << VA_WIDTH_SV39) - 1;
        let page_num = (self.addr / PAGE_SIZE) & vpn_mask;
        VirtPageNum { page_num }
    }

    /// Rounds the address down to the start of its page.
    pub fn round_down(self) -> Self {
        VirtAddr::new(self.addr & !(PAGE_SIZE - 1))
    }

    /// Rounds the address up to the next page boundary.
    pub fn round_up(self) -> Self {
        VirtAddr::new((self.addr + PAGE_SIZE - 1) & !(PAGE_SIZE - 1))
    }

    /// Returns the address `bytes` bytes above this one.
    pub fn offset_by(self, bytes: usize) -> Self {
        VirtAddr::new(self.addr + bytes)
    }
}

/// A physical page number defined in Sv39.
///
/// A physical page number is a 44-bit unsigned integer representing the page
/// number of a physical address. The upper 20 bits of the page number must be
/// zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PhysPageNum {
    page_num: usize,
}

impl PhysPageNum {
    /// Creates a new `PhysPageNum` from the given page number.
    ///
    /// # Panics
    ///
    /// This function panics if the upper 20 bits of the page number
    /// are not zero.
    pub fn new(page_num: usize) -> Self {
        let tmp = page_num >> PPN_WIDTH_SV39;
        debug_assert!(tmp == 0, "invalid physical page number: 0x{:x}", page_num);
        PhysPageNum { page_num }
    }

    /// Gets the inner `usize` page number.
    pub fn to_usize(self) -> usize {
        self.page_num
    }
}

/// A virtual page number defined in Sv39.
///
/// A virtual page number is a 27-bit unsized integer representing the page
/// number of a virtual address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VirtPageNum {
    page_num: usize,
}

impl VirtPageNum {
    /// Creates a new `VirtPageNum` from the given page number.
    ///
    /// # Panics
    ///
    /// This function panics if the page number does not fit in 27 bits.
    pub fn new(page_num: usize) -> Self {
        let tmp = page_num >> VPN_WIDTH_SV39;
        debug_assert!(tmp == 0, "invalid virtual page number: 0x{:x}", page_num);
        VirtPageNum { page_num }
    }

    /// Gets the inner `usize` page number.
    pub fn to_usize(self) -> usize {
        self.page_num
    }

    /// Gets the starting address of the page.
    pub fn address(self) -> VirtAddr {
        VirtAddr::new(self.page_num * PAGE_SIZE)
    }

    /// Returns the page number `count` pages above this one.
    pub fn add(self, count: usize) -> Self {
        VirtPageNum::new(self.page_num + count)
    }

    /// Index of the leaf page table covering this page.
    pub fn table_index(self) -> usize {
        self.page_num / PTE_PER_TABLE
    }

    /// Index of the entry for this page within its leaf page table.
    pub fn entry_index(self) -> usize {
        self.page_num % PTE_PER_TABLE
    }
}

impl From<VirtPageNum> for VirtAddr {
    fn from(vpn: VirtPageNum) -> VirtAddr {
        vpn.address()
    }
}
