//! Module defining constants related to memory management.

/// Page size
pub const PAGE_SIZE: usize = 4096;
/// Width of page offset
pub const PAGE_OFFSET_WIDTH: usize = 12;
/// Width of a physical address in Sv39
pub const PA_WIDTH_SV39: usize = 56;
/// Width of a virtual address in Sv39
pub const VA_WIDTH_SV39: usize = 39;
/// Width of a physical page number in Sv39
pub const PPN_WIDTH_SV39: usize = PA_WIDTH_SV39 - PAGE_OFFSET_WIDTH;
/// Width of a virtual page number in Sv39
pub const VPN_WIDTH_SV39: usize = VA_WIDTH_SV39 - PAGE_OFFSET_WIDTH;

/// Width of a page table entry in Sv39 (64-bit)
pub const PTE_WIDTH: usize = 8;
/// Number of page table entries in a page table
pub const PTE_PER_TABLE: usize = PAGE_SIZE / PTE_WIDTH;

/// Span of virtual memory covered by one leaf page table
pub const PMD_SIZE: usize = PAGE_SIZE * PTE_PER_TABLE;

/// Number of pages the nonlinear scanner visits per step
pub const CLUSTER_PAGES: usize = 32;
/// Span of one nonlinear scan step, never larger than a leaf page table
pub const CLUSTER_SIZE: usize = if CLUSTER_PAGES * PAGE_SIZE > PMD_SIZE {
    PMD_SIZE
} else {
    CLUSTER_PAGES * PAGE_SIZE
};
/// Mask aligning an address down to a cluster boundary
pub const CLUSTER_MASK: usize = !(CLUSTER_SIZE - 1);

/// Physical page number of the first frame handed to the page allocator
pub const FRAME_PPN_START: usize = 0x8_0400;
/// Number of frames managed by the page allocator
pub const FRAME_COUNT: usize = 32 * 1024;
