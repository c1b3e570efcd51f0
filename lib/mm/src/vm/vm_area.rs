//! A module for managing virtual memory areas.
//!
//! A virtual memory area (VMA) is a contiguous region of virtual memory in an
//! address space, whose pages have a common set of attributes, such as permissions
//! and mapping type. A VMA is represented by a [`VmArea`] struct.
//!
//! A VMA has common fields for all types of VMAs, as well as unique fields for a
//! specific type of VMA represented by a [`TypedArea`] enum. A file-backed VMA maps
//! a window of a file starting at page offset `pgoff`. In the usual, linear case,
//! page `n` of the window is mapped at `start_va + n * PAGE_SIZE`. A shared
//! file-backed VMA can be made nonlinear by remapping individual pages to other
//! file offsets, after which the offset of a page can no longer be computed from
//! its address. The reverse mapping code scans nonlinear VMAs cluster by cluster,
//! remembering where it stopped in the VMA's cursor.

use alloc::sync::{Arc, Weak};
use core::{
    fmt,
    sync::atomic::{AtomicU32, AtomicUsize, Ordering},
};

use bitflags::bitflags;

use config::mm::PAGE_SIZE;
use systype::{
    SysError, SysResult,
    memory_flags::{MmapFlags, MmapProt},
};

use super::{addr_space::AddrSpace, pte::PteFlags};
use crate::{address::VirtAddr, mapping::MappingRegistry};

bitflags! {
    /// Attributes of a VMA.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VmFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
        /// Writes are visible to other mappings of the same file.
        const SHARED = 1 << 3;
        /// The mapping was requested as shared.
        const MAYSHARE = 1 << 4;
        /// Pages are locked in memory and must not be unmapped by reclaim.
        const LOCKED = 1 << 5;
        /// Pages belong to a special mapping the memory manager must not touch.
        const RESERVED = 1 << 6;
        /// Some pages are mapped at addresses unrelated to their file offset.
        const NONLINEAR = 1 << 7;
    }
}

impl VmFlags {
    /// Builds VMA flags from the arguments of `mmap`.
    pub fn from_mmap(prot: MmapProt, flags: MmapFlags) -> Self {
        let mut vm_flags = Self::empty();
        if prot.contains(MmapProt::PROT_READ) {
            vm_flags |= Self::READ;
        }
        if prot.contains(MmapProt::PROT_WRITE) {
            vm_flags |= Self::WRITE;
        }
        if prot.contains(MmapProt::PROT_EXEC) {
            vm_flags |= Self::EXEC;
        }
        if flags.is_shared() {
            vm_flags |= Self::SHARED | Self::MAYSHARE;
        }
        if flags.contains(MmapFlags::MAP_LOCKED) {
            vm_flags |= Self::LOCKED;
        }
        vm_flags
    }
}

impl From<VmFlags> for PteFlags {
    /// Convert `VmFlags` to the flags of a user page table entry.
    fn from(vm_flags: VmFlags) -> Self {
        let mut flags = Self::V | Self::U;
        if vm_flags.contains(VmFlags::READ) {
            flags |= PteFlags::R;
        }
        if vm_flags.contains(VmFlags::WRITE) {
            flags |= PteFlags::W;
        }
        if vm_flags.contains(VmFlags::EXEC) {
            flags |= PteFlags::X;
        }
        flags
    }
}

/// Unique data of a specific type of VMA. This enum is used in [`VmArea`].
#[derive(Debug)]
pub enum TypedArea {
    /// A file-backed VMA.
    ///
    /// A file-backed VMA is backed by a file. It is used for memory-mapped files.
    FileBacked(Arc<MappingRegistry>),
    /// An anonymous VMA.
    ///
    /// An anonymous VMA is not backed by any file. It is used for stack and heap.
    Anonymous,
}

/// A virtual memory area (VMA).
///
/// A VMA is a contiguous region of virtual memory in an address space that has
/// a common set of attributes, such as permissions and mapping type.
pub struct VmArea {
    /// Starting virtual address.
    start_va: VirtAddr,
    /// Ending virtual address (exclusive).
    end_va: VirtAddr,
    flags: AtomicU32,
    /// Page offset in the file of the page mapped at `start_va`.
    pgoff: usize,
    /// Unique data of a specific type of VMA.
    map_type: TypedArea,
    /// Address space the VMA belongs to.
    mm: Weak<AddrSpace>,
    /// Byte offset from `start_va` where the next nonlinear scan resumes.
    nonlinear_cursor: AtomicUsize,
}

impl VmArea {
    /// Constructs a file-backed [`VmArea`] mapping the file of `registry` from
    /// page offset `pgoff`.
    pub fn new_file_backed(
        start_va: VirtAddr,
        end_va: VirtAddr,
        flags: VmFlags,
        pgoff: usize,
        registry: Arc<MappingRegistry>,
        mm: Weak<AddrSpace>,
    ) -> Self {
        Self::new(start_va, end_va, flags, pgoff, TypedArea::FileBacked(registry), mm)
    }

    /// Constructs an anonymous [`VmArea`].
    pub fn new_anonymous(
        start_va: VirtAddr,
        end_va: VirtAddr,
        flags: VmFlags,
        mm: Weak<AddrSpace>,
    ) -> Self {
        let pgoff = start_va.page_number().to_usize();
        Self::new(start_va, end_va, flags, pgoff, TypedArea::Anonymous, mm)
    }

    fn new(
        start_va: VirtAddr,
        end_va: VirtAddr,
        flags: VmFlags,
        pgoff: usize,
        map_type: TypedArea,
        mm: Weak<AddrSpace>,
    ) -> Self {
        debug_assert!(start_va.is_aligned() && end_va.is_aligned());
        debug_assert!(start_va < end_va);
        Self {
            start_va,
            end_va,
            flags: AtomicU32::new(flags.bits()),
            pgoff,
            map_type,
            mm,
            nonlinear_cursor: AtomicUsize::new(0),
        }
    }

    pub fn start_va(&self) -> VirtAddr {
        self.start_va
    }

    pub fn end_va(&self) -> VirtAddr {
        self.end_va
    }

    /// Returns the size of the VMA in bytes.
    pub fn size(&self) -> usize {
        self.end_va.to_usize() - self.start_va.to_usize()
    }

    pub fn flags(&self) -> VmFlags {
        VmFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    pub fn pgoff(&self) -> usize {
        self.pgoff
    }

    pub fn map_type(&self) -> &TypedArea {
        &self.map_type
    }

    /// Returns the mapping registry of the file, for a file-backed VMA.
    pub fn registry(&self) -> Option<&Arc<MappingRegistry>> {
        match &self.map_type {
            TypedArea::FileBacked(registry) => Some(registry),
            TypedArea::Anonymous => None,
        }
    }

    /// Returns the address space the VMA belongs to, if it is still alive.
    pub fn owner(&self) -> Option<Arc<AddrSpace>> {
        self.mm.upgrade()
    }

    pub fn contains(&self, va: VirtAddr) -> bool {
        self.start_va <= va && va < self.end_va
    }

    pub fn is_shared(&self) -> bool {
        self.flags().contains(VmFlags::SHARED)
    }

    pub fn is_nonlinear(&self) -> bool {
        self.flags().contains(VmFlags::NONLINEAR)
    }

    /// Returns whether reclaim must leave the pages of this VMA alone.
    pub fn is_locked_or_reserved(&self) -> bool {
        self.flags().intersects(VmFlags::LOCKED | VmFlags::RESERVED)
    }

    /// Marks the VMA nonlinear.
    ///
    /// # Errors
    /// Returns [`SysError::EINVAL`] if the VMA is not a shared file mapping.
    pub fn set_nonlinear(&self) -> SysResult<()> {
        if self.registry().is_none() || !self.is_shared() {
            return Err(SysError::EINVAL);
        }
        self.flags.fetch_or(VmFlags::NONLINEAR.bits(), Ordering::AcqRel);
        Ok(())
    }

    /// Returns the address at which the file page at `pgoff` would be mapped
    /// if the VMA were linear, or `None` if that address falls outside it.
    pub fn vma_address(&self, pgoff: usize) -> Option<VirtAddr> {
        let offset = pgoff.checked_sub(self.pgoff)?.checked_mul(PAGE_SIZE)?;
        let address = self.start_va.to_usize().checked_add(offset)?;
        (address < self.end_va.to_usize()).then(|| VirtAddr::new(address))
    }

    /// Returns the file page offset a linear mapping would map at `va`.
    pub fn linear_page_index(&self, va: VirtAddr) -> usize {
        (va.to_usize() - self.start_va.to_usize()) / PAGE_SIZE + self.pgoff
    }

    pub fn nonlinear_cursor(&self) -> usize {
        self.nonlinear_cursor.load(Ordering::Relaxed)
    }

    pub fn set_nonlinear_cursor(&self, cursor: usize) {
        self.nonlinear_cursor.store(cursor, Ordering::Relaxed);
    }

    /// Flags of the page table entries for pages of this VMA.
    pub fn pte_flags(&self) -> PteFlags {
        self.flags().into()
    }
}

impl fmt::Debug for VmArea {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VmArea")
            .field("start_va", &format_args!("{:#x}", self.start_va.to_usize()))
            .field("end_va", &format_args!("{:#x}", self.end_va.to_usize()))
            .field("flags", &self.flags())
            .field("pgoff", &self.pgoff)
            .field("file_backed", &self.registry().is_some())
            .field("nonlinear_cursor", &self.nonlinear_cursor())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::MemMap;

    fn file_area(flags: VmFlags) -> VmArea {
        let registry = MappingRegistry::new(Arc::new(MemMap::with_frames(0x1000, 4)));
        VmArea::new_file_backed(
            VirtAddr::new(0x1000_0000),
            VirtAddr::new(0x1000_4000),
            flags,
            10,
            registry,
            Weak::new(),
        )
    }

    #[test]
    fn vma_address_in_and_out_of_range() {
        let area = file_area(VmFlags::READ);
        assert_eq!(area.vma_address(10), Some(VirtAddr::new(0x1000_0000)));
        assert_eq!(area.vma_address(13), Some(VirtAddr::new(0x1000_3000)));
        assert_eq!(area.vma_address(14), None);
        assert_eq!(area.vma_address(9), None);
        assert_eq!(area.vma_address(usize::MAX), None);
        assert_eq!(area.linear_page_index(VirtAddr::new(0x1000_2000)), 12);
    }

    #[test]
    fn only_shared_file_areas_become_nonlinear() {
        let private = file_area(VmFlags::READ);
        assert_eq!(private.set_nonlinear(), Err(SysError::EINVAL));
        assert!(!private.is_nonlinear());

        let shared = file_area(VmFlags::READ | VmFlags::SHARED | VmFlags::MAYSHARE);
        shared.set_nonlinear().unwrap();
        assert!(shared.is_nonlinear());

        let anon = VmArea::new_anonymous(
            VirtAddr::new(0x2000_0000),
            VirtAddr::new(0x2000_1000),
            VmFlags::READ | VmFlags::SHARED,
            Weak::new(),
        );
        assert_eq!(anon.set_nonlinear(), Err(SysError::EINVAL));
    }

    #[test]
    fn mmap_arguments_map_to_flags() {
        let flags = VmFlags::from_mmap(
            MmapProt::PROT_READ | MmapProt::PROT_WRITE,
            MmapFlags::MAP_SHARED | MmapFlags::MAP_LOCKED,
        );
        assert!(flags.contains(VmFlags::SHARED | VmFlags::MAYSHARE | VmFlags::LOCKED));
        let pte = PteFlags::from(flags);
        assert!(pte.contains(PteFlags::V | PteFlags::U | PteFlags::R | PteFlags::W));
        assert!(!pte.contains(PteFlags::X));
    }
}
