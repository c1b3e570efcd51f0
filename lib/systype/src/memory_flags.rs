//! Module for abstracting memory permissions.

use bitflags::bitflags;

bitflags! {
    /// Memory protection/access flags for system calls like `mmap`.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MmapProt: i32 {
        /// No access.
        const PROT_NONE = 0x0;
        /// Page can be read.
        const PROT_READ = 0x1;
        /// Page can be written.
        const PROT_WRITE = 0x2;
        /// Page can be executed.
        const PROT_EXEC = 0x4;
    }
}

bitflags! {
    /// Flags for `mmap` system call that specify how the memory should be mapped.
    #[derive(Default, Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct MmapFlags: i32 {
        // Sharing types (must choose one and only one of these).
        /// Share changes.
        const MAP_SHARED = 0x01;
        /// Changes are private.
        const MAP_PRIVATE = 0x02;
        /// Share changes and validate
        const MAP_SHARED_VALIDATE = 0x03;
        const MAP_TYPE_MASK = 0x03;

        // Other flags
        /// Interpret addr exactly.
        const MAP_FIXED = 0x10;
        /// Don't use a file.
        const MAP_ANONYMOUS = 0x20;
        /// Pages are locked in memory.
        const MAP_LOCKED = 0x2000;
        /// Don't check for reservations.
        const MAP_NORESERVE = 0x04000;
    }
}

impl MmapFlags {
    /// Returns whether the sharing type of the mapping is shared.
    pub fn is_shared(self) -> bool {
        matches!(
            self & Self::MAP_TYPE_MASK,
            Self::MAP_SHARED | Self::MAP_SHARED_VALIDATE
        )
    }
}
