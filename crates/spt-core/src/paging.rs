use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::{Gfn, Hfn};

bitflags::bitflags! {
    /// Flag bits of a page-table entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u64 {
        /// The entry maps a present page or table.
        const PRESENT = 1 << 0;

        /// The mapped range is writable.
        const WRITE = 1 << 1;

        /// The mapped range is accessible in user mode.
        const USER = 1 << 2;

        /// Write-through caching is enabled for the mapped range.
        const WRITE_THROUGH = 1 << 3;

        /// Caching is disabled for the mapped range.
        const CACHE_DISABLE = 1 << 4;

        /// The mapped range has been accessed.
        const ACCESSED = 1 << 5;

        /// The mapped range has been written to.
        const DIRTY = 1 << 6;

        /// The entry maps a huge region directly instead of a next-level
        /// table.
        const LARGE = 1 << 7;

        /// The mapping is global (shared between all address spaces).
        const GLOBAL = 1 << 8;

        /// Instruction fetches from the mapped range are disallowed.
        const NO_EXECUTE = 1 << 63;
    }
}

/// The levels in the page table hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum PageTableLevel {
    /// Page Table (PT) - the leaf level, pointing directly to 4KB pages.
    Pt,

    /// Page Directory (PD) - the middle level; can point to PTs or map 2MB
    /// huge regions.
    Pd,

    /// Page Directory Pointer Table (PDPT) - the upper level; can point to
    /// PDs or map 1GB huge regions.
    Pdpt,

    /// Page Map Level 4 (PML4) - the top level of the 4-level hierarchy.
    Pml4,
}

impl PageTableLevel {
    /// Returns the next lower level in the page table hierarchy.
    pub fn next(self) -> Option<Self> {
        match self {
            Self::Pt => None,
            Self::Pd => Some(Self::Pt),
            Self::Pdpt => Some(Self::Pd),
            Self::Pml4 => Some(Self::Pdpt),
        }
    }

    /// Returns the next higher level in the page table hierarchy.
    pub fn previous(self) -> Option<Self> {
        match self {
            Self::Pt => Some(Self::Pd),
            Self::Pd => Some(Self::Pdpt),
            Self::Pdpt => Some(Self::Pml4),
            Self::Pml4 => None,
        }
    }

    /// Checks if entries at this level may map a huge region directly.
    pub fn supports_large(self) -> bool {
        matches!(self, Self::Pd | Self::Pdpt)
    }
}

/// A page table entry in the paging structures.
#[repr(transparent)]
#[derive(Default, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct PageTableEntry(pub u64);

impl PageTableEntry {
    /// All non-address bits of an entry, including the software-defined
    /// bits above the frame number.
    pub const FLAGS_MASK: u64 = 0xFFF0_0000_0000_0FFF;

    const PFN_BITS: u64 = 40;
    const PFN_MASK: u64 = (1 << Self::PFN_BITS) - 1;

    /// Creates an empty (non-present) entry.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Creates an entry mapping the given frame with the given flags.
    pub fn from_frame(frame: Gfn, flags: PageFlags) -> Self {
        Self((frame.0 << 12) | flags.bits())
    }

    /// Checks if the entry is present.
    pub fn present(self) -> bool {
        self.0 & 1 != 0
    }

    /// Checks if the mapped range is writable.
    pub fn write(self) -> bool {
        (self.0 >> 1) & 1 != 0
    }

    /// Checks if the mapped range has been accessed.
    pub fn accessed(self) -> bool {
        (self.0 >> 5) & 1 != 0
    }

    /// Checks if the mapped range has been written to.
    pub fn dirty(self) -> bool {
        (self.0 >> 6) & 1 != 0
    }

    /// Checks if this entry maps a huge region directly.
    pub fn large(self) -> bool {
        (self.0 >> 7) & 1 != 0
    }

    /// Checks if the mapping is global.
    pub fn global(self) -> bool {
        (self.0 >> 8) & 1 != 0
    }

    /// Extracts the raw frame number from the entry.
    pub fn pfn(self) -> u64 {
        (self.0 >> 12) & Self::PFN_MASK
    }

    /// Extracts the frame number as a guest frame.
    pub fn gfn(self) -> Gfn {
        Gfn(self.pfn())
    }

    /// Returns the raw flag bits of the entry, software bits included.
    pub fn flag_bits(self) -> u64 {
        self.0 & Self::FLAGS_MASK
    }

    /// Returns the architectural flags of the entry.
    pub fn flags(self) -> PageFlags {
        PageFlags::from_bits_truncate(self.0)
    }

    /// Rewrites the entry's target through a host-frame translation.
    ///
    /// A non-present source yields an all-zero entry. An unknown translation
    /// (`None`) keeps the flag bits and leaves the frame number zero.
    pub fn translated(self, hfn: Option<Hfn>) -> Self {
        if !self.present() {
            return Self(0);
        }

        Self((self.0 & Self::FLAGS_MASK) | (hfn.unwrap_or_default().0 << 12))
    }

    /// Rewrites the entry's target through a host-frame translation,
    /// clearing the huge-region bit.
    ///
    /// Used when a huge leaf is expanded into a table of natural-page
    /// entries, where the bit must not survive in either the table pointer
    /// or the synthesized leaves.
    pub fn translated_no_large(self, hfn: Option<Hfn>) -> Self {
        if !self.present() {
            return Self(0);
        }

        let flags = self.0 & Self::FLAGS_MASK & !PageFlags::LARGE.bits();
        Self(flags | (hfn.unwrap_or_default().0 << 12))
    }
}

impl std::fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("PageTableEntry")
            .field("present", &self.present())
            .field("write", &self.write())
            .field("accessed", &self.accessed())
            .field("dirty", &self.dirty())
            .field("large", &self.large())
            .field("global", &self.global())
            .field("pfn", &self.pfn())
            .finish()
    }
}
