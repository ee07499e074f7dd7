//! Shared test fixtures: a small guest world with a kernel tree laid out
//! at fixed frame numbers.

use std::sync::Arc;

use spt_core::{
    FrameTranslationTable, Gfn, GuestMemory, Hfn, MemoryZone, PageFlags, PageTableEntry, layout,
};

use crate::{AddressSpace, AddressSpaceId, ShadowState};

/// Top-level node of the kernel tree.
pub(crate) const KERNEL_TOP: Gfn = Gfn(1);

/// Upper-level nodes of the canonical kernel tree.
pub(crate) const UPPER: [Gfn; 2] = [Gfn(0x10), Gfn(0x11)];

/// Middle-level nodes of the canonical kernel tree.
pub(crate) const MIDDLE: [Gfn; 3] = [Gfn(0x20), Gfn(0x21), Gfn(0x22)];

/// Leaf-level nodes of the canonical kernel tree.
pub(crate) const LEAF: [Gfn; 5] = [Gfn(0x30), Gfn(0x31), Gfn(0x32), Gfn(0x33), Gfn(0x34)];

/// First data frame mapped by the canonical kernel tree.
pub(crate) const DATA: Gfn = Gfn(0x100);

/// Host frame numbers are guest frame numbers offset by this.
pub(crate) const HOST_BASE: u64 = 0x4_0000;

/// Top-level slot in the user half.
pub(crate) const TOP_USER_INDEX: usize = 3;

/// Top-level slot in the kernel half, above the guard hole.
pub(crate) const TOP_KERNEL_INDEX: usize = 300;

pub(crate) struct World {
    pub memory: GuestMemory,
    pub state: ShadowState,
}

impl World {
    /// A world with one table/data zone, an allocatable zone for shadow
    /// nodes, a fully populated translation table, and an installed kernel
    /// top-level node.
    pub fn new() -> Self {
        Self::with_allocatable(0x80)
    }

    /// Like [`new`], with a custom number of allocatable frames.
    ///
    /// [`new`]: Self::new
    pub fn with_allocatable(frames: u64) -> Self {
        let mut memory = GuestMemory::new();
        memory.add_zone(MemoryZone::new(Gfn(0), 0x800));
        memory.add_allocatable(Gfn(0x1000), frames);

        let table = Arc::new(FrameTranslationTable::with_len(0x1080));
        for gfn in 0..0x1080u64 {
            table.set(Gfn(gfn), Hfn(HOST_BASE + gfn));
        }

        memory.install_table(KERNEL_TOP).unwrap();

        let kernel = AddressSpace::new(AddressSpaceId(0), KERNEL_TOP);
        let state = ShadowState::new(table, kernel);

        Self { memory, state }
    }

    pub fn install(&self, gfn: Gfn) {
        self.memory.install_table(gfn).unwrap();
    }

    /// Points `table[index]` at `child` as an intermediate link.
    pub fn link(&self, table: Gfn, index: usize, child: Gfn) {
        let entry = PageTableEntry::from_frame(
            child,
            PageFlags::PRESENT | PageFlags::WRITE | PageFlags::ACCESSED,
        );
        self.memory
            .set_entry(layout::entry_pa(table, index), entry)
            .unwrap();
    }

    /// Maps `table[index]` to a data frame as a present leaf entry.
    pub fn map(&self, table: Gfn, index: usize, frame: Gfn, flags: PageFlags) {
        let entry = PageTableEntry::from_frame(frame, flags | PageFlags::PRESENT);
        self.memory
            .set_entry(layout::entry_pa(table, index), entry)
            .unwrap();
    }

    /// Maps `table[index]` as a huge leaf covering 512 natural pages from
    /// `base`.
    pub fn map_huge(&self, table: Gfn, index: usize, base: Gfn) {
        self.map(table, index, base, PageFlags::WRITE | PageFlags::LARGE);
    }

    /// Lays out the canonical kernel tree: two upper nodes, three middle
    /// nodes, five leaf nodes, no huge regions, a few mapped pages.
    pub fn build_kernel_tree(&self) {
        for gfn in UPPER.into_iter().chain(MIDDLE).chain(LEAF) {
            self.install(gfn);
        }

        self.link(KERNEL_TOP, TOP_USER_INDEX, UPPER[0]);
        self.link(KERNEL_TOP, TOP_KERNEL_INDEX, UPPER[1]);

        self.link(UPPER[0], 0, MIDDLE[0]);
        self.link(UPPER[0], 7, MIDDLE[1]);
        self.link(UPPER[1], 1, MIDDLE[2]);

        self.link(MIDDLE[0], 0, LEAF[0]);
        self.link(MIDDLE[0], 5, LEAF[1]);
        self.link(MIDDLE[1], 2, LEAF[2]);
        self.link(MIDDLE[2], 0, LEAF[3]);
        self.link(MIDDLE[2], 9, LEAF[4]);

        self.map(LEAF[0], 0, DATA, PageFlags::WRITE);
        self.map(LEAF[0], 1, DATA + 1, PageFlags::WRITE | PageFlags::DIRTY);
        self.map(LEAF[3], 4, DATA + 2, PageFlags::empty());
    }
}
