use spt_core::{
    Gfn, GuestMemory, Pa, PageFlags, PageTableEntry, PageTableLevel, SptError, layout,
};

use crate::{prober::PresenceProber, space::AddressSpace, state::ShadowState};

/// Synchronized primitives replicating primary-tree mutations into the
/// shadow tree.
///
/// A mirror is a cheap borrow of the process-wide [`ShadowState`] plus the
/// guest memory; every primitive runs synchronously in the caller's
/// execution context and relies on the serialization the primary tree
/// already uses for the touched entry. The shadow-side effect is silently
/// skipped whenever no shadow counterpart exists; that is the normal path
/// for address spaces that were never activated.
///
/// The one primitive with its own concurrency demand is [`establish`],
/// which must use a true atomic exchange on both copies when multiple
/// execution contexts may race on the same entry. Single-context deployments
/// can downgrade it with [`with_smp`].
///
/// [`establish`]: Self::establish
/// [`with_smp`]: Self::with_smp
pub struct MutationMirror<'a> {
    state: &'a ShadowState,
    memory: &'a GuestMemory,
    smp: bool,
}

impl<'a> MutationMirror<'a> {
    pub(crate) fn new(state: &'a ShadowState, memory: &'a GuestMemory) -> Self {
        Self {
            state,
            memory,
            smp: true,
        }
    }

    /// Selects between the atomic-exchange and plain-write variants of
    /// [`establish`].
    ///
    /// [`establish`]: Self::establish
    pub fn with_smp(self, smp: bool) -> Self {
        Self { smp, ..self }
    }

    /// Compares the requested entry to the current one and installs it when
    /// different and `dirty` holds.
    ///
    /// The comparison also considers flag skew between the primary entry
    /// and its shadow copy. Returns whether any change was observed across
    /// both copies.
    pub fn set_entry_if_changed(
        &self,
        level: PageTableLevel,
        pa: Pa,
        entry: PageTableEntry,
        dirty: bool,
    ) -> Result<bool, SptError> {
        let current = self.memory.entry(pa)?;
        let mut changed = current != entry;

        if let Some(shadow_pa) = self.shadow_entry(pa) {
            changed |= current.flag_bits() != self.memory.entry(shadow_pa)?.flag_bits();
        }

        if changed && dirty {
            self.set_entry(level, pa, entry)?;
        }

        Ok(changed)
    }

    /// Installs an entry and replicates it into the shadow copy, if one
    /// exists.
    ///
    /// Leaf entries and huge leaves translate their own target; an
    /// intermediate entry translates the shadow counterpart of the child
    /// node it points at.
    pub fn set_entry(
        &self,
        level: PageTableLevel,
        pa: Pa,
        entry: PageTableEntry,
    ) -> Result<(), SptError> {
        self.memory.set_entry(pa, entry)?;

        let Some(shadow_pa) = self.shadow_entry(pa) else {
            return Ok(());
        };

        let value = self.translate_for(level, entry);
        self.memory.set_entry(shadow_pa, value)
    }

    /// Atomically tests and clears the accessed indicator on both copies.
    ///
    /// The result is the OR of both outcomes.
    pub fn test_and_clear_accessed(&self, pa: Pa) -> Result<bool, SptError> {
        let mut result = false;

        if self.memory.entry(pa)?.accessed() {
            result = self.memory.clear_entry_flags(pa, PageFlags::ACCESSED)?;
        }

        let Some(shadow_pa) = self.shadow_entry(pa) else {
            return Ok(result);
        };

        if self.memory.entry(shadow_pa)?.accessed() {
            result |= self.memory.clear_entry_flags(shadow_pa, PageFlags::ACCESSED)?;
        }

        Ok(result)
    }

    /// Clears the writable bit on both copies.
    pub fn clear_write(&self, pa: Pa) -> Result<(), SptError> {
        self.memory.clear_entry_flags(pa, PageFlags::WRITE)?;

        if let Some(shadow_pa) = self.shadow_entry(pa) {
            self.memory.clear_entry_flags(shadow_pa, PageFlags::WRITE)?;
        }

        Ok(())
    }

    /// Atomically reads and zeroes the entry on both copies.
    ///
    /// The returned entry carries the primary's value merged with the
    /// shadow copy's flags; translated frame numbers never leak back.
    pub fn get_and_clear(
        &self,
        level: PageTableLevel,
        pa: Pa,
    ) -> Result<PageTableEntry, SptError> {
        let displaced = self.memory.take_entry(pa)?;

        let Some(shadow_pa) = self.shadow_entry(pa) else {
            return Ok(displaced);
        };

        let shadow_displaced = self.memory.take_entry(shadow_pa)?;
        Ok(Self::merge_displaced(level, displaced, shadow_displaced))
    }

    /// Exchanges a middle-level entry for a new value on both copies.
    ///
    /// With multiple execution contexts enabled this is a true atomic
    /// exchange on each copy; otherwise both are rewritten with plain
    /// stores. Either way the result merges the two displaced old values.
    pub fn establish(&self, pa: Pa, entry: PageTableEntry) -> Result<PageTableEntry, SptError> {
        if self.smp {
            let displaced = self.memory.swap_entry(pa, entry)?;

            let Some(shadow_pa) = self.shadow_entry(pa) else {
                return Ok(displaced);
            };

            let value = self.translate_for(PageTableLevel::Pd, entry);
            let shadow_displaced = self.memory.swap_entry(shadow_pa, value)?;
            Ok(Self::merge_displaced(
                PageTableLevel::Pd,
                displaced,
                shadow_displaced,
            ))
        }
        else {
            let displaced = self.memory.entry(pa)?;
            self.memory.set_entry(pa, entry)?;

            let Some(shadow_pa) = self.shadow_entry(pa) else {
                return Ok(displaced);
            };

            let shadow_displaced = self.memory.entry(shadow_pa)?;
            let value = self.translate_for(PageTableLevel::Pd, entry);
            self.memory.set_entry(shadow_pa, value)?;
            Ok(Self::merge_displaced(
                PageTableLevel::Pd,
                displaced,
                shadow_displaced,
            ))
        }
    }

    /// Installs a top-level entry and mirrors it through the owning address
    /// space's private shadow top node.
    ///
    /// Skipped for the kernel address space, whose top is mirrored during
    /// construction, and for spaces that were never activated. An activated
    /// space without a shadow top node means activation and mirroring have
    /// diverged.
    pub fn install_top_entry(
        &self,
        space: &AddressSpace,
        index: usize,
        entry: PageTableEntry,
    ) -> Result<(), SptError> {
        self.memory
            .set_entry(layout::entry_pa(space.top(), index), entry)?;

        if self.state.is_kernel(space) || !self.state.gate().is_active(space.id()) {
            return Ok(());
        }

        let shadow_top = self
            .state
            .backrefs()
            .get(space.top())
            .ok_or(SptError::invariant("activated space has no shadow top node"))?;

        let value = self.install_value(space, PageTableLevel::Pml4, entry)?;
        self.memory
            .set_entry(layout::entry_pa(shadow_top, index), value)
    }

    /// Installs an intermediate (upper or middle) entry and mirrors it,
    /// creating the shadow counterpart of the pointed-at child node lazily
    /// on its first install for an activated address space.
    pub fn install_entry(
        &self,
        space: &AddressSpace,
        level: PageTableLevel,
        pa: Pa,
        entry: PageTableEntry,
    ) -> Result<(), SptError> {
        self.memory.set_entry(pa, entry)?;

        let Some(shadow_pa) = self.shadow_entry(pa) else {
            return Ok(());
        };

        let value = self.install_value(space, level, entry)?;
        self.memory.set_entry(shadow_pa, value)
    }

    /// Lifecycle hook: the primary tree allocated a new table node.
    ///
    /// Creates its shadow counterpart when the owning space is activated;
    /// a no-op for the kernel space and for nodes already mirrored.
    pub fn note_table_allocated(
        &self,
        space: &AddressSpace,
        table: Gfn,
    ) -> Result<(), SptError> {
        if self.state.is_kernel(space) || !self.state.gate().is_active(space.id()) {
            return Ok(());
        }

        if self.state.backrefs().get(table).is_some() {
            return Ok(());
        }

        let shadow = self.memory.alloc_frame()?;
        self.state.backrefs().insert(table, shadow)?;
        tracing::trace!(%table, %shadow, "mirrored new table node");
        Ok(())
    }

    /// Lifecycle hook: the primary tree freed a table node.
    ///
    /// Releases its shadow counterpart, if any.
    pub fn note_table_freed(&self, table: Gfn) {
        if let Some(shadow) = self.state.backrefs().remove(table) {
            self.memory.free_frame(shadow);
            tracing::trace!(%table, %shadow, "released mirrored table node");
        }
    }

    fn shadow_entry(&self, pa: Pa) -> Option<Pa> {
        self.state.backrefs().shadow_entry(pa)
    }

    /// Translation target of an entry: leaves and huge leaves reference
    /// their own frame, intermediate entries reference the shadow
    /// counterpart of their child node.
    fn target_for(&self, level: PageTableLevel, entry: PageTableEntry) -> Option<Gfn> {
        if !entry.present() {
            return None;
        }

        match level {
            PageTableLevel::Pt => Some(entry.gfn()),
            _ if entry.large() => Some(entry.gfn()),
            _ => self.state.backrefs().get(entry.gfn()),
        }
    }

    /// Copy-and-translate of one entry, with the presence check applied
    /// before the value can be written anywhere.
    fn translate_for(&self, level: PageTableLevel, entry: PageTableEntry) -> PageTableEntry {
        let target = self.target_for(level, entry);

        if let Some(target) = target {
            PresenceProber::new(self.memory, self.state.table()).check_present(entry, target);
        }

        entry.translated(target.and_then(|target| self.state.table().lookup(target)))
    }

    /// Like [`translate_for`], but mirrors the child node first when this
    /// is its first install.
    ///
    /// [`translate_for`]: Self::translate_for
    fn install_value(
        &self,
        space: &AddressSpace,
        level: PageTableLevel,
        entry: PageTableEntry,
    ) -> Result<PageTableEntry, SptError> {
        let links_child = entry.present() && !entry.large() && level != PageTableLevel::Pt;
        if links_child && self.state.backrefs().get(entry.gfn()).is_none() {
            self.note_table_allocated(space, entry.gfn())?;
        }

        Ok(self.translate_for(level, entry))
    }

    /// Merges a displaced primary entry with its displaced shadow copy.
    fn merge_displaced(
        level: PageTableLevel,
        primary: PageTableEntry,
        shadow: PageTableEntry,
    ) -> PageTableEntry {
        match level {
            // The middle level keeps the primary's flags only.
            PageTableLevel::Pd => primary,
            _ => PageTableEntry(primary.0 | shadow.flag_bits()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        AddressSpaceId,
        fixtures::{DATA, HOST_BASE, LEAF, MIDDLE, UPPER, World},
    };

    fn built_world() -> World {
        let world = World::new();
        world.build_kernel_tree();
        world.state.build_root(&world.memory).unwrap();
        world
    }

    fn leaf_entry_pa(index: usize) -> Pa {
        layout::entry_pa(LEAF[0], index)
    }

    fn shadow_of(world: &World, pa: Pa) -> PageTableEntry {
        let shadow_pa = world.state.backrefs().shadow_entry(pa).unwrap();
        world.memory.entry(shadow_pa).unwrap()
    }

    #[test]
    fn unmirrored_entries_fall_through() -> Result<(), SptError> {
        let world = World::new();
        world.build_kernel_tree();

        // No shadow root: every mirror call is a primary-only operation.
        let mirror = world.state.mirror(&world.memory);
        let pa = leaf_entry_pa(0);
        let entry = PageTableEntry::from_frame(DATA, PageFlags::PRESENT | PageFlags::WRITE);

        assert!(!mirror.set_entry_if_changed(PageTableLevel::Pt, pa, entry, true)?);
        assert!(!mirror.test_and_clear_accessed(pa)?);
        assert_eq!(mirror.get_and_clear(PageTableLevel::Pt, pa)?, entry);

        Ok(())
    }

    #[test]
    fn set_entry_replicates_leaf_translations() -> Result<(), SptError> {
        let world = built_world();
        let mirror = world.state.mirror(&world.memory);

        let pa = leaf_entry_pa(0);
        let entry = PageTableEntry::from_frame(
            DATA + 7,
            PageFlags::PRESENT | PageFlags::WRITE | PageFlags::DIRTY,
        );
        mirror.set_entry(PageTableLevel::Pt, pa, entry)?;

        let shadow = shadow_of(&world, pa);
        assert_eq!(shadow.flag_bits(), entry.flag_bits());
        assert_eq!(shadow.pfn(), HOST_BASE + DATA.0 + 7);

        Ok(())
    }

    #[test]
    fn set_entry_if_changed_observes_flag_skew() -> Result<(), SptError> {
        let world = built_world();
        let mirror = world.state.mirror(&world.memory);

        let pa = leaf_entry_pa(0);
        let current = world.memory.entry(pa)?;

        // Same primary value: only the skewed shadow flags report a change.
        assert!(!mirror.set_entry_if_changed(PageTableLevel::Pt, pa, current, false)?);

        let shadow_pa = world.state.backrefs().shadow_entry(pa).unwrap();
        world.memory.clear_entry_flags(shadow_pa, PageFlags::WRITE)?;
        assert!(mirror.set_entry_if_changed(PageTableLevel::Pt, pa, current, false)?);

        // A dirty install resynchronizes the copies.
        assert!(mirror.set_entry_if_changed(PageTableLevel::Pt, pa, current, true)?);
        assert_eq!(shadow_of(&world, pa).flag_bits(), current.flag_bits());

        Ok(())
    }

    #[test]
    fn test_and_clear_accessed_covers_both_copies() -> Result<(), SptError> {
        let world = built_world();
        let mirror = world.state.mirror(&world.memory);

        let pa = leaf_entry_pa(0);
        let entry = PageTableEntry::from_frame(
            DATA,
            PageFlags::PRESENT | PageFlags::WRITE | PageFlags::ACCESSED,
        );
        mirror.set_entry(PageTableLevel::Pt, pa, entry)?;

        assert!(mirror.test_and_clear_accessed(pa)?);
        assert!(!world.memory.entry(pa)?.accessed());
        assert!(!shadow_of(&world, pa).accessed());
        assert!(!mirror.test_and_clear_accessed(pa)?);

        // A stale accessed bit on the shadow side alone still reports.
        let shadow_pa = world.state.backrefs().shadow_entry(pa).unwrap();
        let stale = PageTableEntry(world.memory.entry(shadow_pa)?.0 | PageFlags::ACCESSED.bits());
        world.memory.set_entry(shadow_pa, stale)?;
        assert!(mirror.test_and_clear_accessed(pa)?);

        Ok(())
    }

    #[test]
    fn clear_write_protects_both_copies() -> Result<(), SptError> {
        let world = built_world();
        let mirror = world.state.mirror(&world.memory);

        let pa = leaf_entry_pa(0);
        mirror.clear_write(pa)?;

        assert!(!world.memory.entry(pa)?.write());
        assert!(!shadow_of(&world, pa).write());

        Ok(())
    }

    #[test]
    fn get_and_clear_merges_leaf_flags() -> Result<(), SptError> {
        let world = built_world();
        let mirror = world.state.mirror(&world.memory);

        let pa = leaf_entry_pa(0);
        let primary = world.memory.entry(pa)?;
        assert!(!primary.dirty());

        // Skew the shadow copy with a dirty bit the primary lacks.
        let shadow_pa = world.state.backrefs().shadow_entry(pa).unwrap();
        let skewed = PageTableEntry(world.memory.entry(shadow_pa)?.0 | PageFlags::DIRTY.bits());
        world.memory.set_entry(shadow_pa, skewed)?;

        let merged = mirror.get_and_clear(PageTableLevel::Pt, pa)?;
        assert!(merged.dirty());
        assert_eq!(merged.gfn(), primary.gfn());

        assert_eq!(world.memory.entry(pa)?, PageTableEntry::empty());
        assert_eq!(world.memory.entry(shadow_pa)?, PageTableEntry::empty());

        Ok(())
    }

    #[test]
    fn get_and_clear_keeps_middle_flags_asymmetric() -> Result<(), SptError> {
        let world = built_world();
        let mirror = world.state.mirror(&world.memory);

        let pa = layout::entry_pa(MIDDLE[0], 0);
        let primary = world.memory.entry(pa)?;

        let shadow_pa = world.state.backrefs().shadow_entry(pa).unwrap();
        let skewed = PageTableEntry(world.memory.entry(shadow_pa)?.0 | PageFlags::DIRTY.bits());
        world.memory.set_entry(shadow_pa, skewed)?;

        // The middle level discards the shadow copy's flags.
        let merged = mirror.get_and_clear(PageTableLevel::Pd, pa)?;
        assert_eq!(merged, primary);

        Ok(())
    }

    #[test]
    fn establish_exchanges_both_copies() -> Result<(), SptError> {
        let world = built_world();
        let mirror = world.state.mirror(&world.memory);

        // Repoint MIDDLE[0][0] from LEAF[0] to LEAF[1].
        let pa = layout::entry_pa(MIDDLE[0], 0);
        let old = world.memory.entry(pa)?;
        let new = PageTableEntry::from_frame(LEAF[1], PageFlags::PRESENT | PageFlags::WRITE);

        let displaced = mirror.establish(pa, new)?;
        assert_eq!(displaced, old);
        assert_eq!(world.memory.entry(pa)?, new);

        let shadow = shadow_of(&world, pa);
        let shadow_leaf = world.state.backrefs().get(LEAF[1]).unwrap();
        assert_eq!(shadow.pfn(), HOST_BASE + shadow_leaf.0);
        assert_eq!(shadow.flag_bits(), new.flag_bits());

        Ok(())
    }

    #[test]
    fn establish_without_smp_behaves_the_same() -> Result<(), SptError> {
        let world = built_world();
        let mirror = world.state.mirror(&world.memory).with_smp(false);

        let pa = layout::entry_pa(MIDDLE[0], 0);
        let old = world.memory.entry(pa)?;
        let new = PageTableEntry::from_frame(LEAF[1], PageFlags::PRESENT | PageFlags::WRITE);

        assert_eq!(mirror.establish(pa, new)?, old);
        assert_eq!(world.memory.entry(pa)?, new);
        assert_eq!(
            shadow_of(&world, pa).flag_bits(),
            new.flag_bits()
        );

        Ok(())
    }

    #[test]
    fn install_top_entry_skips_kernel_and_inactive_spaces() -> Result<(), SptError> {
        let world = built_world();
        let mirror = world.state.mirror(&world.memory);

        let entry = PageTableEntry::from_frame(UPPER[0], PageFlags::PRESENT | PageFlags::WRITE);
        mirror.install_top_entry(world.state.kernel(), 5, entry)?;

        // The kernel shadow top is untouched outside construction.
        let root = world.state.root().unwrap();
        assert_eq!(
            world.memory.entry(layout::entry_pa(root, 5))?,
            PageTableEntry::empty()
        );

        // Same for a user space that never activated.
        let user_top = Gfn(2);
        world.install(user_top);
        let user = AddressSpace::new(AddressSpaceId(7), user_top);
        mirror.install_top_entry(&user, 5, entry)?;
        assert!(world.state.backrefs().get(user_top).is_none());

        Ok(())
    }

    #[test]
    fn install_creates_shadow_children_lazily() -> Result<(), SptError> {
        let world = built_world();
        let mirror = world.state.mirror(&world.memory);

        // An activated user space with a seeded shadow top node.
        let user_top = Gfn(2);
        world.install(user_top);
        let user = AddressSpace::new(AddressSpaceId(7), user_top);
        let shadow_top = world.memory.alloc_frame()?;
        world.state.backrefs().insert(user_top, shadow_top)?;
        world.state.gate().activate(user.id());

        // Install a fresh upper node: its shadow counterpart is created on
        // first use.
        let upper = Gfn(0x50);
        world.install(upper);
        let entry = PageTableEntry::from_frame(upper, PageFlags::PRESENT | PageFlags::WRITE);
        mirror.install_top_entry(&user, 0, entry)?;

        let shadow_upper = world.state.backrefs().get(upper).unwrap();
        let mirrored = world.memory.entry(layout::entry_pa(shadow_top, 0))?;
        assert_eq!(mirrored.pfn(), HOST_BASE + shadow_upper.0);
        assert_eq!(mirrored.flag_bits(), entry.flag_bits());

        // The next level down flows through the same lazy path.
        let middle = Gfn(0x51);
        world.install(middle);
        let pa = layout::entry_pa(upper, 4);
        let entry = PageTableEntry::from_frame(middle, PageFlags::PRESENT | PageFlags::WRITE);
        mirror.install_entry(&user, PageTableLevel::Pdpt, pa, entry)?;

        let shadow_middle = world.state.backrefs().get(middle).unwrap();
        let mirrored = world
            .memory
            .entry(layout::entry_pa(shadow_upper, 4))?;
        assert_eq!(mirrored.pfn(), HOST_BASE + shadow_middle.0);

        Ok(())
    }

    #[test]
    fn freed_tables_release_their_shadow_nodes() -> Result<(), SptError> {
        let world = built_world();
        let mirror = world.state.mirror(&world.memory);

        let user_top = Gfn(2);
        world.install(user_top);
        let user = AddressSpace::new(AddressSpaceId(7), user_top);
        world.state.gate().activate(user.id());

        let table = Gfn(0x50);
        world.install(table);
        mirror.note_table_allocated(&user, table)?;
        assert!(world.state.backrefs().get(table).is_some());

        let free_before = world.memory.free_frames();
        mirror.note_table_freed(table);
        assert!(world.state.backrefs().get(table).is_none());
        assert_eq!(world.memory.free_frames(), free_before + 1);

        Ok(())
    }
}
