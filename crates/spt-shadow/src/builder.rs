//! Two-pass shadow tree construction.
//!
//! The primary tree is walked twice over the same split ranges: everything
//! below the user/kernel midpoint of the top-level node, and everything
//! from the guard-hole boundary upward. The first pass counts how many
//! shadow nodes the mirror will need; the second re-walks in the same
//! ascending order, consuming pool frames as it goes, so the two passes
//! agree frame by frame.
//!
//! Every intermediate node gets exactly one shadow counterpart, recorded in
//! the back-reference index and reused on later encounters. Huge middle
//! leaves are expanded into a full node of natural-page entries; huge upper
//! leaves have no representation in the counting pass and abort
//! construction.

use spt_core::{
    FrameTranslationTable, Gfn, GuestMemory, Pa, PageTableEntry, SptError,
    layout::{self, ENTRIES_PER_TABLE, KERNEL_SPLIT_INDEX},
};

use crate::{backref::BackRefIndex, pool::ShadowNodePool, prober::PresenceProber};

/// Per-level tally of the intermediate nodes the shadow tree will need.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TableCounts {
    /// Upper-level nodes, one per present top-level entry.
    pub upper: u32,

    /// Middle-level nodes, one per present non-huge upper entry.
    pub middle: u32,

    /// Leaf-level nodes, one per present middle entry; a huge middle leaf
    /// still needs one node to be flattened into.
    pub leaf: u32,
}

impl TableCounts {
    /// Total pool requirement, including the top-level node itself.
    pub fn required_nodes(&self) -> usize {
        (self.upper + self.middle + self.leaf) as usize + 1
    }
}

/// The top-level slots a structure walk visits, in ascending order.
fn top_indices() -> impl Iterator<Item = usize> {
    (0..KERNEL_SPLIT_INDEX).chain(layout::guard_hole_end_index()..ENTRIES_PER_TABLE)
}

/// Counting pass: sizes the shadow node pool for the tree under `top`.
pub fn count_tables(memory: &GuestMemory, top: Gfn) -> Result<TableCounts, SptError> {
    let mut counts = TableCounts::default();

    for index in top_indices() {
        let entry = memory.entry(layout::entry_pa(top, index))?;
        if !entry.present() {
            continue;
        }

        counts.upper += 1;
        let upper = entry.gfn();

        for index in 0..ENTRIES_PER_TABLE {
            let entry = memory.entry(layout::entry_pa(upper, index))?;
            if !entry.present() || entry.large() {
                continue;
            }

            counts.middle += 1;
            let middle = entry.gfn();

            for index in 0..ENTRIES_PER_TABLE {
                let entry = memory.entry(layout::entry_pa(middle, index))?;
                if !entry.present() {
                    continue;
                }

                counts.leaf += 1;
            }
        }
    }

    Ok(counts)
}

/// Construction pass over the primary tree.
pub struct ShadowBuilder<'a> {
    memory: &'a GuestMemory,
    table: &'a FrameTranslationTable,
    backrefs: &'a BackRefIndex,
    pool: &'a mut ShadowNodePool,
}

impl<'a> ShadowBuilder<'a> {
    /// Creates a builder drawing nodes from the given pool.
    pub fn new(
        memory: &'a GuestMemory,
        table: &'a FrameTranslationTable,
        backrefs: &'a BackRefIndex,
        pool: &'a mut ShadowNodePool,
    ) -> Self {
        Self {
            memory,
            table,
            backrefs,
            pool,
        }
    }

    /// Mirrors every intermediate node reachable from `top` in the split
    /// ranges and returns the shadow top-level node.
    ///
    /// Re-running over an unchanged primary tree reuses every recorded
    /// back-reference and consumes no additional pool frames.
    pub fn construct(&mut self, top: Gfn) -> Result<Gfn, SptError> {
        let shadow_top = self.ensure_node(top)?;

        for index in top_indices() {
            let entry = self.memory.entry(layout::entry_pa(top, index))?;
            if !entry.present() {
                continue;
            }

            let upper = entry.gfn();
            let shadow_upper = self.ensure_node(upper)?;
            self.link(layout::entry_pa(shadow_top, index), entry, shadow_upper)?;
            self.construct_upper(upper, shadow_upper)?;
        }

        tracing::debug!(
            %top,
            %shadow_top,
            nodes = self.pool.consumed(),
            "constructed shadow tree"
        );

        Ok(shadow_top)
    }

    fn construct_upper(&mut self, upper: Gfn, shadow_upper: Gfn) -> Result<(), SptError> {
        for index in 0..ENTRIES_PER_TABLE {
            let entry = self.memory.entry(layout::entry_pa(upper, index))?;
            if !entry.present() {
                continue;
            }

            if entry.large() {
                // The counting pass has no representation for a flattened
                // upper leaf; meeting one means the passes diverged.
                tracing::error!(%upper, index, "huge upper leaf in construction walk");
                return Err(SptError::invariant("unexpected huge upper leaf"));
            }

            let middle = entry.gfn();
            let shadow_middle = self.ensure_node(middle)?;
            self.link(layout::entry_pa(shadow_upper, index), entry, shadow_middle)?;
            self.construct_middle(middle, shadow_middle)?;
        }

        Ok(())
    }

    fn construct_middle(&mut self, middle: Gfn, shadow_middle: Gfn) -> Result<(), SptError> {
        for index in 0..ENTRIES_PER_TABLE {
            let pa = layout::entry_pa(middle, index);
            let entry = self.memory.entry(pa)?;
            if !entry.present() {
                continue;
            }

            let shadow_pa = layout::entry_pa(shadow_middle, index);

            if entry.large() {
                self.flatten(pa, entry, shadow_pa)?;
                continue;
            }

            let leaf = entry.gfn();
            let shadow_leaf = self.ensure_node(leaf)?;
            self.link(shadow_pa, entry, shadow_leaf)?;
            self.construct_leaf(leaf, shadow_leaf)?;
        }

        Ok(())
    }

    fn construct_leaf(&mut self, leaf: Gfn, shadow_leaf: Gfn) -> Result<(), SptError> {
        let prober = self.prober();

        for index in 0..ENTRIES_PER_TABLE {
            let entry = self.memory.entry(layout::entry_pa(leaf, index))?;
            let target = entry.gfn();

            prober.check_present(entry, target);
            self.memory.set_entry(
                layout::entry_pa(shadow_leaf, index),
                entry.translated(self.table.lookup(target)),
            )?;
        }

        Ok(())
    }

    /// Expands one huge middle leaf into a full node of natural-page
    /// entries.
    ///
    /// This is the one place that fabricates leaf entries with no literal
    /// counterpart in the primary tree, so every slice is translated
    /// independently and eagerly probed before it is written.
    fn flatten(
        &mut self,
        entry_pa: Pa,
        entry: PageTableEntry,
        shadow_pa: Pa,
    ) -> Result<(), SptError> {
        let node = match self.backrefs.flattened(entry_pa) {
            Some(node) => node,
            None => {
                let node = self.pool.take()?;
                self.backrefs.insert_flattened(entry_pa, node)?;
                node
            }
        };

        self.memory
            .set_entry(shadow_pa, entry.translated_no_large(self.table.lookup(node)))?;

        let prober = self.prober();
        let base = entry.gfn();

        for index in 0..ENTRIES_PER_TABLE {
            let target = base + index as u64;

            prober.check_present(entry, target);
            self.memory.set_entry(
                layout::entry_pa(node, index),
                entry.translated_no_large(self.table.lookup(target)),
            )?;
        }

        tracing::debug!(%entry_pa, %node, "flattened huge leaf");
        Ok(())
    }

    /// Returns the shadow counterpart of a primary node, taking a fresh
    /// pool frame on first encounter.
    fn ensure_node(&mut self, primary: Gfn) -> Result<Gfn, SptError> {
        if let Some(shadow) = self.backrefs.get(primary) {
            return Ok(shadow);
        }

        let shadow = self.pool.take()?;
        self.backrefs.insert(primary, shadow)?;
        Ok(shadow)
    }

    /// Copy-and-translate of one intermediate entry: the shadow entry keeps
    /// the primary's flags but points at the shadow child node.
    fn link(
        &self,
        shadow_pa: Pa,
        entry: PageTableEntry,
        shadow_child: Gfn,
    ) -> Result<(), SptError> {
        self.prober().check_present(entry, shadow_child);
        self.memory
            .set_entry(shadow_pa, entry.translated(self.table.lookup(shadow_child)))
    }

    fn prober(&self) -> PresenceProber<'a> {
        PresenceProber::new(self.memory, self.table)
    }
}
