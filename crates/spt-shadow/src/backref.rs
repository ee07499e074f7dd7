use std::sync::RwLock;

use indexmap::IndexMap;
use spt_core::{Gfn, Pa, SptError, layout};

/// Non-owning association from primary table nodes to their shadow
/// counterparts.
///
/// At most one shadow node may ever be associated with a given primary
/// node, and once recorded the association lives until the primary node is
/// freed by its owning subsystem. The index is a lookup relation only; node
/// ownership stays with the pool or the allocator that produced the frame.
///
/// Flattened huge leaves have no primary node of their own, so they are
/// keyed separately by the middle-level entry that was expanded. This keeps
/// reconstruction over an unchanged primary tree from consuming fresh pool
/// frames.
pub struct BackRefIndex {
    nodes: RwLock<IndexMap<Gfn, Gfn>>,
    flattened: RwLock<IndexMap<Pa, Gfn>>,
}

impl BackRefIndex {
    /// Creates an empty index.
    pub fn new() -> Self {
        Self {
            nodes: RwLock::new(IndexMap::new()),
            flattened: RwLock::new(IndexMap::new()),
        }
    }

    /// Looks up the shadow counterpart of a primary table node.
    pub fn get(&self, primary: Gfn) -> Option<Gfn> {
        self.nodes.read().unwrap().get(&primary).copied()
    }

    /// Records the shadow counterpart of a primary table node.
    ///
    /// Recording a second counterpart for the same node violates the
    /// at-most-one invariant and is fatal.
    pub fn insert(&self, primary: Gfn, shadow: Gfn) -> Result<(), SptError> {
        let previous = self.nodes.write().unwrap().insert(primary, shadow);
        if previous.is_some() {
            return Err(SptError::invariant(
                "primary node already has a shadow counterpart",
            ));
        }

        Ok(())
    }

    /// Drops the association for a primary node, returning its former
    /// shadow counterpart.
    ///
    /// Called when the primary node itself is freed by its owning
    /// subsystem.
    pub fn remove(&self, primary: Gfn) -> Option<Gfn> {
        self.nodes.write().unwrap().shift_remove(&primary)
    }

    /// Locates the shadow copy of a primary entry.
    ///
    /// The entry's node is resolved to its shadow counterpart and the same
    /// intra-node offset is applied.
    pub fn shadow_entry(&self, entry: Pa) -> Option<Pa> {
        let shadow = self.get(layout::gfn_from_pa(entry))?;
        Some(layout::entry_pa(shadow, layout::entry_index(entry)))
    }

    /// Looks up the node a huge leaf at the given entry address was
    /// flattened into.
    pub fn flattened(&self, entry: Pa) -> Option<Gfn> {
        self.flattened.read().unwrap().get(&entry).copied()
    }

    /// Records the node a huge leaf at the given entry address was
    /// flattened into.
    pub fn insert_flattened(&self, entry: Pa, shadow: Gfn) -> Result<(), SptError> {
        let previous = self.flattened.write().unwrap().insert(entry, shadow);
        if previous.is_some() {
            return Err(SptError::invariant(
                "huge leaf was already flattened into a shadow node",
            ));
        }

        Ok(())
    }

    /// Returns the number of mirrored table nodes.
    pub fn len(&self) -> usize {
        self.nodes.read().unwrap().len()
    }

    /// Checks if no node is mirrored at all.
    pub fn is_empty(&self) -> bool {
        self.nodes.read().unwrap().is_empty()
    }

    /// Empties the index, returning all node associations.
    ///
    /// Whole-tree teardown only; the caller decides which shadow frames
    /// still need releasing.
    pub fn drain(&self) -> Vec<(Gfn, Gfn)> {
        self.flattened.write().unwrap().clear();
        self.nodes.write().unwrap().drain(..).collect()
    }
}

impl Default for BackRefIndex {
    fn default() -> Self {
        Self::new()
    }
}
