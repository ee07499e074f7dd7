use std::sync::{RwLock, RwLockReadGuard};

use spt_core::Gfn;

/// Identifier of a guest address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AddressSpaceId(pub u64);

impl std::fmt::Display for AddressSpaceId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A guest address space: one top-level table node plus the structural lock
/// guarding its tree.
pub struct AddressSpace {
    id: AddressSpaceId,
    top: Gfn,
    lock: RwLock<()>,
}

impl AddressSpace {
    /// Creates a new address space rooted at the given top-level node.
    pub fn new(id: AddressSpaceId, top: Gfn) -> Self {
        Self {
            id,
            top,
            lock: RwLock::new(()),
        }
    }

    /// Returns the identifier of the address space.
    pub fn id(&self) -> AddressSpaceId {
        self.id
    }

    /// Returns the top-level table node of the address space.
    pub fn top(&self) -> Gfn {
        self.top
    }

    /// Holds the tree structure in shared mode.
    ///
    /// Structure walks take this for their whole duration; concurrent
    /// lookups remain possible while structural mutation of the walked
    /// range is excluded.
    pub fn lock_shared(&self) -> RwLockReadGuard<'_, ()> {
        self.lock.read().unwrap()
    }
}
