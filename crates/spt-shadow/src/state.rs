use std::sync::{Arc, Mutex, RwLock};

use spt_core::{
    FrameTranslationTable, Gfn, GuestMemory, SptError,
    layout::{self, ENTRIES_PER_TABLE, KERNEL_SPLIT_INDEX},
};

use crate::{
    backref::BackRefIndex,
    builder::{self, ShadowBuilder},
    gate::ActivationGate,
    mirror::MutationMirror,
    pool::ShadowNodePool,
    prober::PresenceProber,
    space::AddressSpace,
};

/// Process-wide state of the shadow subsystem.
///
/// Constructed once by control-device bring-up and torn down once by its
/// shutdown; everything in between receives the state by reference. The
/// global shadow root follows an init-once lifecycle: [`build_root`]
/// constructs it over the kernel address space on first use and returns
/// the existing root afterwards.
///
/// [`build_root`]: Self::build_root
pub struct ShadowState {
    table: Arc<FrameTranslationTable>,
    kernel: AddressSpace,
    backrefs: BackRefIndex,
    pool: Mutex<ShadowNodePool>,
    root: RwLock<Option<Gfn>>,
    gate: ActivationGate,
}

impl ShadowState {
    /// Creates the shadow state over the given translation table and kernel
    /// address space.
    pub fn new(table: Arc<FrameTranslationTable>, kernel: AddressSpace) -> Self {
        Self {
            table,
            kernel,
            backrefs: BackRefIndex::new(),
            pool: Mutex::new(ShadowNodePool::empty()),
            root: RwLock::new(None),
            gate: ActivationGate::new(),
        }
    }

    /// Returns the frame-translation table.
    pub fn table(&self) -> &FrameTranslationTable {
        &self.table
    }

    /// Returns the always-shared kernel address space.
    pub fn kernel(&self) -> &AddressSpace {
        &self.kernel
    }

    /// Checks if the given space is the kernel address space.
    pub fn is_kernel(&self, space: &AddressSpace) -> bool {
        space.id() == self.kernel.id()
    }

    /// Returns the back-reference index.
    pub fn backrefs(&self) -> &BackRefIndex {
        &self.backrefs
    }

    /// Returns the activation gate.
    pub fn gate(&self) -> &ActivationGate {
        &self.gate
    }

    /// Returns the global shadow root, if it has been constructed.
    pub fn root(&self) -> Option<Gfn> {
        *self.root.read().unwrap()
    }

    /// Creates a mutation mirror over this state and the given memory.
    pub fn mirror<'a>(&'a self, memory: &'a GuestMemory) -> MutationMirror<'a> {
        MutationMirror::new(self, memory)
    }

    /// Creates a presence prober over this state and the given memory.
    pub fn prober<'a>(&'a self, memory: &'a GuestMemory) -> PresenceProber<'a> {
        PresenceProber::new(memory, &self.table)
    }

    /// Builds the global shadow root, or returns the existing one.
    ///
    /// Sizes the pool with a counting pass over the kernel tree, reserves
    /// it all-or-nothing, and runs the construction pass, holding the
    /// kernel address space in shared mode throughout. An allocation
    /// failure unwinds cleanly and may be retried.
    pub fn build_root(&self, memory: &GuestMemory) -> Result<Gfn, SptError> {
        let mut root = self.root.write().unwrap();
        if let Some(root) = *root {
            return Ok(root);
        }

        let _guard = self.kernel.lock_shared();

        let counts = builder::count_tables(memory, self.kernel.top())?;
        let required = counts.required_nodes();
        tracing::debug!(?counts, required, "sizing the shadow node pool");

        let mut pool = ShadowNodePool::reserve(memory, required)?;
        let shadow_top = ShadowBuilder::new(memory, &self.table, &self.backrefs, &mut pool)
            .construct(self.kernel.top())?;

        *self.pool.lock().unwrap() = pool;
        *root = Some(shadow_top);

        tracing::info!(%shadow_top, nodes = required, "constructed the global shadow root");
        Ok(shadow_top)
    }

    /// Tears down the shadow root and releases every shadow node.
    ///
    /// Pool-owned nodes go back through the pool; lazily mirrored nodes are
    /// released individually. Called once, by control-device shutdown.
    pub fn teardown(&self, memory: &GuestMemory) {
        let mut root = self.root.write().unwrap();
        let mut pool = self.pool.lock().unwrap();

        for (primary, shadow) in self.backrefs.drain() {
            if !pool.contains(shadow) {
                tracing::trace!(%primary, %shadow, "releasing lazily mirrored node");
                memory.free_frame(shadow);
            }
        }

        pool.release_all(memory);
        *root = None;

        tracing::info!("released the shadow root");
    }

    /// Activation transition, fired when a new process image is about to
    /// begin executing.
    ///
    /// The executable's base name must match the configured target name
    /// exactly, and the space must not be the kernel one. On transition the
    /// activation bit is set and the kernel-range slots of the global
    /// shadow root are copied into the space's private shadow top node,
    /// building the root on demand first if needed. A construction failure
    /// leaves the space inactive.
    ///
    /// Returns whether the space was activated.
    pub fn handle_exec(
        &self,
        memory: &GuestMemory,
        space: &AddressSpace,
        image_path: &str,
    ) -> Result<bool, SptError> {
        if self.is_kernel(space) {
            return Ok(false);
        }

        let name = basename(image_path);
        if !self.gate.matches(name) {
            return Ok(false);
        }

        let root = self.build_root(memory)?;

        let shadow_top = match self.backrefs.get(space.top()) {
            Some(shadow) => shadow,
            None => {
                let shadow = memory.alloc_frame()?;
                self.backrefs.insert(space.top(), shadow)?;
                shadow
            }
        };

        self.gate.activate(space.id());

        // Kernel-range translations are shared: the upper slots of the
        // global root seed the private shadow top node; the user half
        // stays empty and fills in lazily through the mirror.
        for index in KERNEL_SPLIT_INDEX..ENTRIES_PER_TABLE {
            let entry = memory.entry(layout::entry_pa(root, index))?;
            memory.set_entry(layout::entry_pa(shadow_top, index), entry)?;
        }

        tracing::info!(space = %space.id(), name, "activated address space");
        Ok(true)
    }
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}
