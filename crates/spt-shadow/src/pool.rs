use spt_core::{Gfn, GuestMemory, SptError};

/// A pre-sized set of page frames backing the shadow tree.
///
/// The pool is filled once, before construction starts, with exactly the
/// number of frames the counting pass determined. Frames are handed out in
/// FIFO order so that counting and construction agree step by step; running
/// dry mid-construction means the two passes diverged and is unrecoverable.
#[derive(Debug)]
pub struct ShadowNodePool {
    frames: Vec<Gfn>,
    next: usize,
}

impl ShadowNodePool {
    /// Creates a pool that owns no frames.
    pub fn empty() -> Self {
        Self {
            frames: Vec::new(),
            next: 0,
        }
    }

    /// Reserves `count` zero-filled frames up front.
    ///
    /// If any single frame cannot be obtained, every frame obtained so far
    /// is released before the error is returned.
    pub fn reserve(memory: &GuestMemory, count: usize) -> Result<Self, SptError> {
        let mut frames = Vec::with_capacity(count);

        for _ in 0..count {
            match memory.alloc_frame() {
                Ok(gfn) => frames.push(gfn),
                Err(err) => {
                    tracing::warn!(reserved = frames.len(), count, "shadow pool reservation failed");
                    for &gfn in &frames {
                        memory.free_frame(gfn);
                    }
                    return Err(err);
                }
            }
        }

        Ok(Self { frames, next: 0 })
    }

    /// Hands out the next unused frame.
    ///
    /// Taking more frames than were reserved indicates that the counting
    /// and construction passes disagree, which corrupts the tree; it is
    /// reported as a fatal invariant violation.
    pub fn take(&mut self) -> Result<Gfn, SptError> {
        let Some(&gfn) = self.frames.get(self.next) else {
            return Err(SptError::invariant("shadow node pool exhausted"));
        };

        self.next += 1;
        Ok(gfn)
    }

    /// Returns the number of frames handed out so far.
    pub fn consumed(&self) -> usize {
        self.next
    }

    /// Returns the number of frames still available.
    pub fn remaining(&self) -> usize {
        self.frames.len() - self.next
    }

    /// Checks if the pool owns the given frame, consumed or not.
    pub fn contains(&self, gfn: Gfn) -> bool {
        self.frames.contains(&gfn)
    }

    /// Releases every owned frame, consumed or not.
    ///
    /// Called only when the whole shadow tree is torn down, never for a
    /// single process.
    pub fn release_all(&mut self, memory: &GuestMemory) {
        for &gfn in &self.frames {
            memory.free_frame(gfn);
        }

        self.frames.clear();
        self.next = 0;
    }
}
