use crate::Gfn;

/// An error that can occur while building or mirroring the shadow tree.
#[derive(thiserror::Error, Debug)]
pub enum SptError {
    /// A frame allocation could not be satisfied.
    ///
    /// Partial allocations have already been unwound when this is returned;
    /// the caller may retry once memory becomes available.
    #[error("out of memory: {0}")]
    OutOfMemory(&'static str),

    /// A physical frame the operation needs is not backed.
    #[error("frame not present: {0}")]
    FrameNotPresent(Gfn),

    /// The shadow and primary trees have diverged.
    ///
    /// There is no safe local continuation; the caller must halt the
    /// affected subsystem instead of skipping the shadow-side effect.
    #[error("shadow invariant violated: {0}")]
    InvariantViolated(&'static str),

    /// The control device rejected or failed an operation.
    #[error("control device: {0}")]
    Device(&'static str),
}

impl SptError {
    /// Creates a new invariant-violation error.
    pub fn invariant(message: &'static str) -> Self {
        Self::InvariantViolated(message)
    }

    /// Checks whether the error admits no local recovery.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::InvariantViolated(_))
    }
}
