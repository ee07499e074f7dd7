use std::sync::Arc;

use spt_core::GuestMemory;
use spt_shadow::ShadowState;

/// The read/write `task_name` attribute naming the process to instrument.
///
/// Reading yields the configured target name, newline-terminated. Writing
/// replaces it, constructing the global shadow root as a side effect if it
/// does not exist yet; a write during which construction fails consumes
/// zero bytes and leaves the previous name untouched.
pub struct TaskNameAttr {
    state: Arc<ShadowState>,
}

impl TaskNameAttr {
    pub(crate) fn new(state: Arc<ShadowState>) -> Self {
        Self { state }
    }

    /// Reads the configured target name, newline-terminated.
    pub fn show(&self) -> String {
        format!("{}\n", self.state.gate().target_name())
    }

    /// Replaces the target name, returning the number of bytes consumed.
    ///
    /// Zero signals that shadow-root construction failed; the previous name
    /// is left in place and the caller may retry later.
    pub fn store(&self, memory: &GuestMemory, value: &str) -> usize {
        if self.state.root().is_none() {
            if let Err(err) = self.state.build_root(memory) {
                tracing::warn!(?err, "shadow root construction failed, target name unchanged");
                return 0;
            }
        }

        self.state
            .gate()
            .set_target_name(value.trim_end_matches('\n'));
        value.len()
    }
}
