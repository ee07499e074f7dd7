use std::sync::RwLock;

use indexmap::IndexSet;

use crate::space::AddressSpaceId;

/// Maximum stored length of the target process name, in characters.
pub const TASK_NAME_MAX: usize = 15;

/// The per-process activation gate.
///
/// Holds the configured target process name and the set of activated
/// address spaces. Activation is monotonic: once a space is activated it
/// stays activated for its lifetime; there is no API to revert the bit.
pub struct ActivationGate {
    target: RwLock<String>,
    active: RwLock<IndexSet<AddressSpaceId>>,
}

impl ActivationGate {
    pub(crate) fn new() -> Self {
        Self {
            target: RwLock::new(String::new()),
            active: RwLock::new(IndexSet::new()),
        }
    }

    /// Returns the currently configured target process name.
    pub fn target_name(&self) -> String {
        self.target.read().unwrap().clone()
    }

    /// Replaces the target process name.
    ///
    /// Names longer than [`TASK_NAME_MAX`] characters are truncated, the
    /// way the primary system truncates process names.
    pub fn set_target_name(&self, name: &str) {
        let name: String = name.chars().take(TASK_NAME_MAX).collect();
        *self.target.write().unwrap() = name;
    }

    /// Checks whether the given process name selects the configured target.
    ///
    /// Both names must be non-empty and match exactly, case included.
    pub fn matches(&self, name: &str) -> bool {
        let target = self.target.read().unwrap();
        !target.is_empty() && !name.is_empty() && *target == name
    }

    /// Checks if the given address space has been activated.
    pub fn is_active(&self, id: AddressSpaceId) -> bool {
        self.active.read().unwrap().contains(&id)
    }

    pub(crate) fn activate(&self, id: AddressSpaceId) {
        self.active.write().unwrap().insert(id);
    }

    /// Returns the number of activated address spaces.
    pub fn active_spaces(&self) -> usize {
        self.active.read().unwrap().len()
    }
}
