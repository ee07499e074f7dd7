use spt_core::{FrameTranslationTable, Gfn, GuestMemory, PageTableEntry};

/// Best-effort residency enforcement for frames entering the shadow tree.
///
/// The shadow tree must never reference a frame the hypervisor side has not
/// been told about, so every translated write is preceded by a presence
/// check: frames the translation table already knows are skipped, and
/// everything else gets a non-blocking data touch that forces lazily-backed
/// memory into residency. Some call sites run with preemption disabled, so
/// none of these operations block or sleep.
pub struct PresenceProber<'a> {
    memory: &'a GuestMemory,
    table: &'a FrameTranslationTable,
}

impl<'a> PresenceProber<'a> {
    /// Creates a prober over the given memory and translation table.
    pub fn new(memory: &'a GuestMemory, table: &'a FrameTranslationTable) -> Self {
        Self { memory, table }
    }

    /// Touches the given frame if it is a valid residency candidate.
    ///
    /// An invalid frame is left alone; this is not an error, since the
    /// caller may be probing a speculative region.
    pub fn ensure_resident(&self, gfn: Gfn) {
        if !self.memory.is_valid(gfn) {
            return;
        }

        self.memory.touch(gfn);
    }

    /// Presence check applied before writing a translated reference.
    ///
    /// Non-present sources need no target; frames the translation table
    /// already knows are necessarily realized on the hypervisor side.
    pub fn check_present(&self, source: PageTableEntry, target: Gfn) {
        if !source.present() {
            return;
        }

        if self.table.knows(target) {
            return;
        }

        self.ensure_resident(target);
    }

    /// Maintenance sweep touching every valid frame in every populated
    /// zone.
    ///
    /// Reserved frames that are not already resident are skipped. Returns
    /// the number of frames resident after the sweep; used at bring-up,
    /// before the shadow root exists, to realize the translation table's
    /// frame universe ahead of any mirrored write.
    pub fn probe_all(&self) -> u64 {
        let mut resident = 0;

        for zone in self.memory.zones() {
            for gfn in zone.iter() {
                if zone.reserved && !self.memory.is_resident(gfn) {
                    continue;
                }

                if self.memory.touch(gfn) {
                    resident += 1;
                }
            }
        }

        tracing::debug!(resident, "probed populated zones");
        resident
    }
}
