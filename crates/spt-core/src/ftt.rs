use std::sync::atomic::{AtomicU64, Ordering};

use crate::{Gfn, Hfn};

/// The externally maintained guest-frame to host-frame lookup array.
///
/// One 64-bit host frame number per guest frame index, with the length fixed
/// when the control device maps the translation window. The mirroring side
/// only ever reads the table; the hypervisor side fills it in through
/// [`set`]. A stored value of zero means the frame is unknown and must not
/// be treated as translated.
///
/// [`set`]: Self::set
pub struct FrameTranslationTable {
    slots: Box<[AtomicU64]>,
}

impl FrameTranslationTable {
    /// Creates a table covering the given number of guest frames.
    pub fn with_len(len: usize) -> Self {
        let slots = (0..len).map(|_| AtomicU64::new(0)).collect();
        Self { slots }
    }

    /// Returns the number of guest frames the table covers.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Checks if the table covers no frames at all.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Looks up the host frame backing the given guest frame.
    ///
    /// Returns `None` for frames outside the table and for frames the
    /// hypervisor side has not announced yet.
    pub fn lookup(&self, gfn: Gfn) -> Option<Hfn> {
        let raw = self.slots.get(gfn.0 as usize)?.load(Ordering::Relaxed);
        if raw == 0 {
            return None;
        }

        Some(Hfn(raw))
    }

    /// Checks if the given guest frame has a known translation.
    pub fn knows(&self, gfn: Gfn) -> bool {
        self.lookup(gfn).is_some()
    }

    /// Publishes a translation for the given guest frame.
    ///
    /// This is the hypervisor-side write path; frames outside the table are
    /// ignored.
    pub fn set(&self, gfn: Gfn, hfn: Hfn) {
        if let Some(slot) = self.slots.get(gfn.0 as usize) {
            slot.store(hfn.0, Ordering::Relaxed);
        }
    }
}
