//! Shadow page-table mirroring with frame translation.
//!
//! A shadow 4-level translation hierarchy mirrors a primary page-table
//! tree, rewriting every physical-frame reference through an externally
//! supplied frame-translation table, so a hypervisor-side component can
//! observe and redirect every physical memory reference a designated guest
//! process makes, without the guest's own tables ever being altered.
//!
//! The usual flow:
//!
//! 1. [`ControlDevice::attach`] maps the control device's register and
//!    translation windows and announces readiness.
//! 2. An operator writes a target process name to the [`TaskNameAttr`]
//!    attribute, which constructs the global shadow root on first use.
//! 3. The next process created under that name activates through
//!    [`ShadowState::handle_exec`]; its private shadow top node inherits
//!    the kernel-range slots of the global root.
//! 4. Every primary-tree mutation for that space flows through a
//!    [`MutationMirror`], which replicates it into the shadow tree with
//!    the physical target translated.

pub use spt_core::{
    FrameTranslationTable, Gfn, GuestMemory, Hfn, MemoryZone, Pa, PageFlags, PageTableEntry,
    PageTableLevel, SptError, Va, layout,
};
pub use spt_device::{
    ControlDevice, ControlTransport, MemTransport, REG_TRANSLATION_LEN, RegisterWindow,
    TaskNameAttr,
};
pub use spt_shadow::{
    ActivationGate, AddressSpace, AddressSpaceId, BackRefIndex, MutationMirror, PresenceProber,
    ShadowNodePool, ShadowState, TASK_NAME_MAX, builder,
};
