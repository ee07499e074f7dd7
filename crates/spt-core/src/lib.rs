//! Core types for shadow page-table mirroring.
//!
//! This crate defines the vocabulary shared by the shadow subsystem and the
//! control device: typed frame numbers and addresses, the paging structures
//! of the mirrored 4-level hierarchy, the guest physical-memory model both
//! trees live in, and the frame-translation table supplied from the
//! hypervisor side.

mod core;
mod error;
mod ftt;
pub mod layout;
mod memory;
mod paging;

pub use self::{
    core::{Gfn, Hfn, Pa, Va},
    error::SptError,
    ftt::FrameTranslationTable,
    memory::{GuestMemory, MemoryZone},
    paging::{PageFlags, PageTableEntry, PageTableLevel},
};
