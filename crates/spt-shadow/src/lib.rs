//! Shadow page-table construction and mirroring.
//!
//! This crate maintains a shadow 4-level translation hierarchy that mirrors
//! a primary page-table tree, rewriting every physical-frame reference it
//! copies through an externally supplied frame-translation table. The
//! primary tree is never altered; the shadow tree is built once over the
//! shared kernel range and then kept consistent by mirroring every
//! primary-tree mutation as it happens.
//!
//! The moving parts, leaves first:
//!
//! - [`ShadowNodePool`]: page frames reserved up front for construction,
//!   handed out in FIFO order.
//! - [`BackRefIndex`]: a non-owning side table associating each primary
//!   intermediate node with its shadow counterpart.
//! - [`PresenceProber`]: best-effort residency enforcement, so the shadow
//!   tree never references a frame the hypervisor side has not seen.
//! - [`builder`]: the two-pass construction protocol: count the nodes the
//!   mirror will need, then re-walk and build, flattening huge middle
//!   leaves into full nodes of natural-page entries.
//! - [`MutationMirror`]: synchronized primitives replicating every standard
//!   primary-tree mutation into the shadow tree.
//! - [`ActivationGate`] and [`ShadowState::handle_exec`]: the name-matched,
//!   per-address-space activation transition.
//!
//! [`ShadowState`] ties the parts together with an explicit init-once /
//! teardown-once lifecycle and is passed by reference wherever it is
//! needed.

mod backref;
pub mod builder;
mod gate;
mod mirror;
mod pool;
mod prober;
mod space;
mod state;

#[cfg(test)]
mod fixtures;

pub use self::{
    backref::BackRefIndex,
    gate::{ActivationGate, TASK_NAME_MAX},
    mirror::MutationMirror,
    pool::ShadowNodePool,
    prober::PresenceProber,
    space::{AddressSpace, AddressSpaceId},
    state::ShadowState,
};
