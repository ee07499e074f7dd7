//! Control-device bring-up for shadow page-table mirroring.
//!
//! The control device is the guest-side end of the hypervisor channel: two
//! mapped communication regions (a register window and a translation-table
//! window), a single read/write `task_name` attribute naming the process to
//! instrument, and a one-shot readiness notification issued once bring-up
//! completes. Attach wires everything into a fresh [`ShadowState`]; detach
//! reverses the mappings and tears the shadow root down.
//!
//! [`ShadowState`]: spt_shadow::ShadowState

mod attr;
mod device;
mod transport;

pub use self::{
    attr::TaskNameAttr,
    device::ControlDevice,
    transport::{ControlTransport, MemTransport, REG_TRANSLATION_LEN, RegisterWindow},
};
