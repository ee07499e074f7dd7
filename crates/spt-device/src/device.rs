use std::sync::Arc;

use spt_core::{GuestMemory, SptError};
use spt_shadow::{AddressSpace, ShadowState};

use crate::{
    attr::TaskNameAttr,
    transport::{ControlTransport, REG_TRANSLATION_LEN},
};

/// The guest-side control device.
///
/// Attach performs the bring-up sequence: map the register window, read the
/// translation-window length, map the translation window sized accordingly,
/// create the shadow state, and deliver the readiness notification. Detach
/// reverses the mappings (by dropping the transport) and releases the
/// shadow root if one was built.
pub struct ControlDevice<T>
where
    T: ControlTransport,
{
    // Held so the mappings live exactly as long as the device.
    #[expect(dead_code)]
    transport: T,
    state: Arc<ShadowState>,
}

impl<T> ControlDevice<T>
where
    T: ControlTransport,
{
    /// Attaches the control device and brings the shadow state up.
    ///
    /// Fails with a device error when the translation-length register reads
    /// zero, without leaving any mapping behind.
    pub fn attach(transport: T, kernel: AddressSpace) -> Result<Self, SptError> {
        let registers = transport.map_registers()?;

        let words = registers.read_u32(REG_TRANSLATION_LEN);
        if words == 0 {
            return Err(SptError::Device("translation window length is zero"));
        }

        let entries = words as usize / 2;
        let table = transport.map_translation(entries)?;
        let state = Arc::new(ShadowState::new(table, kernel));

        transport.notify_ready()?;
        tracing::info!(entries, "control device attached");

        Ok(Self { transport, state })
    }

    /// Returns the shadow state owned by the device.
    pub fn state(&self) -> &Arc<ShadowState> {
        &self.state
    }

    /// Returns the `task_name` attribute surface.
    pub fn task_name(&self) -> TaskNameAttr {
        TaskNameAttr::new(self.state.clone())
    }

    /// Detaches the device, tearing down the shadow root if one exists.
    pub fn detach(self, memory: &GuestMemory) {
        if self.state.root().is_some() {
            self.state.teardown(memory);
        }

        tracing::info!("control device detached");
    }
}

impl<T> std::fmt::Debug for ControlDevice<T>
where
    T: ControlTransport,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlDevice").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use spt_core::{Gfn, Hfn, MemoryZone, PageFlags, PageTableEntry, layout};
    use spt_shadow::AddressSpaceId;

    use super::*;
    use crate::transport::MemTransport;

    const KERNEL_TOP: Gfn = Gfn(1);

    fn kernel_space() -> AddressSpace {
        AddressSpace::new(AddressSpaceId(0), KERNEL_TOP)
    }

    /// A minimal world: one kernel branch and a fully announced
    /// translation window.
    fn world(transport: &MemTransport) -> GuestMemory {
        let mut memory = GuestMemory::new();
        memory.add_zone(MemoryZone::new(Gfn(0), 0x100));
        memory.add_allocatable(Gfn(0x100), 0x20);

        for (table, index, child) in [(KERNEL_TOP, 3, Gfn(0x10)), (Gfn(0x10), 0, Gfn(0x20))] {
            memory.install_table(table).unwrap();
            memory
                .set_entry(
                    layout::entry_pa(table, index),
                    PageTableEntry::from_frame(child, PageFlags::PRESENT | PageFlags::WRITE),
                )
                .unwrap();
        }
        memory.install_table(Gfn(0x20)).unwrap();

        for gfn in 0..transport.translation().len() as u64 {
            transport.translation().set(Gfn(gfn), Hfn(0x9000 + gfn));
        }

        memory
    }

    #[test]
    fn attach_sizes_the_translation_window() -> Result<(), SptError> {
        let transport = MemTransport::new(0x200);

        let device = ControlDevice::attach(transport.clone(), kernel_space())?;
        assert_eq!(device.state().table().len(), 0x200);
        assert!(transport.was_notified());

        Ok(())
    }

    #[test]
    fn attach_rejects_a_zero_length_window() {
        let transport = MemTransport::new(0);

        let err = ControlDevice::attach(transport, kernel_space()).unwrap_err();
        assert!(matches!(err, SptError::Device(_)));
    }

    #[test]
    fn the_readiness_notification_is_one_shot() -> Result<(), SptError> {
        let transport = MemTransport::new(0x200);

        let _device = ControlDevice::attach(transport.clone(), kernel_space())?;
        let err = ControlDevice::attach(transport, kernel_space()).unwrap_err();
        assert!(matches!(err, SptError::Device(_)));

        Ok(())
    }

    #[test]
    fn detach_releases_the_shadow_root() -> Result<(), SptError> {
        let transport = MemTransport::new(0x200);
        let memory = world(&transport);

        let device = ControlDevice::attach(transport, kernel_space())?;
        let state = device.state().clone();

        let free_before = memory.free_frames();
        state.build_root(&memory)?;
        assert!(state.root().is_some());

        device.detach(&memory);
        assert!(state.root().is_none());
        assert_eq!(memory.free_frames(), free_before);

        Ok(())
    }
}
