//! End-to-end walkthrough: bring the control device up, target a process,
//! and watch its mutations get mirrored.

use spt::{
    AddressSpace, AddressSpaceId, ControlDevice, Gfn, GuestMemory, Hfn, MemTransport, MemoryZone,
    PageFlags, PageTableEntry, PageTableLevel, SptError, layout,
};

fn main() -> Result<(), SptError> {
    tracing_subscriber::fmt().init();

    // A small guest: one zone of table and data frames, plus an
    // allocatable region the shadow nodes come from.
    let mut memory = GuestMemory::new();
    memory.add_zone(MemoryZone::new(Gfn(0), 0x200));
    memory.add_allocatable(Gfn(0x200), 0x40);

    // The hypervisor side announces a host frame for every guest frame.
    let transport = MemTransport::new(0x240);
    for gfn in 0..0x240u64 {
        transport.translation().set(Gfn(gfn), Hfn(0x10_0000 + gfn));
    }

    // The primary kernel tree: one branch in the kernel half.
    let (top, upper, middle, leaf) = (Gfn(1), Gfn(0x10), Gfn(0x20), Gfn(0x30));
    for table in [top, upper, middle, leaf] {
        memory.install_table(table)?;
    }

    let flags = PageFlags::PRESENT | PageFlags::WRITE;
    memory.set_entry(
        layout::entry_pa(top, 300),
        PageTableEntry::from_frame(upper, flags),
    )?;
    memory.set_entry(
        layout::entry_pa(upper, 0),
        PageTableEntry::from_frame(middle, flags),
    )?;
    memory.set_entry(
        layout::entry_pa(middle, 0),
        PageTableEntry::from_frame(leaf, flags),
    )?;
    memory.set_entry(
        layout::entry_pa(leaf, 0),
        PageTableEntry::from_frame(Gfn(0x40), flags),
    )?;

    let kernel = AddressSpace::new(AddressSpaceId(0), top);
    let device = ControlDevice::attach(transport, kernel)?;
    let state = device.state().clone();

    // Realize the frame universe before any mirrored write.
    let resident = state.prober(&memory).probe_all();
    tracing::info!(resident, "presence sweep complete");

    // Target a process; the first store constructs the shadow root.
    let attr = device.task_name();
    attr.store(&memory, "proc-x\n");
    tracing::info!(root = ?state.root(), "shadow root ready");

    // A process by that name execs: its space activates and its private
    // shadow top node inherits the kernel-range slots.
    let user = AddressSpace::new(AddressSpaceId(1), Gfn(2));
    memory.install_table(Gfn(2))?;
    let activated = state.handle_exec(&memory, &user, "/usr/bin/proc-x")?;
    tracing::info!(activated, "exec observed");

    // Runtime mutations mirror synchronously in the caller's context.
    let mirror = state.mirror(&memory);
    let pa = layout::entry_pa(leaf, 1);
    mirror.set_entry(
        PageTableLevel::Pt,
        pa,
        PageTableEntry::from_frame(Gfn(0x41), flags | PageFlags::ACCESSED),
    )?;

    if let Some(shadow_pa) = state.backrefs().shadow_entry(pa) {
        tracing::info!(entry = ?memory.entry(shadow_pa)?, "mirrored leaf entry");
    }

    let accessed = mirror.test_and_clear_accessed(pa)?;
    tracing::info!(accessed, "accessed bit cleared on both copies");

    device.detach(&memory);
    Ok(())
}
