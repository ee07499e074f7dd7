use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex, RwLock,
        atomic::{AtomicU64, Ordering},
    },
};

use indexmap::IndexMap;

use crate::{
    Gfn, Pa, PageFlags, PageTableEntry, SptError,
    layout::{self, ENTRIES_PER_TABLE},
};

/// A contiguous range of valid guest frames.
#[derive(Debug, Clone, Copy)]
pub struct MemoryZone {
    /// The first frame of the zone.
    pub start: Gfn,

    /// The number of frames in the zone.
    pub frames: u64,

    /// Reserved zones are skipped by residency sweeps unless a frame is
    /// already backed.
    pub reserved: bool,
}

impl MemoryZone {
    /// Creates a new ordinary memory zone.
    pub fn new(start: Gfn, frames: u64) -> Self {
        Self {
            start,
            frames,
            reserved: false,
        }
    }

    /// Creates a new reserved memory zone.
    pub fn reserved(start: Gfn, frames: u64) -> Self {
        Self {
            start,
            frames,
            reserved: true,
        }
    }

    /// Checks if the zone contains the given frame.
    pub fn contains(&self, gfn: Gfn) -> bool {
        gfn >= self.start && gfn.0 < self.start.0 + self.frames
    }

    /// Iterates over the frames of the zone in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = Gfn> + use<> {
        let start = self.start.0;
        (start..start + self.frames).map(Gfn)
    }
}

/// One backed guest frame, interpreted as an array of 64-bit entries.
struct Frame {
    words: Box<[AtomicU64]>,
}

impl Frame {
    fn zeroed() -> Self {
        let words = (0..ENTRIES_PER_TABLE).map(|_| AtomicU64::new(0)).collect();
        Self { words }
    }
}

/// The guest physical memory that both the primary and the shadow tree live
/// in.
///
/// Frames inside a [`MemoryZone`] are *valid*; they become *resident* when
/// first touched or explicitly installed, modeling lazily-backed physical
/// memory. Entry-level operations are atomic 64-bit accesses, so a mirrored
/// exchange observes the same ordering guarantees as the primary one.
pub struct GuestMemory {
    zones: Vec<MemoryZone>,
    frames: RwLock<IndexMap<Gfn, Arc<Frame>>>,
    free: Mutex<VecDeque<Gfn>>,
}

impl GuestMemory {
    /// Creates an empty guest memory with no zones.
    pub fn new() -> Self {
        Self {
            zones: Vec::new(),
            frames: RwLock::new(IndexMap::new()),
            free: Mutex::new(VecDeque::new()),
        }
    }

    /// Adds a zone of valid frames.
    pub fn add_zone(&mut self, zone: MemoryZone) {
        self.zones.push(zone);
    }

    /// Adds a zone of valid frames that may also be drawn from by
    /// [`alloc_frame`].
    ///
    /// The free list hands frames out in ascending order.
    ///
    /// [`alloc_frame`]: Self::alloc_frame
    pub fn add_allocatable(&mut self, start: Gfn, frames: u64) {
        let zone = MemoryZone::new(start, frames);
        self.zones.push(zone);

        self.free.lock().unwrap().extend(zone.iter());
    }

    /// Returns the configured memory zones.
    pub fn zones(&self) -> &[MemoryZone] {
        &self.zones
    }

    /// Checks if the given frame falls inside any zone.
    pub fn is_valid(&self, gfn: Gfn) -> bool {
        self.zones.iter().any(|zone| zone.contains(gfn))
    }

    /// Checks if the given frame is currently backed.
    pub fn is_resident(&self, gfn: Gfn) -> bool {
        self.frames.read().unwrap().contains_key(&gfn)
    }

    /// Performs a best-effort data touch of the given frame.
    ///
    /// An invalid frame is left alone. A valid frame in a reserved zone is
    /// only considered if it is already backed. Returns whether the frame is
    /// resident afterwards.
    pub fn touch(&self, gfn: Gfn) -> bool {
        let Some(zone) = self.zones.iter().find(|zone| zone.contains(gfn)) else {
            return false;
        };

        let mut frames = self.frames.write().unwrap();
        if frames.contains_key(&gfn) {
            return true;
        }

        if zone.reserved {
            return false;
        }

        frames.insert(gfn, Arc::new(Frame::zeroed()));
        true
    }

    /// Backs the given valid frame with a zeroed page.
    ///
    /// Used to lay out table nodes at fixed frame numbers; runtime
    /// allocations go through [`alloc_frame`] instead.
    ///
    /// [`alloc_frame`]: Self::alloc_frame
    pub fn install_table(&self, gfn: Gfn) -> Result<(), SptError> {
        if !self.is_valid(gfn) {
            return Err(SptError::FrameNotPresent(gfn));
        }

        self.frames
            .write()
            .unwrap()
            .entry(gfn)
            .or_insert_with(|| Arc::new(Frame::zeroed()));
        Ok(())
    }

    /// Allocates a zero-filled frame from the free list.
    pub fn alloc_frame(&self) -> Result<Gfn, SptError> {
        let gfn = {
            let mut free = self.free.lock().unwrap();
            free.pop_front()
                .ok_or(SptError::OutOfMemory("no allocatable frames left"))?
        };

        self.frames
            .write()
            .unwrap()
            .insert(gfn, Arc::new(Frame::zeroed()));

        tracing::trace!(%gfn, "allocated frame");
        Ok(gfn)
    }

    /// Releases a frame previously obtained from [`alloc_frame`].
    ///
    /// The backing is dropped and the frame returns to the free list.
    ///
    /// [`alloc_frame`]: Self::alloc_frame
    pub fn free_frame(&self, gfn: Gfn) {
        if self.frames.write().unwrap().shift_remove(&gfn).is_none() {
            tracing::warn!(%gfn, "freeing a frame that was not backed");
        }

        self.free.lock().unwrap().push_back(gfn);
        tracing::trace!(%gfn, "released frame");
    }

    /// Returns the number of frames available to [`alloc_frame`].
    ///
    /// [`alloc_frame`]: Self::alloc_frame
    pub fn free_frames(&self) -> usize {
        self.free.lock().unwrap().len()
    }

    fn frame(&self, gfn: Gfn) -> Result<Arc<Frame>, SptError> {
        self.frames
            .read()
            .unwrap()
            .get(&gfn)
            .cloned()
            .ok_or(SptError::FrameNotPresent(gfn))
    }

    fn word(&self, pa: Pa) -> Result<(Arc<Frame>, usize), SptError> {
        let frame = self.frame(layout::gfn_from_pa(pa))?;
        Ok((frame, layout::entry_index(pa)))
    }

    /// Reads the entry at the given physical address.
    pub fn entry(&self, pa: Pa) -> Result<PageTableEntry, SptError> {
        let (frame, index) = self.word(pa)?;
        Ok(PageTableEntry(frame.words[index].load(Ordering::Relaxed)))
    }

    /// Writes the entry at the given physical address.
    pub fn set_entry(&self, pa: Pa, entry: PageTableEntry) -> Result<(), SptError> {
        let (frame, index) = self.word(pa)?;
        frame.words[index].store(entry.0, Ordering::Relaxed);
        Ok(())
    }

    /// Atomically exchanges the entry at the given physical address.
    pub fn swap_entry(&self, pa: Pa, entry: PageTableEntry) -> Result<PageTableEntry, SptError> {
        let (frame, index) = self.word(pa)?;
        Ok(PageTableEntry(
            frame.words[index].swap(entry.0, Ordering::SeqCst),
        ))
    }

    /// Atomically reads the entry at the given physical address and zeroes
    /// it.
    pub fn take_entry(&self, pa: Pa) -> Result<PageTableEntry, SptError> {
        self.swap_entry(pa, PageTableEntry::empty())
    }

    /// Atomically clears the given flag bits on the entry at the given
    /// physical address.
    ///
    /// Returns whether any of the bits were previously set.
    pub fn clear_entry_flags(&self, pa: Pa, flags: PageFlags) -> Result<bool, SptError> {
        let (frame, index) = self.word(pa)?;
        let previous = frame.words[index].fetch_and(!flags.bits(), Ordering::SeqCst);
        Ok(previous & flags.bits() != 0)
    }
}

impl Default for GuestMemory {
    fn default() -> Self {
        Self::new()
    }
}
