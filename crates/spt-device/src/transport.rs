use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU32, Ordering},
};

use spt_core::{FrameTranslationTable, SptError};

/// Byte offset of the translation-window length register.
///
/// The register holds the window length in 32-bit units; one translation
/// entry is two units.
pub const REG_TRANSLATION_LEN: usize = 16;

/// A mapped view of the control device's register window.
#[derive(Clone)]
pub struct RegisterWindow {
    words: Arc<[AtomicU32]>,
}

impl RegisterWindow {
    /// Creates a zeroed register window of the given size, in 32-bit words.
    pub fn with_len(words: usize) -> Self {
        Self {
            words: (0..words).map(|_| AtomicU32::new(0)).collect(),
        }
    }

    /// Reads the register at the given byte offset.
    ///
    /// Reads outside the window return zero, like reads from an unmapped
    /// region.
    pub fn read_u32(&self, offset: usize) -> u32 {
        self.words
            .get(offset / 4)
            .map(|word| word.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Writes the register at the given byte offset.
    pub fn write_u32(&self, offset: usize, value: u32) {
        if let Some(word) = self.words.get(offset / 4) {
            word.store(value, Ordering::Relaxed);
        }
    }
}

/// Access to the control device's two communication regions.
///
/// Implementations map the register window and the translation-table window
/// and deliver the one-shot readiness notification to the hypervisor side.
pub trait ControlTransport {
    /// Maps the register window.
    fn map_registers(&self) -> Result<RegisterWindow, SptError>;

    /// Maps the translation-table window covering the given number of
    /// frames.
    fn map_translation(&self, entries: usize) -> Result<Arc<FrameTranslationTable>, SptError>;

    /// Issues the one-shot readiness notification.
    fn notify_ready(&self) -> Result<(), SptError>;
}

/// An in-process transport backed by plain memory.
///
/// The hypervisor side of the channel keeps its own handle to the
/// translation window through [`translation`] and observes the readiness
/// notification through [`was_notified`].
///
/// [`translation`]: Self::translation
/// [`was_notified`]: Self::was_notified
#[derive(Clone)]
pub struct MemTransport {
    registers: RegisterWindow,
    translation: Arc<FrameTranslationTable>,
    notified: Arc<AtomicBool>,
}

impl MemTransport {
    /// Creates a transport whose translation window covers `entries` guest
    /// frames.
    pub fn new(entries: usize) -> Self {
        let registers = RegisterWindow::with_len(8);
        registers.write_u32(REG_TRANSLATION_LEN, (entries * 2) as u32);

        Self {
            registers,
            translation: Arc::new(FrameTranslationTable::with_len(entries)),
            notified: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Returns the hypervisor-side handle to the translation window.
    pub fn translation(&self) -> &Arc<FrameTranslationTable> {
        &self.translation
    }

    /// Checks if the readiness notification has been delivered.
    pub fn was_notified(&self) -> bool {
        self.notified.load(Ordering::Relaxed)
    }
}

impl ControlTransport for MemTransport {
    fn map_registers(&self) -> Result<RegisterWindow, SptError> {
        Ok(self.registers.clone())
    }

    fn map_translation(&self, entries: usize) -> Result<Arc<FrameTranslationTable>, SptError> {
        if entries > self.translation.len() {
            return Err(SptError::Device("translation window too small"));
        }

        Ok(self.translation.clone())
    }

    fn notify_ready(&self) -> Result<(), SptError> {
        if self.notified.swap(true, Ordering::Relaxed) {
            return Err(SptError::Device("readiness notification already delivered"));
        }

        Ok(())
    }
}
