//! Shared I/O register file and interrupt signalling.
//!
//! The register file covers the low 256 bytes of the AVR data space, indexed
//! by data-space address:
//!
//! | Address Range | Content                                   |
//! |---------------|-------------------------------------------|
//! | 0x00–0x1F     | General registers (owned by the executor)  |
//! | 0x20–0x5F     | I/O registers                              |
//! | 0x60–0xFF     | Extended I/O registers                     |
//!
//! Every cell is an independent atomic byte. The executor thread and the
//! background peripheral threads (watchdog monitor, UART workers) touch the same
//! cells, so partial updates go through fetch-or / fetch-and / compare-exchange
//! instead of a lock: the executor must never block on peripheral activity.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

/// Number of addressable register cells.
pub const REGISTER_COUNT: usize = 256;

/// Byte-addressable I/O register space shared by all components.
pub struct RegisterFile {
    cells: [AtomicU8; REGISTER_COUNT],
}

impl RegisterFile {
    pub fn new() -> Self {
        RegisterFile { cells: std::array::from_fn(|_| AtomicU8::new(0)) }
    }

    #[inline(always)]
    pub fn read(&self, addr: u8) -> u8 {
        self.cells[addr as usize].load(Ordering::Acquire)
    }

    #[inline(always)]
    pub fn write(&self, addr: u8, value: u8) {
        self.cells[addr as usize].store(value, Ordering::Release);
    }

    /// Atomically OR `mask` into the cell. Returns the previous value.
    #[inline(always)]
    pub fn set_bits(&self, addr: u8, mask: u8) -> u8 {
        self.cells[addr as usize].fetch_or(mask, Ordering::AcqRel)
    }

    /// Atomically clear `mask` in the cell. Returns the previous value.
    #[inline(always)]
    pub fn clear_bits(&self, addr: u8, mask: u8) -> u8 {
        self.cells[addr as usize].fetch_and(!mask, Ordering::AcqRel)
    }

    /// Atomic read-modify-write. Returns the previous value.
    pub fn update(&self, addr: u8, mut f: impl FnMut(u8) -> u8) -> u8 {
        let cell = &self.cells[addr as usize];
        match cell.fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| Some(f(v))) {
            Ok(prev) | Err(prev) => prev,
        }
    }

    /// Zero every cell.
    pub fn clear(&self) {
        for cell in &self.cells {
            cell.store(0, Ordering::Release);
        }
    }

    /// Copy of the whole register space.
    pub fn snapshot(&self) -> Vec<u8> {
        self.cells.iter().map(|c| c.load(Ordering::Acquire)).collect()
    }

    /// Load register contents from a snapshot; missing bytes are zeroed.
    pub fn restore(&self, data: &[u8]) {
        for (i, cell) in self.cells.iter().enumerate() {
            cell.store(data.get(i).copied().unwrap_or(0), Ordering::Release);
        }
    }
}

impl Default for RegisterFile {
    fn default() -> Self {
        Self::new()
    }
}

/// Out-of-band reset requests, in the order the resolver checks them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResetRequest {
    /// The watchdog timed out with only WDE set.
    Watchdog = 1,
    /// External reset (operator request, e.g. Ctrl-C on the bench).
    External = 2,
    /// Power removed; the run ends after the brown-out reset.
    PowerOff = 3,
}

impl ResetRequest {
    fn from_bits(v: u8) -> Option<Self> {
        match v {
            1 => Some(ResetRequest::Watchdog),
            2 => Some(ResetRequest::External),
            3 => Some(ResetRequest::PowerOff),
            _ => None,
        }
    }
}

/// The interrupt line between peripherals and the executor.
///
/// `pending` is the single flag the executor polls. `halt` forces the executor
/// out of its run loop even with interrupts globally disabled, which is how a
/// reset request gets through a `cli; sleep` or a spin loop.
#[derive(Default)]
pub struct Signals {
    pending: AtomicBool,
    halt: AtomicBool,
    reset: AtomicU8,
    forcing: AtomicBool,
}

impl Signals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assert the interrupt line. Callers publish the triggering status flag
    /// first; the release store keeps it visible before the line.
    #[inline(always)]
    pub fn raise(&self) {
        self.pending.store(true, Ordering::Release);
    }

    #[inline(always)]
    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    /// Clear the line. Returns whether it was asserted.
    pub fn acknowledge(&self) -> bool {
        self.pending.swap(false, Ordering::AcqRel)
    }

    pub fn force_halt(&self) {
        self.halt.store(true, Ordering::Release);
    }

    /// Consume a pending halt request.
    pub fn take_halt(&self) -> bool {
        self.halt.swap(false, Ordering::AcqRel)
    }

    /// Record a reset cause and drag the executor out of whatever it is doing.
    pub fn request_reset(&self, request: ResetRequest) {
        self.reset.store(request as u8, Ordering::Release);
        self.raise();
        self.force_halt();
    }

    pub fn reset_request(&self) -> Option<ResetRequest> {
        ResetRequest::from_bits(self.reset.load(Ordering::Acquire))
    }

    pub fn clear_reset(&self) {
        self.reset.store(0, Ordering::Release);
    }

    /// Set while a background thread is busy-forcing the halt signal.
    pub fn set_forcing(&self, on: bool) {
        self.forcing.store(on, Ordering::Release);
    }

    pub fn is_forcing(&self) -> bool {
        self.forcing.load(Ordering::Acquire)
    }
}

/// Clonable handle for requesting resets from outside the executor thread.
#[derive(Clone)]
pub struct ResetLine {
    signals: Arc<Signals>,
}

impl ResetLine {
    pub fn new(signals: Arc<Signals>) -> Self {
        ResetLine { signals }
    }

    pub fn external_reset(&self) {
        self.signals.request_reset(ResetRequest::External);
    }

    pub fn power_off(&self) {
        self.signals.request_reset(ResetRequest::PowerOff);
    }
}
