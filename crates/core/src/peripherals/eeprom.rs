//! EEPROM controller.
//!
//! The controller is driven entirely by EECR writes:
//!
//! 1. Software sets EEMPE. This opens a write window of four cycles.
//! 2. Software sets EEPE inside the window. The byte at EEAR is erased and/or
//!    programmed from EEDR according to EEPM1:0.
//! 3. EERE copies the byte at EEAR into EEDR.
//!
//! EEPE outside the window is ignored. Operations complete instantly apart
//! from a fixed cycle penalty. Storage survives resets; persisting it is the
//! job of an `EepromStore`.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::memory::{RegisterFile, Signals};
use crate::regs::{EEARH, EEARL, EECR, EEDR};

pub const EEPM1: u8 = 0x20;
pub const EEPM0: u8 = 0x10;
pub const EERIE: u8 = 0x08;
pub const EEMPE: u8 = 0x04;
pub const EEPE: u8 = 0x02;
pub const EERE: u8 = 0x01;
const STROBES: u8 = EEMPE | EEPE | EERE;

/// Cycles EEMPE stays armed.
pub const WRITE_WINDOW: u64 = 4;
/// Cycles charged for a programming operation.
pub const WRITE_PENALTY: u64 = 4;
/// Cycles charged for a read.
pub const READ_PENALTY: u64 = 2;

/// Persistent backing for EEPROM contents.
pub trait EepromStore: Send {
    fn commit(&mut self, data: &[u8]) -> Result<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EepromState {
    pub storage: Vec<u8>,
    pub armed_at: Option<u64>,
}

pub struct Eeprom {
    storage: Vec<u8>,
    armed_at: Option<u64>,
    dirty: bool,
}

impl Eeprom {
    /// Erased EEPROM of `size` bytes.
    pub fn new(size: usize) -> Self {
        Eeprom { storage: vec![0xFF; size], armed_at: None, dirty: false }
    }

    /// EEPROM preloaded from an image; bytes beyond `size` are dropped.
    pub fn with_contents(size: usize, image: &[u8]) -> Self {
        let mut e = Eeprom::new(size);
        let n = image.len().min(size);
        e.storage[..n].copy_from_slice(&image[..n]);
        e
    }

    pub fn reset(&mut self) {
        self.armed_at = None;
    }

    pub fn data(&self) -> &[u8] {
        &self.storage
    }

    pub fn size(&self) -> usize {
        self.storage.len()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    /// EEAR, wrapped to the capacity.
    pub fn address(&self, regs: &RegisterFile) -> usize {
        let ear = (regs.read(EEARH) as usize) << 8 | regs.read(EEARL) as usize;
        ear % self.storage.len()
    }

    fn window_open(&self, cycle: u64) -> bool {
        self.armed_at.map_or(false, |t| cycle.saturating_sub(t) <= WRITE_WINDOW)
    }

    /// EECR read. EEMPE reads back cleared once its window has passed.
    pub fn read_control(&mut self, cycle: u64, regs: &RegisterFile) -> u8 {
        if self.armed_at.is_some() && !self.window_open(cycle) {
            self.armed_at = None;
            regs.clear_bits(EECR, EEMPE);
        }
        regs.read(EECR)
    }

    /// EECR write at `*cycle`. Performed operations add their penalty to it.
    pub fn write_control(&mut self, value: u8, cycle: &mut u64, regs: &RegisterFile, signals: &Signals) {
        let now = *cycle;
        // EEPE only counts if EEMPE was armed by an earlier write
        let may_program = self.window_open(now);
        if !may_program {
            self.armed_at = None;
        }
        // Every write carrying EEMPE restarts the window
        if value & EEMPE != 0 {
            self.armed_at = Some(now);
        }

        let mut done = false;
        if value & EEPE != 0 && may_program {
            let addr = self.address(regs);
            let mut byte = self.storage[addr];
            if value & EEPM1 == 0 {
                byte = 0xFF;
            }
            if value & EEPM0 == 0 {
                byte &= regs.read(EEDR);
            }
            if byte != self.storage[addr] {
                self.storage[addr] = byte;
                self.dirty = true;
            }
            *cycle += WRITE_PENALTY;
            done = true;
        }
        if value & EERE != 0 {
            let addr = self.address(regs);
            regs.write(EEDR, self.storage[addr]);
            *cycle += READ_PENALTY;
            done = true;
        }

        let mut stored = value & !STROBES;
        if done {
            self.armed_at = None;
        } else if self.armed_at.is_some() {
            stored |= EEMPE;
        }
        regs.write(EECR, stored);

        if stored & EERIE != 0 {
            signals.raise();
        }
    }

    /// EE_READY condition: interrupt enabled and no write in progress.
    pub fn ready_interrupt(&self, regs: &RegisterFile) -> bool {
        regs.read(EECR) & (EERIE | EEPE) == EERIE
    }

    /// Hand the contents to the store if anything changed since the last commit.
    pub fn commit(&mut self, store: &mut dyn EepromStore) -> Result<bool> {
        if !self.dirty {
            return Ok(false);
        }
        store.commit(&self.storage)?;
        self.dirty = false;
        Ok(true)
    }

    pub fn save_state(&self) -> EepromState {
        EepromState { storage: self.storage.clone(), armed_at: self.armed_at }
    }

    pub fn load_state(&mut self, s: &EepromState) {
        let n = s.storage.len().min(self.storage.len());
        self.storage[..n].copy_from_slice(&s.storage[..n]);
        self.armed_at = s.armed_at;
        self.dirty = true;
    }
}
