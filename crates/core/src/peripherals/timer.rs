//! Timer/Counter 0, 1 and 2 in normal mode.
//!
//! The counter value is never stepped. It is reconstructed on demand from the
//! prescaler's scaled count plus a software offset, so a counter costs nothing
//! while nobody looks at it. Overflows are found by comparing the bits above
//! the counter width between two samples; the difference is owed to software
//! as a backlog of overflow interrupts.
//!
//! One `Timer` type serves all three counters; the register addresses, counter
//! width and vector come from `TimerAddrs`.

use serde::{Deserialize, Serialize};

use crate::memory::{RegisterFile, Signals};
use crate::peripherals::prescaler::{ClockSelect, Prescaler};

/// TOVn in TIFRn.
pub const TOV: u8 = 0x01;
/// TOIEn in TIMSKn.
pub const TOIE: u8 = 0x01;

/// Which counter a timer instance models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimerId {
    Timer0,
    Timer1,
    Timer2,
}

impl std::fmt::Display for TimerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let n = match self {
            TimerId::Timer0 => 0,
            TimerId::Timer1 => 1,
            TimerId::Timer2 => 2,
        };
        write!(f, "timer{}", n)
    }
}

/// Register layout of one counter.
#[derive(Debug, Clone)]
pub struct TimerAddrs {
    pub id: TimerId,
    /// TCNTn, or TCNTnL for the 16-bit counter
    pub tcnt: u8,
    /// TCNTnH, present on the 16-bit counter only
    pub tcnt_high: Option<u8>,
    pub tccr_b: u8,
    pub tifr: u8,
    pub timsk: u8,
    /// Counter width in bits
    pub bits: u32,
    /// Clocked from the asynchronous prescaler
    pub asynchronous: bool,
}

pub struct Timer {
    addrs: TimerAddrs,
    select: ClockSelect,
    offset: u64,
    backlog: u32,
    last_observed: u64,
    /// Shared high-byte latch of a 16-bit counter
    temp: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimerState {
    pub select: u8,
    pub offset: u64,
    pub backlog: u32,
    pub last_observed: u64,
    pub temp: u8,
}

impl Timer {
    pub fn new(addrs: TimerAddrs) -> Self {
        Timer { addrs, select: ClockSelect::STOPPED, offset: 0, backlog: 0, last_observed: 0, temp: 0 }
    }

    pub fn reset(&mut self) {
        *self = Timer::new(self.addrs.clone());
    }

    pub fn addrs(&self) -> &TimerAddrs {
        &self.addrs
    }

    pub fn id(&self) -> TimerId {
        self.addrs.id
    }

    pub fn select(&self) -> ClockSelect {
        self.select
    }

    pub fn backlog(&self) -> u32 {
        self.backlog
    }

    fn mask(&self) -> u64 {
        (1u64 << self.addrs.bits) - 1
    }

    /// Recompute the counter and collect overflows since the last sample.
    ///
    /// Returns the visible counter value. The visible register cell is kept
    /// in sync so dumps show what software would read.
    pub fn sample(&mut self, prescaler: &Prescaler, regs: &RegisterFile, signals: &Signals) -> u16 {
        let raw = prescaler.scaled_count(self.select);
        let now = raw.wrapping_add(self.offset);
        let bits = self.addrs.bits;
        let old_top = self.last_observed >> bits;
        let new_top = now >> bits;
        if new_top != old_top {
            regs.set_bits(self.addrs.tifr, TOV);
            if regs.read(self.addrs.timsk) & TOIE != 0 {
                let owed = u32::try_from(new_top.wrapping_sub(old_top)).unwrap_or(u32::MAX);
                self.backlog = self.backlog.saturating_add(owed);
                signals.raise();
            }
        }
        self.last_observed = now;
        let value = (now & self.mask()) as u16;
        regs.write(self.addrs.tcnt, value as u8);
        if let Some(high) = self.addrs.tcnt_high {
            regs.write(high, (value >> 8) as u8);
        }
        value
    }

    /// Make the counter read `value` from now on, without touching the
    /// prescaler phase. Callers sample first so pending overflows are kept.
    fn rebase(&mut self, prescaler: &Prescaler, value: u16) {
        let raw = prescaler.scaled_count(self.select);
        let value = value as u64 & self.mask();
        self.offset = value.wrapping_sub(raw & self.mask());
        self.last_observed = raw.wrapping_add(self.offset);
    }

    /// Software write of the whole counter.
    pub fn set_count(&mut self, value: u16, prescaler: &Prescaler, regs: &RegisterFile, signals: &Signals) {
        self.sample(prescaler, regs, signals);
        self.rebase(prescaler, value);
        regs.write(self.addrs.tcnt, value as u8);
        if let Some(high) = self.addrs.tcnt_high {
            regs.write(high, (value >> 8) as u8);
        }
    }

    /// TCCRnB write: the count so far accrues at the old rate, the count from
    /// here on at the new one.
    pub fn set_control(&mut self, tccr: u8, prescaler: &Prescaler, regs: &RegisterFile, signals: &Signals) {
        let value = self.sample(prescaler, regs, signals);
        self.select = ClockSelect::from_tccr(tccr);
        self.rebase(prescaler, value);
        regs.write(self.addrs.tccr_b, tccr);
    }

    /// Read of TCNTn / TCNTnL. The 16-bit counter latches its high byte.
    pub fn read_low(&mut self, prescaler: &Prescaler, regs: &RegisterFile, signals: &Signals) -> u8 {
        let value = self.sample(prescaler, regs, signals);
        if self.addrs.tcnt_high.is_some() {
            self.temp = (value >> 8) as u8;
        }
        value as u8
    }

    /// Read of TCNTnH returns the byte latched by the last low-byte read.
    pub fn read_high(&self) -> u8 {
        self.temp
    }

    /// Write of TCNTnH only fills the latch.
    pub fn write_high(&mut self, value: u8) {
        self.temp = value;
    }

    /// Write of TCNTn / TCNTnL commits the latched high byte along with it.
    pub fn write_low(&mut self, value: u8, prescaler: &Prescaler, regs: &RegisterFile, signals: &Signals) {
        let full = if self.addrs.tcnt_high.is_some() {
            (self.temp as u16) << 8 | value as u16
        } else {
            value as u16
        };
        self.set_count(full, prescaler, regs, signals);
    }

    /// TIFRn write: ones clear flags. Clearing TOV forgives the backlog.
    pub fn write_flags(&mut self, value: u8, regs: &RegisterFile) {
        let prev = regs.update(self.addrs.tifr, |v| v & !value);
        if prev & value & TOV != 0 {
            self.backlog = 0;
        }
    }

    /// TIMSKn write. Enabling the interrupt with TOV already pending owes one.
    pub fn write_mask(&mut self, value: u8, regs: &RegisterFile, signals: &Signals) {
        let prev = regs.read(self.addrs.timsk);
        regs.write(self.addrs.timsk, value);
        let enabled = value & !prev & TOIE != 0;
        if enabled && regs.read(self.addrs.tifr) & TOV != 0 && self.backlog == 0 {
            self.backlog = 1;
            signals.raise();
        }
    }

    /// Hand out one owed overflow interrupt, if enabled.
    ///
    /// Returns `Some(more)` when an overflow is dispatched; `more` tells the
    /// caller to keep the interrupt line asserted.
    pub fn take_overflow(&mut self, regs: &RegisterFile) -> Option<bool> {
        if self.backlog == 0 || regs.read(self.addrs.timsk) & TOIE == 0 {
            return None;
        }
        self.backlog -= 1;
        if self.backlog == 0 {
            regs.clear_bits(self.addrs.tifr, TOV);
        }
        Some(self.backlog > 0)
    }

    pub fn save_state(&self) -> TimerState {
        TimerState {
            select: self.select.bits(),
            offset: self.offset,
            backlog: self.backlog,
            last_observed: self.last_observed,
            temp: self.temp,
        }
    }

    pub fn load_state(&mut self, s: &TimerState) {
        self.select = ClockSelect::from_tccr(s.select);
        self.offset = s.offset;
        self.backlog = s.backlog;
        self.last_observed = s.last_observed;
        self.temp = s.temp;
    }
}
