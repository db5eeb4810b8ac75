//! Emulator configuration.

use std::time::Duration;

use crate::error::{Error, Result};
use crate::peripherals::watchdog::DEFAULT_TICK;
use crate::peripherals::{ClockSource, TapTable, UartMode, ASYNC_TAPS, SYNC_TAPS};
use crate::regs::EEPROM_SIZE;

/// Largest EEPROM the 16-bit EEAR can address.
pub const MAX_EEPROM_SIZE: usize = 1 << 16;
/// Largest buffered UART ring.
pub const MAX_UART_CAPACITY: usize = 1 << 16;

#[derive(Debug, Clone)]
pub struct Config {
    pub uart: UartMode,
    /// Clock feeding the synchronous prescaler
    pub timer_clock: ClockSource,
    pub sync_taps: TapTable,
    pub async_taps: TapTable,
    pub eeprom_size: usize,
    /// Run the watchdog monitor thread
    pub watchdog: bool,
    pub watchdog_tick: Duration,
    /// On a halted core, wait for an external reset instead of exiting
    pub hold_on_halt: bool,
    /// Commit dirty EEPROM contents at this interval while running
    pub autocommit: Option<Duration>,
    /// Instructions single-stepped after a breakpoint, `None` until the program ends
    pub trace_steps: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            uart: UartMode::PassThrough,
            timer_clock: ClockSource::Cycles,
            sync_taps: SYNC_TAPS,
            async_taps: ASYNC_TAPS,
            eeprom_size: EEPROM_SIZE,
            watchdog: true,
            watchdog_tick: DEFAULT_TICK,
            hold_on_halt: false,
            autocommit: None,
            trace_steps: None,
        }
    }
}

impl Config {
    /// Reject settings no component could run with.
    pub fn validate(&self) -> Result<()> {
        if let UartMode::Buffered { capacity, poll } = self.uart {
            if capacity == 0 || capacity > MAX_UART_CAPACITY {
                return Err(Error::config(format!("uart capacity {} not in 1..={}", capacity, MAX_UART_CAPACITY)));
            }
            if poll.is_zero() {
                return Err(Error::config("uart poll interval must be non-zero"));
            }
        }
        if let ClockSource::Oscillator { hz: 0 } = self.timer_clock {
            return Err(Error::config("timer oscillator frequency must be non-zero"));
        }
        self.sync_taps.validate().map_err(Error::Config)?;
        self.async_taps.validate().map_err(Error::Config)?;
        if self.eeprom_size == 0 || self.eeprom_size > MAX_EEPROM_SIZE {
            return Err(Error::config(format!("eeprom size {} not in 1..={}", self.eeprom_size, MAX_EEPROM_SIZE)));
        }
        if self.watchdog && self.watchdog_tick.is_zero() {
            return Err(Error::config("watchdog tick must be non-zero"));
        }
        if self.autocommit.map_or(false, |d| d.is_zero()) {
            return Err(Error::config("autocommit interval must be non-zero"));
        }
        Ok(())
    }
}
