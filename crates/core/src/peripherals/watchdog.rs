//! Watchdog timer.
//!
//! The watchdog runs on its own thread, like the 128 kHz oscillator it models.
//! Every monitor tick it compares the WDR marker against the one it saw last;
//! if software has not kicked the dog for longer than the period selected by
//! WDP3:0, the watchdog either raises its interrupt or forces a system reset.
//!
//! WDTCSR writes go through `WatchdogCtrl`, which enforces the timed change
//! sequence (WDCE + WDE, then the new value within four cycles).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, info};

use crate::memory::{RegisterFile, ResetRequest, Signals};
use crate::regs::{MCUSR, WDRF, WDTCSR};

pub const WDIF: u8 = 0x80;
pub const WDIE: u8 = 0x40;
pub const WDP3: u8 = 0x20;
pub const WDCE: u8 = 0x10;
pub const WDE: u8 = 0x08;
/// WDP3 and WDP2:0
pub const WDP_MASK: u8 = 0x27;

/// Default monitor tick.
pub const DEFAULT_TICK: Duration = Duration::from_millis(1);

/// Cycles after WDCE|WDE during which protected bits may change.
pub const CHANGE_WINDOW: u64 = 4;

/// Monitor ticks a watchdog period lasts for the given WDTCSR value.
///
/// WDP3:0 select a doubling period. The reserved selections (10..15) wrap
/// around instead of growing without bound.
pub fn threshold(wdtcsr: u8) -> u64 {
    let prescale = ((wdtcsr & WDP3) >> 2) | (wdtcsr & 0x07);
    2u64 << (prescale % 10)
}

/// What one monitor tick decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogEvent {
    None,
    Interrupt,
    Reset,
}

/// Watchdog counter state shared between the executor and the monitor.
#[derive(Default)]
pub struct Watchdog {
    /// Bumped by every WDR and every hard reset
    marker: AtomicU64,
    last_marker: AtomicU64,
    elapsed: AtomicU64,
}

impl Watchdog {
    pub fn new() -> Self {
        Self::default()
    }

    /// WDR instruction.
    pub fn kick(&self) {
        self.marker.fetch_add(1, Ordering::AcqRel);
    }

    pub fn marker(&self) -> u64 {
        self.marker.load(Ordering::Acquire)
    }

    pub fn elapsed_ticks(&self) -> u64 {
        self.elapsed.load(Ordering::Acquire)
    }

    /// One monitor wake-up.
    pub fn tick(&self, regs: &RegisterFile, signals: &Signals) -> WatchdogEvent {
        let marker = self.marker.load(Ordering::Acquire);
        if marker != self.last_marker.load(Ordering::Acquire) {
            self.elapsed.store(0, Ordering::Release);
            self.last_marker.store(marker, Ordering::Release);
            return WatchdogEvent::None;
        }

        let ctrl = regs.read(WDTCSR);
        if ctrl & (WDIE | WDE) == 0 {
            return WatchdogEvent::None;
        }
        let elapsed = self.elapsed.fetch_add(1, Ordering::AcqRel) + 1;
        if elapsed <= threshold(ctrl) {
            return WatchdogEvent::None;
        }
        self.elapsed.store(0, Ordering::Release);

        if ctrl & WDIE != 0 {
            // Interrupt-and-reset mode falls back to reset on the next timeout
            regs.update(WDTCSR, |v| if v & WDE != 0 { (v | WDIF) & !WDIE } else { v | WDIF });
            signals.raise();
            WatchdogEvent::Interrupt
        } else {
            signals.request_reset(ResetRequest::Watchdog);
            WatchdogEvent::Reset
        }
    }

    pub fn reset(&self) {
        self.kick();
    }

    pub fn save_state(&self) -> (u64, u64) {
        (self.marker(), self.elapsed_ticks())
    }

    pub fn load_state(&self, marker: u64, elapsed: u64) {
        self.marker.store(marker, Ordering::Release);
        self.last_marker.store(marker, Ordering::Release);
        self.elapsed.store(elapsed, Ordering::Release);
    }
}

/// Keep forcing the executor out of its loop until it has taken the reset.
///
/// There is no way to preempt the executor, so this spins on the halt signal.
/// It ends once the executor acknowledges the line, MCUSR shows the watchdog
/// reset, or the monitor is stopped.
pub fn force_reset(regs: &RegisterFile, signals: &Signals, stop: &AtomicBool) {
    signals.set_forcing(true);
    while signals.is_pending() && regs.read(MCUSR) & WDRF == 0 && !stop.load(Ordering::Acquire) {
        signals.force_halt();
        thread::yield_now();
    }
    signals.set_forcing(false);
}

/// The monitor thread. Stops and joins when dropped.
pub struct WatchdogThread {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl WatchdogThread {
    pub fn spawn(
        watchdog: Arc<Watchdog>,
        regs: Arc<RegisterFile>,
        signals: Arc<Signals>,
        tick: Duration,
    ) -> std::io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let handle = thread::Builder::new().name("watchdog".into()).spawn(move || {
            while !flag.load(Ordering::Acquire) {
                thread::sleep(tick);
                match watchdog.tick(&regs, &signals) {
                    WatchdogEvent::None => {}
                    WatchdogEvent::Interrupt => debug!("watchdog interrupt"),
                    WatchdogEvent::Reset => {
                        info!("watchdog reset");
                        force_reset(&regs, &signals, &flag);
                    }
                }
            }
        })?;
        Ok(WatchdogThread { stop, handle: Some(handle) })
    }
}

impl Drop for WatchdogThread {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// WDTCSR timed change protection.
#[derive(Debug, Default, Clone)]
pub struct WatchdogCtrl {
    last_wdce: Option<u64>,
}

impl WatchdogCtrl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.last_wdce = None;
    }

    pub fn window(&self) -> Option<u64> {
        self.last_wdce
    }

    pub fn set_window(&mut self, at: Option<u64>) {
        self.last_wdce = at;
    }

    /// Software write of WDTCSR at `cycle`.
    ///
    /// Outside the change window WDP3:0 are frozen and WDE can only be set.
    /// MCUSR.WDRF keeps the register locked. WDIF is write-one-to-clear and
    /// WDCE never reads back as set.
    pub fn write(&mut self, value: u8, cycle: u64, regs: &RegisterFile) {
        let opened = self.last_wdce.take();
        let in_window = opened.map_or(false, |t| cycle.saturating_sub(t) <= CHANGE_WINDOW);
        let unlocked = in_window && regs.read(MCUSR) & WDRF == 0;

        if value & (WDCE | WDE) == (WDCE | WDE) {
            self.last_wdce = Some(cycle);
        }

        regs.update(WDTCSR, |prev| {
            let mut next = if unlocked {
                value
            } else {
                (prev & (WDP_MASK | WDE)) | (value & !WDP_MASK)
            };
            next &= !(WDCE | WDIF);
            next | (prev & WDIF & !(value & WDIF))
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threshold_table() {
        assert_eq!(threshold(0), 2);
        assert_eq!(threshold(0x07), 256);
        assert_eq!(threshold(WDP3), 512);
        assert_eq!(threshold(WDP3 | 0x01), 1024);
        // Reserved selections wrap
        assert_eq!(threshold(WDP3 | 0x02), 2);
        assert_eq!(threshold(WDP3 | 0x07), 64);
        // Non-prescale bits do not matter
        assert_eq!(threshold(WDIE | WDE | 0x03), 16);
    }

    #[test]
    fn test_interrupt_fires_once_after_threshold() {
        let regs = RegisterFile::new();
        let signals = Signals::new();
        let wd = Watchdog::new();
        regs.write(WDTCSR, WDIE);
        let limit = threshold(WDIE);
        let mut fired = 0;
        for _ in 0..limit + 1 {
            if wd.tick(&regs, &signals) == WatchdogEvent::Interrupt {
                fired += 1;
            }
        }
        assert_eq!(fired, 1);
        assert_eq!(wd.elapsed_ticks(), 0);
        assert!(signals.is_pending());
        assert_eq!(regs.read(WDTCSR), WDIE | WDIF);
        assert_eq!(signals.reset_request(), None);
    }

    #[test]
    fn test_kick_restarts_count() {
        let regs = RegisterFile::new();
        let signals = Signals::new();
        let wd = Watchdog::new();
        regs.write(WDTCSR, WDIE);
        for _ in 0..threshold(WDIE) {
            wd.tick(&regs, &signals);
        }
        wd.kick();
        assert_eq!(wd.tick(&regs, &signals), WatchdogEvent::None);
        assert_eq!(wd.elapsed_ticks(), 0);
        for _ in 0..threshold(WDIE) {
            assert_eq!(wd.tick(&regs, &signals), WatchdogEvent::None);
        }
        assert_eq!(wd.tick(&regs, &signals), WatchdogEvent::Interrupt);
    }

    #[test]
    fn test_disabled_watchdog_never_counts() {
        let regs = RegisterFile::new();
        let signals = Signals::new();
        let wd = Watchdog::new();
        for _ in 0..100 {
            assert_eq!(wd.tick(&regs, &signals), WatchdogEvent::None);
        }
        assert_eq!(wd.elapsed_ticks(), 0);
    }

    #[test]
    fn test_interrupt_and_reset_mode() {
        let regs = RegisterFile::new();
        let signals = Signals::new();
        let wd = Watchdog::new();
        regs.write(WDTCSR, WDIE | WDE);
        let limit = threshold(0);
        for _ in 0..=limit {
            wd.tick(&regs, &signals);
        }
        // First timeout interrupts and disarms WDIE
        assert_eq!(regs.read(WDTCSR), WDE | WDIF);
        assert_eq!(signals.reset_request(), None);
        for _ in 0..limit {
            assert_eq!(wd.tick(&regs, &signals), WatchdogEvent::None);
        }
        assert_eq!(wd.tick(&regs, &signals), WatchdogEvent::Reset);
        assert_eq!(signals.reset_request(), Some(ResetRequest::Watchdog));
        assert!(signals.take_halt());
    }

    #[test]
    fn test_force_reset_ends_on_acknowledge() {
        let regs = Arc::new(RegisterFile::new());
        let signals = Arc::new(Signals::new());
        let stop = Arc::new(AtomicBool::new(false));
        signals.request_reset(ResetRequest::Watchdog);
        let handle = {
            let (regs, signals, stop) = (regs.clone(), signals.clone(), stop.clone());
            thread::spawn(move || force_reset(&regs, &signals, &stop))
        };
        while !signals.take_halt() {
            thread::yield_now();
        }
        signals.acknowledge();
        handle.join().unwrap();
        assert!(!signals.is_forcing());
    }

    #[test]
    fn test_change_protection() {
        let regs = RegisterFile::new();
        let mut ctrl = WatchdogCtrl::new();

        // Prescaler is frozen outside the window, WDE may be set
        ctrl.write(WDE | 0x07, 10, &regs);
        assert_eq!(regs.read(WDTCSR), WDE);
        // WDE cannot be cleared without the sequence
        ctrl.write(0, 12, &regs);
        assert_eq!(regs.read(WDTCSR), WDE);

        // Timed sequence
        ctrl.write(WDCE | WDE, 20, &regs);
        assert_eq!(regs.read(WDTCSR) & WDCE, 0);
        ctrl.write(WDP3 | 0x01, 24, &regs);
        assert_eq!(regs.read(WDTCSR), WDP3 | 0x01);

        // Window is single use and four cycles long
        ctrl.write(WDCE | WDE, 30, &regs);
        ctrl.write(0, 35, &regs);
        assert_eq!(regs.read(WDTCSR), WDP3 | 0x01 | WDE);
    }

    #[test]
    fn test_wdrf_locks_wde() {
        let regs = RegisterFile::new();
        let mut ctrl = WatchdogCtrl::new();
        regs.write(MCUSR, WDRF);
        regs.write(WDTCSR, WDE);
        ctrl.write(WDCE | WDE, 0, &regs);
        ctrl.write(0, 1, &regs);
        assert_eq!(regs.read(WDTCSR), WDE);
        regs.write(MCUSR, 0);
        ctrl.write(WDCE | WDE, 2, &regs);
        ctrl.write(0, 3, &regs);
        assert_eq!(regs.read(WDTCSR), 0);
    }

    #[test]
    fn test_wdif_write_one_to_clear() {
        let regs = RegisterFile::new();
        let mut ctrl = WatchdogCtrl::new();
        regs.write(WDTCSR, WDIF | WDIE);
        ctrl.write(WDIE, 0, &regs);
        assert_eq!(regs.read(WDTCSR), WDIF | WDIE);
        ctrl.write(WDIF | WDIE, 1, &regs);
        assert_eq!(regs.read(WDTCSR), WDIE);
    }
}
