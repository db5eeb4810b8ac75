//! Timer prescalers and their clock domains.
//!
//! A prescaler turns a monotonically increasing clock into the scaled count a
//! timer sees. The ATmega2560 has two: a synchronous one shared by
//! Timer/Counter0 and Timer/Counter1, and an asynchronous one for
//! Timer/Counter2 which can run from a 32.768 kHz crystal (ASSR.AS2).
//!
//! The clock-select field (CSn2:0) picks a tap of the prescaler. Tap widths are
//! powers of two; select 0 stops the counter.

use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Frequency of the asynchronous timer crystal.
pub const ASYNC_CRYSTAL_HZ: u64 = 32_768;

/// Tap widths (log2 of the division) for the synchronous prescaler, select 1..=7.
///
/// Selects 6 and 7 are external clock inputs on real silicon; they are
/// modelled as very slow taps so the counter still moves.
pub const SYNC_TAPS: TapTable = TapTable([0, 3, 6, 8, 10, 16, 20]);
/// Tap widths for the asynchronous prescaler of Timer/Counter2.
pub const ASYNC_TAPS: TapTable = TapTable([0, 3, 5, 6, 7, 8, 10]);

/// Largest tap width a table may contain.
pub const MAX_TAP_WIDTH: u32 = 40;

/// The 3-bit clock-select field of a TCCRnB register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockSelect(u8);

impl ClockSelect {
    pub const STOPPED: ClockSelect = ClockSelect(0);

    /// Extract the select bits from a TCCRnB value.
    pub fn from_tccr(tccr: u8) -> Self {
        ClockSelect(tccr & 7)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn is_stopped(self) -> bool {
        self.0 == 0
    }
}

/// Tap widths for select values 1..=7.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TapTable(pub [u32; 7]);

impl TapTable {
    /// Width for a select value, `None` when the counter is stopped.
    pub fn width(&self, select: ClockSelect) -> Option<u32> {
        match select.bits() {
            0 => None,
            s => Some(self.0[s as usize - 1]),
        }
    }

    /// Widths must be bounded and non-decreasing.
    pub fn validate(&self) -> Result<(), String> {
        for pair in self.0.windows(2) {
            if pair[1] < pair[0] {
                return Err(format!("tap widths must not decrease: {:?}", self.0));
            }
        }
        if let Some(w) = self.0.iter().find(|&&w| w > MAX_TAP_WIDTH) {
            return Err(format!("tap width {} exceeds {}", w, MAX_TAP_WIDTH));
        }
        Ok(())
    }
}

/// Where a prescaler takes its time from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClockSource {
    /// The executor's cycle counter.
    Cycles,
    /// A free-running oscillator derived from the host's monotonic clock.
    Oscillator { hz: u64 },
}

impl ClockSource {
    /// Current time in this source's units.
    pub fn now(&self, cycle: u64, epoch: Instant) -> u64 {
        match *self {
            ClockSource::Cycles => cycle,
            ClockSource::Oscillator { hz } => {
                let nanos = epoch.elapsed().as_nanos();
                (nanos * hz as u128 / 1_000_000_000) as u64
            }
        }
    }
}

/// Divide elapsed ticks by a tap of width `width`.
pub fn scaled_count(ticks: u64, width: u32) -> u64 {
    ticks >> width
}

/// Free-running prescaler state.
///
/// `counted` only moves forward with the clock. A prescaler reset does not
/// zero it; it records the reset point so every tap restarts its phase there.
#[derive(Debug, Clone)]
pub struct Prescaler {
    taps: TapTable,
    counted: u64,
    last_reset: u64,
    prev_clock: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PrescalerState {
    pub counted: u64,
    pub last_reset: u64,
}

impl Prescaler {
    pub fn new(taps: TapTable, now: u64) -> Self {
        Prescaler { taps, counted: 0, last_reset: 0, prev_clock: now }
    }

    pub fn reset(&mut self, now: u64) {
        *self = Prescaler::new(self.taps, now);
    }

    pub fn taps(&self) -> TapTable {
        self.taps
    }

    /// Fold the time elapsed since the last call into the prescaler.
    ///
    /// With `hold_reset` the prescaler is reset at this point. A reset seen
    /// again with nothing counted since is a no-op and drops the elapsed time,
    /// so a prescaler held in reset (GTCCR.TSM) stands still. A fresh or
    /// freshly reset prescaler has `counted == last_reset` and so also drops
    /// time spent under reset.
    pub fn advance(&mut self, now: u64, hold_reset: bool) {
        let elapsed = now.saturating_sub(self.prev_clock);
        self.prev_clock = now;
        if hold_reset {
            if self.last_reset != self.counted {
                self.counted += elapsed;
                self.last_reset = self.counted;
            }
        } else {
            self.counted += elapsed;
        }
    }

    /// Move the clock origin without counting, used when the clock source of
    /// the domain changes (ASSR.AS2 toggled).
    pub fn resync(&mut self, now: u64) {
        self.prev_clock = now;
    }

    /// Count seen by a timer running from tap `select`.
    pub fn scaled_count(&self, select: ClockSelect) -> u64 {
        match self.taps.width(select) {
            None => 0,
            Some(w) => {
                let phase = self.last_reset & ((1u64 << w) - 1);
                scaled_count(self.counted - phase, w)
            }
        }
    }

    pub fn counted(&self) -> u64 {
        self.counted
    }

    pub fn save_state(&self) -> PrescalerState {
        PrescalerState { counted: self.counted, last_reset: self.last_reset }
    }

    pub fn load_state(&mut self, s: &PrescalerState, now: u64) {
        self.counted = s.counted;
        self.last_reset = s.last_reset.min(s.counted);
        self.prev_clock = now;
    }
}
