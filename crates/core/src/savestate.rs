//! Peripheral save states.
//!
//! Captures the register file and every peripheral's private state using
//! bincode serialization with deflate compression, so a test run can be
//! parked and resumed. Executor state is not included; the executor saves its
//! own registers and flash.
//!
//! ## File format
//!
//! ```text
//! +------------------+
//! | Magic "AVPS"     |  4 bytes
//! +------------------+
//! | Format version   |  u32 little-endian (currently 1)
//! +------------------+
//! | Compressed data  |  deflate-compressed bincode payload
//! +------------------+
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::io::Peripherals;
use crate::peripherals::prescaler::PrescalerState;
use crate::peripherals::{EepromState, TimerState};

/// Magic bytes identifying a peripheral save state.
const MAGIC: &[u8; 4] = b"AVPS";
/// Current save state format version.
const FORMAT_VERSION: u32 = 1;
const HEADER_LEN: usize = 8;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeripheralState {
    pub registers: Vec<u8>,
    pub sync: PrescalerState,
    pub asynchronous: PrescalerState,
    pub timers: Vec<TimerState>,
    pub eeprom: EepromState,
    pub watchdog_marker: u64,
    pub watchdog_elapsed: u64,
    pub wdce_window: Option<u64>,
}

impl Peripherals {
    pub fn save_state(&self) -> PeripheralState {
        let (watchdog_marker, watchdog_elapsed) = self.watchdog.save_state();
        PeripheralState {
            registers: self.regs.snapshot(),
            sync: self.sync.save_state(),
            asynchronous: self.asynchronous.save_state(),
            timers: self.timers.iter().map(|t| t.save_state()).collect(),
            eeprom: self.eeprom.save_state(),
            watchdog_marker,
            watchdog_elapsed,
            wdce_window: self.wdt_ctrl.window(),
        }
    }

    /// Restore a saved state. Prescalers resume counting from `cycle`.
    pub fn load_state(&mut self, s: &PeripheralState, cycle: u64) -> Result<()> {
        if s.timers.len() != self.timers.len() {
            return Err(Error::SaveState(format!("expected {} timers, found {}", self.timers.len(), s.timers.len())));
        }
        self.regs.restore(&s.registers);
        let now = self.sync_now(cycle);
        self.sync.load_state(&s.sync, now);
        let now = self.async_now(cycle);
        self.asynchronous.load_state(&s.asynchronous, now);
        for (t, ts) in self.timers.iter_mut().zip(&s.timers) {
            t.load_state(ts);
        }
        self.eeprom.load_state(&s.eeprom);
        self.watchdog.load_state(s.watchdog_marker, s.watchdog_elapsed);
        self.wdt_ctrl.set_window(s.wdce_window);
        Ok(())
    }
}

/// Serialize and compress a state with the file header.
pub fn encode(state: &PeripheralState) -> Result<Vec<u8>> {
    let payload = bincode::serialize(state).map_err(|e| Error::SaveState(format!("serialize: {}", e)))?;
    let compressed = miniz_oxide::deflate::compress_to_vec(&payload, 6);

    let mut out = Vec::with_capacity(HEADER_LEN + compressed.len());
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    out.extend_from_slice(&compressed);
    Ok(out)
}

/// Verify the header, decompress and deserialize.
pub fn decode(data: &[u8]) -> Result<PeripheralState> {
    if data.len() < HEADER_LEN {
        return Err(Error::SaveState("file too small".into()));
    }
    if &data[0..4] != MAGIC {
        return Err(Error::SaveState("bad magic".into()));
    }
    let version = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
    if version != FORMAT_VERSION {
        return Err(Error::SaveState(format!("unsupported version {} (expected {})", version, FORMAT_VERSION)));
    }
    let decompressed = miniz_oxide::inflate::decompress_to_vec(&data[HEADER_LEN..])
        .map_err(|e| Error::SaveState(format!("decompress: {:?}", e)))?;
    bincode::deserialize(&decompressed).map_err(|e| Error::SaveState(format!("deserialize: {}", e)))
}

pub fn save_to_file(state: &PeripheralState, path: &Path) -> Result<()> {
    let bytes = encode(state)?;
    std::fs::write(path, bytes).map_err(|e| Error::io(path, e))
}

pub fn load_from_file(path: &Path) -> Result<PeripheralState> {
    let data = std::fs::read(path).map_err(|e| Error::io(path, e))?;
    decode(&data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::tests::bench;
    use crate::peripherals::TimerId;
    use crate::regs::*;

    #[test]
    fn test_state_survives_file() {
        let (mut io, _) = bench();
        let mut cycle = 0;
        io.write(TIMSK0, 1, &mut cycle);
        io.write(TCCR0B, 1, &mut cycle);
        io.write(EEDR, 0x5A, &mut cycle);
        io.write(EECR, 0x04, &mut cycle);
        io.write(EECR, 0x02, &mut cycle);
        cycle = 1000;
        io.poll(cycle);
        let saved = io.save_state();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.state");
        save_to_file(&saved, &path).unwrap();
        let loaded = load_from_file(&path).unwrap();

        let (mut other, _) = bench();
        other.load_state(&loaded, 50_000).unwrap();
        assert_eq!(other.eeprom().data()[0], 0x5A);
        assert_eq!(other.timer(TimerId::Timer0).backlog(), 3);
        assert_eq!(other.regs().read(TCCR0B), 1);
        // Counting resumes from the saved count at the new cycle origin
        let mut c = 50_010;
        assert_eq!(other.read(TCNT0, &mut c), ((1000 + 10) % 256) as u8);
    }

    #[test]
    fn test_rejects_bad_header() {
        assert!(matches!(decode(b"AVP"), Err(Error::SaveState(_))));
        assert!(matches!(decode(b"ABES\x01\0\0\0xx"), Err(Error::SaveState(_))));
        let (io, _) = bench();
        let mut bytes = encode(&io.save_state()).unwrap();
        bytes[4] = 9;
        assert!(matches!(decode(&bytes), Err(Error::SaveState(_))));
    }
}
