//! Intel HEX images.
//!
//! Parses Intel HEX text (`:LLAAAATT[DD...]CC`) into a byte buffer and writes
//! buffers back out. Supports record types 00 (data), 01 (EOF), 02 (extended
//! segment address) and 04 (extended linear address), which covers any
//! EEPROM size.
//!
//! [`HexEeprom`] uses both directions to persist EEPROM contents in a file.

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use log::debug;

use crate::error::{Error, Result};
use crate::peripherals::EepromStore;

/// Bytes per data record when writing.
const RECORD_LEN: usize = 16;

/// Parse Intel HEX text into `image`.
///
/// Returns the number of bytes loaded (highest address reached). Data past
/// the end of `image` is ignored.
pub fn parse_hex(hex: &str, image: &mut [u8]) -> Result<usize> {
    let mut max_addr = 0usize;
    let mut base_addr: u32 = 0;

    for (n, line) in hex.lines().enumerate() {
        let line_no = n + 1;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some(body) = line.strip_prefix(':') else {
            continue; // skip non-hex lines
        };

        let bytes = hex_line_to_bytes(body).map_err(|message| Error::Hex { line: line_no, message })?;
        if bytes.len() < 5 {
            return Err(Error::Hex { line: line_no, message: "line too short".into() });
        }

        let byte_count = bytes[0] as usize;
        if bytes.len() != byte_count + 5 {
            return Err(Error::Hex { line: line_no, message: format!("length mismatch: {} data bytes declared", byte_count) });
        }
        let addr = ((bytes[1] as u16) << 8) | bytes[2] as u16;
        let record_type = bytes[3];

        let sum: u8 = bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
        if sum != 0 {
            return Err(Error::Hex { line: line_no, message: format!("checksum error: sum={}", sum) });
        }

        match record_type {
            0x00 => {
                let full_addr = base_addr + addr as u32;
                for i in 0..byte_count {
                    let target = (full_addr as usize) + i;
                    if target < image.len() {
                        image[target] = bytes[4 + i];
                        max_addr = max_addr.max(target + 1);
                    }
                }
            }
            0x01 => break,
            0x02 => {
                if byte_count >= 2 {
                    base_addr = (((bytes[4] as u32) << 8) | bytes[5] as u32) << 4;
                }
            }
            0x04 => {
                if byte_count >= 2 {
                    base_addr = ((bytes[4] as u32) << 8 | bytes[5] as u32) << 16;
                }
            }
            // Start addresses mean nothing for a data image
            _ => {}
        }
    }

    Ok(max_addr)
}

fn hex_line_to_bytes(hex_str: &str) -> std::result::Result<Vec<u8>, String> {
    let chars: Vec<char> = hex_str.chars().collect();
    if chars.len() % 2 != 0 {
        return Err("odd number of hex characters".into());
    }
    chars
        .chunks(2)
        .map(|pair| Ok((hex_char(pair[0])? << 4) | hex_char(pair[1])?))
        .collect()
}

fn hex_char(c: char) -> std::result::Result<u8, String> {
    c.to_digit(16).map(|d| d as u8).ok_or_else(|| format!("invalid hex character: {}", c))
}

fn push_record(out: &mut String, addr: u16, kind: u8, data: &[u8]) {
    let mut sum = (data.len() as u8)
        .wrapping_add((addr >> 8) as u8)
        .wrapping_add(addr as u8)
        .wrapping_add(kind);
    let _ = write!(out, ":{:02X}{:04X}{:02X}", data.len(), addr, kind);
    for &b in data {
        sum = sum.wrapping_add(b);
        let _ = write!(out, "{:02X}", b);
    }
    let _ = writeln!(out, "{:02X}", sum.wrapping_neg());
}

/// Render `image` as Intel HEX: 16-byte data records, an extended segment
/// record at every 64 KiB boundary past the first, and an EOF record.
pub fn write_hex(image: &[u8]) -> String {
    let mut out = String::with_capacity(image.len() * 3);
    for (i, chunk) in image.chunks(RECORD_LEN).enumerate() {
        let addr = i * RECORD_LEN;
        if addr >> 16 != 0 && addr & 0xFFFF == 0 {
            let segment = ((addr >> 4) & 0xF000) as u16;
            push_record(&mut out, 0, 0x02, &segment.to_be_bytes());
        }
        push_record(&mut out, addr as u16, 0x00, chunk);
    }
    out.push_str(":00000001FF\n");
    out
}

/// EEPROM persisted as an Intel HEX file.
///
/// Only the prefix that was present in the file when it was loaded is
/// written back; the rest of the device is treated as volatile.
pub struct HexEeprom {
    path: PathBuf,
    persistent: usize,
}

impl HexEeprom {
    /// Load `path` into an erased image of `size` bytes.
    ///
    /// A missing file yields an erased image with nothing persisted.
    pub fn open(path: impl Into<PathBuf>, size: usize) -> Result<(Self, Vec<u8>)> {
        let path = path.into();
        let mut image = vec![0xFF; size];
        let persistent = match fs::read_to_string(&path) {
            Ok(text) => parse_hex(&text, &mut image)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(Error::io(&path, e)),
        };
        debug!("eeprom {}: {} persistent bytes", path.display(), persistent);
        Ok((HexEeprom { path, persistent }, image))
    }

    /// Store writing the first `persistent` bytes to `path`.
    pub fn create(path: impl Into<PathBuf>, persistent: usize) -> Self {
        HexEeprom { path: path.into(), persistent }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn persistent_len(&self) -> usize {
        self.persistent
    }
}

impl EepromStore for HexEeprom {
    fn commit(&mut self, data: &[u8]) -> Result<()> {
        let n = self.persistent.min(data.len());
        fs::write(&self.path, write_hex(&data[..n]))
            .map_err(|source| Error::Commit { path: self.path.clone(), source })
    }
}
