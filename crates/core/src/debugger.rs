//! Debug dumps and register names.
//!
//! - **State summary**: [`DebugSummary`] captures executor registers and the
//!   state of every modelled peripheral. `Display` renders the classic one-line
//!   register dump followed by a line per peripheral; serde renders it as JSON.
//! - **I/O register names**: lookup in both directions, used by dumps and by
//!   bench scripts that address registers symbolically.

use std::fmt;

use serde::Serialize;

use crate::cpu::CpuState;
use crate::io::Peripherals;
use crate::peripherals::watchdog::threshold;
use crate::peripherals::TimerId;
use crate::regs::*;

// ─── I/O Register Names ─────────────────────────────────────────────────────

/// Named I/O registers of the ATmega2560 that the emulator models.
pub fn io_reg_names() -> Vec<(u8, &'static str)> {
    vec![
        (PINA, "PINA"), (0x21, "DDRA"), (PORTA, "PORTA"),
        (PINB, "PINB"), (0x24, "DDRB"), (PORTB, "PORTB"),
        (PINC, "PINC"), (0x27, "DDRC"), (PORTC, "PORTC"),
        (PIND, "PIND"), (0x2A, "DDRD"), (PORTD, "PORTD"),
        (TIFR0, "TIFR0"), (TIFR1, "TIFR1"), (TIFR2, "TIFR2"),
        (0x3E, "GPIOR0"), (EECR, "EECR"), (EEDR, "EEDR"),
        (EEARL, "EEARL"), (EEARH, "EEARH"),
        (GTCCR, "GTCCR"), (0x44, "TCCR0A"), (TCCR0B, "TCCR0B"), (TCNT0, "TCNT0"),
        (0x4A, "GPIOR1"), (0x4B, "GPIOR2"),
        (0x53, "SMCR"), (MCUSR, "MCUSR"), (0x55, "MCUCR"),
        (SPMCSR, "SPMCSR"),
        (SPL, "SPL"), (SPH, "SPH"), (SREG, "SREG"),
        (WDTCSR, "WDTCSR"),
        (TIMSK0, "TIMSK0"), (TIMSK1, "TIMSK1"), (TIMSK2, "TIMSK2"),
        (0x80, "TCCR1A"), (TCCR1B, "TCCR1B"), (0x82, "TCCR1C"),
        (TCNT1L, "TCNT1L"), (TCNT1H, "TCNT1H"),
        (0xB0, "TCCR2A"), (TCCR2B, "TCCR2B"), (TCNT2, "TCNT2"),
        (ASSR, "ASSR"),
        (UCSR0A, "UCSR0A"), (UCSR0B, "UCSR0B"), (0xC2, "UCSR0C"),
        (0xC4, "UBRR0L"), (0xC5, "UBRR0H"), (UDR0, "UDR0"),
    ]
}

/// Resolve an I/O address to its name (if known).
pub fn io_name(addr: u8) -> Option<&'static str> {
    io_reg_names().into_iter().find(|(a, _)| *a == addr).map(|(_, n)| n)
}

/// Resolve a register name (case-insensitive) to its data-space address.
pub fn io_addr(name: &str) -> Option<u8> {
    io_reg_names().into_iter().find(|(_, n)| n.eq_ignore_ascii_case(name)).map(|(a, _)| a)
}

/// Format the named registers that are non-zero.
pub fn dump_io_regs(data: &[u8]) -> String {
    let mut s = String::new();
    for (addr, name) in io_reg_names() {
        let val = data.get(addr as usize).copied().unwrap_or(0);
        if val != 0 {
            s.push_str(&format!("  {:>8} (0x{:02X}) = 0x{:02X}  {:08b}\n", name, addr, val, val));
        }
    }
    if s.is_empty() {
        s.push_str("  (all zero)\n");
    }
    s
}

// ─── State Summary ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct TimerSummary {
    pub id: TimerId,
    pub select: u8,
    pub count: u16,
    pub flags: u8,
    pub backlog: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct WatchdogSummary {
    pub control: u8,
    pub marker: u64,
    pub elapsed_ticks: u64,
    pub threshold: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct UartSummary {
    pub mode: &'static str,
    pub status: u8,
    pub control: u8,
    pub tx_queued: Option<usize>,
    pub rx_queued: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EepromSummary {
    pub control: u8,
    pub address: usize,
    pub size: usize,
    pub dirty: bool,
}

/// Snapshot of everything a debug dump shows.
#[derive(Debug, Clone, Serialize)]
pub struct DebugSummary {
    pub cycle: u64,
    pub cpu: CpuState,
    pub mcusr: u8,
    pub timers: Vec<TimerSummary>,
    pub watchdog: WatchdogSummary,
    pub uart: UartSummary,
    pub eeprom: EepromSummary,
    pub pending: bool,
    /// Raw I/O space, rendered by `Display` as the named non-zero registers
    #[serde(skip)]
    pub io: Vec<u8>,
}

impl Peripherals {
    /// Summarize peripheral state. Reads plain cells only; no hooks run.
    pub fn summary(&self, cycle: u64, cpu: CpuState) -> DebugSummary {
        let regs = self.regs();
        let timers = [TimerId::Timer0, TimerId::Timer1, TimerId::Timer2]
            .iter()
            .map(|&id| {
                let t = self.timer(id);
                let a = t.addrs();
                let high = a.tcnt_high.map_or(0, |h| regs.read(h));
                TimerSummary {
                    id,
                    select: t.select().bits(),
                    count: (high as u16) << 8 | regs.read(a.tcnt) as u16,
                    flags: regs.read(a.tifr),
                    backlog: t.backlog(),
                }
            })
            .collect();
        let control = regs.read(WDTCSR);
        let (tx_queued, rx_queued) = match self.uart().queue_depths() {
            Some((tx, rx)) => (Some(tx), Some(rx)),
            None => (None, None),
        };
        DebugSummary {
            cycle,
            cpu,
            mcusr: regs.read(MCUSR),
            timers,
            watchdog: WatchdogSummary {
                control,
                marker: self.watchdog().marker(),
                elapsed_ticks: self.watchdog().elapsed_ticks(),
                threshold: threshold(control),
            },
            uart: UartSummary {
                mode: self.uart().mode_name(),
                status: regs.read(UCSR0A),
                control: regs.read(UCSR0B),
                tx_queued,
                rx_queued,
            },
            eeprom: EepromSummary {
                control: regs.read(EECR),
                address: self.eeprom().address(regs),
                size: self.eeprom().size(),
                dirty: self.eeprom().is_dirty(),
            },
            pending: self.signals().is_pending(),
            io: regs.snapshot(),
        }
    }
}

impl fmt::Display for DebugSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:10}: ", self.cycle)?;
        for r in &self.cpu.regs {
            write!(f, "{:02x} ", r)?;
        }
        writeln!(f, "SP={:04x}, SREG={:02x}, PC={:04x}", self.cpu.sp, self.cpu.sreg, self.cpu.pc)?;
        for t in &self.timers {
            writeln!(
                f,
                "  {}: cs={} tcnt={:04x} tifr={:02x} backlog={}",
                t.id, t.select, t.count, t.flags, t.backlog
            )?;
        }
        writeln!(
            f,
            "  wdt: wdtcsr={:02x} marker={} elapsed={}/{} mcusr={:02x}",
            self.watchdog.control, self.watchdog.marker, self.watchdog.elapsed_ticks, self.watchdog.threshold, self.mcusr
        )?;
        write!(f, "  uart({}): ucsr0a={:02x} ucsr0b={:02x}", self.uart.mode, self.uart.status, self.uart.control)?;
        if let (Some(tx), Some(rx)) = (self.uart.tx_queued, self.uart.rx_queued) {
            write!(f, " tx={} rx={}", tx, rx)?;
        }
        writeln!(f)?;
        write!(
            f,
            "  eeprom: eecr={:02x} eear={:04x} size={}{}{}",
            self.eeprom.control,
            self.eeprom.address,
            self.eeprom.size,
            if self.eeprom.dirty { " dirty" } else { "" },
            if self.pending { " [int]" } else { "" },
        )?;
        writeln!(f)?;
        f.write_str(dump_io_regs(&self.io).trim_end())
    }
}
