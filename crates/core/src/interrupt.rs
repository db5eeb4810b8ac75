//! Choosing which interrupt the executor services next.
//!
//! Peripherals only assert one shared line. When the executor stops with
//! the line up, [`Peripherals::resolve_interrupt`] walks the sources in fixed
//! priority order and hands out exactly one vector, acknowledging the flag
//! that caused it. Sources with more work pending re-assert the line.

use std::fmt;

use serde::Serialize;

use crate::io::Peripherals;
use crate::memory::ResetRequest;
use crate::peripherals::uart::{RXC, TXC, UDRE};
use crate::peripherals::watchdog::WDIF;
use crate::peripherals::TimerId;
use crate::regs::*;

/// Why the core was reset. Each cause has its own MCUSR flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ResetCause {
    PowerOn,
    External,
    Watchdog,
    BrownOut,
}

impl ResetCause {
    pub fn mcusr_flag(self) -> u8 {
        match self {
            ResetCause::PowerOn => PORF,
            ResetCause::External => EXTRF,
            ResetCause::Watchdog => WDRF,
            ResetCause::BrownOut => BORF,
        }
    }
}

impl fmt::Display for ResetCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ResetCause::PowerOn => "power-on",
            ResetCause::External => "external",
            ResetCause::Watchdog => "watchdog",
            ResetCause::BrownOut => "brown-out",
        })
    }
}

/// A condition that can claim the interrupt line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Interrupt {
    WatchdogReset,
    ExternalReset,
    PowerOff,
    Watchdog,
    TimerOverflow(TimerId),
    EepromReady,
    UartUdre,
    UartTx,
    UartRx,
}

impl Interrupt {
    /// Vector (word address), `None` for the reset conditions.
    pub fn vector(self) -> Option<u16> {
        match self {
            Interrupt::WatchdogReset | Interrupt::ExternalReset | Interrupt::PowerOff => None,
            Interrupt::Watchdog => Some(WDT_VECTOR),
            Interrupt::TimerOverflow(TimerId::Timer0) => Some(TIMER0_OVF_VECTOR),
            Interrupt::TimerOverflow(TimerId::Timer1) => Some(TIMER1_OVF_VECTOR),
            Interrupt::TimerOverflow(TimerId::Timer2) => Some(TIMER2_OVF_VECTOR),
            Interrupt::EepromReady => Some(EE_READY_VECTOR),
            Interrupt::UartUdre => Some(USART0_UDRE_VECTOR),
            Interrupt::UartTx => Some(USART0_TX_VECTOR),
            Interrupt::UartRx => Some(USART0_RX_VECTOR),
        }
    }
}

/// What the run loop must do with a dispatchable core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Reset(ResetCause),
    /// Power removed: reset with BORF and end the run
    PowerOff,
    Vector(Interrupt, u16),
    /// Nothing claims the line; resume where the core left off
    Return,
}

impl Dispatch {
    fn vector(irq: Interrupt) -> Dispatch {
        match irq.vector() {
            Some(v) => Dispatch::Vector(irq, v),
            None => Dispatch::Return,
        }
    }
}

impl Peripherals {
    /// Pick the highest-priority pending source and acknowledge it.
    ///
    /// Order: reset requests, watchdog interrupt, timer overflows (0, 1, 2),
    /// EEPROM ready, UART (UDRE, TXC, then RXC).
    pub fn resolve_interrupt(&mut self) -> Dispatch {
        match self.signals.reset_request() {
            Some(ResetRequest::Watchdog) => return Dispatch::Reset(ResetCause::Watchdog),
            Some(ResetRequest::External) => return Dispatch::Reset(ResetCause::External),
            Some(ResetRequest::PowerOff) => return Dispatch::PowerOff,
            None => {}
        }

        if self.regs.clear_bits(WDTCSR, WDIF) & WDIF != 0 {
            return Dispatch::vector(Interrupt::Watchdog);
        }

        for timer in self.timers.iter_mut() {
            if let Some(more) = timer.take_overflow(&self.regs) {
                if more {
                    self.signals.raise();
                }
                return Dispatch::vector(Interrupt::TimerOverflow(timer.id()));
            }
        }

        if self.eeprom.ready_interrupt(&self.regs) {
            // Level triggered: fires until software clears EERIE
            self.signals.raise();
            return Dispatch::vector(Interrupt::EepromReady);
        }

        self.uart.refresh();
        let status = self.regs.read(UCSR0A);
        let active = status & self.regs.read(UCSR0B);
        if active & UDRE != 0 {
            self.signals.raise();
            return Dispatch::vector(Interrupt::UartUdre);
        }
        if active & TXC != 0 {
            self.regs.clear_bits(UCSR0A, TXC);
            self.signals.raise();
            return Dispatch::vector(Interrupt::UartTx);
        }
        if active & RXC != 0 {
            self.signals.raise();
            return Dispatch::vector(Interrupt::UartRx);
        }

        Dispatch::Return
    }
}
