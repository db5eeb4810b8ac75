//! ATmega2560 peripheral emulation.
//!
//! Only the peripherals a test program talks to are modelled:
//!
//! - [`Prescaler`]: synchronous and asynchronous timer prescalers
//! - [`Timer`]: Timer/Counter0 (8 bit), Timer/Counter1 (16 bit), Timer/Counter2 (8 bit, async)
//! - [`Watchdog`]: watchdog monitor thread and WDTCSR change protection
//! - [`Uart`]: USART0 bridged to the host, pass-through or buffered
//! - [`Eeprom`]: EEPROM controller with timed write enable

pub mod prescaler;
mod timer;
pub mod watchdog;
mod ring;
pub mod uart;
pub mod eeprom;

pub use prescaler::{ClockSelect, ClockSource, Prescaler, TapTable, ASYNC_TAPS, SYNC_TAPS};
pub use timer::{Timer, TimerAddrs, TimerId, TimerState, TOIE, TOV};
pub use watchdog::{Watchdog, WatchdogCtrl, WatchdogThread};
pub use ring::ByteRing;
pub use uart::{Fill, RxWorker, TxWorker, Uart, UartMode};
pub use eeprom::{Eeprom, EepromState, EepromStore};
