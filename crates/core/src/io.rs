//! Memory-mapped I/O as the executor sees it.
//!
//! [`Peripherals`] owns every modelled peripheral and routes register
//! accesses to them. Plain registers are just cells in the shared
//! [`RegisterFile`]; hooked registers run side effects synchronously before
//! the value is stored or after it is fetched.
//!
//! Timer overflow detection is eager: every register access brings the
//! prescalers up to date and samples all three counters first. The run loop
//! and executors may additionally call [`Peripherals::poll`] at their own
//! cadence so overflows are noticed by programs that never touch I/O.

use std::sync::Arc;
use std::time::Instant;

use log::info;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::host::{ByteSink, ByteSource};
use crate::memory::{RegisterFile, Signals};
use crate::peripherals::prescaler::ASYNC_CRYSTAL_HZ;
use crate::peripherals::{
    ClockSource, Eeprom, Prescaler, Timer, TimerAddrs, TimerId, Uart, UartMode, Watchdog, WatchdogCtrl,
};
use crate::regs::*;

/// Register layout of Timer/Counter0, 1 and 2.
pub fn timer_layout() -> [TimerAddrs; 3] {
    [
        TimerAddrs {
            id: TimerId::Timer0,
            tcnt: TCNT0,
            tcnt_high: None,
            tccr_b: TCCR0B,
            tifr: TIFR0,
            timsk: TIMSK0,
            bits: 8,
            asynchronous: false,
        },
        TimerAddrs {
            id: TimerId::Timer1,
            tcnt: TCNT1L,
            tcnt_high: Some(TCNT1H),
            tccr_b: TCCR1B,
            tifr: TIFR1,
            timsk: TIMSK1,
            bits: 16,
            asynchronous: false,
        },
        TimerAddrs {
            id: TimerId::Timer2,
            tcnt: TCNT2,
            tcnt_high: None,
            tccr_b: TCCR2B,
            tifr: TIFR2,
            timsk: TIMSK2,
            bits: 8,
            asynchronous: true,
        },
    ]
}

/// GPIO ports whose output edges are reported, with their PINx/PORTx addresses.
const PORTS: [(char, u8, u8); 4] = [('A', PINA, PORTA), ('B', PINB, PORTB), ('C', PINC, PORTC), ('D', PIND, PORTD)];

pub struct Peripherals {
    pub(crate) regs: Arc<RegisterFile>,
    pub(crate) signals: Arc<Signals>,
    clock: ClockSource,
    epoch: Instant,
    pub(crate) sync: Prescaler,
    pub(crate) asynchronous: Prescaler,
    pub(crate) timers: [Timer; 3],
    pub(crate) watchdog: Arc<Watchdog>,
    pub(crate) wdt_ctrl: WatchdogCtrl,
    pub(crate) uart: Uart,
    pub(crate) eeprom: Eeprom,
}

impl Peripherals {
    /// Peripherals with the UART bridged to `source`/`sink` as configured.
    pub fn new(
        config: &Config,
        eeprom: Eeprom,
        source: Box<dyn ByteSource>,
        sink: Box<dyn ByteSink>,
    ) -> Result<Self> {
        let mode = config.uart;
        Peripherals::with_uart(config, eeprom, move |regs, signals| match mode {
            UartMode::PassThrough => Ok(Uart::pass_through(regs, signals, source, sink)),
            UartMode::Buffered { capacity, poll } => Uart::buffered(regs, signals, capacity, poll, source, sink)
                .map_err(|source| Error::Thread { name: "uart", source }),
        })
    }

    /// Peripherals with a caller-built UART.
    pub fn with_uart(
        config: &Config,
        eeprom: Eeprom,
        make_uart: impl FnOnce(Arc<RegisterFile>, Arc<Signals>) -> Result<Uart>,
    ) -> Result<Self> {
        config.validate()?;
        let regs = Arc::new(RegisterFile::new());
        let signals = Arc::new(Signals::new());
        let uart = make_uart(regs.clone(), signals.clone())?;
        let timers = timer_layout().map(Timer::new);
        Ok(Peripherals {
            regs,
            signals,
            clock: config.timer_clock,
            epoch: Instant::now(),
            sync: Prescaler::new(config.sync_taps, 0),
            asynchronous: Prescaler::new(config.async_taps, 0),
            timers,
            watchdog: Arc::new(Watchdog::new()),
            wdt_ctrl: WatchdogCtrl::new(),
            uart,
            eeprom,
        })
    }

    pub fn regs(&self) -> &Arc<RegisterFile> {
        &self.regs
    }

    pub fn signals(&self) -> &Arc<Signals> {
        &self.signals
    }

    pub fn watchdog(&self) -> &Arc<Watchdog> {
        &self.watchdog
    }

    pub fn timer(&self, id: TimerId) -> &Timer {
        &self.timers[id as usize]
    }

    pub fn uart(&self) -> &Uart {
        &self.uart
    }

    pub fn eeprom(&self) -> &Eeprom {
        &self.eeprom
    }

    pub fn eeprom_mut(&mut self) -> &mut Eeprom {
        &mut self.eeprom
    }

    pub(crate) fn sync_now(&self, cycle: u64) -> u64 {
        self.clock.now(cycle, self.epoch)
    }

    pub(crate) fn async_now(&self, cycle: u64) -> u64 {
        if self.regs.read(ASSR) & AS2 != 0 {
            ClockSource::Oscillator { hz: ASYNC_CRYSTAL_HZ }.now(cycle, self.epoch)
        } else {
            self.sync_now(cycle)
        }
    }

    fn update_clocks(&mut self, cycle: u64) {
        let gtccr = self.regs.read(GTCCR);
        let now = self.sync_now(cycle);
        self.sync.advance(now, gtccr & PSRSYNC != 0);
        let now = self.async_now(cycle);
        self.asynchronous.advance(now, gtccr & PSRASY != 0);
    }

    /// Run `f` on timer `id` with the prescaler that clocks it.
    fn with_timer<R>(&mut self, id: TimerId, f: impl FnOnce(&mut Timer, &Prescaler, &RegisterFile, &Signals) -> R) -> R {
        let timer = &mut self.timers[id as usize];
        let prescaler = if timer.addrs().asynchronous { &self.asynchronous } else { &self.sync };
        f(timer, prescaler, &self.regs, &self.signals)
    }

    fn poll_timers(&mut self, cycle: u64) {
        self.update_clocks(cycle);
        for id in [TimerId::Timer0, TimerId::Timer1, TimerId::Timer2] {
            self.with_timer(id, |t, p, regs, signals| {
                t.sample(p, regs, signals);
            });
        }
    }

    /// Periodic poll: catch timer overflows and host UART input.
    pub fn poll(&mut self, cycle: u64) {
        self.poll_timers(cycle);
        self.uart.refresh();
    }

    /// WDR instruction.
    pub fn watchdog_reset(&self) {
        self.watchdog.kick();
    }

    /// Hooked register read at `*cycle`.
    pub fn read(&mut self, addr: u8, cycle: &mut u64) -> u8 {
        self.poll_timers(*cycle);
        match addr {
            TCNT0 => self.with_timer(TimerId::Timer0, |t, p, r, s| t.read_low(p, r, s)),
            TCNT1L => self.with_timer(TimerId::Timer1, |t, p, r, s| t.read_low(p, r, s)),
            TCNT1H => self.timers[TimerId::Timer1 as usize].read_high(),
            TCNT2 => self.with_timer(TimerId::Timer2, |t, p, r, s| t.read_low(p, r, s)),
            UDR0 => self.uart.read_data(),
            UCSR0A => {
                self.uart.refresh();
                self.regs.read(UCSR0A)
            }
            EECR => self.eeprom.read_control(*cycle, &self.regs),
            _ => self.regs.read(addr),
        }
    }

    /// Hooked register write at `*cycle`. EEPROM operations advance `*cycle`.
    pub fn write(&mut self, addr: u8, value: u8, cycle: &mut u64) {
        self.poll_timers(*cycle);
        match addr {
            TCNT0 => self.with_timer(TimerId::Timer0, |t, p, r, s| t.write_low(value, p, r, s)),
            TCNT1H => self.timers[TimerId::Timer1 as usize].write_high(value),
            TCNT1L => self.with_timer(TimerId::Timer1, |t, p, r, s| t.write_low(value, p, r, s)),
            TCNT2 => self.with_timer(TimerId::Timer2, |t, p, r, s| t.write_low(value, p, r, s)),
            TCCR0B => self.with_timer(TimerId::Timer0, |t, p, r, s| t.set_control(value, p, r, s)),
            TCCR1B => self.with_timer(TimerId::Timer1, |t, p, r, s| t.set_control(value, p, r, s)),
            TCCR2B => self.with_timer(TimerId::Timer2, |t, p, r, s| t.set_control(value, p, r, s)),
            TIFR0 => self.timers[0].write_flags(value, &self.regs),
            TIFR1 => self.timers[1].write_flags(value, &self.regs),
            TIFR2 => self.timers[2].write_flags(value, &self.regs),
            TIMSK0 => self.timers[0].write_mask(value, &self.regs, &self.signals),
            TIMSK1 => self.timers[1].write_mask(value, &self.regs, &self.signals),
            TIMSK2 => self.timers[2].write_mask(value, &self.regs, &self.signals),
            GTCCR => {
                self.regs.write(GTCCR, value);
                // Zero time has passed since the poll, so this only resets
                self.update_clocks(*cycle);
                if value & TSM == 0 {
                    self.regs.clear_bits(GTCCR, PSRSYNC | PSRASY);
                }
            }
            ASSR => {
                let prev = self.regs.read(ASSR);
                self.regs.write(ASSR, value);
                if (prev ^ value) & AS2 != 0 {
                    let now = self.async_now(*cycle);
                    self.asynchronous.resync(now);
                }
            }
            WDTCSR => self.wdt_ctrl.write(value, *cycle, &self.regs),
            UDR0 => self.uart.write_data(value),
            UCSR0A => self.uart.write_status(value),
            UCSR0B => self.uart.write_control(value),
            EECR => self.eeprom.write_control(value, cycle, &self.regs, &self.signals),
            _ => {
                if let Some(&(_, pin, port)) = PORTS.iter().find(|(_, pin, _)| *pin == addr) {
                    // Writing ones to PINx toggles PORTx
                    let prev = self.regs.update(port, |v| v ^ value);
                    self.report_edges(pin, prev, prev ^ value);
                } else if let Some(&(_, pin, _)) = PORTS.iter().find(|(_, _, port)| *port == addr) {
                    let prev = self.regs.read(addr);
                    self.regs.write(addr, value);
                    self.report_edges(pin, prev, value);
                } else {
                    self.regs.write(addr, value);
                }
            }
        }
    }

    fn report_edges(&self, pin: u8, prev: u8, next: u8) {
        let rising = next & !prev;
        if rising == 0 {
            return;
        }
        if let Some(&(name, _, _)) = PORTS.iter().find(|(_, p, _)| *p == pin) {
            for bit in (0..8).filter(|b| rising & (1 << b) != 0) {
                info!(target: "gpio", "<{}{}>", name, bit);
            }
        }
    }

    /// Peripheral side of a hard reset. MCUSR and EEPROM contents survive.
    pub fn reset(&mut self, cycle: u64) {
        let mcusr = self.regs.read(MCUSR);
        self.regs.clear();
        self.regs.write(MCUSR, mcusr);
        let now = self.sync_now(cycle);
        self.sync.reset(now);
        let now = self.async_now(cycle);
        self.asynchronous.reset(now);
        for t in self.timers.iter_mut() {
            t.reset();
        }
        self.watchdog.reset();
        self.wdt_ctrl.reset();
        self.uart.reset();
        self.eeprom.reset();
    }
}
