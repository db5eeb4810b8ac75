//! # avrtest-core
//!
//! Peripheral and interrupt emulation for an ATmega2560 test bench.
//!
//! Models the memory-mapped I/O a test program depends on: USART0 bridged to
//! the host, Timer/Counter0/1/2 with their prescalers, the watchdog timer and
//! the EEPROM controller. Timing follows the executor's cycle counter (or the
//! host clock for real-time timers); instruction execution itself is left to
//! an executor implementing [`Cpu`].
//!
//! ## Architecture
//!
//! - [`Emulator`]: owns the executor and peripherals and runs the run-state machine
//! - [`Cpu`]: the executor contract (run/step/reset, cycle counter, vectors)
//! - [`Peripherals`]: hooked register access and interrupt resolution
//! - [`memory`]: the shared atomic register file and the interrupt line
//! - [`peripherals`]: Prescaler, Timer, Watchdog, Uart, Eeprom
//! - [`hex`]: Intel HEX reading and writing, EEPROM persistence
//! - [`debugger`]: state summaries and I/O register names
//! - [`savestate`]: peripheral save states
//! - [`script`]: a scripted executor for driving the peripherals without a core
//!
//! ## Threads
//!
//! The executor runs on the caller's thread. The watchdog monitor and, in
//! buffered mode, two UART workers run in the background and communicate
//! with it only through the register file and the interrupt line.

pub mod config;
pub mod cpu;
pub mod debugger;
pub mod error;
pub mod hex;
pub mod host;
pub mod interrupt;
pub mod io;
pub mod memory;
pub mod peripherals;
pub mod regs;
pub mod savestate;
pub mod script;

use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info};

pub use config::Config;
pub use cpu::{Cpu, CpuState, RunState};
pub use debugger::DebugSummary;
pub use error::{Error, Result};
pub use interrupt::{Dispatch, Interrupt, ResetCause};
pub use io::Peripherals;
pub use memory::{RegisterFile, ResetLine, Signals};

use peripherals::{EepromStore, WatchdogThread};
use regs::{MCUSR, PORF, WDRF, WDTCSR};

/// How long an idle or halted run loop sleeps between checks.
const IDLE_BACKOFF: Duration = Duration::from_micros(50);
/// Cycles that pass per idle-loop iteration while sleeping with I set.
const IDLE_CYCLES: u64 = 2;

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// Power was removed (brown-out reset performed)
    PoweredDown,
    /// The program hit a breakpoint
    Breakpoint,
    /// The core halted with no way to resume
    Halted,
}

/// Executor, peripherals and background threads wired together.
pub struct Emulator<C: Cpu> {
    cpu: C,
    io: Peripherals,
    config: Config,
    store: Option<Box<dyn EepromStore>>,
    last_commit: Instant,
    /// Stopped and joined on drop
    _watchdog: Option<WatchdogThread>,
}

impl<C: Cpu> Emulator<C> {
    /// Wire up an emulator. The watchdog monitor starts if configured.
    pub fn new(cpu: C, io: Peripherals, config: Config, store: Option<Box<dyn EepromStore>>) -> Result<Self> {
        config.validate()?;
        let watchdog = if config.watchdog {
            let t = WatchdogThread::spawn(
                io.watchdog().clone(),
                io.regs().clone(),
                io.signals().clone(),
                config.watchdog_tick,
            )
            .map_err(|source| Error::Thread { name: "watchdog", source })?;
            Some(t)
        } else {
            None
        };
        Ok(Emulator { cpu, io, config, store, last_commit: Instant::now(), _watchdog: watchdog })
    }

    pub fn cpu(&self) -> &C {
        &self.cpu
    }

    pub fn cpu_mut(&mut self) -> &mut C {
        &mut self.cpu
    }

    pub fn io(&self) -> &Peripherals {
        &self.io
    }

    pub fn io_mut(&mut self) -> &mut Peripherals {
        &mut self.io
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Handle for requesting resets from other threads.
    pub fn reset_line(&self) -> ResetLine {
        ResetLine::new(self.io.signals().clone())
    }

    pub fn power_on(&mut self) {
        self.hard_reset(ResetCause::PowerOn);
    }

    /// Reset executor and peripherals and record `cause` in MCUSR.
    pub fn hard_reset(&mut self, cause: ResetCause) {
        self.cpu.reset();
        let cycle = self.cpu.cycle();
        self.io.reset(cycle);
        let regs = self.io.regs();
        if cause == ResetCause::PowerOn {
            regs.write(MCUSR, PORF);
        } else {
            regs.set_bits(MCUSR, cause.mcusr_flag());
        }

        let signals = self.io.signals();
        signals.clear_reset();
        // The watchdog may still be forcing; it stops once it sees WDRF
        while signals.is_forcing() {
            thread::yield_now();
        }
        signals.take_halt();
        signals.acknowledge();
    }

    /// Acknowledge the interrupt line and act on the resolved source.
    ///
    /// Returns `Some` when the run must end.
    pub fn service_interrupt(&mut self) -> Result<Option<Exit>> {
        self.io.signals().acknowledge();
        match self.io.resolve_interrupt() {
            Dispatch::Reset(cause) => {
                info!("{} reset", cause);
                self.hard_reset(cause);
                Ok(None)
            }
            Dispatch::PowerOff => {
                info!("powered down");
                self.hard_reset(ResetCause::BrownOut);
                Ok(Some(Exit::PoweredDown))
            }
            Dispatch::Vector(irq, vector) => {
                debug!("{:?} -> vector {:#06x}", irq, vector);
                self.cpu.enter_vector(vector);
                Ok(None)
            }
            Dispatch::Return => {
                self.cpu.return_from_interrupt();
                Ok(None)
            }
        }
    }

    /// Run until the program ends. EEPROM contents are committed on the way out.
    pub fn run(&mut self) -> Result<Exit> {
        let exit = loop {
            // A watchdog reset leaves the watchdog enabled
            let wdrf = self.io.regs().read(MCUSR) & WDRF;
            self.io.regs().set_bits(WDTCSR, wdrf);
            self.autocommit()?;

            match self.cpu.run(&mut self.io) {
                RunState::Dispatchable => {
                    if let Some(exit) = self.service_interrupt()? {
                        break exit;
                    }
                }
                RunState::Idle => {
                    info!("mcu idle");
                    if self.cpu.interrupts_enabled() {
                        self.wait_for_interrupt()?;
                    } else if let Some(exit) = self.halted()? {
                        break exit;
                    }
                }
                RunState::Spinlocked => {
                    info!("mcu spinlocked");
                    if self.cpu.interrupts_enabled() {
                        self.wait_for_interrupt()?;
                    } else if let Some(exit) = self.halted()? {
                        break exit;
                    }
                }
                RunState::Breakpoint => {
                    info!("breakpoint");
                    let mut steps = 0;
                    loop {
                        let dump = self.debug_dump()?;
                        debug!("{}", dump);
                        if self.config.trace_steps.map_or(false, |limit| steps >= limit) {
                            break;
                        }
                        if !self.cpu.step(&mut self.io) {
                            break;
                        }
                        steps += 1;
                    }
                    break Exit::Breakpoint;
                }
            }
        };
        info!("done");
        let dump = self.debug_dump()?;
        debug!("{}", dump);
        Ok(exit)
    }

    /// Let time pass until something raises the interrupt line.
    fn wait_for_interrupt(&mut self) -> Result<()> {
        let signals = self.io.signals().clone();
        while !signals.is_pending() {
            self.cpu.advance(IDLE_CYCLES);
            let cycle = self.cpu.cycle();
            self.io.poll(cycle);
            self.autocommit()?;
            thread::yield_now();
        }
        Ok(())
    }

    /// The core cannot continue on its own.
    fn halted(&mut self) -> Result<Option<Exit>> {
        info!("halted");
        if !self.config.hold_on_halt {
            return Ok(Some(Exit::Halted));
        }
        let signals = self.io.signals().clone();
        while signals.reset_request().is_none() {
            self.autocommit()?;
            thread::sleep(IDLE_BACKOFF);
        }
        self.service_interrupt()
    }

    fn autocommit(&mut self) -> Result<()> {
        if let Some(interval) = self.config.autocommit {
            if self.io.eeprom().is_dirty() && self.last_commit.elapsed() >= interval {
                self.commit_eeprom()?;
            }
        }
        Ok(())
    }

    /// Persist EEPROM contents if they changed. Failure is fatal to the run.
    pub fn commit_eeprom(&mut self) -> Result<bool> {
        self.last_commit = Instant::now();
        match self.store.as_deref_mut() {
            Some(store) => self.io.eeprom_mut().commit(store),
            None => Ok(false),
        }
    }

    /// Current state without side effects.
    pub fn summary(&self) -> DebugSummary {
        self.io.summary(self.cpu.cycle(), self.cpu.state())
    }

    /// Debug dump: state summary, committing EEPROM as every dump does.
    pub fn debug_dump(&mut self) -> Result<DebugSummary> {
        self.commit_eeprom()?;
        Ok(self.summary())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::MemoryPort;
    use crate::peripherals::eeprom::{EEMPE, EEPE};
    use crate::peripherals::watchdog::{WDE, WDIE};
    use crate::peripherals::Eeprom;
    use crate::regs::*;
    use std::sync::{Arc, Mutex};

    /// Executor that replays a fixed list of run results and records calls.
    struct Replay {
        states: Vec<RunState>,
        cycle: u64,
        sreg: u8,
        vectors: Vec<u16>,
        returns: usize,
        resets: usize,
    }

    impl Replay {
        fn new(mut states: Vec<RunState>) -> Self {
            states.reverse();
            Replay { states, cycle: 0, sreg: 0, vectors: Vec::new(), returns: 0, resets: 0 }
        }
    }

    impl Cpu for Replay {
        fn run(&mut self, io: &mut Peripherals) -> RunState {
            io.signals().take_halt();
            self.states.pop().unwrap_or(RunState::Idle)
        }
        fn step(&mut self, _io: &mut Peripherals) -> bool {
            false
        }
        fn reset(&mut self) {
            self.resets += 1;
            self.sreg = 0;
        }
        fn cycle(&self) -> u64 {
            self.cycle
        }
        fn advance(&mut self, cycles: u64) {
            self.cycle += cycles;
        }
        fn interrupts_enabled(&self) -> bool {
            self.sreg & SREG_I != 0
        }
        fn enter_vector(&mut self, vector: u16) {
            self.vectors.push(vector);
        }
        fn return_from_interrupt(&mut self) {
            self.returns += 1;
        }
        fn state(&self) -> CpuState {
            CpuState::default()
        }
    }

    fn emulator(states: Vec<RunState>, config: Config) -> (Emulator<Replay>, MemoryPort) {
        let port = MemoryPort::new();
        let io = Peripherals::new(&config, Eeprom::new(config.eeprom_size), Box::new(port.clone()), Box::new(port.clone()))
            .unwrap();
        let emu = Emulator::new(Replay::new(states), io, config, None).unwrap();
        (emu, port)
    }

    fn quiet() -> Config {
        Config { watchdog: false, ..Config::default() }
    }

    #[test]
    fn test_power_on_sets_porf() {
        let (mut emu, _) = emulator(vec![], quiet());
        emu.io().regs().write(MCUSR, EXTRF | WDRF);
        emu.power_on();
        assert_eq!(emu.io().regs().read(MCUSR), PORF);
        assert_eq!(emu.cpu().resets, 1);
    }

    #[test]
    fn test_spurious_dispatch_returns() {
        let (mut emu, _) = emulator(vec![RunState::Dispatchable, RunState::Breakpoint], quiet());
        emu.power_on();
        assert_eq!(emu.run().unwrap(), Exit::Breakpoint);
        assert_eq!(emu.cpu().returns, 1);
        assert!(emu.cpu().vectors.is_empty());
    }

    #[test]
    fn test_idle_without_interrupts_halts() {
        let (mut emu, _) = emulator(vec![RunState::Idle], quiet());
        emu.power_on();
        assert_eq!(emu.run().unwrap(), Exit::Halted);
        let (mut emu, _) = emulator(vec![RunState::Spinlocked], quiet());
        assert_eq!(emu.run().unwrap(), Exit::Halted);
    }

    #[test]
    fn test_idle_wakes_on_timer_overflow() {
        let (mut emu, _) = emulator(vec![RunState::Idle, RunState::Dispatchable, RunState::Breakpoint], quiet());
        emu.power_on();
        let mut cycle = 0;
        emu.io_mut().write(TIMSK0, 1, &mut cycle);
        emu.io_mut().write(TCCR0B, 1, &mut cycle);
        emu.cpu_mut().sreg = SREG_I;
        assert_eq!(emu.run().unwrap(), Exit::Breakpoint);
        assert_eq!(emu.cpu().vectors, vec![TIMER0_OVF_VECTOR]);
        // Woken by the first overflow, 256 cycles in
        assert!(emu.cpu().cycle >= 256 && emu.cpu().cycle < 260);
    }

    #[test]
    fn test_external_reset_then_power_off() {
        let (mut emu, _) = emulator(vec![], quiet());
        emu.power_on();
        let line = emu.reset_line();
        line.external_reset();
        assert!(emu.io().signals().is_pending());
        assert_eq!(emu.service_interrupt().unwrap(), None);
        assert_eq!(emu.io().regs().read(MCUSR), PORF | EXTRF);
        assert!(!emu.io().signals().is_pending());

        line.power_off();
        assert_eq!(emu.service_interrupt().unwrap(), Some(Exit::PoweredDown));
        assert_eq!(emu.io().regs().read(MCUSR), PORF | EXTRF | BORF);
        assert_eq!(emu.cpu().resets, 3);
    }

    #[test]
    fn test_hold_on_halt_waits_for_reset() {
        let cfg = Config { hold_on_halt: true, ..quiet() };
        let (mut emu, _) = emulator(vec![RunState::Idle, RunState::Breakpoint], cfg);
        emu.power_on();
        let line = emu.reset_line();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(5));
            line.external_reset();
        });
        assert_eq!(emu.run().unwrap(), Exit::Breakpoint);
        handle.join().unwrap();
        assert_ne!(emu.io().regs().read(MCUSR) & EXTRF, 0);
    }

    #[test]
    fn test_watchdog_reset_keeps_watchdog_enabled() {
        let cfg = Config { watchdog_tick: Duration::from_millis(1), ..Config::default() };
        let (mut emu, _) = emulator(vec![RunState::Dispatchable, RunState::Breakpoint], cfg);
        emu.power_on();
        let mut cycle = 0;
        emu.io_mut().write(WDTCSR, WDE, &mut cycle);
        // Wait for the monitor to time out (threshold 2 ticks)
        while emu.io().signals().reset_request().is_none() {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(emu.run().unwrap(), Exit::Breakpoint);
        let mcusr = emu.io().regs().read(MCUSR);
        assert_ne!(mcusr & WDRF, 0);
        assert_ne!(emu.io().regs().read(WDTCSR) & WDE, 0);
        assert_eq!(emu.io().regs().read(WDTCSR) & WDIE, 0);
    }

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<Vec<u8>>>>);

    impl EepromStore for Captured {
        fn commit(&mut self, data: &[u8]) -> Result<()> {
            self.0.lock().unwrap().push(data.to_vec());
            Ok(())
        }
    }

    #[test]
    fn test_eeprom_committed_at_end_of_run() {
        let port = MemoryPort::new();
        let config = quiet();
        let io = Peripherals::new(&config, Eeprom::new(16), Box::new(port.clone()), Box::new(port)).unwrap();
        let store = Captured::default();
        let mut emu = Emulator::new(Replay::new(vec![RunState::Idle]), io, config, Some(Box::new(store.clone()))).unwrap();
        emu.power_on();
        let mut cycle = 0;
        emu.io_mut().write(EEDR, 0x42, &mut cycle);
        emu.io_mut().write(EECR, EEMPE, &mut cycle);
        emu.io_mut().write(EECR, EEPE, &mut cycle);
        assert_eq!(emu.run().unwrap(), Exit::Halted);
        let commits = store.0.lock().unwrap();
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0][0], 0x42);
    }
}
