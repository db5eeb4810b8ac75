//! avrtest command-line test bench.
//!
//! Runs a bench script against the ATmega2560 peripheral model. USART0 is
//! bridged to stdin/stdout, the EEPROM can be backed by an Intel HEX file, and
//! the exit status reports the outcome:
//!
//! - `0`: the program ran to a breakpoint, halt or power-down
//! - `1`: one or more `expect` statements failed
//! - `2`: fatal error (bad configuration, script or file, failed EEPROM commit)
//!
//! On Unix, SIGINT pulls the reset pin (external reset) and SIGQUIT powers the
//! device off, which ends the run with a final EEPROM commit.
//!
//! Logging goes to stderr through `env_logger` (default level `info`, override
//! with `RUST_LOG`, e.g. `RUST_LOG=debug` for per-step dumps after a breakpoint).

use std::error::Error;
use std::path::PathBuf;
use std::process;
#[cfg(unix)]
use std::thread;
use std::time::Duration;

use avrtest_core::hex::HexEeprom;
use avrtest_core::host::{StdinSource, StdoutSink};
use avrtest_core::peripherals::{ClockSource, Eeprom, EepromStore, UartMode};
use avrtest_core::regs::{CLOCK_HZ, EEPROM_SIZE};
use avrtest_core::script::ScriptCpu;
use avrtest_core::{savestate, Config, Cpu, Emulator, Peripherals, ResetLine};
use clap::Parser;
use log::{error, info};
#[cfg(unix)]
use signal_hook::consts::{SIGINT, SIGQUIT};

#[derive(Parser, Debug)]
#[command(name = "avrtest")]
#[command(version)]
#[command(about = "ATmega2560 peripheral test bench")]
struct Cli {
    /// Bench script to run
    script: PathBuf,

    /// EEPROM image (Intel HEX), loaded at start and written back on commit
    #[arg(long, value_name = "FILE")]
    eeprom: Option<PathBuf>,

    /// Decouple USART0 from the host through ring buffers and worker threads
    #[arg(long)]
    buffered_uart: bool,

    /// Ring capacity in bytes (buffered UART)
    #[arg(long, default_value_t = 256, value_name = "BYTES")]
    uart_capacity: usize,

    /// Worker poll interval in microseconds (buffered UART)
    #[arg(long, default_value_t = 100, value_name = "US")]
    uart_poll_us: u64,

    /// Clock the synchronous timers from the host clock instead of the cycle counter
    #[arg(long)]
    realtime_timers: bool,

    /// EEPROM capacity in bytes
    #[arg(long, default_value_t = EEPROM_SIZE)]
    eeprom_size: usize,

    /// Do not start the watchdog monitor
    #[arg(long)]
    no_watchdog: bool,

    /// Watchdog monitor tick in microseconds
    #[arg(long, default_value_t = 1000, value_name = "US")]
    watchdog_tick_us: u64,

    /// Wait for an external reset instead of exiting when the core halts
    #[arg(long)]
    hold: bool,

    /// Commit dirty EEPROM contents at this interval
    #[arg(long, value_name = "MS")]
    autocommit_ms: Option<u64>,

    /// Single-step at most this many instructions after a breakpoint
    #[arg(long, value_name = "N")]
    trace_steps: Option<u64>,

    /// Print the final state summary as JSON on stdout
    #[arg(long)]
    json: bool,

    /// Restore peripheral state from this file after power-on
    #[arg(long, value_name = "FILE")]
    load_state: Option<PathBuf>,

    /// Save peripheral state to this file when the run ends
    #[arg(long, value_name = "FILE")]
    save_state: Option<PathBuf>,
}

impl Cli {
    fn config(&self) -> Config {
        let uart = if self.buffered_uart {
            UartMode::Buffered { capacity: self.uart_capacity, poll: Duration::from_micros(self.uart_poll_us) }
        } else {
            UartMode::PassThrough
        };
        let timer_clock =
            if self.realtime_timers { ClockSource::Oscillator { hz: CLOCK_HZ } } else { ClockSource::Cycles };
        Config {
            uart,
            timer_clock,
            eeprom_size: self.eeprom_size,
            watchdog: !self.no_watchdog,
            watchdog_tick: Duration::from_micros(self.watchdog_tick_us),
            hold_on_halt: self.hold,
            autocommit: self.autocommit_ms.map(Duration::from_millis),
            trace_steps: self.trace_steps,
            ..Config::default()
        }
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    match run(&cli) {
        Ok(code) => process::exit(code),
        Err(e) => {
            error!("{}", e);
            process::exit(2);
        }
    }
}

/// Apply one process signal to the reset line.
#[cfg(unix)]
fn route_signal(signal: i32, line: &ResetLine) {
    match signal {
        SIGINT => {
            info!("SIGINT: external reset");
            line.external_reset();
        }
        SIGQUIT => {
            info!("SIGQUIT: power off");
            line.power_off();
        }
        _ => {}
    }
}

#[cfg(unix)]
fn forward_signals(line: ResetLine) -> std::io::Result<()> {
    let mut signals = signal_hook::iterator::Signals::new([SIGINT, SIGQUIT])?;
    thread::Builder::new().name("signals".into()).spawn(move || {
        for signal in signals.forever() {
            route_signal(signal, &line);
        }
    })?;
    Ok(())
}

#[cfg(not(unix))]
fn forward_signals(_line: ResetLine) -> std::io::Result<()> {
    Ok(())
}

fn run(cli: &Cli) -> Result<i32, Box<dyn Error>> {
    let config = cli.config();
    config.validate()?;
    let cpu = ScriptCpu::from_file(&cli.script)?;

    let (eeprom, store): (Eeprom, Option<Box<dyn EepromStore>>) = match &cli.eeprom {
        Some(path) => {
            let (store, image) = HexEeprom::open(path, config.eeprom_size)?;
            (Eeprom::with_contents(config.eeprom_size, &image), Some(Box::new(store) as Box<dyn EepromStore>))
        }
        None => (Eeprom::new(config.eeprom_size), None),
    };

    let source = StdinSource::spawn()
        .map_err(|source| avrtest_core::Error::Thread { name: "stdin", source })?;
    let io = Peripherals::new(&config, eeprom, Box::new(source), Box::new(StdoutSink))?;
    let mut emu = Emulator::new(cpu, io, config, store)?;
    forward_signals(emu.reset_line()).map_err(|source| avrtest_core::Error::Thread { name: "signals", source })?;
    emu.power_on();

    if let Some(path) = &cli.load_state {
        let state = savestate::load_from_file(path)?;
        let cycle = emu.cpu().cycle();
        emu.io_mut().load_state(&state, cycle)?;
        info!("restored {}", path.display());
    }

    let exit = emu.run()?;
    info!("exit: {:?} after {} cycles", exit, emu.cpu().cycle());

    if let Some(path) = &cli.save_state {
        savestate::save_to_file(&emu.io().save_state(), path)?;
        info!("saved {}", path.display());
    }

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&emu.summary())?);
    }

    let failures = emu.cpu().failures();
    if failures.is_empty() {
        Ok(0)
    } else {
        for f in failures {
            error!("{}", f);
        }
        error!("{} expectation(s) failed", failures.len());
        Ok(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_map_to_config() {
        let cli = Cli::parse_from(["avrtest", "bench.txt"]);
        let cfg = cli.config();
        cfg.validate().unwrap();
        assert_eq!(cfg.uart, UartMode::PassThrough);
        assert!(cfg.watchdog);
        assert_eq!(cfg.watchdog_tick, Duration::from_millis(1));
        assert_eq!(cfg.eeprom_size, EEPROM_SIZE);
        assert!(cfg.autocommit.is_none());
    }

    #[test]
    fn test_flags_map_to_config() {
        let cli = Cli::parse_from([
            "avrtest",
            "bench.txt",
            "--buffered-uart",
            "--uart-capacity",
            "32",
            "--realtime-timers",
            "--no-watchdog",
            "--hold",
            "--autocommit-ms",
            "250",
            "--trace-steps",
            "10",
        ]);
        let cfg = cli.config();
        assert_eq!(cfg.uart, UartMode::Buffered { capacity: 32, poll: Duration::from_micros(100) });
        assert!(matches!(cfg.timer_clock, ClockSource::Oscillator { hz: CLOCK_HZ }));
        assert!(!cfg.watchdog);
        assert!(cfg.hold_on_halt);
        assert_eq!(cfg.autocommit, Some(Duration::from_millis(250)));
        assert_eq!(cfg.trace_steps, Some(10));
    }

    #[test]
    fn test_bad_capacity_rejected() {
        let cli = Cli::parse_from(["avrtest", "bench.txt", "--buffered-uart", "--uart-capacity", "0"]);
        assert!(cli.config().validate().is_err());
    }

    #[cfg(unix)]
    fn bench(script: &str, hold: bool) -> Emulator<ScriptCpu> {
        use avrtest_core::host::MemoryPort;
        let config = Config { watchdog: false, hold_on_halt: hold, ..Config::default() };
        let port = MemoryPort::new();
        let io = Peripherals::new(&config, Eeprom::new(config.eeprom_size), Box::new(port.clone()), Box::new(port))
            .unwrap();
        let mut emu = Emulator::new(ScriptCpu::parse(script).unwrap(), io, config, None).unwrap();
        emu.power_on();
        emu
    }

    #[cfg(unix)]
    #[test]
    fn test_sigint_is_external_reset() {
        use avrtest_core::regs::{EXTRF, MCUSR, PORF};
        let mut emu = bench("brset MCUSR 0x02 again\ncli\nsleep\nagain: break\n", true);
        route_signal(SIGINT, &emu.reset_line());
        assert_eq!(emu.run().unwrap(), avrtest_core::Exit::Breakpoint);
        assert_eq!(emu.io().regs().read(MCUSR), PORF | EXTRF);
    }

    #[cfg(unix)]
    #[test]
    fn test_sigquit_powers_off() {
        let mut emu = bench("sei\nspin\n", false);
        route_signal(SIGQUIT, &emu.reset_line());
        assert_eq!(emu.run().unwrap(), avrtest_core::Exit::PoweredDown);
    }

    #[cfg(unix)]
    #[test]
    fn test_other_signals_ignored() {
        let emu = bench("break\n", false);
        route_signal(signal_hook::consts::SIGTERM, &emu.reset_line());
        assert!(!emu.io().signals().is_pending());
    }
}
