//! End-to-end runs: scripted programs driving the peripherals through the
//! emulator's run loop.

use std::thread;
use std::time::Duration;

use avrtest_core::hex::{parse_hex, write_hex, HexEeprom};
use avrtest_core::host::MemoryPort;
use avrtest_core::peripherals::{Eeprom, UartMode};
use avrtest_core::regs::*;
use avrtest_core::script::ScriptCpu;
use avrtest_core::{Config, Cpu, Emulator, Exit, Peripherals};

fn quiet() -> Config {
    Config { watchdog: false, ..Config::default() }
}

fn emulator(script: &str, config: Config) -> (Emulator<ScriptCpu>, MemoryPort) {
    let port = MemoryPort::new();
    let cpu = ScriptCpu::parse(script).unwrap();
    let io = Peripherals::new(&config, Eeprom::new(config.eeprom_size), Box::new(port.clone()), Box::new(port.clone()))
        .unwrap();
    let mut emu = Emulator::new(cpu, io, config, None).unwrap();
    emu.power_on();
    (emu, port)
}

#[test]
fn test_timer0_overflow_wakes_sleeping_program() {
    let script = "
        out TIMSK0 0x01
        out TCCR0B 0x02      ; clk/8: one overflow per 2048 cycles
        sei
idle:   sleep
        brclr GPIOR0 0x01 idle
        break

isr TIMER0_OVF
        out GPIOR0 0x01
end
";
    let (mut emu, _) = emulator(script, quiet());
    assert_eq!(emu.run().unwrap(), Exit::Breakpoint);
    assert_eq!(emu.cpu().vectors(), &[TIMER0_OVF_VECTOR]);
    assert!(emu.cpu().cycle() >= 2048);
    assert!(emu.cpu().cycle() < 2048 + 64);
}

#[test]
fn test_eeprom_write_only_mode_ands_into_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("eeprom.hex");
    let mut initial = vec![0xFF; 16];
    initial[0] = 0x0F;
    std::fs::write(&path, write_hex(&initial)).unwrap();

    let config = quiet();
    let (store, image) = HexEeprom::open(&path, config.eeprom_size).unwrap();
    assert_eq!(store.persistent_len(), 16);
    let port = MemoryPort::new();
    let io = Peripherals::new(
        &config,
        Eeprom::with_contents(config.eeprom_size, &image),
        Box::new(port.clone()),
        Box::new(port),
    )
    .unwrap();
    let script = "
        out EEARL 0
        out EEDR 0xAB
        out EECR 0x24        ; EEPM1 | EEMPE
        out EECR 0x22        ; EEPM1 | EEPE
        out EECR 0x01        ; EERE
        expect EEDR 0x0B
";
    let mut emu = Emulator::new(ScriptCpu::parse(script).unwrap(), io, config, Some(Box::new(store))).unwrap();
    emu.power_on();
    assert_eq!(emu.run().unwrap(), Exit::Halted);
    assert!(emu.cpu().passed(), "{:?}", emu.cpu().failures());

    let mut saved = vec![0xFF; 16];
    let n = parse_hex(&std::fs::read_to_string(&path).unwrap(), &mut saved).unwrap();
    assert_eq!(n, 16);
    assert_eq!(saved[0], 0x0B);
    assert_eq!(&saved[1..], &initial[1..]);
}

#[test]
fn test_program_enable_too_late_is_ignored() {
    let script = "
        out EEDR 0x00
        out EECR 0x04        ; EEMPE
        cycles 5
        out EECR 0x02        ; EEPE outside the window
        expect EECR 0x00
";
    let (mut emu, _) = emulator(script, quiet());
    assert_eq!(emu.run().unwrap(), Exit::Halted);
    assert!(emu.cpu().passed(), "{:?}", emu.cpu().failures());
    assert_eq!(emu.io().eeprom().data()[0], 0xFF);
    assert!(!emu.io().eeprom().is_dirty());
}

#[test]
fn test_watchdog_reset_restarts_program() {
    let script = "
        brset MCUSR 0x08 rebooted
        out WDTCSR 0x08      ; system reset mode, shortest period
        sei
        spin
rebooted:
        expect MCUSR 0x09
        expect WDTCSR 0x08 0x08
        break
";
    let config = Config { watchdog_tick: Duration::from_millis(1), ..Config::default() };
    let (mut emu, _) = emulator(script, config);
    assert_eq!(emu.run().unwrap(), Exit::Breakpoint);
    assert!(emu.cpu().passed(), "{:?}", emu.cpu().failures());
    assert!(emu.cpu().vectors().is_empty());
}

#[test]
fn test_watchdog_interrupt_mode_vectors() {
    let script = "
        out WDTCSR 0x18      ; WDCE | WDE
        out WDTCSR 0x40      ; WDIE only
        sei
idle:   sleep
        brclr GPIOR0 0x01 idle
        expect WDTCSR 0x40
        break

isr WDT
        out GPIOR0 0x01
end
";
    let config = Config { watchdog_tick: Duration::from_millis(1), ..Config::default() };
    let (mut emu, _) = emulator(script, config);
    assert_eq!(emu.run().unwrap(), Exit::Breakpoint);
    assert!(emu.cpu().passed(), "{:?}", emu.cpu().failures());
    assert_eq!(emu.cpu().vectors(), &[WDT_VECTOR]);
    assert_eq!(emu.io().regs().read(MCUSR), PORF);
}

#[test]
fn test_pass_through_output() {
    let (mut emu, port) = emulator("send \"hello\\n\"\nbreak\n", quiet());
    assert_eq!(emu.run().unwrap(), Exit::Breakpoint);
    assert_eq!(port.output(), b"hello\n");
}

#[test]
fn test_buffered_echo() {
    let script = "
        wait UCSR0A 0x80     ; RXC
        expect UDR0 0x78
        send \"ok\"
        break
";
    let config = Config {
        uart: UartMode::Buffered { capacity: 16, poll: Duration::from_micros(100) },
        ..quiet()
    };
    let (mut emu, port) = emulator(script, config);
    port.feed(b"x");
    assert_eq!(emu.run().unwrap(), Exit::Breakpoint);
    assert!(emu.cpu().passed(), "{:?}", emu.cpu().failures());
    // Dropping the emulator flushes the transmit ring
    drop(emu);
    assert_eq!(port.output(), b"ok");
}

#[test]
fn test_external_reset_releases_held_core() {
    let script = "
        brset MCUSR 0x02 again
        cli
        sleep
again:  break
";
    let config = Config { hold_on_halt: true, ..quiet() };
    let (mut emu, _) = emulator(script, config);
    let line = emu.reset_line();
    let handle = thread::spawn(move || {
        thread::sleep(Duration::from_millis(10));
        line.external_reset();
    });
    assert_eq!(emu.run().unwrap(), Exit::Breakpoint);
    handle.join().unwrap();
    assert_eq!(emu.io().regs().read(MCUSR), PORF | EXTRF);
}

#[test]
fn test_power_off_ends_run() {
    let (mut emu, _) = emulator("sei\nspin\n", quiet());
    let line = emu.reset_line();
    let handle = thread::spawn(move || {
        thread::sleep(Duration::from_millis(10));
        line.power_off();
    });
    assert_eq!(emu.run().unwrap(), Exit::PoweredDown);
    handle.join().unwrap();
    assert_ne!(emu.io().regs().read(MCUSR) & BORF, 0);
}

#[test]
fn test_timer_demo_script() {
    let (mut emu, _) = emulator(include_str!("../../../demos/timer_overflow.avt"), quiet());
    assert_eq!(emu.run().unwrap(), Exit::Breakpoint);
    assert_eq!(emu.cpu().vectors(), &[TIMER0_OVF_VECTOR; 4]);
    // Four toggles leave PB7 where it started
    assert_eq!(emu.io().regs().read(PORTB), 0);
}
