//! The contract between the peripheral subsystem and an instruction executor.
//!
//! Decoding and executing AVR instructions is the executor's business. What
//! the emulator needs from it is small: a cycle counter, register accesses
//! routed through [`Peripherals`], and a run loop that stops when the
//! interrupt line or the halt signal asks it to.

use serde::Serialize;

use crate::io::Peripherals;

/// Why [`Cpu::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// The interrupt line is asserted with I set, or a halt was forced. The
    /// return address is on the stack and I is clear; a vector must be chosen.
    Dispatchable,
    /// SLEEP: nothing to do until an interrupt arrives.
    Idle,
    /// BREAK, or the program ran off its end.
    Breakpoint,
    /// A jump to itself. Only an interrupt or reset gets the core out.
    Spinlocked,
}

/// Executor registers, for debug dumps.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CpuState {
    /// Program counter (word address)
    pub pc: u32,
    pub sp: u16,
    pub sreg: u8,
    /// R0..R31
    pub regs: [u8; 32],
}

/// An AVR instruction executor.
pub trait Cpu {
    /// Execute until something needs the emulator's attention.
    ///
    /// Implementations must check `io.signals()` between instructions: when
    /// `take_halt()` reports a forced halt, or the line is pending with I set,
    /// they push the return address, clear I and return `Dispatchable`.
    fn run(&mut self, io: &mut Peripherals) -> RunState;

    /// Execute a single instruction. Returns false when there is nothing left
    /// to execute.
    fn step(&mut self, io: &mut Peripherals) -> bool;

    /// Reset the core: PC to the reset vector, SREG and registers cleared.
    fn reset(&mut self);

    /// Monotonic cycle counter.
    fn cycle(&self) -> u64;

    /// Let `cycles` pass without executing anything.
    fn advance(&mut self, cycles: u64);

    /// SREG.I
    fn interrupts_enabled(&self) -> bool;

    /// Jump to an interrupt vector (word address).
    fn enter_vector(&mut self, vector: u16);

    /// RETI: pop the return address and set I.
    fn return_from_interrupt(&mut self);

    fn state(&self) -> CpuState;
}
