//! Scripted executor.
//!
//! [`ScriptCpu`] drives the peripherals from a small line-oriented script
//! instead of AVR machine code. Every statement costs at least one cycle and
//! goes through the same hooked register access a real core would use, so
//! scripts exercise timers, the watchdog, the UART and the EEPROM exactly as
//! firmware does.
//!
//! ```text
//! ; comments start with a semicolon
//!         out   TIMSK0 0x01        ; write a register (name or address)
//!         out   TCCR0B 1
//!         sei
//! idle:   sleep                    ; labels end with a colon
//!         brclr GPIOR0 0x01 idle   ; branch while the bit is clear
//!         send  "ok\n"             ; transmit through USART0
//!         expect TCNT0 0x10 0xF0   ; compare under an optional mask
//!         break
//!
//! isr TIMER0_OVF                   ; handler for a vector (name or address)
//!         out   GPIOR0 0x01
//! end                              ; return from interrupt
//! ```
//!
//! Statements: `out REG VAL`, `in REG`, `expect REG VAL [MASK]`, `cycles N`,
//! `wait REG MASK`, `brset REG MASK LABEL`, `brclr REG MASK LABEL`,
//! `jmp LABEL`, `send "TEXT"`, `wdr`, `sei`, `cli`, `sleep`, `break`, `spin`.
//! Running off the end of the main program is `cli; sleep`.

use std::collections::HashMap;
use std::path::Path;

use log::warn;

use crate::cpu::{Cpu, CpuState, RunState};
use crate::debugger::{io_addr, io_name};
use crate::error::{Error, Result};
use crate::io::Peripherals;
use crate::peripherals::uart::UDRE;
use crate::regs::*;

/// Vector names accepted after `isr`.
const VECTOR_NAMES: [(&str, u16); 8] = [
    ("WDT", WDT_VECTOR),
    ("TIMER2_OVF", TIMER2_OVF_VECTOR),
    ("TIMER1_OVF", TIMER1_OVF_VECTOR),
    ("TIMER0_OVF", TIMER0_OVF_VECTOR),
    ("USART0_RX", USART0_RX_VECTOR),
    ("USART0_UDRE", USART0_UDRE_VECTOR),
    ("USART0_TX", USART0_TX_VECTOR),
    ("EE_READY", EE_READY_VECTOR),
];

/// Stack pointer at reset (top of internal SRAM).
const RAMEND: u16 = 0x21FF;
/// Register `in` loads into.
const ACCUMULATOR: usize = 24;

#[derive(Debug, Clone, PartialEq)]
enum Op {
    Out(u8, u8),
    In(u8),
    Expect { addr: u8, value: u8, mask: u8 },
    Delay(u64),
    Wait { addr: u8, mask: u8 },
    Branch { addr: u8, mask: u8, set: bool, target: usize },
    Jump(usize),
    Wdr,
    Sei,
    Cli,
    Sleep,
    Break,
    Spin,
    Reti,
    /// End of the main program
    End,
}

/// Return address pushed on interrupt entry. A `cycles` statement that was
/// interrupted resumes with what it had left.
#[derive(Debug, Clone, Copy)]
struct Frame {
    pc: usize,
    delay: Option<u64>,
}

pub struct ScriptCpu {
    ops: Vec<Op>,
    lines: Vec<usize>,
    handlers: HashMap<u16, usize>,
    pc: usize,
    sreg: u8,
    stack: Vec<Frame>,
    delay: Option<u64>,
    cycle: u64,
    regs: [u8; 32],
    vectors: Vec<u16>,
    failures: Vec<String>,
}

impl ScriptCpu {
    pub fn parse(text: &str) -> Result<Self> {
        let program = Parser::default().parse(text)?;
        Ok(ScriptCpu {
            ops: program.ops,
            lines: program.lines,
            handlers: program.handlers,
            pc: 0,
            sreg: 0,
            stack: Vec::new(),
            delay: None,
            cycle: 0,
            regs: [0; 32],
            vectors: Vec::new(),
            failures: Vec::new(),
        })
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        Self::parse(&text)
    }

    /// Every vector entered so far, in order.
    pub fn vectors(&self) -> &[u16] {
        &self.vectors
    }

    /// Failed `expect` statements.
    pub fn failures(&self) -> &[String] {
        &self.failures
    }

    pub fn passed(&self) -> bool {
        self.failures.is_empty()
    }

    fn io_read(&mut self, io: &mut Peripherals, addr: u8) -> u8 {
        let v = io.read(addr, &mut self.cycle);
        self.cycle += 1;
        v
    }

    /// Execute the statement at `pc`. Returns `Some` when `run` must return.
    fn exec(&mut self, io: &mut Peripherals) -> Option<RunState> {
        let op = self.ops[self.pc].clone();
        let mut next = self.pc + 1;
        let mut stop = None;
        match op {
            Op::Out(addr, value) => {
                io.write(addr, value, &mut self.cycle);
                self.cycle += 1;
            }
            Op::In(addr) => {
                let v = self.io_read(io, addr);
                self.regs[ACCUMULATOR] = v;
            }
            Op::Expect { addr, value, mask } => {
                let got = self.io_read(io, addr);
                if got & mask != value & mask {
                    let name = io_name(addr).map_or_else(|| format!("{:#04x}", addr), str::to_string);
                    let msg = format!(
                        "line {}: {} = {:#04x}, expected {:#04x} (mask {:#04x})",
                        self.lines[self.pc], name, got, value, mask
                    );
                    warn!("{}", msg);
                    self.failures.push(msg);
                }
            }
            Op::Delay(n) => {
                let left = self.delay.take().unwrap_or(n);
                if left > 1 {
                    next = self.pc;
                    self.delay = Some(left - 1);
                }
                if left > 0 {
                    self.cycle += 1;
                    io.poll(self.cycle);
                }
            }
            Op::Wait { addr, mask } => {
                if self.io_read(io, addr) & mask == 0 {
                    next = self.pc;
                }
            }
            Op::Branch { addr, mask, set, target } => {
                if (self.io_read(io, addr) & mask != 0) == set {
                    next = target;
                }
            }
            Op::Jump(target) => {
                self.cycle += 2;
                next = target;
            }
            Op::Wdr => {
                io.watchdog_reset();
                self.cycle += 1;
            }
            Op::Sei => {
                self.sreg |= SREG_I;
                self.cycle += 1;
            }
            Op::Cli => {
                self.sreg &= !SREG_I;
                self.cycle += 1;
            }
            Op::Sleep => {
                self.cycle += 1;
                stop = Some(RunState::Idle);
            }
            Op::Break => {
                self.cycle += 1;
                stop = Some(RunState::Breakpoint);
            }
            Op::Spin => {
                self.cycle += 2;
                next = self.pc;
                stop = Some(RunState::Spinlocked);
            }
            Op::Reti => {
                self.cycle += 4;
                self.return_from_interrupt();
                return None;
            }
            Op::End => {
                self.sreg &= !SREG_I;
                next = self.pc;
                stop = Some(RunState::Idle);
            }
        }
        self.pc = next;
        stop
    }
}

impl Cpu for ScriptCpu {
    fn run(&mut self, io: &mut Peripherals) -> RunState {
        loop {
            let halted = io.signals().take_halt();
            if halted || (io.signals().is_pending() && self.interrupts_enabled()) {
                self.stack.push(Frame { pc: self.pc, delay: self.delay.take() });
                self.sreg &= !SREG_I;
                return RunState::Dispatchable;
            }
            if let Some(state) = self.exec(io) {
                return state;
            }
        }
    }

    fn step(&mut self, io: &mut Peripherals) -> bool {
        match self.ops[self.pc] {
            Op::End | Op::Spin => false,
            _ => {
                self.exec(io);
                true
            }
        }
    }

    fn reset(&mut self) {
        self.pc = 0;
        self.sreg = 0;
        self.stack.clear();
        self.delay = None;
        self.regs = [0; 32];
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
        self.cycle += 5;
        match self.handlers.get(&vector) {
            Some(&start) => self.pc = start,
            None => {
                warn!("no handler for vector {:#06x}", vector);
                self.return_from_interrupt();
            }
        }
    }

    fn return_from_interrupt(&mut self) {
        if let Some(frame) = self.stack.pop() {
            self.pc = frame.pc;
            self.delay = frame.delay;
        }
        self.sreg |= SREG_I;
    }

    fn state(&self) -> CpuState {
        CpuState {
            pc: self.pc as u32,
            // Nesting deeper than SRAM pins SP at the bottom
            sp: RAMEND.saturating_sub(u16::try_from(2 * self.stack.len()).unwrap_or(u16::MAX)),
            sreg: self.sreg,
            regs: self.regs,
        }
    }
}

// ─── Parser ─────────────────────────────────────────────────────────────────

struct Program {
    ops: Vec<Op>,
    lines: Vec<usize>,
    handlers: HashMap<u16, usize>,
}

/// Main program and handler blocks are collected separately and laid out
/// main first, so the main program falls into `End` rather than a handler.
#[derive(Default)]
struct Parser {
    main: Vec<(Op, usize)>,
    blocks: Vec<(u16, Vec<(Op, usize)>)>,
    in_block: bool,
    /// label -> (block index or None for main, index within it)
    labels: HashMap<String, (Option<usize>, usize)>,
    /// (block, index, label, line) of branches to patch
    fixups: Vec<(Option<usize>, usize, String, usize)>,
}

fn err(line: usize, message: impl Into<String>) -> Error {
    Error::Script { line, message: message.into() }
}

fn parse_number(tok: &str, line: usize) -> Result<u64> {
    let lower = tok.to_ascii_lowercase();
    let parsed = if let Some(hex) = lower.strip_prefix("0x") {
        u64::from_str_radix(hex, 16)
    } else if let Some(bin) = lower.strip_prefix("0b") {
        u64::from_str_radix(bin, 2)
    } else {
        lower.parse()
    };
    parsed.map_err(|_| err(line, format!("bad number '{}'", tok)))
}

fn parse_byte(tok: &str, line: usize) -> Result<u8> {
    let n = parse_number(tok, line)?;
    u8::try_from(n).map_err(|_| err(line, format!("{} does not fit in a byte", tok)))
}

fn parse_reg(tok: &str, line: usize) -> Result<u8> {
    match io_addr(tok) {
        Some(addr) => Ok(addr),
        None => parse_byte(tok, line).map_err(|_| err(line, format!("unknown register '{}'", tok))),
    }
}

fn parse_vector(tok: &str, line: usize) -> Result<u16> {
    let upper = tok.to_ascii_uppercase();
    let name = upper.strip_suffix("_VECT").unwrap_or(&upper);
    if let Some(&(_, v)) = VECTOR_NAMES.iter().find(|(n, _)| *n == name) {
        return Ok(v);
    }
    let n = parse_number(tok, line).map_err(|_| err(line, format!("unknown vector '{}'", tok)))?;
    u16::try_from(n).map_err(|_| err(line, format!("vector {} out of range", tok)))
}

/// Strip a `;` comment that is not inside a quoted string.
fn strip_comment(line: &str) -> &str {
    let mut quoted = false;
    let mut escaped = false;
    for (i, c) in line.char_indices() {
        match c {
            _ if escaped => escaped = false,
            '\\' if quoted => escaped = true,
            '"' => quoted = !quoted,
            ';' if !quoted => return &line[..i],
            _ => {}
        }
    }
    line
}

fn parse_text(rest: &str, line: usize) -> Result<Vec<u8>> {
    let inner = rest
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .ok_or_else(|| err(line, "send expects a quoted string"))?;
    let mut out = Vec::new();
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            let mut buf = [0u8; 4];
            out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            continue;
        }
        match chars.next() {
            Some('n') => out.push(b'\n'),
            Some('r') => out.push(b'\r'),
            Some('t') => out.push(b'\t'),
            Some('0') => out.push(0),
            Some('\\') => out.push(b'\\'),
            Some('"') => out.push(b'"'),
            Some(other) => return Err(err(line, format!("unknown escape '\\{}'", other))),
            None => return Err(err(line, "dangling backslash")),
        }
    }
    Ok(out)
}

impl Parser {
    fn current(&mut self) -> (Option<usize>, &mut Vec<(Op, usize)>) {
        if self.in_block {
            let k = self.blocks.len() - 1;
            (Some(k), &mut self.blocks[k].1)
        } else {
            (None, &mut self.main)
        }
    }

    fn emit(&mut self, op: Op, line: usize) {
        self.current().1.push((op, line));
    }

    fn emit_branch(&mut self, op: Op, label: &str, line: usize) {
        let (block, ops) = self.current();
        let index = ops.len();
        ops.push((op, line));
        self.fixups.push((block, index, label.to_string(), line));
    }

    fn parse(mut self, text: &str) -> Result<Program> {
        let mut open_block = 0;
        for (n, raw) in text.lines().enumerate() {
            let line = n + 1;
            let mut code = strip_comment(raw).trim();

            // Leading label
            if let Some((label, rest)) = code.split_once(':') {
                let label = label.trim();
                if !label.is_empty() && !label.contains(char::is_whitespace) && !label.contains('"') {
                    let (block, ops) = self.current();
                    let at = (block, ops.len());
                    if self.labels.insert(label.to_string(), at).is_some() {
                        return Err(err(line, format!("duplicate label '{}'", label)));
                    }
                    code = rest.trim();
                }
            }
            if code.is_empty() {
                continue;
            }

            let (word, rest) = code.split_once(char::is_whitespace).unwrap_or((code, ""));
            let rest = rest.trim();
            let args: Vec<&str> = rest.split_whitespace().collect();
            let want = |k: usize| -> Result<()> {
                if args.len() == k {
                    Ok(())
                } else {
                    Err(err(line, format!("{} takes {} argument(s), got {}", word, k, args.len())))
                }
            };

            match word.to_ascii_lowercase().as_str() {
                "isr" => {
                    want(1)?;
                    if self.in_block {
                        return Err(err(line, "isr blocks cannot nest"));
                    }
                    let vector = parse_vector(args[0], line)?;
                    if self.blocks.iter().any(|(v, _)| *v == vector) {
                        return Err(err(line, format!("second handler for vector {:#06x}", vector)));
                    }
                    self.blocks.push((vector, Vec::new()));
                    self.in_block = true;
                    open_block = line;
                }
                "end" => {
                    want(0)?;
                    if !self.in_block {
                        return Err(err(line, "end outside an isr block"));
                    }
                    self.emit(Op::Reti, line);
                    self.in_block = false;
                }
                "out" => {
                    want(2)?;
                    let op = Op::Out(parse_reg(args[0], line)?, parse_byte(args[1], line)?);
                    self.emit(op, line);
                }
                "in" => {
                    want(1)?;
                    let op = Op::In(parse_reg(args[0], line)?);
                    self.emit(op, line);
                }
                "expect" => {
                    if args.len() != 2 && args.len() != 3 {
                        return Err(err(line, "expect takes a register, a value and an optional mask"));
                    }
                    let mask = match args.get(2) {
                        Some(m) => parse_byte(m, line)?,
                        None => 0xFF,
                    };
                    let op = Op::Expect { addr: parse_reg(args[0], line)?, value: parse_byte(args[1], line)?, mask };
                    self.emit(op, line);
                }
                "cycles" => {
                    want(1)?;
                    let op = Op::Delay(parse_number(args[0], line)?);
                    self.emit(op, line);
                }
                "wait" => {
                    want(2)?;
                    let op = Op::Wait { addr: parse_reg(args[0], line)?, mask: parse_byte(args[1], line)? };
                    self.emit(op, line);
                }
                "brset" | "brclr" => {
                    want(3)?;
                    let op = Op::Branch {
                        addr: parse_reg(args[0], line)?,
                        mask: parse_byte(args[1], line)?,
                        set: word.eq_ignore_ascii_case("brset"),
                        target: 0,
                    };
                    self.emit_branch(op, args[2], line);
                }
                "jmp" => {
                    want(1)?;
                    self.emit_branch(Op::Jump(0), args[0], line);
                }
                "send" => {
                    for byte in parse_text(rest, line)? {
                        self.emit(Op::Wait { addr: UCSR0A, mask: UDRE }, line);
                        self.emit(Op::Out(UDR0, byte), line);
                    }
                }
                simple => {
                    want(0)?;
                    let op = match simple {
                        "wdr" => Op::Wdr,
                        "sei" => Op::Sei,
                        "cli" => Op::Cli,
                        "sleep" => Op::Sleep,
                        "break" => Op::Break,
                        "spin" => Op::Spin,
                        "reti" if self.in_block => Op::Reti,
                        _ => return Err(err(line, format!("unknown statement '{}'", word))),
                    };
                    self.emit(op, line);
                }
            }
        }
        if self.in_block {
            return Err(err(open_block, "isr block is missing its end"));
        }
        self.link(text.lines().count() + 1)
    }

    /// Lay out main and handler blocks and resolve branch targets.
    fn link(self, end_line: usize) -> Result<Program> {
        let mut ops = Vec::new();
        let mut lines = Vec::new();
        for (op, line) in self.main {
            ops.push(op);
            lines.push(line);
        }
        ops.push(Op::End);
        lines.push(end_line);

        let mut bases = Vec::with_capacity(self.blocks.len());
        let mut handlers = HashMap::new();
        for (vector, block) in self.blocks {
            bases.push(ops.len());
            handlers.insert(vector, ops.len());
            for (op, line) in block {
                ops.push(op);
                lines.push(line);
            }
        }
        let resolve = |(block, index): (Option<usize>, usize)| match block {
            Some(k) => bases[k] + index,
            None => index,
        };

        for (block, index, label, line) in self.fixups {
            let at = self.labels.get(&label).copied().ok_or_else(|| err(line, format!("unknown label '{}'", label)))?;
            let target = resolve(at);
            match &mut ops[resolve((block, index))] {
                Op::Branch { target: t, .. } | Op::Jump(t) => *t = target,
                _ => {}
            }
        }
        Ok(Program { ops, lines, handlers })
    }
}
