//! USART0 connected to the host.
//!
//! Two models are available:
//!
//! - **Pass-through**: UDR0 writes go straight to the host sink and UDR0
//!   reads poll the host source. UDRE is always set; RXC is set only while a
//!   byte is actually waiting.
//! - **Buffered**: TX and RX rings serviced by worker threads at a fixed
//!   interval, which gives software a UART that takes time to drain and
//!   exercises its flow control.
//!
//! Interrupts are edge triggered: the line is raised only when a status flag
//! whose interrupt is enabled becomes set, never again for a condition that is
//! already standing.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::host::{ByteSink, ByteSource, HostByte};
use crate::memory::{RegisterFile, Signals};
use crate::peripherals::ring::ByteRing;
use crate::regs::{UCSR0A, UCSR0B, UDR0};

/// UCSR0A status bits; UCSR0B holds the matching enables at the same positions.
pub const RXC: u8 = 0x80;
pub const TXC: u8 = 0x40;
pub const UDRE: u8 = 0x20;
pub const U2X: u8 = 0x02;
pub const MPCM: u8 = 0x01;
const STATUS: u8 = RXC | TXC | UDRE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UartMode {
    PassThrough,
    Buffered { capacity: usize, poll: Duration },
}

impl Default for UartMode {
    fn default() -> Self {
        UartMode::PassThrough
    }
}

/// Set status bits and raise the line if that enabled a new condition.
fn raise_status(regs: &RegisterFile, signals: &Signals, bits: u8) {
    let prev = regs.set_bits(UCSR0A, bits);
    let ctrl = regs.read(UCSR0B);
    let before = prev & ctrl & STATUS;
    let after = (prev | bits) & ctrl & STATUS;
    if after & !before != 0 {
        signals.raise();
    }
}

enum Backend {
    PassThrough {
        source: Box<dyn ByteSource>,
        sink: Box<dyn ByteSink>,
        peeked: Option<u8>,
    },
    Buffered {
        tx: Arc<ByteRing>,
        rx: Arc<ByteRing>,
        workers: Vec<Worker>,
    },
}

pub struct Uart {
    regs: Arc<RegisterFile>,
    signals: Arc<Signals>,
    backend: Backend,
}

impl Uart {
    pub fn pass_through(
        regs: Arc<RegisterFile>,
        signals: Arc<Signals>,
        source: Box<dyn ByteSource>,
        sink: Box<dyn ByteSink>,
    ) -> Self {
        let uart = Uart { regs, signals, backend: Backend::PassThrough { source, sink, peeked: None } };
        uart.regs.set_bits(UCSR0A, UDRE);
        uart
    }

    /// Buffered UART with its two worker threads running.
    pub fn buffered(
        regs: Arc<RegisterFile>,
        signals: Arc<Signals>,
        capacity: usize,
        poll: Duration,
        source: Box<dyn ByteSource>,
        sink: Box<dyn ByteSink>,
    ) -> io::Result<Self> {
        let (mut uart, tx_worker, rx_worker) = Uart::buffered_detached(regs, signals, capacity, source, sink);
        let workers = vec![Worker::spawn_tx(tx_worker, poll)?, Worker::spawn_rx(rx_worker, poll)?];
        if let Backend::Buffered { workers: slot, .. } = &mut uart.backend {
            *slot = workers;
        }
        Ok(uart)
    }

    /// Buffered UART whose workers are driven by the caller.
    pub fn buffered_detached(
        regs: Arc<RegisterFile>,
        signals: Arc<Signals>,
        capacity: usize,
        source: Box<dyn ByteSource>,
        sink: Box<dyn ByteSink>,
    ) -> (Self, TxWorker, RxWorker) {
        let tx = Arc::new(ByteRing::new(capacity));
        let rx = Arc::new(ByteRing::new(capacity));
        let tx_worker = TxWorker { ring: tx.clone(), regs: regs.clone(), signals: signals.clone(), sink };
        let rx_worker = RxWorker { ring: rx.clone(), regs: regs.clone(), signals: signals.clone(), source };
        regs.set_bits(UCSR0A, UDRE);
        let uart = Uart { regs, signals, backend: Backend::Buffered { tx, rx, workers: Vec::new() } };
        (uart, tx_worker, rx_worker)
    }

    pub fn mode_name(&self) -> &'static str {
        match self.backend {
            Backend::PassThrough { .. } => "pass-through",
            Backend::Buffered { .. } => "buffered",
        }
    }

    /// Fill levels of the TX and RX rings, buffered mode only.
    pub fn queue_depths(&self) -> Option<(usize, usize)> {
        match &self.backend {
            Backend::PassThrough { .. } => None,
            Backend::Buffered { tx, rx, .. } => Some((tx.len(), rx.len())),
        }
    }

    /// Bring UCSR0A up to date with the host side.
    pub fn refresh(&mut self) {
        let regs = &self.regs;
        let signals = &self.signals;
        match &mut self.backend {
            Backend::PassThrough { source, peeked, .. } => {
                if regs.read(UCSR0A) & RXC == 0 {
                    if peeked.is_none() {
                        if let HostByte::Byte(b) = source.poll_byte() {
                            *peeked = Some(b);
                        }
                    }
                    if peeked.is_some() {
                        raise_status(regs, signals, RXC | UDRE);
                        return;
                    }
                }
                raise_status(regs, signals, UDRE);
            }
            Backend::Buffered { tx, rx, .. } => {
                let mut bits = 0;
                if !rx.is_empty() {
                    bits |= RXC;
                }
                if !tx.is_full() {
                    bits |= UDRE;
                }
                if bits != 0 {
                    raise_status(regs, signals, bits);
                }
            }
        }
    }

    /// UDR0 read.
    pub fn read_data(&mut self) -> u8 {
        let value = match &mut self.backend {
            Backend::PassThrough { source, peeked, .. } => {
                let byte = match peeked.take() {
                    Some(b) => Some(b),
                    None => match source.poll_byte() {
                        HostByte::Byte(b) => Some(b),
                        _ => None,
                    },
                };
                self.regs.clear_bits(UCSR0A, RXC);
                byte.unwrap_or(0xFF)
            }
            Backend::Buffered { rx, .. } => {
                let byte = rx.pop();
                if rx.is_empty() {
                    self.regs.clear_bits(UCSR0A, RXC);
                }
                // An empty receiver keeps returning the last byte
                byte.unwrap_or_else(|| self.regs.read(UDR0))
            }
        };
        self.regs.write(UDR0, value);
        self.refresh();
        value
    }

    /// UDR0 write.
    pub fn write_data(&mut self, value: u8) {
        self.regs.write(UDR0, value);
        match &mut self.backend {
            Backend::PassThrough { sink, .. } => {
                if let Err(e) = sink.put(value) {
                    warn!("uart output: {}", e);
                }
                raise_status(&self.regs, &self.signals, TXC | UDRE);
            }
            Backend::Buffered { tx, .. } => {
                self.regs.clear_bits(UCSR0A, TXC | UDRE);
                match tx.push(value) {
                    Ok(()) => {
                        if !tx.is_full() {
                            raise_status(&self.regs, &self.signals, TXC | UDRE);
                        }
                    }
                    Err(b) => debug!("uart flow control: tx ring full, dropped {:#04x}", b),
                }
            }
        }
    }

    /// UCSR0A write: only MPCM and U2X are writable, TXC is write-one-to-clear.
    pub fn write_status(&mut self, value: u8) {
        self.regs.update(UCSR0A, |prev| {
            let kept = prev & !(TXC | U2X | MPCM);
            kept | (((value & (TXC | U2X | MPCM)) | (!prev & TXC)) ^ TXC)
        });
    }

    /// UCSR0B write. Enabling an interrupt whose condition already stands fires it.
    pub fn write_control(&mut self, value: u8) {
        let old_ctrl = self.regs.read(UCSR0B);
        self.regs.write(UCSR0B, value);
        self.refresh();
        let status = self.regs.read(UCSR0A) & STATUS;
        if status & value & !old_ctrl != 0 {
            self.signals.raise();
        }
    }

    pub fn reset(&mut self) {
        if let Backend::Buffered { tx, rx, .. } = &self.backend {
            tx.clear();
            rx.clear();
        }
        self.regs.set_bits(UCSR0A, UDRE);
    }
}

impl Drop for Uart {
    fn drop(&mut self) {
        if let Backend::Buffered { workers, .. } = &mut self.backend {
            for w in workers.iter() {
                w.stop.store(true, Ordering::Release);
            }
            for w in workers.iter_mut() {
                if let Some(handle) = w.handle.take() {
                    let _ = handle.join();
                }
            }
        }
    }
}

/// Moves bytes from the TX ring to the host.
pub struct TxWorker {
    ring: Arc<ByteRing>,
    regs: Arc<RegisterFile>,
    signals: Arc<Signals>,
    sink: Box<dyn ByteSink>,
}

impl TxWorker {
    /// Transmit one byte. Returns false when the ring was empty.
    pub fn drain_once(&mut self) -> bool {
        match self.ring.pop() {
            Some(b) => {
                raise_status(&self.regs, &self.signals, TXC | UDRE);
                if let Err(e) = self.sink.put(b) {
                    warn!("uart output: {}", e);
                }
                true
            }
            None => {
                raise_status(&self.regs, &self.signals, UDRE);
                false
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fill {
    Idle,
    Received,
    Closed,
}

/// Moves bytes from the host into the RX ring.
pub struct RxWorker {
    ring: Arc<ByteRing>,
    regs: Arc<RegisterFile>,
    signals: Arc<Signals>,
    source: Box<dyn ByteSource>,
}

impl RxWorker {
    /// Receive at most one byte; never polls the host while the ring is full.
    pub fn fill_once(&mut self) -> Fill {
        if self.ring.is_full() {
            return Fill::Idle;
        }
        match self.source.poll_byte() {
            HostByte::Byte(b) => {
                if self.ring.push(b).is_err() {
                    debug!("uart flow control: rx ring full, dropped {:#04x}", b);
                    return Fill::Idle;
                }
                raise_status(&self.regs, &self.signals, RXC);
                Fill::Received
            }
            HostByte::Empty => Fill::Idle,
            HostByte::Closed => Fill::Closed,
        }
    }
}

struct Worker {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    fn spawn_tx(mut w: TxWorker, poll: Duration) -> io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let handle = thread::Builder::new().name("uart-tx".into()).spawn(move || {
            while !flag.load(Ordering::Acquire) {
                if !w.drain_once() {
                    thread::sleep(poll);
                }
            }
            // Flush what software already queued
            while w.drain_once() {}
        })?;
        Ok(Worker { stop, handle: Some(handle) })
    }

    fn spawn_rx(mut w: RxWorker, poll: Duration) -> io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let handle = thread::Builder::new().name("uart-rx".into()).spawn(move || {
            while !flag.load(Ordering::Acquire) {
                match w.fill_once() {
                    Fill::Received => {}
                    Fill::Idle => thread::sleep(poll),
                    Fill::Closed => break,
                }
            }
        })?;
        Ok(Worker { stop, handle: Some(handle) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::MemoryPort;

    fn shared() -> (Arc<RegisterFile>, Arc<Signals>) {
        (Arc::new(RegisterFile::new()), Arc::new(Signals::new()))
    }

    #[test]
    fn test_pass_through_tx() {
        let (regs, signals) = shared();
        let port = MemoryPort::new();
        let mut uart = Uart::pass_through(regs.clone(), signals.clone(), Box::new(port.clone()), Box::new(port.clone()));
        uart.write_data(b'A');
        uart.write_data(b'B');
        assert_eq!(port.output(), b"AB");
        assert_eq!(regs.read(UCSR0A) & (TXC | UDRE), TXC | UDRE);
        // No enables, no interrupt
        assert!(!signals.is_pending());
    }

    #[test]
    fn test_pass_through_rx() {
        let (regs, signals) = shared();
        let port = MemoryPort::new();
        let mut uart = Uart::pass_through(regs.clone(), signals.clone(), Box::new(port.clone()), Box::new(port.clone()));
        uart.refresh();
        assert_eq!(regs.read(UCSR0A) & RXC, 0);
        assert_eq!(uart.read_data(), 0xFF);

        port.feed(b"xy");
        uart.refresh();
        assert_ne!(regs.read(UCSR0A) & RXC, 0);
        assert_eq!(uart.read_data(), b'x');
        // Refresh after the read already found the next byte
        assert_ne!(regs.read(UCSR0A) & RXC, 0);
        assert_eq!(uart.read_data(), b'y');
        assert_eq!(regs.read(UCSR0A) & RXC, 0);
    }

    #[test]
    fn test_edge_triggered_raise() {
        let (regs, signals) = shared();
        let port = MemoryPort::new();
        let mut uart = Uart::pass_through(regs.clone(), signals.clone(), Box::new(port.clone()), Box::new(port.clone()));
        // UDRE stands when UDRIE is enabled: fires once
        uart.write_control(UDRE);
        assert!(signals.acknowledge());
        uart.refresh();
        assert!(!signals.is_pending());
        uart.write_data(0);
        assert!(!signals.is_pending());

        // RXC newly set with RXCIE on
        uart.write_control(UDRE | RXC);
        signals.acknowledge();
        port.feed(&[1]);
        uart.refresh();
        assert!(signals.acknowledge());
        uart.refresh();
        assert!(!signals.is_pending());
    }

    #[test]
    fn test_status_write_masks() {
        let (regs, signals) = shared();
        let port = MemoryPort::new();
        let mut uart = Uart::pass_through(regs.clone(), signals, Box::new(port.clone()), Box::new(port));
        regs.write(UCSR0A, RXC | TXC | UDRE);
        // RXC/UDRE read-only, TXC kept when written zero
        uart.write_status(U2X);
        assert_eq!(regs.read(UCSR0A), RXC | TXC | UDRE | U2X);
        uart.write_status(TXC | MPCM);
        assert_eq!(regs.read(UCSR0A), RXC | UDRE | MPCM);
        // Writing TXC while it is clear does not set it
        uart.write_status(TXC);
        assert_eq!(regs.read(UCSR0A), RXC | UDRE);
    }

    #[test]
    fn test_buffered_flow_control() {
        let (regs, signals) = shared();
        let port = MemoryPort::new();
        let (mut uart, mut tx, _rx) =
            Uart::buffered_detached(regs.clone(), signals, 4, Box::new(port.clone()), Box::new(port.clone()));
        for b in 0..4 {
            uart.write_data(b);
        }
        assert_eq!(regs.read(UCSR0A) & UDRE, 0);
        uart.write_data(0xEE);
        assert_eq!(regs.read(UCSR0A) & UDRE, 0);
        assert_eq!(uart.queue_depths(), Some((4, 0)));

        assert!(tx.drain_once());
        assert_ne!(regs.read(UCSR0A) & UDRE, 0);
        uart.write_data(4);
        assert_eq!(regs.read(UCSR0A) & UDRE, 0);
        uart.write_data(0xEF);
        while tx.drain_once() {}
        assert_eq!(port.output(), vec![0, 1, 2, 3, 4]);
        assert_ne!(regs.read(UCSR0A) & (TXC | UDRE), 0);
    }

    #[test]
    fn test_buffered_rx() {
        let (regs, signals) = shared();
        let port = MemoryPort::new();
        let (mut uart, _tx, mut rx) =
            Uart::buffered_detached(regs.clone(), signals.clone(), 2, Box::new(port.clone()), Box::new(port.clone()));
        regs.write(UCSR0B, RXC);
        port.feed(b"abc");
        assert_eq!(rx.fill_once(), Fill::Received);
        assert!(signals.acknowledge());
        assert_eq!(rx.fill_once(), Fill::Received);
        // Already set: no second edge
        assert!(!signals.is_pending());
        assert_eq!(rx.fill_once(), Fill::Idle);
        assert_eq!(port.pending_input(), 1);

        assert_eq!(uart.read_data(), b'a');
        assert_ne!(regs.read(UCSR0A) & RXC, 0);
        assert_eq!(uart.read_data(), b'b');
        assert_eq!(regs.read(UCSR0A) & RXC, 0);
        // Empty receiver repeats the last byte
        assert_eq!(uart.read_data(), b'b');

        assert_eq!(rx.fill_once(), Fill::Received);
        port.close();
        assert_eq!(rx.fill_once(), Fill::Closed);
    }

    #[test]
    fn test_buffered_threads_drain_on_drop() {
        let (regs, signals) = shared();
        let port = MemoryPort::new();
        let mut uart = Uart::buffered(
            regs,
            signals,
            64,
            Duration::from_millis(1),
            Box::new(port.clone()),
            Box::new(port.clone()),
        )
        .unwrap();
        for &b in b"hello" {
            uart.write_data(b);
        }
        drop(uart);
        assert_eq!(port.output(), b"hello");
    }

    #[test]
    fn test_reset_clears_rings() {
        let (regs, signals) = shared();
        let port = MemoryPort::new();
        let (mut uart, _tx, mut rx) =
            Uart::buffered_detached(regs.clone(), signals, 4, Box::new(port.clone()), Box::new(port.clone()));
        uart.write_data(1);
        port.feed(&[2]);
        rx.fill_once();
        regs.clear();
        uart.reset();
        assert_eq!(uart.queue_depths(), Some((0, 0)));
        assert_eq!(regs.read(UCSR0A), UDRE);
    }
}
