//! Host side of the UART: where received bytes come from and transmitted
//! bytes go.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use log::warn;

/// Result of a non-blocking poll for input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostByte {
    Byte(u8),
    /// Nothing available right now
    Empty,
    /// The input has ended and will never produce another byte
    Closed,
}

/// Source of received bytes. `poll_byte` must never block.
pub trait ByteSource: Send {
    fn poll_byte(&mut self) -> HostByte;
}

/// Destination of transmitted bytes.
pub trait ByteSink: Send {
    fn put(&mut self, byte: u8) -> io::Result<()>;
}

/// Standard input, read on a helper thread so polling never blocks.
pub struct StdinSource {
    rx: Receiver<u8>,
}

impl StdinSource {
    pub fn spawn() -> io::Result<Self> {
        let (tx, rx) = mpsc::channel();
        thread::Builder::new().name("stdin".into()).spawn(move || {
            let stdin = io::stdin();
            let mut lock = stdin.lock();
            let mut buf = [0u8; 1];
            loop {
                match lock.read(&mut buf) {
                    Ok(0) => break,
                    Ok(_) => {
                        if tx.send(buf[0]).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        warn!("stdin: {}", e);
                        break;
                    }
                }
            }
        })?;
        Ok(StdinSource { rx })
    }
}

impl ByteSource for StdinSource {
    fn poll_byte(&mut self) -> HostByte {
        match self.rx.try_recv() {
            Ok(b) => HostByte::Byte(b),
            Err(TryRecvError::Empty) => HostByte::Empty,
            Err(TryRecvError::Disconnected) => HostByte::Closed,
        }
    }
}

/// Standard output, flushed per byte so interactive output appears at once.
pub struct StdoutSink;

impl ByteSink for StdoutSink {
    fn put(&mut self, byte: u8) -> io::Result<()> {
        let stdout = io::stdout();
        let mut lock = stdout.lock();
        lock.write_all(&[byte])?;
        lock.flush()
    }
}

#[derive(Default)]
struct PortState {
    input: VecDeque<u8>,
    closed: bool,
    output: Vec<u8>,
}

/// In-memory host port. Clones share the same buffers, so one clone can be
/// handed to the UART while another feeds input and inspects output.
#[derive(Clone, Default)]
pub struct MemoryPort {
    state: Arc<Mutex<PortState>>,
}

impl MemoryPort {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, PortState> {
        // A panicked test thread must not hide the port from the others
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn feed(&self, bytes: &[u8]) {
        self.lock().input.extend(bytes.iter().copied());
    }

    /// Mark the input as ended once the queued bytes are consumed.
    pub fn close(&self) {
        self.lock().closed = true;
    }

    pub fn output(&self) -> Vec<u8> {
        self.lock().output.clone()
    }

    pub fn take_output(&self) -> Vec<u8> {
        std::mem::take(&mut self.lock().output)
    }

    pub fn pending_input(&self) -> usize {
        self.lock().input.len()
    }
}

impl ByteSource for MemoryPort {
    fn poll_byte(&mut self) -> HostByte {
        let mut state = self.lock();
        match state.input.pop_front() {
            Some(b) => HostByte::Byte(b),
            None if state.closed => HostByte::Closed,
            None => HostByte::Empty,
        }
    }
}

impl ByteSink for MemoryPort {
    fn put(&mut self, byte: u8) -> io::Result<()> {
        self.lock().output.push(byte);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_port_shared_between_clones() {
        let port = MemoryPort::new();
        let mut uart_side = port.clone();
        port.feed(b"hi");
        assert_eq!(uart_side.poll_byte(), HostByte::Byte(b'h'));
        assert_eq!(uart_side.poll_byte(), HostByte::Byte(b'i'));
        assert_eq!(uart_side.poll_byte(), HostByte::Empty);
        port.close();
        assert_eq!(uart_side.poll_byte(), HostByte::Closed);

        uart_side.put(b'o').unwrap();
        uart_side.put(b'k').unwrap();
        assert_eq!(port.take_output(), b"ok");
        assert!(port.output().is_empty());
    }
}
