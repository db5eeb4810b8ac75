//! Bounded lock-free byte FIFO between the executor and a UART worker.
//!
//! One side pushes, the other pops. `head` and `tail` are free-running
//! counters; their difference is the fill level. Pops claim a slot with a
//! compare-exchange on `head`, so `clear` can be called from either side
//! without losing track of what is queued.

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

pub struct ByteRing {
    slots: Box<[AtomicU8]>,
    head: AtomicUsize,
    tail: AtomicUsize,
}

impl ByteRing {
    /// `capacity` must be non-zero; configuration validation rejects zero.
    pub fn new(capacity: usize) -> Self {
        let slots = (0..capacity.max(1)).map(|_| AtomicU8::new(0)).collect();
        ByteRing { slots, head: AtomicUsize::new(0), tail: AtomicUsize::new(0) }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);
        tail.wrapping_sub(head).min(self.capacity())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity()
    }

    /// Producer side. Hands the byte back when the ring is full.
    pub fn push(&self, byte: u8) -> Result<(), u8> {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        if tail.wrapping_sub(head) >= self.capacity() {
            return Err(byte);
        }
        self.slots[tail % self.capacity()].store(byte, Ordering::Relaxed);
        self.tail.store(tail.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Consumer side.
    pub fn pop(&self) -> Option<u8> {
        loop {
            let head = self.head.load(Ordering::Acquire);
            let tail = self.tail.load(Ordering::Acquire);
            if head == tail {
                return None;
            }
            let byte = self.slots[head % self.capacity()].load(Ordering::Relaxed);
            if self
                .head
                .compare_exchange(head, head.wrapping_add(1), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(byte);
            }
        }
    }

    /// Drop everything queued.
    pub fn clear(&self) {
        let tail = self.tail.load(Ordering::Acquire);
        self.head.fetch_max(tail, Ordering::AcqRel);
    }
}
