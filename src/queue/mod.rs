// SPDX-FileCopyrightText: 2023 Linutronix GmbH
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Lock-free single producer / single consumer descriptor ring
//!
//! Every transmit queue is fed by exactly one socket and drained by exactly
//! one scheduler, so two index atomics are enough. The producer publishes a
//! slot with a release store of the write index, the consumer frees it with a
//! release store of the read index.
//!
//! ```
//! use netqos::queue::{ring, TxDesc};
//!
//! let (mut producer, mut consumer) = ring::<TxDesc>(4);
//! producer.push(TxDesc::new(vec![0; 64])).unwrap();
//! assert_eq!(consumer.pending(), 1);
//! assert_eq!(consumer.peek().map(TxDesc::len), Some(64));
//! assert!(consumer.dequeue().is_some());
//! assert!(consumer.dequeue().is_none());
//! ```
use std::cell::UnsafeCell;
use std::fmt;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Transmit descriptor as handed from a socket to the scheduler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxDesc {
    /// Presentation time (gPTP nanoseconds, lower 32 bit) before which the
    /// frame must be sent. Untimed frames are eligible immediately.
    pub ts: Option<u32>,

    /// Frame without FCS
    pub frame: Vec<u8>,
}

impl TxDesc {
    /// Untimed descriptor
    #[must_use]
    pub const fn new(frame: Vec<u8>) -> Self {
        Self { ts: None, frame }
    }

    /// Descriptor carrying a presentation time
    #[must_use]
    pub const fn with_timestamp(frame: Vec<u8>, ts: u32) -> Self {
        Self {
            ts: Some(ts),
            frame,
        }
    }

    /// Frame length in bytes
    #[must_use]
    pub fn len(&self) -> usize {
        self.frame.len()
    }

    /// Frame is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frame.is_empty()
    }
}

struct Ring<T> {
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
    mask: usize,
    write: AtomicUsize,
    read: AtomicUsize,
}

// SAFETY: a slot is accessed either by the producer (before publishing) or by
// the consumer (after publishing, before freeing), never by both.
unsafe impl<T: Send> Sync for Ring<T> {}

// SAFETY: the ring owns its elements, moving it between threads moves them.
unsafe impl<T: Send> Send for Ring<T> {}

impl<T> Ring<T> {
    fn capacity(&self) -> usize {
        self.mask + 1
    }

    fn len(&self) -> usize {
        self.write
            .load(Ordering::Acquire)
            .wrapping_sub(self.read.load(Ordering::Acquire))
    }

    fn slot(&self, index: usize) -> *mut MaybeUninit<T> {
        self.slots[index & self.mask].get()
    }
}

impl<T> Drop for Ring<T> {
    fn drop(&mut self) {
        let write = *self.write.get_mut();
        let mut read = *self.read.get_mut();
        while read != write {
            // SAFETY: slots between read and write are initialized and
            // nobody else holds the ring anymore.
            unsafe { (*self.slot(read)).assume_init_drop() };
            read = read.wrapping_add(1);
        }
    }
}

/// Writing end of a ring
pub struct Producer<T> {
    ring: Arc<Ring<T>>,
}

/// Reading end of a ring
pub struct Consumer<T> {
    ring: Arc<Ring<T>>,
}

/// Creates a ring with room for at least `capacity` elements.
///
/// The capacity is rounded up to a power of two, and is at least two.
#[must_use]
pub fn ring<T>(capacity: usize) -> (Producer<T>, Consumer<T>) {
    let capacity = capacity.max(2).next_power_of_two();
    let slots = (0..capacity)
        .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
        .collect();

    let ring = Arc::new(Ring {
        slots,
        mask: capacity - 1,
        write: AtomicUsize::new(0),
        read: AtomicUsize::new(0),
    });

    (
        Producer {
            ring: Arc::clone(&ring),
        },
        Consumer { ring },
    )
}

impl<T> Producer<T> {
    /// Enqueues `value`, handing it back if the ring is full
    ///
    /// # Errors
    ///
    /// Returns the value if there is no free slot.
    pub fn push(&mut self, value: T) -> Result<(), T> {
        let write = self.ring.write.load(Ordering::Relaxed);
        let read = self.ring.read.load(Ordering::Acquire);

        if write.wrapping_sub(read) >= self.ring.capacity() {
            return Err(value);
        }

        // SAFETY: the slot is free (read has passed it) and only the single
        // producer writes to free slots.
        unsafe { (*self.ring.slot(write)).write(value) };
        self.ring
            .write
            .store(write.wrapping_add(1), Ordering::Release);

        Ok(())
    }

    /// Free slots
    #[must_use]
    pub fn available(&self) -> usize {
        self.ring.capacity() - self.ring.len()
    }

    /// Total slots
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }
}

impl<T> Consumer<T> {
    /// Oldest element without removing it
    #[must_use]
    pub fn peek(&self) -> Option<&T> {
        let read = self.ring.read.load(Ordering::Relaxed);
        let write = self.ring.write.load(Ordering::Acquire);

        if read == write {
            return None;
        }

        // SAFETY: the slot was published by the producer and stays untouched
        // until the read index moves, which needs `&mut self`.
        Some(unsafe { (*self.ring.slot(read)).assume_init_ref() })
    }

    /// Removes the oldest element
    pub fn dequeue(&mut self) -> Option<T> {
        let read = self.ring.read.load(Ordering::Relaxed);
        let write = self.ring.write.load(Ordering::Acquire);

        if read == write {
            return None;
        }

        // SAFETY: the slot was published by the producer, it is read exactly
        // once before the read index releases it.
        let value = unsafe { (*self.ring.slot(read)).assume_init_read() };
        self.ring.read.store(read.wrapping_add(1), Ordering::Release);

        Some(value)
    }

    /// Drops every queued element and returns how many there were
    pub fn flush(&mut self) -> usize {
        let mut flushed = 0;
        while self.dequeue().is_some() {
            flushed += 1;
        }
        flushed
    }

    /// Queued elements
    #[must_use]
    pub fn pending(&self) -> usize {
        self.ring.len()
    }

    /// Free slots
    #[must_use]
    pub fn available(&self) -> usize {
        self.ring.capacity() - self.ring.len()
    }

    /// Total slots
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }
}

impl<T> fmt::Debug for Producer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Producer")
            .field("capacity", &self.capacity())
            .field("available", &self.available())
            .finish()
    }
}

impl<T> fmt::Debug for Consumer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer")
            .field("capacity", &self.capacity())
            .field("pending", &self.pending())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_capacity_rounded_up() {
        let (producer, consumer) = ring::<u32>(5);
        assert_eq!(producer.capacity(), 8);
        assert_eq!(consumer.available(), 8);
        assert_eq!(ring::<u32>(0).0.capacity(), 2);
    }

    #[test]
    fn test_full_ring_hands_value_back() {
        let (mut producer, mut consumer) = ring(2);
        producer.push(1).unwrap();
        producer.push(2).unwrap();
        assert_eq!(producer.push(3), Err(3));
        assert_eq!(producer.available(), 0);

        assert_eq!(consumer.dequeue(), Some(1));
        producer.push(3).unwrap();
        assert_eq!(consumer.dequeue(), Some(2));
        assert_eq!(consumer.dequeue(), Some(3));
        assert_eq!(consumer.dequeue(), None);
    }

    #[test]
    fn test_peek_does_not_consume() {
        let (mut producer, consumer) = ring(4);
        producer.push(TxDesc::with_timestamp(vec![1, 2, 3], 77)).unwrap();
        assert_eq!(consumer.peek().and_then(|d| d.ts), Some(77));
        assert_eq!(consumer.peek().map(TxDesc::len), Some(3));
        assert_eq!(consumer.pending(), 1);
    }

    #[test]
    fn test_flush() {
        let (mut producer, mut consumer) = ring(8);
        for i in 0..5 {
            producer.push(i).unwrap();
        }
        assert_eq!(consumer.flush(), 5);
        assert_eq!(consumer.pending(), 0);
    }

    #[test]
    fn test_drop_releases_queued_elements() {
        struct Counted(Arc<AtomicUsize>);
        impl Drop for Counted {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::Relaxed);
            }
        }

        let dropped = Arc::new(AtomicUsize::new(0));
        {
            let (mut producer, mut consumer) = ring(4);
            for _ in 0..3 {
                assert!(producer.push(Counted(Arc::clone(&dropped))).is_ok());
            }
            drop(consumer.dequeue());
        }
        assert_eq!(dropped.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn test_threads_preserve_order() {
        const COUNT: u32 = 100_000;

        let (mut producer, mut consumer) = ring(64);
        let handle = std::thread::spawn(move || {
            let mut next = 0;
            while next < COUNT {
                if producer.push(next).is_ok() {
                    next += 1;
                } else {
                    std::thread::yield_now();
                }
            }
        });

        let mut expected = 0;
        while expected < COUNT {
            if let Some(value) = consumer.dequeue() {
                assert_eq!(value, expected);
                expected += 1;
            } else {
                std::thread::yield_now();
            }
        }

        handle.join().unwrap();
    }
}
