//! Exchanging queue: bounded SPSC handoff to a dedicated worker
//!
//! A power-of-two ring with separate producer and consumer cursors. The
//! producer owns `tail`, the consumer owns `head`; neither ever writes the
//! other's cursor, so no CAS is needed. A consumer that finds the ring empty
//! can park in [`QueueConsumer::blocking_poll`] until the producer publishes
//! an item or an [`Interrupter`] asks it to give up.
//!
//! Single-producer/single-consumer is enforced by the types: each end is a
//! unique, non-`Clone` handle whose operations take `&mut self`.
//!
//! # Example
//!
//! ```
//! use precipice::exchanging_queue::exchanging_queue;
//!
//! let (mut producer, mut consumer) = exchanging_queue(2);
//! assert!(producer.offer(1).is_ok());
//! assert!(producer.offer(2).is_ok());
//! assert_eq!(producer.offer(3), Err(3));
//!
//! assert_eq!(consumer.poll(), Some(1));
//!
//! let worker = std::thread::spawn(move || {
//!     let mut seen = Vec::new();
//!     while let Ok(item) = consumer.blocking_poll() {
//!         seen.push(item);
//!         if item == 4 {
//!             break;
//!         }
//!     }
//!     seen
//! });
//! assert!(producer.offer(3).is_ok());
//! while producer.offer(4).is_err() {
//!     std::thread::yield_now();
//! }
//! assert_eq!(worker.join().unwrap(), vec![2, 3, 4]);
//! ```

use crossbeam_utils::sync::{Parker, Unparker};
use crossbeam_utils::CachePadded;
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{fence, AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Returned by [`QueueConsumer::blocking_poll`] when interrupted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("blocking poll interrupted")]
pub struct Interrupted;

struct Ring<T> {
    /// Next position to read; written only by the consumer
    head: CachePadded<AtomicUsize>,
    /// Next position to write; written only by the producer
    tail: CachePadded<AtomicUsize>,
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
    mask: usize,
    consumer_waiting: AtomicBool,
    interrupted: AtomicBool,
    unparker: Unparker,
}

// SAFETY: a slot is accessed by at most one side at a time, handed over by
// the Release/Acquire pair on the cursors.
unsafe impl<T: Send> Send for Ring<T> {}
unsafe impl<T: Send> Sync for Ring<T> {}

impl<T> Ring<T> {
    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn len(&self) -> usize {
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);
        tail.wrapping_sub(head)
    }
}

impl<T> Drop for Ring<T> {
    fn drop(&mut self) {
        let head = *self.head.get_mut();
        let tail = *self.tail.get_mut();
        let mut position = head;
        while position != tail {
            let slot = &mut self.slots[position & self.mask];
            // SAFETY: positions in head..tail hold initialized values.
            unsafe { slot.get_mut().assume_init_drop() };
            position = position.wrapping_add(1);
        }
    }
}

/// Create a queue holding at least `capacity` items.
///
/// Capacity is rounded up to the next power of two; zero is treated as one.
pub fn exchanging_queue<T: Send + 'static>(capacity: usize) -> (QueueProducer<T>, QueueConsumer<T>) {
    let capacity = capacity.max(1).next_power_of_two();
    let slots: Vec<UnsafeCell<MaybeUninit<T>>> = (0..capacity)
        .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
        .collect();

    let parker = Parker::new();
    let ring = Arc::new(Ring {
        head: CachePadded::new(AtomicUsize::new(0)),
        tail: CachePadded::new(AtomicUsize::new(0)),
        slots: slots.into_boxed_slice(),
        mask: capacity - 1,
        consumer_waiting: AtomicBool::new(false),
        interrupted: AtomicBool::new(false),
        unparker: parker.unparker().clone(),
    });

    (
        QueueProducer {
            ring: Arc::clone(&ring),
        },
        QueueConsumer { ring, parker },
    )
}

/// Writing end of an exchanging queue
pub struct QueueProducer<T> {
    ring: Arc<Ring<T>>,
}

impl<T: Send + 'static> QueueProducer<T> {
    /// Enqueue `item`, handing it back if the queue is full
    pub fn offer(&mut self, item: T) -> Result<(), T> {
        let ring = &*self.ring;
        let tail = ring.tail.load(Ordering::Relaxed);
        let head = ring.head.load(Ordering::Acquire);
        if tail.wrapping_sub(head) >= ring.capacity() {
            return Err(item);
        }

        // SAFETY: the slot at `tail` is outside head..tail, so the consumer
        // is not reading it and it holds no value.
        unsafe { (*ring.slots[tail & ring.mask].get()).write(item) };
        ring.tail.store(tail.wrapping_add(1), Ordering::Release);

        // Pairs with the fence in `blocking_poll`
        fence(Ordering::SeqCst);
        if ring.consumer_waiting.load(Ordering::Relaxed) {
            ring.unparker.unpark();
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    pub fn interrupter(&self) -> Interrupter {
        Interrupter {
            ring: Arc::clone(&self.ring) as Arc<dyn Interruptible>,
        }
    }
}

/// Reading end of an exchanging queue
pub struct QueueConsumer<T> {
    ring: Arc<Ring<T>>,
    parker: Parker,
}

impl<T: Send + 'static> QueueConsumer<T> {
    /// Dequeue without blocking
    pub fn poll(&mut self) -> Option<T> {
        let ring = &*self.ring;
        let head = ring.head.load(Ordering::Relaxed);
        let tail = ring.tail.load(Ordering::Acquire);
        if head == tail {
            return None;
        }

        // SAFETY: `head < tail`, so the producer published this slot and
        // will not touch it until `head` moves past it.
        let item = unsafe { (*ring.slots[head & ring.mask].get()).assume_init_read() };
        ring.head.store(head.wrapping_add(1), Ordering::Release);
        Some(item)
    }

    /// Dequeue, parking while the queue is empty.
    ///
    /// Returns [`Interrupted`] once an [`Interrupter`] fires; the interrupt
    /// is consumed.
    pub fn blocking_poll(&mut self) -> Result<T, Interrupted> {
        loop {
            if let Some(item) = self.poll() {
                return Ok(item);
            }
            if self.ring.interrupted.swap(false, Ordering::AcqRel) {
                return Err(Interrupted);
            }

            self.ring.consumer_waiting.store(true, Ordering::Relaxed);
            fence(Ordering::SeqCst);
            if let Some(item) = self.poll() {
                self.ring.consumer_waiting.store(false, Ordering::Relaxed);
                return Ok(item);
            }
            if !self.ring.interrupted.load(Ordering::Acquire) {
                self.parker.park();
            }
            self.ring.consumer_waiting.store(false, Ordering::Relaxed);
        }
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    pub fn interrupter(&self) -> Interrupter {
        Interrupter {
            ring: Arc::clone(&self.ring) as Arc<dyn Interruptible>,
        }
    }
}

trait Interruptible: Send + Sync {
    fn interrupt(&self);
}

impl<T: Send> Interruptible for Ring<T> {
    fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Release);
        self.unparker.unpark();
    }
}

/// Wakes a consumer parked in `blocking_poll` and makes it return
/// [`Interrupted`].
#[derive(Clone)]
pub struct Interrupter {
    ring: Arc<dyn Interruptible>,
}

impl Interrupter {
    pub fn interrupt(&self) {
        self.ring.interrupt();
    }
}

impl std::fmt::Debug for Interrupter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interrupter").finish_non_exhaustive()
    }
}

impl<T> std::fmt::Debug for QueueProducer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueProducer")
            .field("capacity", &self.ring.capacity())
            .field("len", &self.ring.len())
            .finish()
    }
}

impl<T> std::fmt::Debug for QueueConsumer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueConsumer")
            .field("capacity", &self.ring.capacity())
            .field("len", &self.ring.len())
            .finish()
    }
}
