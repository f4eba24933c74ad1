//! Double-buffered recorder
//!
//! Writers record into the *active* instance; a reader captures by flipping
//! active and inactive and then reading the instance it just retired. The
//! flip never blocks writers. The reader waits only for writers that were
//! already inside the retired instance when the flip happened.
//!
//! The gate is a writer/reader phaser: every write is bracketed by a start
//! ticket (`fetch_add` on a shared epoch whose sign encodes the phase) and an
//! end ticket on the counter for that phase. A flip swaps the start epoch to
//! the other phase and waits until the old phase's end counter catches up
//! with the start value it swapped out.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

/// An accumulator that can be zeroed through a shared reference.
pub trait Resettable {
    fn reset(&self);
}

/// Active/inactive accumulator pair.
///
/// # Example
///
/// ```
/// use precipice::metrics::recorder::{Recorder, Resettable};
/// use std::sync::atomic::{AtomicU64, Ordering};
///
/// struct Hits(AtomicU64);
/// impl Resettable for Hits {
///     fn reset(&self) {
///         self.0.store(0, Ordering::Relaxed);
///     }
/// }
///
/// let recorder = Recorder::new(Hits(AtomicU64::new(0)), Hits(AtomicU64::new(0)));
/// recorder.record(|h| h.0.fetch_add(3, Ordering::Relaxed));
///
/// assert_eq!(recorder.capture(|h| h.0.load(Ordering::Relaxed)), 3);
/// assert_eq!(recorder.capture(|h| h.0.load(Ordering::Relaxed)), 0);
/// ```
#[derive(Debug)]
pub struct Recorder<T: Resettable> {
    instances: [T; 2],
    active: AtomicUsize,
    phaser: Phaser,
    // Serializes readers only; writers never touch it.
    flip: Mutex<()>,
}

impl<T: Resettable> Recorder<T> {
    pub fn new(first: T, second: T) -> Self {
        Self {
            instances: [first, second],
            active: AtomicUsize::new(0),
            phaser: Phaser::new(),
            flip: Mutex::new(()),
        }
    }

    /// Write into the active instance
    pub fn record<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let ticket = self.phaser.writer_enter();
        let active = &self.instances[self.active.load(Ordering::SeqCst)];
        let result = f(active);
        self.phaser.writer_exit(ticket);
        result
    }

    /// Retire the active instance, read it with `f`, then zero it.
    ///
    /// Returns whatever `f` extracted: everything recorded since the
    /// previous capture.
    pub fn capture<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let _reader = self.flip.lock();

        let retired = self.active.load(Ordering::SeqCst);
        self.active.store(1 - retired, Ordering::SeqCst);
        self.phaser.flip();

        let instance = &self.instances[retired];
        let result = f(instance);
        instance.reset();
        result
    }
}

#[derive(Debug)]
struct Phaser {
    start_epoch: AtomicI64,
    even_end_epoch: AtomicI64,
    odd_end_epoch: AtomicI64,
}

impl Phaser {
    fn new() -> Self {
        Self {
            start_epoch: AtomicI64::new(0),
            even_end_epoch: AtomicI64::new(0),
            odd_end_epoch: AtomicI64::new(i64::MIN),
        }
    }

    fn writer_enter(&self) -> i64 {
        self.start_epoch.fetch_add(1, Ordering::SeqCst)
    }

    fn writer_exit(&self, ticket: i64) {
        if ticket < 0 {
            self.odd_end_epoch.fetch_add(1, Ordering::SeqCst);
        } else {
            self.even_end_epoch.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Move writers to the other phase and wait for the old phase to drain.
    ///
    /// Callers must serialize flips.
    fn flip(&self) {
        let next_phase_is_even = self.start_epoch.load(Ordering::SeqCst) < 0;

        let initial_start = if next_phase_is_even { 0 } else { i64::MIN };
        if next_phase_is_even {
            self.even_end_epoch.store(initial_start, Ordering::SeqCst);
        } else {
            self.odd_end_epoch.store(initial_start, Ordering::SeqCst);
        }

        let start_at_flip = self.start_epoch.swap(initial_start, Ordering::SeqCst);

        let old_end = if next_phase_is_even {
            &self.odd_end_epoch
        } else {
            &self.even_end_epoch
        };
        let mut spins = 0u32;
        while old_end.load(Ordering::SeqCst) != start_at_flip {
            if spins < 64 {
                std::hint::spin_loop();
                spins += 1;
            } else {
                std::thread::yield_now();
            }
        }
    }
}
