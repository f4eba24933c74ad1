//! Rolling window: a fixed ring of time-bucketed accumulators
//!
//! Time is divided into slots of `bucket_width`, counted from the window's
//! `start`. The ring has `bucket_count.next_power_of_two()` physical positions
//! and slot `s` lives at position `s & mask`, so many slots share a position.
//! Each stored bucket is stamped with the absolute slot it was created for;
//! a reader that finds a different stamp knows the position holds no data
//! for the slot it wanted.
//!
//! Buckets are never reset in place. Moving a position to a newer slot
//! swaps in a freshly allocated bucket and retires the old one through
//! epoch-based reclamation, so writers that already hold the old
//! accumulator keep a valid (if no longer visible) reference.
//!
//! # Example
//!
//! ```
//! use precipice::metrics::rolling::RollingWindow;
//! use std::sync::atomic::{AtomicU64, Ordering};
//! use std::time::Duration;
//!
//! let window = RollingWindow::new(4, Duration::from_secs(1), 0, || AtomicU64::new(0)).unwrap();
//!
//! window.current(0).fetch_add(1, Ordering::Relaxed);
//! window.current(1_500_000_000).fetch_add(2, Ordering::Relaxed);
//!
//! let totals: Vec<u64> = window
//!     .intervals(1_500_000_000)
//!     .map(|interval| interval.value.load(Ordering::Relaxed))
//!     .collect();
//! assert_eq!(totals, vec![1, 2]);
//! ```

use crate::error::{PrecipiceError, Result};
use crate::time::duration_nanos;
use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};
use serde::{Deserialize, Serialize};
use std::iter::FusedIterator;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

/// Shape of a rolling window
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RollingConfig {
    /// Number of buckets tracked
    pub bucket_count: usize,

    /// Width of one bucket in milliseconds
    pub bucket_width_millis: u64,
}

impl Default for RollingConfig {
    fn default() -> Self {
        Self {
            bucket_count: 60,
            bucket_width_millis: 1_000,
        }
    }
}

impl RollingConfig {
    pub fn bucket_width(&self) -> Duration {
        Duration::from_millis(self.bucket_width_millis)
    }

    /// Total time span covered by the window.
    ///
    /// Fails when the span does not fit the window's `u64` nanosecond timeline.
    pub fn span(&self) -> Result<Duration> {
        u128::from(self.bucket_width_millis)
            .checked_mul(1_000_000)
            .and_then(|width| width.checked_mul(self.bucket_count as u128))
            .and_then(|nanos| u64::try_from(nanos).ok())
            .map(Duration::from_nanos)
            .ok_or_else(|| {
                PrecipiceError::invalid(format!(
                    "rolling window span ({} buckets of {}ms) is too large",
                    self.bucket_count, self.bucket_width_millis
                ))
            })
    }

    pub fn validate(&self) -> Result<()> {
        if self.bucket_count == 0 {
            return Err(PrecipiceError::invalid("bucket_count must be at least 1"));
        }
        if self.bucket_width_millis == 0 {
            return Err(PrecipiceError::invalid(
                "bucket_width_millis must be greater than 0",
            ));
        }
        self.span()?;
        Ok(())
    }
}

struct Bucket<T> {
    slot: u64,
    value: Arc<T>,
}

type Allocator<T> = Box<dyn Fn() -> T + Send + Sync>;

/// Fixed-capacity ring of accumulators indexed by absolute time slot.
pub struct RollingWindow<T> {
    buckets: Box<[Atomic<Bucket<T>>]>,
    mask: u64,
    bucket_count: u64,
    bucket_width: u64,
    start: u64,
    allocator: Allocator<T>,
}

impl<T> RollingWindow<T> {
    /// Create a window of `bucket_count` buckets of `bucket_width` each.
    ///
    /// `start` is the nanosecond timestamp slot zero begins at. `allocator`
    /// produces a fresh accumulator whenever a position moves to a new slot.
    pub fn new<F>(bucket_count: usize, bucket_width: Duration, start: u64, allocator: F) -> Result<Self>
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        if bucket_count == 0 {
            return Err(PrecipiceError::invalid("bucket_count must be at least 1"));
        }
        let bucket_width = duration_nanos(bucket_width);
        if bucket_width == 0 {
            return Err(PrecipiceError::invalid("bucket width must be greater than 0"));
        }

        let capacity = bucket_count.next_power_of_two();
        let buckets: Vec<Atomic<Bucket<T>>> = (0..capacity).map(|_| Atomic::null()).collect();

        Ok(Self {
            buckets: buckets.into_boxed_slice(),
            mask: capacity as u64 - 1,
            bucket_count: bucket_count as u64,
            bucket_width,
            start,
            allocator: Box::new(allocator),
        })
    }

    /// Create a window from a [`RollingConfig`]
    pub fn from_config<F>(config: &RollingConfig, start: u64, allocator: F) -> Result<Self>
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        config.validate()?;
        Self::new(config.bucket_count, config.bucket_width(), start, allocator)
    }

    /// Number of buckets tracked
    pub fn bucket_count(&self) -> usize {
        self.bucket_count as usize
    }

    /// Physical ring size (next power of two of `bucket_count`)
    pub fn capacity(&self) -> usize {
        self.buckets.len()
    }

    pub fn bucket_width(&self) -> Duration {
        Duration::from_nanos(self.bucket_width)
    }

    /// Absolute slot number for a timestamp
    pub fn slot_for(&self, now: u64) -> u64 {
        now.saturating_sub(self.start) / self.bucket_width
    }

    /// Get or create the accumulator for `now`'s slot.
    ///
    /// A writer whose `now` is so old that its position has already moved on
    /// to a newer slot gets a detached accumulator: the write is dropped
    /// rather than landing in the wrong bucket.
    pub fn current(&self, now: u64) -> Arc<T> {
        let guard = epoch::pin();
        match self.bucket(self.slot_for(now), &guard) {
            Some(bucket) => Arc::clone(&bucket.value),
            None => Arc::new((self.allocator)()),
        }
    }

    /// Run `f` against the accumulator for `now`'s slot without cloning it out
    pub fn with_current<R>(&self, now: u64, f: impl FnOnce(&T) -> R) -> R {
        let guard = epoch::pin();
        match self.bucket(self.slot_for(now), &guard) {
            Some(bucket) => f(&bucket.value),
            None => f(&(self.allocator)()),
        }
    }

    fn bucket<'g>(&self, slot: u64, guard: &'g Guard) -> Option<&'g Bucket<T>> {
        let cell = &self.buckets[(slot & self.mask) as usize];
        let mut current = cell.load(Ordering::Acquire, guard);

        loop {
            // SAFETY: buckets are only freed via `defer_destroy` after being
            // unlinked, and `guard` keeps the current epoch pinned.
            if let Some(bucket) = unsafe { current.as_ref() } {
                if bucket.slot == slot {
                    return Some(bucket);
                }
                if bucket.slot > slot {
                    return None;
                }
            }

            let fresh = Owned::new(Bucket {
                slot,
                value: Arc::new((self.allocator)()),
            });
            match cell.compare_exchange(current, fresh, Ordering::AcqRel, Ordering::Acquire, guard) {
                Ok(installed) => {
                    if !current.is_null() {
                        // SAFETY: `current` was unlinked by the successful CAS.
                        unsafe { guard.defer_destroy(current) };
                    }
                    // SAFETY: just installed and protected by `guard`.
                    return Some(unsafe { installed.deref() });
                }
                Err(err) => current = err.current,
            }
        }
    }

    /// Buckets covering the whole window ending at `now`, oldest first
    pub fn intervals(&self, now: u64) -> Intervals<'_, T> {
        self.intervals_for_buckets(now, self.bucket_count)
    }

    /// Buckets covering the trailing `span` ending at `now`, oldest first.
    ///
    /// The span is rounded up to whole buckets and capped at the window size.
    pub fn intervals_over(&self, now: u64, span: Duration) -> Intervals<'_, T> {
        let span = duration_nanos(span);
        let buckets = span.div_ceil(self.bucket_width).clamp(1, self.bucket_count);
        self.intervals_for_buckets(now, buckets)
    }

    fn intervals_for_buckets(&self, now: u64, buckets: u64) -> Intervals<'_, T> {
        let end_slot = self.slot_for(now);
        Intervals {
            window: self,
            guard: epoch::pin(),
            next_slot: end_slot.saturating_sub(buckets - 1),
            end_slot,
            done: false,
        }
    }
}

impl<T> std::fmt::Debug for RollingWindow<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RollingWindow")
            .field("bucket_count", &self.bucket_count)
            .field("capacity", &self.buckets.len())
            .field("bucket_width_nanos", &self.bucket_width)
            .field("start", &self.start)
            .finish()
    }
}

impl<T> Drop for RollingWindow<T> {
    fn drop(&mut self) {
        // SAFETY: `&mut self` excludes every other reference into the ring.
        let guard = unsafe { epoch::unprotected() };
        for cell in self.buckets.iter() {
            let bucket = cell.swap(Shared::null(), Ordering::Relaxed, guard);
            if !bucket.is_null() {
                // SAFETY: unlinked above, nobody else can observe it.
                unsafe { drop(bucket.into_owned()) };
            }
        }
    }
}

/// One populated bucket yielded by [`Intervals`]
#[derive(Debug)]
pub struct WindowInterval<T> {
    /// Absolute slot number
    pub slot: u64,
    /// Inclusive start of the bucket, in clock nanoseconds
    pub start_nanos: u64,
    /// Exclusive end of the bucket, in clock nanoseconds
    pub end_nanos: u64,
    pub value: Arc<T>,
}

/// Point-in-time, single-pass view over a window's buckets.
///
/// Positions whose stamp does not match the expected slot (never written, or
/// already recycled for a newer slot) are skipped.
pub struct Intervals<'a, T> {
    window: &'a RollingWindow<T>,
    guard: Guard,
    next_slot: u64,
    end_slot: u64,
    done: bool,
}

impl<T> Iterator for Intervals<'_, T> {
    type Item = WindowInterval<T>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            let slot = self.next_slot;
            if slot >= self.end_slot {
                self.done = true;
            } else {
                self.next_slot += 1;
            }

            let window = self.window;
            let cell = &window.buckets[(slot & window.mask) as usize];
            let shared = cell.load(Ordering::Acquire, &self.guard);
            // SAFETY: protected by the iterator's pinned guard.
            if let Some(bucket) = unsafe { shared.as_ref() } {
                if bucket.slot == slot {
                    let start_nanos = window.start + slot * window.bucket_width;
                    return Some(WindowInterval {
                        slot,
                        start_nanos,
                        end_nanos: start_nanos + window.bucket_width,
                        value: Arc::clone(&bucket.value),
                    });
                }
            }
        }
        None
    }
}

impl<T> FusedIterator for Intervals<'_, T> {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    const SECOND: u64 = 1_000_000_000;

    fn counter_window(buckets: usize) -> RollingWindow<AtomicU64> {
        RollingWindow::new(buckets, Duration::from_secs(1), 0, || AtomicU64::new(0)).unwrap()
    }

    fn values(window: &RollingWindow<AtomicU64>, now: u64) -> Vec<(u64, u64)> {
        window
            .intervals(now)
            .map(|i| (i.slot, i.value.load(Ordering::Relaxed)))
            .collect()
    }

    #[test]
    fn test_capacity_rounds_to_power_of_two() {
        assert_eq!(counter_window(5).capacity(), 8);
        assert_eq!(counter_window(8).capacity(), 8);
        assert_eq!(counter_window(1).capacity(), 1);
    }

    #[test]
    fn test_rejects_invalid_shape() {
        assert!(RollingWindow::new(0, Duration::from_secs(1), 0, || 0u8).is_err());
        assert!(RollingWindow::new(4, Duration::ZERO, 0, || 0u8).is_err());
    }

    #[test]
    fn test_same_slot_shares_accumulator() {
        let window = counter_window(4);
        let a = window.current(100);
        let b = window.current(SECOND - 1);
        assert!(Arc::ptr_eq(&a, &b));

        let c = window.current(SECOND);
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn test_round_trip_counts() {
        let window = counter_window(4);
        window.current(0).fetch_add(3, Ordering::Relaxed);
        window.current(SECOND).fetch_add(5, Ordering::Relaxed);
        window.current(3 * SECOND).fetch_add(7, Ordering::Relaxed);

        // Slot 2 was never written and is skipped
        assert_eq!(values(&window, 3 * SECOND), vec![(0, 3), (1, 5), (3, 7)]);
    }

    #[test]
    fn test_old_buckets_fall_out_of_view() {
        let window = counter_window(4);
        window.current(0).fetch_add(1, Ordering::Relaxed);
        window.current(2 * SECOND).fetch_add(2, Ordering::Relaxed);

        // Window at slot 5 covers slots 2..=5
        assert_eq!(values(&window, 5 * SECOND), vec![(2, 2)]);
        // Window at slot 6 covers slots 3..=6
        assert!(values(&window, 6 * SECOND).is_empty());
    }

    #[test]
    fn test_recycled_position_is_fresh() {
        let window = counter_window(4);
        let old = window.current(SECOND);
        old.fetch_add(9, Ordering::Relaxed);

        // Slot 5 maps onto the same physical position as slot 1
        let new = window.current(5 * SECOND);
        assert!(!Arc::ptr_eq(&old, &new));
        assert_eq!(new.load(Ordering::Relaxed), 0);

        // The retired accumulator stays readable for whoever held it
        assert_eq!(old.load(Ordering::Relaxed), 9);
    }

    #[test]
    fn test_late_writer_is_detached() {
        let window = counter_window(4);
        window.current(5 * SECOND).fetch_add(1, Ordering::Relaxed);

        // Slot 1 shares the position and is older: it must not clobber slot 5
        let late = window.current(SECOND);
        late.fetch_add(100, Ordering::Relaxed);

        assert_eq!(values(&window, 5 * SECOND), vec![(5, 1)]);
    }

    #[test]
    fn test_intervals_over_span() {
        let window = counter_window(8);
        for s in 0..8 {
            window.current(s * SECOND).fetch_add(s + 1, Ordering::Relaxed);
        }

        let last_two: Vec<u64> = window
            .intervals_over(7 * SECOND, Duration::from_secs(2))
            .map(|i| i.value.load(Ordering::Relaxed))
            .collect();
        assert_eq!(last_two, vec![7, 8]);

        // Partial buckets round up
        let covered = window
            .intervals_over(7 * SECOND, Duration::from_millis(2_500))
            .count();
        assert_eq!(covered, 3);

        // Spans beyond the window are capped
        let all = window
            .intervals_over(7 * SECOND, Duration::from_secs(60))
            .count();
        assert_eq!(all, 8);
    }

    #[test]
    fn test_interval_bounds() {
        let window = RollingWindow::new(2, Duration::from_secs(1), 500, || AtomicU64::new(0)).unwrap();
        window.current(500 + SECOND).fetch_add(1, Ordering::Relaxed);

        let interval = window.intervals(500 + SECOND).next().unwrap();
        assert_eq!(interval.slot, 1);
        assert_eq!(interval.start_nanos, 500 + SECOND);
        assert_eq!(interval.end_nanos, 500 + 2 * SECOND);
    }

    #[test]
    fn test_before_start_maps_to_slot_zero() {
        let window = RollingWindow::new(2, Duration::from_secs(1), 10 * SECOND, || AtomicU64::new(0)).unwrap();
        assert_eq!(window.slot_for(0), 0);
        assert_eq!(window.slot_for(11 * SECOND), 1);
    }

    #[test]
    fn test_with_current() {
        let window = counter_window(2);
        window.with_current(0, |c| c.fetch_add(4, Ordering::Relaxed));
        assert_eq!(window.with_current(10, |c| c.load(Ordering::Relaxed)), 4);
    }

    #[test]
    fn test_concurrent_writers_same_bucket() {
        let window = Arc::new(counter_window(4));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let w = Arc::clone(&window);
                std::thread::spawn(move || {
                    for _ in 0..1_000 {
                        w.with_current(SECOND, |c| c.fetch_add(1, Ordering::Relaxed));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().expect("writer thread should not panic");
        }

        assert_eq!(values(&window, SECOND), vec![(1, 8_000)]);
    }

    #[test]
    fn test_config_validation() {
        assert!(RollingConfig::default().validate().is_ok());
        let zero = RollingConfig {
            bucket_count: 0,
            ..Default::default()
        };
        assert!(zero.validate().is_err());
        assert_eq!(RollingConfig::default().span().unwrap(), Duration::from_secs(60));
    }

    #[test]
    fn test_oversized_span_is_invalid() {
        let huge = RollingConfig {
            bucket_count: 4_000,
            bucket_width_millis: i64::MAX as u64,
        };
        assert!(matches!(huge.span(), Err(PrecipiceError::InvalidConfig(_))));
        assert!(huge.validate().is_err());

        // Just under the u64 nanosecond limit still works
        let edge = RollingConfig {
            bucket_count: 1,
            bucket_width_millis: u64::MAX / 1_000_000,
        };
        assert!(edge.validate().is_ok());
        assert_eq!(edge.span().unwrap(), Duration::from_millis(u64::MAX / 1_000_000));
    }
}
