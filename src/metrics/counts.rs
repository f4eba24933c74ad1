//! Per-key counters: cumulative and rolling
//!
//! Counts are monotonic. A rolling bucket that ages out is replaced by a fresh
//! accumulator rather than being zeroed.

use super::rolling::{Intervals, RollingConfig, RollingWindow};
use crate::error::Result;
use crate::outcome::MetricKey;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// One monotonically increasing count per key.
#[derive(Debug)]
pub struct CountAccumulator<K: MetricKey> {
    counts: Box<[AtomicU64]>,
    _key: PhantomData<fn() -> K>,
}

impl<K: MetricKey> CountAccumulator<K> {
    pub fn new() -> Self {
        let counts: Vec<AtomicU64> = K::VARIANTS.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            counts: counts.into_boxed_slice(),
            _key: PhantomData,
        }
    }

    /// Add `delta` to the count for `key`.
    ///
    /// Wraps only at `u64::MAX`.
    pub fn add(&self, key: K, delta: u64) {
        self.counts[key.ordinal()].fetch_add(delta, Ordering::Relaxed);
    }

    pub fn get(&self, key: K) -> u64 {
        self.counts[key.ordinal()].load(Ordering::Relaxed)
    }

    /// Sum over every key
    pub fn total(&self) -> u64 {
        self.counts.iter().map(|c| c.load(Ordering::Relaxed)).sum()
    }

    /// Sum over the keys matching `filter`
    pub fn total_where(&self, filter: impl Fn(K) -> bool) -> u64 {
        K::VARIANTS
            .iter()
            .filter(|k| filter(**k))
            .map(|k| self.get(*k))
            .sum()
    }
}

impl<K: MetricKey> Default for CountAccumulator<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// Lifetime totals per key, never rolled.
#[derive(Debug)]
pub struct TotalCounts<K: MetricKey> {
    counts: CountAccumulator<K>,
}

impl<K: MetricKey> TotalCounts<K> {
    pub fn new() -> Self {
        Self {
            counts: CountAccumulator::new(),
        }
    }

    pub fn add(&self, key: K, delta: u64) {
        self.counts.add(key, delta);
    }

    pub fn count(&self, key: K) -> u64 {
        self.counts.get(key)
    }

    pub fn total(&self) -> u64 {
        self.counts.total()
    }
}

impl<K: MetricKey> Default for TotalCounts<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-key counts bucketed by time.
///
/// # Example
///
/// ```
/// use precipice::metrics::RollingCounts;
/// use precipice::outcome::TimeoutableResult;
/// use std::time::Duration;
///
/// let counts = RollingCounts::<TimeoutableResult>::new(10, Duration::from_secs(1), 0).unwrap();
/// counts.add(TimeoutableResult::Error, 1, 0);
/// counts.add(TimeoutableResult::Success, 2, 2_000_000_000);
///
/// assert_eq!(counts.count(TimeoutableResult::Success, 2_000_000_000), 2);
/// assert_eq!(counts.total_over(Duration::from_secs(1), 2_000_000_000), 2);
/// assert_eq!(counts.total_over(Duration::from_secs(10), 2_000_000_000), 3);
/// ```
#[derive(Debug)]
pub struct RollingCounts<K: MetricKey> {
    window: RollingWindow<CountAccumulator<K>>,
}

impl<K: MetricKey> RollingCounts<K> {
    pub fn new(bucket_count: usize, bucket_width: Duration, start: u64) -> Result<Self> {
        Ok(Self {
            window: RollingWindow::new(bucket_count, bucket_width, start, CountAccumulator::new)?,
        })
    }

    pub fn from_config(config: &RollingConfig, start: u64) -> Result<Self> {
        Ok(Self {
            window: RollingWindow::from_config(config, start, CountAccumulator::new)?,
        })
    }

    pub fn add(&self, key: K, delta: u64, now: u64) {
        self.window.with_current(now, |acc| acc.add(key, delta));
    }

    /// Count for `key` over the whole window
    pub fn count(&self, key: K, now: u64) -> u64 {
        self.window.intervals(now).map(|i| i.value.get(key)).sum()
    }

    /// Count for `key` over the trailing `span`
    pub fn count_over(&self, key: K, span: Duration, now: u64) -> u64 {
        self.window
            .intervals_over(now, span)
            .map(|i| i.value.get(key))
            .sum()
    }

    /// Count over every key in the trailing `span`
    pub fn total_over(&self, span: Duration, now: u64) -> u64 {
        self.window
            .intervals_over(now, span)
            .map(|i| i.value.total())
            .sum()
    }

    /// Raw bucket view, oldest first
    pub fn intervals(&self, now: u64) -> Intervals<'_, CountAccumulator<K>> {
        self.window.intervals(now)
    }

    /// Raw bucket view over a trailing `span`, oldest first
    pub fn intervals_over(&self, now: u64, span: Duration) -> Intervals<'_, CountAccumulator<K>> {
        self.window.intervals_over(now, span)
    }

    pub fn window(&self) -> &RollingWindow<CountAccumulator<K>> {
        &self.window
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::{Outcome, Rejected, TimeoutableResult};

    const SECOND: u64 = 1_000_000_000;

    #[test]
    fn test_accumulator_counts() {
        let acc = CountAccumulator::<TimeoutableResult>::new();
        acc.add(TimeoutableResult::Success, 2);
        acc.add(TimeoutableResult::Error, 1);
        acc.add(TimeoutableResult::Success, 3);

        assert_eq!(acc.get(TimeoutableResult::Success), 5);
        assert_eq!(acc.get(TimeoutableResult::Timeout), 0);
        assert_eq!(acc.total(), 6);
        assert_eq!(acc.total_where(|k| k.is_failure()), 1);
    }

    #[test]
    fn test_total_counts() {
        let totals = TotalCounts::<Rejected>::new();
        totals.add(Rejected::RateLimited, 4);
        totals.add(Rejected::CircuitOpen, 1);
        assert_eq!(totals.count(Rejected::RateLimited), 4);
        assert_eq!(totals.total(), 5);
    }

    #[test]
    fn test_rolling_counts_expire() {
        let counts = RollingCounts::<TimeoutableResult>::new(3, Duration::from_secs(1), 0).unwrap();
        counts.add(TimeoutableResult::Error, 1, 0);
        counts.add(TimeoutableResult::Error, 2, SECOND);
        counts.add(TimeoutableResult::Error, 4, 2 * SECOND);

        assert_eq!(counts.count(TimeoutableResult::Error, 2 * SECOND), 7);
        assert_eq!(counts.count(TimeoutableResult::Error, 3 * SECOND), 6);
        assert_eq!(counts.count(TimeoutableResult::Error, 5 * SECOND), 0);
    }

    #[test]
    fn test_count_over_span() {
        let counts = RollingCounts::<TimeoutableResult>::new(10, Duration::from_secs(1), 0).unwrap();
        for s in 0..10 {
            counts.add(TimeoutableResult::Success, 1, s * SECOND);
        }
        let now = 9 * SECOND;
        assert_eq!(counts.count_over(TimeoutableResult::Success, Duration::from_secs(3), now), 3);
        assert_eq!(counts.total_over(Duration::from_secs(10), now), 10);
    }

    #[test]
    fn test_per_bucket_intervals() {
        let counts = RollingCounts::<TimeoutableResult>::new(4, Duration::from_secs(1), 0).unwrap();
        counts.add(TimeoutableResult::Success, 1, 0);
        counts.add(TimeoutableResult::Timeout, 1, 2 * SECOND);

        let per_bucket: Vec<(u64, u64)> = counts
            .intervals(3 * SECOND)
            .map(|i| (i.slot, i.value.get(TimeoutableResult::Timeout)))
            .collect();
        assert_eq!(per_bucket, vec![(0, 0), (2, 1)]);
    }
}
