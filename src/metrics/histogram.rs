//! Lock-free latency histogram
//!
//! Log-linear bucketing with three significant decimal digits, laid out
//! exactly like an `hdrhistogram::Histogram` with the same bounds so a
//! snapshot can be replayed into one for percentile queries. Writers only
//! touch `AtomicU64` counts.

use crate::error::{PrecipiceError, Result};
use hdrhistogram::Histogram;
use std::sync::atomic::{AtomicU64, Ordering};

/// Significant decimal digits preserved by every histogram in this crate
pub const SIGNIFICANT_DIGITS: u8 = 3;

/// Default highest trackable value: one hour in nanoseconds
pub const DEFAULT_HIGHEST_TRACKABLE: u64 = 3_600_000_000_000;

// 2 * 10^3 needs 11 bits of sub-bucket resolution
const SUB_BUCKET_COUNT_MAGNITUDE: u32 = 11;
const SUB_BUCKET_HALF_COUNT_MAGNITUDE: u32 = SUB_BUCKET_COUNT_MAGNITUDE - 1;
const SUB_BUCKET_COUNT: u64 = 1 << SUB_BUCKET_COUNT_MAGNITUDE;
const SUB_BUCKET_HALF_COUNT: u64 = SUB_BUCKET_COUNT / 2;
const SUB_BUCKET_MASK: u64 = SUB_BUCKET_COUNT - 1;
const LEADING_ZERO_COUNT_BASE: u32 = 64 - SUB_BUCKET_HALF_COUNT_MAGNITUDE - 1;

/// Histogram of `u64` values in `[0, highest_trackable]`.
///
/// Values above `highest_trackable` are clamped to it.
#[derive(Debug)]
pub struct AtomicHistogram {
    counts: Box<[AtomicU64]>,
    highest_trackable: u64,
    total: AtomicU64,
}

impl AtomicHistogram {
    pub fn new(highest_trackable: u64) -> Result<Self> {
        if highest_trackable < 2 {
            return Err(PrecipiceError::invalid(
                "highest trackable histogram value must be at least 2",
            ));
        }
        Ok(Self::allocate(highest_trackable))
    }

    /// Allocate without validating; `highest_trackable` must be at least 2.
    pub(crate) fn allocate(highest_trackable: u64) -> Self {
        let len = counts_len(highest_trackable);
        let counts: Vec<AtomicU64> = (0..len).map(|_| AtomicU64::new(0)).collect();
        Self {
            counts: counts.into_boxed_slice(),
            highest_trackable,
            total: AtomicU64::new(0),
        }
    }

    pub fn record(&self, value: u64) {
        self.record_n(value, 1);
    }

    pub fn record_n(&self, value: u64, count: u64) {
        let value = value.min(self.highest_trackable);
        self.counts[counts_index(value)].fetch_add(count, Ordering::Relaxed);
        self.total.fetch_add(count, Ordering::Relaxed);
    }

    /// Number of recorded values
    pub fn len(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn highest_trackable(&self) -> u64 {
        self.highest_trackable
    }

    /// Zero every count.
    ///
    /// Only meaningful once writers have moved elsewhere, see
    /// [`Recorder`](super::recorder::Recorder).
    pub fn reset(&self) {
        for count in self.counts.iter() {
            count.store(0, Ordering::Relaxed);
        }
        self.total.store(0, Ordering::Relaxed);
    }

    /// Add this histogram's counts to an `hdrhistogram` with compatible bounds
    pub fn add_to(&self, target: &mut Histogram<u64>) {
        for (index, count) in self.counts.iter().enumerate() {
            let n = count.load(Ordering::Relaxed);
            if n > 0 {
                let _ = target.record_n(value_from_index(index), n);
            }
        }
    }

    /// Copy the current counts into an `hdrhistogram` for percentile queries
    pub fn snapshot(&self) -> Histogram<u64> {
        let mut histogram = empty_histogram(self.highest_trackable);
        self.add_to(&mut histogram);
        histogram
    }
}

/// An empty `hdrhistogram` with the bucketing used by [`AtomicHistogram`]
pub fn empty_histogram(highest_trackable: u64) -> Histogram<u64> {
    Histogram::new_with_bounds(1, highest_trackable.max(2), SIGNIFICANT_DIGITS)
        .expect("latency histogram bounds")
}

fn buckets_needed(highest_trackable: u64) -> u64 {
    let mut smallest_untrackable = SUB_BUCKET_COUNT;
    let mut needed = 1;
    while smallest_untrackable <= highest_trackable {
        if smallest_untrackable > u64::MAX / 2 {
            return needed + 1;
        }
        smallest_untrackable <<= 1;
        needed += 1;
    }
    needed
}

fn counts_len(highest_trackable: u64) -> usize {
    ((buckets_needed(highest_trackable) + 1) * SUB_BUCKET_HALF_COUNT) as usize
}

fn counts_index(value: u64) -> usize {
    let bucket_index = LEADING_ZERO_COUNT_BASE - (value | SUB_BUCKET_MASK).leading_zeros();
    let sub_bucket_index = value >> bucket_index;
    ((u64::from(bucket_index) << SUB_BUCKET_HALF_COUNT_MAGNITUDE) + sub_bucket_index) as usize
}

fn value_from_index(index: usize) -> u64 {
    let index = index as u64;
    let mut bucket_index = (index >> SUB_BUCKET_HALF_COUNT_MAGNITUDE) as i64 - 1;
    let mut sub_bucket_index = (index & (SUB_BUCKET_HALF_COUNT - 1)) + SUB_BUCKET_HALF_COUNT;
    if bucket_index < 0 {
        sub_bucket_index -= SUB_BUCKET_HALF_COUNT;
        bucket_index = 0;
    }
    sub_bucket_index << bucket_index
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_round_trip_low_values_are_exact() {
        for v in 0..SUB_BUCKET_COUNT {
            assert_eq!(value_from_index(counts_index(v)), v);
        }
    }

    #[test]
    fn test_index_precision_high_values() {
        for v in [2_048u64, 2_248, 1_000_000, 123_456_789, DEFAULT_HIGHEST_TRACKABLE] {
            let lowest = value_from_index(counts_index(v));
            assert!(lowest <= v);
            // Three significant digits: bucket floor within 0.1%
            assert!((v - lowest) as f64 / v as f64 <= 0.001, "value {} floor {}", v, lowest);
        }
    }

    #[test]
    fn test_highest_value_fits() {
        let len = counts_len(DEFAULT_HIGHEST_TRACKABLE);
        assert!(counts_index(DEFAULT_HIGHEST_TRACKABLE) < len);
    }

    #[test]
    fn test_record_and_snapshot() {
        let histogram = AtomicHistogram::new(DEFAULT_HIGHEST_TRACKABLE).unwrap();
        for v in 1..=100u64 {
            histogram.record(v * 1_000);
        }
        assert_eq!(histogram.len(), 100);

        let snapshot = histogram.snapshot();
        assert_eq!(snapshot.len(), 100);
        assert_eq!(snapshot.min(), 1_000);
        let p50 = snapshot.value_at_quantile(0.5);
        assert!((49_000..=51_000).contains(&p50), "p50 was {}", p50);
        assert!(snapshot.max() >= 99_900);
    }

    #[test]
    fn test_values_above_range_are_clamped() {
        let histogram = AtomicHistogram::new(10_000).unwrap();
        histogram.record(u64::MAX);
        let snapshot = histogram.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.max() <= snapshot.highest_equivalent(10_000));
    }

    #[test]
    fn test_reset() {
        let histogram = AtomicHistogram::new(DEFAULT_HIGHEST_TRACKABLE).unwrap();
        histogram.record_n(500, 10);
        histogram.reset();
        assert!(histogram.is_empty());
        assert_eq!(histogram.snapshot().len(), 0);
    }

    #[test]
    fn test_rejects_tiny_range() {
        assert!(AtomicHistogram::new(1).is_err());
    }
}
