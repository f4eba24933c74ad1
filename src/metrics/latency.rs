//! Latency metrics per outcome key
//!
//! Two shapes over the same accumulator:
//!
//! - [`IntervalLatency`]: recorder-backed, every capture returns what was
//!   recorded since the previous capture.
//! - [`RollingLatency`]: time-bucketed, queries merge the buckets of a
//!   trailing span.
//!
//! Per-key histograms are allocated on first write, so keys that never see
//! a value cost one empty slot.

use super::histogram::{empty_histogram, AtomicHistogram, DEFAULT_HIGHEST_TRACKABLE};
use super::recorder::{Recorder, Resettable};
use super::rolling::{RollingConfig, RollingWindow};
use crate::error::{PrecipiceError, Result};
use crate::outcome::MetricKey;
use hdrhistogram::Histogram;
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;
use std::sync::OnceLock;
use std::time::Duration;

/// Latency histogram settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LatencyConfig {
    /// Largest latency recorded exactly; larger values are clamped
    pub highest_trackable_nanos: u64,
}

impl Default for LatencyConfig {
    fn default() -> Self {
        Self {
            highest_trackable_nanos: DEFAULT_HIGHEST_TRACKABLE,
        }
    }
}

impl LatencyConfig {
    pub fn validate(&self) -> Result<()> {
        if self.highest_trackable_nanos < 2 {
            return Err(PrecipiceError::invalid(
                "highest_trackable_nanos must be at least 2",
            ));
        }
        Ok(())
    }
}

/// One lazily allocated histogram per key.
#[derive(Debug)]
pub struct LatencyAccumulator<K: MetricKey> {
    histograms: Box<[OnceLock<AtomicHistogram>]>,
    highest_trackable: u64,
    _key: PhantomData<fn() -> K>,
}

impl<K: MetricKey> LatencyAccumulator<K> {
    pub fn new(highest_trackable: u64) -> Result<Self> {
        if highest_trackable < 2 {
            return Err(PrecipiceError::invalid(
                "highest trackable latency must be at least 2",
            ));
        }
        Ok(Self::with_valid_bounds(highest_trackable))
    }

    fn with_valid_bounds(highest_trackable: u64) -> Self {
        let histograms: Vec<OnceLock<AtomicHistogram>> =
            K::VARIANTS.iter().map(|_| OnceLock::new()).collect();
        Self {
            histograms: histograms.into_boxed_slice(),
            highest_trackable,
            _key: PhantomData,
        }
    }

    pub fn record(&self, key: K, nanos: u64) {
        self.histogram(key).record(nanos);
    }

    /// Recorded values for `key`
    pub fn count(&self, key: K) -> u64 {
        self.histograms[key.ordinal()]
            .get()
            .map(AtomicHistogram::len)
            .unwrap_or(0)
    }

    pub fn highest_trackable(&self) -> u64 {
        self.highest_trackable
    }

    fn histogram(&self, key: K) -> &AtomicHistogram {
        let highest = self.highest_trackable;
        self.histograms[key.ordinal()].get_or_init(|| AtomicHistogram::allocate(highest))
    }

    /// Add the values for `key` into `target`
    pub fn add_to(&self, key: K, target: &mut Histogram<u64>) {
        if let Some(histogram) = self.histograms[key.ordinal()].get() {
            histogram.add_to(target);
        }
    }

    pub fn snapshot(&self, key: K) -> LatencySnapshot {
        let mut histogram = empty_histogram(self.highest_trackable);
        self.add_to(key, &mut histogram);
        LatencySnapshot::from(histogram)
    }
}

impl<K: MetricKey> Resettable for LatencyAccumulator<K> {
    fn reset(&self) {
        for histogram in self.histograms.iter().filter_map(OnceLock::get) {
            histogram.reset();
        }
    }
}

/// Immutable latency distribution, in nanoseconds
#[derive(Debug, Clone)]
pub struct LatencySnapshot {
    histogram: Histogram<u64>,
}

impl LatencySnapshot {
    pub fn count(&self) -> u64 {
        self.histogram.len()
    }

    pub fn is_empty(&self) -> bool {
        self.histogram.is_empty()
    }

    /// Smallest recorded value, 0 when empty
    pub fn min(&self) -> u64 {
        if self.is_empty() {
            0
        } else {
            self.histogram.min()
        }
    }

    pub fn max(&self) -> u64 {
        self.histogram.max()
    }

    pub fn mean(&self) -> f64 {
        self.histogram.mean()
    }

    /// Value at `percentile` (0.0 to 100.0)
    pub fn value_at_percentile(&self, percentile: f64) -> u64 {
        self.histogram.value_at_percentile(percentile.clamp(0.0, 100.0))
    }

    pub fn histogram(&self) -> &Histogram<u64> {
        &self.histogram
    }

    pub fn into_histogram(self) -> Histogram<u64> {
        self.histogram
    }
}

impl From<Histogram<u64>> for LatencySnapshot {
    fn from(histogram: Histogram<u64>) -> Self {
        Self { histogram }
    }
}

/// Latency for every key captured at one instant
#[derive(Debug, Clone)]
pub struct LatencyCapture<K: MetricKey> {
    snapshots: Vec<LatencySnapshot>,
    _key: PhantomData<fn() -> K>,
}

impl<K: MetricKey> LatencyCapture<K> {
    pub fn get(&self, key: K) -> &LatencySnapshot {
        &self.snapshots[key.ordinal()]
    }

    /// Every key's values merged into one distribution
    pub fn merged(&self) -> LatencySnapshot {
        let mut iter = self.snapshots.iter();
        let mut merged = match iter.next() {
            Some(first) => first.histogram.clone(),
            None => return LatencySnapshot::from(empty_histogram(DEFAULT_HIGHEST_TRACKABLE)),
        };
        for snapshot in iter {
            let _ = merged.add(&snapshot.histogram);
        }
        LatencySnapshot::from(merged)
    }
}

/// Interval latency: each capture drains what was recorded since the last one.
///
/// # Example
///
/// ```
/// use precipice::metrics::IntervalLatency;
/// use precipice::outcome::TimeoutableResult;
///
/// let latency = IntervalLatency::<TimeoutableResult>::new().unwrap();
/// latency.record(TimeoutableResult::Success, 1_500);
/// latency.record(TimeoutableResult::Success, 2_500);
///
/// let capture = latency.interval_snapshot();
/// assert_eq!(capture.get(TimeoutableResult::Success).count(), 2);
/// assert!(latency.interval_snapshot().get(TimeoutableResult::Success).is_empty());
/// ```
#[derive(Debug)]
pub struct IntervalLatency<K: MetricKey> {
    recorder: Recorder<LatencyAccumulator<K>>,
    highest_trackable: u64,
}

impl<K: MetricKey> IntervalLatency<K> {
    pub fn new() -> Result<Self> {
        Self::with_highest_trackable(DEFAULT_HIGHEST_TRACKABLE)
    }

    pub fn with_highest_trackable(highest_trackable: u64) -> Result<Self> {
        Ok(Self {
            recorder: Recorder::new(
                LatencyAccumulator::new(highest_trackable)?,
                LatencyAccumulator::new(highest_trackable)?,
            ),
            highest_trackable,
        })
    }

    pub fn from_config(config: &LatencyConfig) -> Result<Self> {
        config.validate()?;
        Self::with_highest_trackable(config.highest_trackable_nanos)
    }

    pub fn highest_trackable(&self) -> u64 {
        self.highest_trackable
    }

    pub fn record(&self, key: K, nanos: u64) {
        self.recorder.record(|acc| acc.record(key, nanos));
    }

    /// Latency for every key since the previous call
    pub fn interval_snapshot(&self) -> LatencyCapture<K> {
        self.recorder.capture(|acc| LatencyCapture {
            snapshots: K::VARIANTS.iter().map(|k| acc.snapshot(*k)).collect(),
            _key: PhantomData,
        })
    }
}

/// Time-bucketed latency per key.
#[derive(Debug)]
pub struct RollingLatency<K: MetricKey> {
    window: RollingWindow<LatencyAccumulator<K>>,
    highest_trackable: u64,
}

impl<K: MetricKey> RollingLatency<K> {
    pub fn new(bucket_count: usize, bucket_width: Duration, start: u64) -> Result<Self> {
        Self::with_highest_trackable(bucket_count, bucket_width, start, DEFAULT_HIGHEST_TRACKABLE)
    }

    pub fn with_highest_trackable(
        bucket_count: usize,
        bucket_width: Duration,
        start: u64,
        highest_trackable: u64,
    ) -> Result<Self> {
        if highest_trackable < 2 {
            return Err(PrecipiceError::invalid(
                "highest trackable latency must be at least 2",
            ));
        }
        let window = RollingWindow::new(bucket_count, bucket_width, start, move || {
            LatencyAccumulator::with_valid_bounds(highest_trackable)
        })?;
        Ok(Self {
            window,
            highest_trackable,
        })
    }

    pub fn from_config(rolling: &RollingConfig, latency: &LatencyConfig, start: u64) -> Result<Self> {
        rolling.validate()?;
        latency.validate()?;
        Self::with_highest_trackable(
            rolling.bucket_count,
            rolling.bucket_width(),
            start,
            latency.highest_trackable_nanos,
        )
    }

    pub fn highest_trackable(&self) -> u64 {
        self.highest_trackable
    }

    pub fn record(&self, key: K, nanos: u64, now: u64) {
        self.window.with_current(now, |acc| acc.record(key, nanos));
    }

    /// Latency for `key` over the whole window
    pub fn snapshot(&self, key: K, now: u64) -> LatencySnapshot {
        let mut histogram = empty_histogram(self.highest_trackable);
        for interval in self.window.intervals(now) {
            interval.value.add_to(key, &mut histogram);
        }
        LatencySnapshot::from(histogram)
    }

    /// Latency for `key` over the trailing `span`
    pub fn snapshot_over(&self, key: K, span: Duration, now: u64) -> LatencySnapshot {
        let mut histogram = empty_histogram(self.highest_trackable);
        for interval in self.window.intervals_over(now, span) {
            interval.value.add_to(key, &mut histogram);
        }
        LatencySnapshot::from(histogram)
    }

    /// Every key merged over the trailing `span`
    pub fn snapshot_all_over(&self, span: Duration, now: u64) -> LatencySnapshot {
        let mut histogram = empty_histogram(self.highest_trackable);
        for interval in self.window.intervals_over(now, span) {
            for key in K::VARIANTS {
                interval.value.add_to(*key, &mut histogram);
            }
        }
        LatencySnapshot::from(histogram)
    }

    pub fn window(&self) -> &RollingWindow<LatencyAccumulator<K>> {
        &self.window
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::TimeoutableResult;
    use std::sync::Arc;

    const SECOND: u64 = 1_000_000_000;
    const MILLI: u64 = 1_000_000;

    #[test]
    fn test_accumulator_allocates_lazily() {
        let acc = LatencyAccumulator::<TimeoutableResult>::new(DEFAULT_HIGHEST_TRACKABLE).unwrap();
        assert_eq!(acc.count(TimeoutableResult::Error), 0);
        assert!(acc.snapshot(TimeoutableResult::Error).is_empty());

        acc.record(TimeoutableResult::Error, 5 * MILLI);
        assert_eq!(acc.count(TimeoutableResult::Error), 1);
        assert_eq!(acc.count(TimeoutableResult::Success), 0);
    }

    #[test]
    fn test_snapshot_statistics() {
        let acc = LatencyAccumulator::<TimeoutableResult>::new(DEFAULT_HIGHEST_TRACKABLE).unwrap();
        for ms in 1..=10 {
            acc.record(TimeoutableResult::Success, ms * MILLI);
        }
        let snapshot = acc.snapshot(TimeoutableResult::Success);
        assert_eq!(snapshot.count(), 10);
        assert!(snapshot.min() <= MILLI && snapshot.min() >= MILLI - MILLI / 1000);
        assert!(snapshot.max() >= 10 * MILLI - 10 * MILLI / 1000);
        let mean_ms = snapshot.mean() / MILLI as f64;
        assert!((mean_ms - 5.5).abs() < 0.05, "mean was {}", mean_ms);
        let p50 = snapshot.value_at_percentile(50.0);
        assert!((4 * MILLI..=6 * MILLI).contains(&p50));
    }

    #[test]
    fn test_empty_snapshot_min_is_zero() {
        let acc = LatencyAccumulator::<TimeoutableResult>::new(1_000).unwrap();
        let snapshot = acc.snapshot(TimeoutableResult::Timeout);
        assert_eq!(snapshot.min(), 0);
        assert_eq!(snapshot.count(), 0);
    }

    #[test]
    fn test_interval_latency_drains() {
        let latency = IntervalLatency::<TimeoutableResult>::new().unwrap();
        latency.record(TimeoutableResult::Success, MILLI);
        latency.record(TimeoutableResult::Timeout, 50 * MILLI);

        let capture = latency.interval_snapshot();
        assert_eq!(capture.get(TimeoutableResult::Success).count(), 1);
        assert_eq!(capture.get(TimeoutableResult::Timeout).count(), 1);
        assert_eq!(capture.merged().count(), 2);

        latency.record(TimeoutableResult::Success, 2 * MILLI);
        let next = latency.interval_snapshot();
        assert_eq!(next.get(TimeoutableResult::Success).count(), 1);
        assert!(next.get(TimeoutableResult::Timeout).is_empty());
    }

    #[test]
    fn test_interval_latency_concurrent() {
        let latency = Arc::new(IntervalLatency::<TimeoutableResult>::new().unwrap());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let l = Arc::clone(&latency);
                std::thread::spawn(move || {
                    for i in 0..2_000u64 {
                        l.record(TimeoutableResult::Success, i + 1);
                    }
                })
            })
            .collect();

        let mut seen = 0;
        while handles.iter().any(|h| !h.is_finished()) {
            seen += latency.interval_snapshot().get(TimeoutableResult::Success).count();
        }
        for h in handles {
            h.join().expect("recording thread should not panic");
        }
        seen += latency.interval_snapshot().get(TimeoutableResult::Success).count();
        assert_eq!(seen, 8_000);
    }

    #[test]
    fn test_rolling_latency_spans() {
        let latency =
            RollingLatency::<TimeoutableResult>::new(10, Duration::from_secs(1), 0).unwrap();
        latency.record(TimeoutableResult::Success, 10 * MILLI, 0);
        latency.record(TimeoutableResult::Success, 20 * MILLI, 5 * SECOND);
        latency.record(TimeoutableResult::Error, 30 * MILLI, 5 * SECOND);

        let now = 5 * SECOND;
        assert_eq!(latency.snapshot(TimeoutableResult::Success, now).count(), 2);
        let recent = latency.snapshot_over(TimeoutableResult::Success, Duration::from_secs(1), now);
        assert_eq!(recent.count(), 1);
        assert!(recent.min() >= 20 * MILLI - 20 * MILLI / 1000);
        assert_eq!(latency.snapshot_all_over(Duration::from_secs(1), now).count(), 2);

        // Slot 0 has aged out of a ten bucket window by slot 10
        assert_eq!(latency.snapshot(TimeoutableResult::Success, 10 * SECOND).count(), 1);
    }

    #[test]
    fn test_latency_config_bounds_histograms() {
        let config = LatencyConfig {
            highest_trackable_nanos: MILLI,
        };
        let rolling = RollingConfig {
            bucket_count: 4,
            bucket_width_millis: 1_000,
        };

        let windowed = RollingLatency::<TimeoutableResult>::from_config(&rolling, &config, 0).unwrap();
        assert_eq!(windowed.highest_trackable(), MILLI);
        windowed.record(TimeoutableResult::Success, 5 * SECOND, 0);
        assert!(windowed.snapshot(TimeoutableResult::Success, 0).max() < 2 * MILLI);

        let interval = IntervalLatency::<TimeoutableResult>::from_config(&config).unwrap();
        assert_eq!(interval.highest_trackable(), MILLI);
        interval.record(TimeoutableResult::Error, 5 * SECOND);
        assert!(interval.interval_snapshot().get(TimeoutableResult::Error).max() < 2 * MILLI);

        let tiny = LatencyConfig {
            highest_trackable_nanos: 1,
        };
        assert!(IntervalLatency::<TimeoutableResult>::from_config(&tiny).is_err());
        assert!(RollingLatency::<TimeoutableResult>::from_config(&rolling, &tiny, 0).is_err());
        assert_eq!(LatencyConfig::default().highest_trackable_nanos, DEFAULT_HIGHEST_TRACKABLE);
    }

    #[test]
    fn test_rolling_latency_rejects_tiny_range() {
        assert!(RollingLatency::<TimeoutableResult>::with_highest_trackable(
            4,
            Duration::from_secs(1),
            0,
            1
        )
        .is_err());
    }
}
