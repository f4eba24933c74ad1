//! Health evaluation over rolling result counts
//!
//! The checker sums a trailing span of buckets into a [`HealthSnapshot`] and
//! caches it. Refreshes are throttled: at most one thread per refresh
//! interval performs the aggregation, chosen by a CAS on the throttle
//! timestamp; everyone else reads the cached snapshot.

use crate::metrics::RollingCounts;
use crate::outcome::Outcome;
use crate::time::duration_nanos;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

const NEVER: u64 = u64::MAX;

/// Failure/total counts over a trailing span
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HealthSnapshot {
    pub total: u64,
    pub failures: u64,
    /// `floor(100 * failures / total)`, or 0 when `total` is 0
    pub failure_percentage: u8,
}

impl HealthSnapshot {
    pub fn new(total: u64, failures: u64) -> Self {
        let failure_percentage = if total == 0 {
            0
        } else {
            ((u128::from(failures) * 100) / u128::from(total)).min(100) as u8
        };
        Self {
            total,
            failures,
            failure_percentage,
        }
    }
}

/// Throttled, cached health aggregation.
#[derive(Debug)]
pub struct HealthChecker<O: Outcome> {
    metrics: Arc<RollingCounts<O>>,
    trailing: Duration,
    refresh_interval: u64,
    last_health_time: AtomicU64,
    cached: RwLock<HealthSnapshot>,
    aggregations: AtomicU64,
}

impl<O: Outcome> HealthChecker<O> {
    pub fn new(metrics: Arc<RollingCounts<O>>, trailing: Duration, refresh_interval: Duration) -> Self {
        Self {
            metrics,
            trailing,
            refresh_interval: duration_nanos(refresh_interval),
            last_health_time: AtomicU64::new(NEVER),
            cached: RwLock::new(HealthSnapshot::default()),
            aggregations: AtomicU64::new(0),
        }
    }

    /// Current snapshot, refreshed if the refresh interval has elapsed
    pub fn health(&self, now: u64) -> HealthSnapshot {
        let last = self.last_health_time.load(Ordering::Acquire);
        let due = last == NEVER || now.saturating_sub(last) >= self.refresh_interval;

        if due
            && self
                .last_health_time
                .compare_exchange(last, now, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            let snapshot = self.aggregate(now);
            *self.cached.write() = snapshot;
            return snapshot;
        }

        *self.cached.read()
    }

    /// Aggregate now, ignoring the throttle
    pub fn refresh(&self, now: u64) -> HealthSnapshot {
        self.last_health_time.store(now, Ordering::Release);
        let snapshot = self.aggregate(now);
        *self.cached.write() = snapshot;
        snapshot
    }

    /// Last snapshot built, without refreshing
    pub fn cached(&self) -> HealthSnapshot {
        *self.cached.read()
    }

    pub fn trailing(&self) -> Duration {
        self.trailing
    }

    /// Number of trailing-window aggregations performed so far
    pub fn aggregations(&self) -> u64 {
        self.aggregations.load(Ordering::Relaxed)
    }

    fn aggregate(&self, now: u64) -> HealthSnapshot {
        self.aggregations.fetch_add(1, Ordering::Relaxed);
        let mut total = 0u64;
        let mut failures = 0u64;
        for interval in self.metrics.intervals_over(now, self.trailing) {
            total = total.saturating_add(interval.value.total());
            failures = failures.saturating_add(interval.value.total_where(O::is_failure));
        }
        HealthSnapshot::new(total, failures)
    }
}
