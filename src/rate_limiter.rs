//! Rate limiter: fixed window throughput bound
//!
//! An atomic count of units admitted in the current period plus an atomic
//! rollover deadline. The first acquirer to observe `now >= deadline` wins a
//! CAS that moves the deadline forward and resets the count; losers re-read
//! and proceed against the new period. Permits are not returned on release:
//! the limit is on admissions per period, not on work in flight.
//!
//! # Example
//!
//! ```
//! use precipice::outcome::Rejected;
//! use precipice::rate_limiter::RateLimiter;
//! use std::time::Duration;
//!
//! let limiter = RateLimiter::new("api", 2, Duration::from_secs(1), Rejected::RateLimited, 0).unwrap();
//!
//! assert!(limiter.try_acquire(2, 0));
//! assert!(!limiter.try_acquire(1, 500_000_000));
//!
//! // The next period admits again
//! assert!(limiter.try_acquire(1, 1_000_000_000));
//! ```

use crate::backpressure::Backpressure;
use crate::error::{PrecipiceError, Result};
use crate::outcome::{Outcome, Rejection};
use crate::time::duration_nanos;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Configuration for a [`RateLimiter`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimiterConfig {
    /// Units admitted per period
    pub allowed_per_period: u64,

    /// Period length in milliseconds
    pub period_millis: u64,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            allowed_per_period: 1_000,
            period_millis: 1_000,
        }
    }
}

impl RateLimiterConfig {
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_millis)
    }

    pub fn validate(&self) -> Result<()> {
        if self.allowed_per_period == 0 {
            return Err(PrecipiceError::invalid("allowed_per_period must be at least 1"));
        }
        if self.period_millis == 0 {
            return Err(PrecipiceError::invalid("period_millis must be greater than 0"));
        }
        Ok(())
    }
}

/// Lock-free fixed window rate limiter.
#[derive(Debug)]
pub struct RateLimiter<R: Rejection> {
    name: String,
    allowed_per_period: u64,
    period: u64,
    count: AtomicU64,
    deadline: AtomicU64,
    reason: R,
}

impl<R: Rejection> RateLimiter<R> {
    /// Create a limiter whose first period starts at `now`
    pub fn new(
        name: impl Into<String>,
        allowed_per_period: u64,
        period: Duration,
        reason: R,
        now: u64,
    ) -> Result<Self> {
        if allowed_per_period == 0 {
            return Err(PrecipiceError::invalid("allowed_per_period must be at least 1"));
        }
        let period = duration_nanos(period);
        if period == 0 {
            return Err(PrecipiceError::invalid("rate limiter period must be greater than 0"));
        }

        Ok(Self {
            name: name.into(),
            allowed_per_period,
            period,
            count: AtomicU64::new(0),
            deadline: AtomicU64::new(now.saturating_add(period)),
            reason,
        })
    }

    pub fn from_config(
        name: impl Into<String>,
        config: &RateLimiterConfig,
        reason: R,
        now: u64,
    ) -> Result<Self> {
        config.validate()?;
        Self::new(name, config.allowed_per_period, config.period(), reason, now)
    }

    /// Admit `units` if they fit in the current period
    pub fn try_acquire(&self, units: u64, now: u64) -> bool {
        self.roll_over(now);

        let allowed = self.allowed_per_period;
        self.count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                count.checked_add(units).filter(|next| *next <= allowed)
            })
            .is_ok()
    }

    fn roll_over(&self, now: u64) {
        let mut deadline = self.deadline.load(Ordering::Acquire);
        while now >= deadline {
            let mut next = deadline.saturating_add(self.period);
            if next <= now {
                // Idle for more than a full period
                next = now.saturating_add(self.period);
            }
            match self
                .deadline
                .compare_exchange(deadline, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    // An acquirer that read the new deadline before this store
                    // may have its units wiped, admitting slightly more than
                    // the limit in that period.
                    self.count.store(0, Ordering::Release);
                    return;
                }
                Err(current) => deadline = current,
            }
        }
    }

    /// Units admitted so far in the current period
    pub fn current_count(&self) -> u64 {
        self.count.load(Ordering::Acquire)
    }

    pub fn allowed_per_period(&self) -> u64 {
        self.allowed_per_period
    }

    pub fn period(&self) -> Duration {
        Duration::from_nanos(self.period)
    }

    /// Nanosecond timestamp at which the current period ends
    pub fn rollover_deadline(&self) -> u64 {
        self.deadline.load(Ordering::Acquire)
    }
}

impl<O: Outcome, R: Rejection> Backpressure<O, R> for RateLimiter<R> {
    fn acquire_permit(&self, units: u64, now: u64) -> Option<R> {
        if self.try_acquire(units, now) {
            None
        } else {
            Some(self.reason)
        }
    }

    fn release_permit(&self, _units: u64, _outcome: O, _now: u64) {}

    fn name(&self) -> &str {
        &self.name
    }
}
