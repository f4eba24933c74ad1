//! Circuit Breaker driven by rolling health
//!
//! The breaker fails fast when the guarded resource is unhealthy. It has
//! three states:
//! - Closed: requests pass through; every failed outcome triggers a health
//!   check that may open the circuit
//! - Open: requests are rejected until the backoff has elapsed since the
//!   last test, then one probe is let through; any success closes it again
//! - ForcedOpen: operator override, rejects everything until `force_closed`
//!
//! Health comes from the same rolling result counts the guard rail records
//! into, through a throttled [`HealthChecker`].
//!
//! # Example
//!
//! ```
//! use precipice::backpressure::Backpressure;
//! use precipice::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
//! use precipice::metrics::RollingCounts;
//! use precipice::outcome::{Rejected, TimeoutableResult};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let metrics = Arc::new(RollingCounts::new(10, Duration::from_secs(1), 0).unwrap());
//! let config = CircuitBreakerConfig {
//!     failure_threshold: 2,
//!     health_refresh_millis: 0,
//!     ..Default::default()
//! };
//! let breaker = CircuitBreaker::new("search", config, Rejected::CircuitOpen, Arc::clone(&metrics)).unwrap();
//!
//! metrics.add(TimeoutableResult::Error, 3, 0);
//! breaker.release_permit(1, TimeoutableResult::Error, 0);
//! assert_eq!(breaker.state(), CircuitState::Open);
//! assert_eq!(breaker.acquire_permit(1, 0), Some(Rejected::CircuitOpen));
//! ```

use crate::backpressure::Backpressure;
use crate::error::{PrecipiceError, Result};
use crate::health::{HealthChecker, HealthSnapshot};
use crate::metrics::RollingCounts;
use crate::outcome::{Outcome, Rejection};
use crate::time::duration_nanos;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Failure count threshold that never trips. Kept within TOML's i64 range.
pub const DISABLED_THRESHOLD: u64 = i64::MAX as u64;

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Failures in the trailing period above which the circuit opens
    pub failure_threshold: u64,

    /// Failure percentage above which the circuit opens, once the sample
    /// size threshold is met
    pub failure_percentage_threshold: u8,

    /// Minimum results in the trailing period before the percentage applies
    pub sample_size_threshold: u64,

    /// Span of rolling metrics considered by a health check
    pub trailing_period_millis: u64,

    /// Time an open circuit waits before letting a probe through
    pub backoff_period_millis: u64,

    /// Minimum time between two health aggregations
    pub health_refresh_millis: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DISABLED_THRESHOLD,
            failure_percentage_threshold: 50,
            sample_size_threshold: 10,
            trailing_period_millis: 1_000,
            backoff_period_millis: 1_000,
            health_refresh_millis: 500,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn trailing_period(&self) -> Duration {
        Duration::from_millis(self.trailing_period_millis)
    }

    pub fn backoff_period(&self) -> Duration {
        Duration::from_millis(self.backoff_period_millis)
    }

    pub fn health_refresh(&self) -> Duration {
        Duration::from_millis(self.health_refresh_millis)
    }

    pub fn validate(&self) -> Result<()> {
        if self.failure_percentage_threshold > 100 {
            return Err(PrecipiceError::invalid(
                "failure_percentage_threshold must be between 0 and 100",
            ));
        }
        if self.trailing_period_millis == 0 {
            return Err(PrecipiceError::invalid(
                "trailing_period_millis must be greater than 0",
            ));
        }
        if self.backoff_period_millis == 0 {
            return Err(PrecipiceError::invalid(
                "backoff_period_millis must be greater than 0",
            ));
        }
        Ok(())
    }

    /// Whether `health` crosses either trip threshold
    pub fn is_unhealthy(&self, health: &HealthSnapshot) -> bool {
        health.failures > self.failure_threshold
            || (health.failure_percentage > self.failure_percentage_threshold
                && health.total >= self.sample_size_threshold)
    }
}

/// State of the circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CircuitState {
    Closed = 0,
    Open = 1,
    ForcedOpen = 2,
}

impl CircuitState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => CircuitState::Open,
            2 => CircuitState::ForcedOpen,
            _ => CircuitState::Closed,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::ForcedOpen => write!(f, "forced_open"),
        }
    }
}

/// Point-in-time view of a breaker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerStats {
    pub state: CircuitState,
    pub health: HealthSnapshot,
    /// Time left before an open circuit admits a probe, zero otherwise
    pub backoff_remaining: Duration,
}

/// Health-driven circuit breaker.
///
/// Probe policy: once the backoff has elapsed, admission requires winning a
/// CAS of `last_tested` from the value the caller observed to `now`. Only
/// the winner is admitted; racing callers that read the same stale value
/// lose the CAS and are rejected.
#[derive(Debug)]
pub struct CircuitBreaker<O: Outcome, R: Rejection> {
    name: String,
    config: CircuitBreakerConfig,
    open_reason: R,
    state: AtomicU8,
    last_tested: AtomicU64,
    backoff: u64,
    health: HealthChecker<O>,
}

impl<O: Outcome, R: Rejection> CircuitBreaker<O, R> {
    /// Create a closed breaker reading health from `metrics`
    pub fn new(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
        open_reason: R,
        metrics: Arc<RollingCounts<O>>,
    ) -> Result<Self> {
        config.validate()?;
        let health = HealthChecker::new(metrics, config.trailing_period(), config.health_refresh());
        Ok(Self {
            name: name.into(),
            backoff: duration_nanos(config.backoff_period()),
            config,
            open_reason,
            state: AtomicU8::new(CircuitState::Closed as u8),
            last_tested: AtomicU64::new(0),
            health,
        })
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_open(&self) -> bool {
        self.state() != CircuitState::Closed
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Health snapshot, refreshed if due
    pub fn health(&self, now: u64) -> HealthSnapshot {
        self.health.health(now)
    }

    pub fn stats(&self, now: u64) -> CircuitBreakerStats {
        let state = self.state();
        let backoff_remaining = if state == CircuitState::Open {
            let elapsed = now.saturating_sub(self.last_tested.load(Ordering::Acquire));
            Duration::from_nanos(self.backoff.saturating_sub(elapsed))
        } else {
            Duration::ZERO
        };
        CircuitBreakerStats {
            state,
            health: self.health.cached(),
            backoff_remaining,
        }
    }

    /// Reject everything until [`force_closed`](Self::force_closed)
    pub fn force_open(&self) {
        self.state.store(CircuitState::ForcedOpen as u8, Ordering::Release);
        warn!(breaker = %self.name, "Circuit breaker forced open");
    }

    /// Close unconditionally, discarding any pending backoff
    pub fn force_closed(&self) {
        self.last_tested.store(0, Ordering::Release);
        self.state.store(CircuitState::Closed as u8, Ordering::Release);
        warn!(breaker = %self.name, "Circuit breaker forced closed");
    }

    fn transition(&self, from: CircuitState, to: CircuitState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn try_probe(&self, now: u64) -> bool {
        let last = self.last_tested.load(Ordering::Acquire);
        now.saturating_sub(last) >= self.backoff
            && self
                .last_tested
                .compare_exchange(last, now, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
    }

    fn on_failure(&self, now: u64) {
        let health = self.health.health(now);
        if !self.config.is_unhealthy(&health) {
            return;
        }

        // Stamp first so an acquirer that sees Open never reads a stale test time
        self.last_tested.store(now, Ordering::Release);
        if self.transition(CircuitState::Closed, CircuitState::Open) {
            warn!(
                breaker = %self.name,
                failures = health.failures,
                total = health.total,
                failure_percentage = health.failure_percentage,
                "Circuit breaker opened"
            );
        }
    }
}

impl<O: Outcome, R: Rejection> Backpressure<O, R> for CircuitBreaker<O, R> {
    fn acquire_permit(&self, _units: u64, now: u64) -> Option<R> {
        match self.state() {
            CircuitState::Closed => None,
            CircuitState::ForcedOpen => Some(self.open_reason),
            CircuitState::Open => {
                if self.try_probe(now) {
                    debug!(breaker = %self.name, "Circuit breaker admitting probe");
                    None
                } else {
                    Some(self.open_reason)
                }
            }
        }
    }

    fn release_permit(&self, _units: u64, outcome: O, now: u64) {
        match self.state() {
            CircuitState::Open if outcome.is_success() => {
                if self.transition(CircuitState::Open, CircuitState::Closed) {
                    info!(breaker = %self.name, "Circuit breaker closed after successful probe");
                }
            }
            CircuitState::Closed if outcome.is_failure() => self.on_failure(now),
            _ => {}
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}
