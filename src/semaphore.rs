//! Semaphore: bounded concurrency
//!
//! An atomic count of remaining permits. Acquisition is a CAS loop that
//! never lets the count go below zero; release is an unconditional add.
//! Releasing more than was acquired is a caller bug and is not guarded.
//!
//! # Example
//!
//! ```
//! use precipice::backpressure::Backpressure;
//! use precipice::outcome::{Rejected, TimeoutableResult};
//! use precipice::semaphore::Semaphore;
//!
//! let semaphore = Semaphore::new("db-pool", 2, Rejected::MaxConcurrencyLevelExceeded).unwrap();
//! let gate: &dyn Backpressure<TimeoutableResult, Rejected> = &semaphore;
//!
//! assert_eq!(gate.acquire_permit(2, 0), None);
//! assert_eq!(gate.acquire_permit(1, 0), Some(Rejected::MaxConcurrencyLevelExceeded));
//!
//! gate.release_permit(1, TimeoutableResult::Success, 0);
//! assert_eq!(semaphore.current_concurrency(), 1);
//! ```

use crate::backpressure::Backpressure;
use crate::error::{PrecipiceError, Result};
use crate::outcome::{Outcome, Rejection};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Configuration for a [`Semaphore`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SemaphoreConfig {
    /// Maximum permits held at once
    pub max_concurrency: u64,
}

impl Default for SemaphoreConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 100,
        }
    }
}

impl SemaphoreConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency == 0 {
            return Err(PrecipiceError::invalid("max_concurrency must be at least 1"));
        }
        Ok(())
    }
}

/// Lock-free counting semaphore.
#[derive(Debug)]
pub struct Semaphore<R: Rejection> {
    name: String,
    max_concurrency: u64,
    remaining: AtomicU64,
    reason: R,
}

impl<R: Rejection> Semaphore<R> {
    /// Create a semaphore with `max_concurrency` permits that rejects with `reason`
    pub fn new(name: impl Into<String>, max_concurrency: u64, reason: R) -> Result<Self> {
        SemaphoreConfig { max_concurrency }.validate()?;
        Ok(Self {
            name: name.into(),
            max_concurrency,
            remaining: AtomicU64::new(max_concurrency),
            reason,
        })
    }

    pub fn from_config(name: impl Into<String>, config: &SemaphoreConfig, reason: R) -> Result<Self> {
        Self::new(name, config.max_concurrency, reason)
    }

    /// Take `units` permits if that many remain
    pub fn try_acquire(&self, units: u64) -> bool {
        self.remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |remaining| {
                remaining.checked_sub(units)
            })
            .is_ok()
    }

    pub fn release(&self, units: u64) {
        self.remaining.fetch_add(units, Ordering::AcqRel);
    }

    pub fn remaining_capacity(&self) -> u64 {
        self.remaining.load(Ordering::Acquire)
    }

    pub fn max_concurrency(&self) -> u64 {
        self.max_concurrency
    }

    /// Permits currently held
    pub fn current_concurrency(&self) -> u64 {
        self.max_concurrency.saturating_sub(self.remaining_capacity())
    }
}

impl<O: Outcome, R: Rejection> Backpressure<O, R> for Semaphore<R> {
    fn acquire_permit(&self, units: u64, _now: u64) -> Option<R> {
        if self.try_acquire(units) {
            None
        } else {
            Some(self.reason)
        }
    }

    fn release_permit(&self, units: u64, _outcome: O, _now: u64) {
        self.release(units);
    }

    fn release_unused(&self, units: u64, _now: u64) {
        self.release(units);
    }

    fn name(&self) -> &str {
        &self.name
    }
}
