//! Outcome and rejection vocabularies
//!
//! Both are closed, caller-defined enumerations. Metrics index accumulators by
//! a key's ordinal, so every key type lists its variants up front.
//!
//! # Example
//!
//! ```
//! use precipice::outcome::{MetricKey, Outcome};
//!
//! #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
//! enum HttpResult {
//!     Ok,
//!     ServerError,
//!     TimedOut,
//!     Aborted,
//! }
//!
//! impl MetricKey for HttpResult {
//!     const VARIANTS: &'static [Self] = &[Self::Ok, Self::ServerError, Self::TimedOut, Self::Aborted];
//!
//!     fn ordinal(self) -> usize {
//!         self as usize
//!     }
//! }
//!
//! impl Outcome for HttpResult {
//!     fn is_success(self) -> bool {
//!         matches!(self, HttpResult::Ok)
//!     }
//!     fn timeout() -> Self {
//!         HttpResult::TimedOut
//!     }
//!     fn cancelled() -> Self {
//!         HttpResult::Aborted
//!     }
//! }
//!
//! assert!(HttpResult::ServerError.is_failure());
//! ```

use std::fmt::Debug;
use std::hash::Hash;

/// A closed set of keys that metrics can be bucketed by.
pub trait MetricKey: Copy + Eq + Hash + Debug + Send + Sync + 'static {
    /// Every variant, in ordinal order
    const VARIANTS: &'static [Self];

    /// Dense index in `0..VARIANTS.len()`
    fn ordinal(self) -> usize;
}

/// Result type of an admitted action.
pub trait Outcome: MetricKey {
    /// Whether this outcome counts as a success
    fn is_success(self) -> bool;

    /// Whether this outcome feeds circuit-breaker failure counts.
    ///
    /// Defaults to `!is_success()`. Override for neutral outcomes such as
    /// cancellation.
    fn is_failure(self) -> bool {
        !self.is_success()
    }

    /// Outcome recorded when a promise times out
    fn timeout() -> Self;

    /// Outcome recorded when a promise is cancelled
    fn cancelled() -> Self;
}

/// Reason a permit request was denied.
pub trait Rejection: MetricKey {}

/// Default outcome vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeoutableResult {
    Success,
    Error,
    Timeout,
    Cancelled,
}

impl MetricKey for TimeoutableResult {
    const VARIANTS: &'static [Self] = &[
        TimeoutableResult::Success,
        TimeoutableResult::Error,
        TimeoutableResult::Timeout,
        TimeoutableResult::Cancelled,
    ];

    fn ordinal(self) -> usize {
        self as usize
    }
}

impl Outcome for TimeoutableResult {
    fn is_success(self) -> bool {
        matches!(self, TimeoutableResult::Success)
    }

    fn is_failure(self) -> bool {
        matches!(self, TimeoutableResult::Error | TimeoutableResult::Timeout)
    }

    fn timeout() -> Self {
        TimeoutableResult::Timeout
    }

    fn cancelled() -> Self {
        TimeoutableResult::Cancelled
    }
}

/// Default rejection vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Rejected {
    MaxConcurrencyLevelExceeded,
    RateLimited,
    CircuitOpen,
}

impl MetricKey for Rejected {
    const VARIANTS: &'static [Self] = &[
        Rejected::MaxConcurrencyLevelExceeded,
        Rejected::RateLimited,
        Rejected::CircuitOpen,
    ];

    fn ordinal(self) -> usize {
        self as usize
    }
}

impl Rejection for Rejected {}

impl std::fmt::Display for Rejected {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Rejected::MaxConcurrencyLevelExceeded => write!(f, "max concurrency level exceeded"),
            Rejected::RateLimited => write!(f, "rate limited"),
            Rejected::CircuitOpen => write!(f, "circuit open"),
        }
    }
}
