/*!
 * Precipice - admission control for calls into fallible dependencies
 *
 * A guard rail decides, before an action runs, whether it may run at all.
 * Each admitted action holds permits that are returned exactly once, with
 * the action's outcome, when it completes:
 *
 * ```text
 *   acquire_permits(units) ──► Semaphore ──► RateLimiter ──► CircuitBreaker
 *          │                       │               │                │
 *          │             rejection: roll back earlier components, count it
 *          ▼
 *   Promise / Completable ── complete | fail | timeout | cancel ──► release_permits
 *                                                                      │
 *                                   result counts, latency, component release
 * ```
 *
 * Features:
 * - Lock-free rolling counts and latency histograms
 * - Semaphore, fixed-window rate limiter and circuit breaker components
 * - Single-assignment promises with blocking, callback and `Future` waiters
 * - A background timeout service
 * - A bounded single-producer single-consumer handoff queue
 *
 * Every time-dependent operation takes an explicit `now` in nanoseconds from
 * the guard rail's [`Clock`], so behaviour is deterministic under test.
 */

pub mod backpressure;
pub mod circuit_breaker;
pub mod completion;
pub mod config;
pub mod error;
pub mod exchanging_queue;
pub mod guard_rail;
pub mod health;
pub mod logging;
pub mod metrics;
pub mod outcome;
pub mod rate_limiter;
pub mod semaphore;
pub mod time;
pub mod timeout;

// Re-export commonly used types
pub use backpressure::Backpressure;
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use completion::{Completable, Completion, PermitContext, Promise, PromiseFuture, Status};
pub use config::PrecipiceConfig;
pub use error::{PrecipiceError, Result};
pub use exchanging_queue::{exchanging_queue, QueueConsumer, QueueProducer};
pub use guard_rail::{GuardRail, GuardRailBuilder, PermitObserver, ReleaseFunction};
pub use health::{HealthChecker, HealthSnapshot};
pub use outcome::{MetricKey, Outcome, Rejected, Rejection, TimeoutableResult};
pub use rate_limiter::RateLimiter;
pub use semaphore::Semaphore;
pub use time::{Clock, ManualClock, SystemClock};
pub use timeout::{TimeoutService, TimeoutTask};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Glob import for the usual guard rail setup
pub mod prelude {
    pub use crate::backpressure::Backpressure;
    pub use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
    pub use crate::completion::{Completable, Promise};
    pub use crate::guard_rail::GuardRail;
    pub use crate::metrics::{RollingConfig, RollingCounts};
    pub use crate::outcome::{MetricKey, Outcome, Rejected, Rejection, TimeoutableResult};
    pub use crate::rate_limiter::RateLimiter;
    pub use crate::semaphore::Semaphore;
    pub use crate::time::{Clock, ManualClock, SystemClock};
}
