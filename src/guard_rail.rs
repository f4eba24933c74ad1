//! Guard Rail: one admission decision over an ordered backpressure chain
//!
//! Acquisition walks the chain in order. The first rejection wins: permits
//! already granted by earlier components are handed back in reverse order
//! through [`Backpressure::release_unused`], the rejection is recorded, and
//! the caller gets the reason. Nothing is held after a rejection.
//!
//! Release records the result first, so a circuit breaker evaluating health
//! sees the outcome that triggered it, then releases every component in
//! chain order.
//!
//! ```text
//!   acquire_permits ──► semaphore ──► rate limiter ──► breaker ──► None
//!                          │              │ reject
//!                          ◄── release_unused (reverse) ──┘
//!
//!   release_permits ──► metrics ──► semaphore ──► rate limiter ──► breaker
//! ```
//!
//! # Example
//!
//! ```
//! use precipice::guard_rail::GuardRail;
//! use precipice::outcome::{Rejected, TimeoutableResult};
//! use precipice::semaphore::Semaphore;
//! use std::sync::Arc;
//!
//! let semaphore = Arc::new(Semaphore::new("pool", 1, Rejected::MaxConcurrencyLevelExceeded).unwrap());
//! let rail = GuardRail::<TimeoutableResult, Rejected>::builder("orders")
//!     .add_backpressure(semaphore)
//!     .build()
//!     .unwrap();
//!
//! let promise = rail.acquire_promise::<u32, String>(1, 0).unwrap();
//! assert_eq!(rail.acquire_permits(1, 0), Some(Rejected::MaxConcurrencyLevelExceeded));
//!
//! promise.complete(TimeoutableResult::Success, 200);
//! assert_eq!(rail.acquire_permits(1, 0), None);
//! assert_eq!(rail.result_totals().count(TimeoutableResult::Success), 1);
//! ```

use crate::backpressure::Backpressure;
use crate::completion::{Completable, PermitContext, Promise};
use crate::error::Result;
use crate::metrics::{IntervalLatency, RollingConfig, RollingCounts, RollingLatency, TotalCounts};
use crate::outcome::{Outcome, Rejection};
use crate::time::{Clock, SystemClock};
use std::sync::Arc;
use tracing::{debug, trace};

/// Hook notified of every permit decision.
///
/// Every method defaults to a no-op.
pub trait PermitObserver<O: Outcome, R: Rejection>: Send + Sync {
    fn on_acquired(&self, _guard_rail: &str, _units: u64, _now: u64) {}

    fn on_rejected(&self, _guard_rail: &str, _units: u64, _rejection: R, _now: u64) {}

    fn on_released(&self, _guard_rail: &str, _units: u64, _outcome: O, _now: u64) {}
}

/// Observer that logs every decision through `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl<O: Outcome, R: Rejection> PermitObserver<O, R> for TracingObserver {
    fn on_acquired(&self, guard_rail: &str, units: u64, now: u64) {
        trace!(guard_rail, units, now, "Permits acquired");
    }

    fn on_rejected(&self, guard_rail: &str, units: u64, rejection: R, now: u64) {
        debug!(guard_rail, units, now, rejection = ?rejection, "Permits rejected");
    }

    fn on_released(&self, guard_rail: &str, units: u64, outcome: O, now: u64) {
        trace!(guard_rail, units, now, outcome = ?outcome, "Permits released");
    }
}

type ReleaseFn<O> = dyn Fn(u64, O, u64, u64) + Send + Sync;

/// Callback returning permits to the guard rail it was created from.
///
/// Arguments are `(units, outcome, start_nanos, now)`.
pub struct ReleaseFunction<O: Outcome> {
    release: Arc<ReleaseFn<O>>,
}

impl<O: Outcome> ReleaseFunction<O> {
    pub fn new(release: impl Fn(u64, O, u64, u64) + Send + Sync + 'static) -> Self {
        Self {
            release: Arc::new(release),
        }
    }

    pub fn release(&self, units: u64, outcome: O, start_nanos: u64, now: u64) {
        (self.release)(units, outcome, start_nanos, now)
    }
}

impl<O: Outcome> Clone for ReleaseFunction<O> {
    fn clone(&self) -> Self {
        Self {
            release: Arc::clone(&self.release),
        }
    }
}

impl<O: Outcome> std::fmt::Debug for ReleaseFunction<O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReleaseFunction").finish_non_exhaustive()
    }
}

struct Inner<O: Outcome, R: Rejection> {
    name: String,
    result_metrics: Arc<RollingCounts<O>>,
    rejected_metrics: Arc<RollingCounts<R>>,
    result_totals: TotalCounts<O>,
    rejected_totals: TotalCounts<R>,
    rolling_latency: Option<Arc<RollingLatency<O>>>,
    interval_latency: Option<Arc<IntervalLatency<O>>>,
    backpressure: Vec<Arc<dyn Backpressure<O, R>>>,
    observers: Vec<Arc<dyn PermitObserver<O, R>>>,
    clock: Arc<dyn Clock>,
}

impl<O: Outcome, R: Rejection> Inner<O, R> {
    fn acquire_permits(&self, units: u64, now: u64) -> Option<R> {
        for (index, component) in self.backpressure.iter().enumerate() {
            if let Some(rejection) = component.acquire_permit(units, now) {
                for granted in self.backpressure[..index].iter().rev() {
                    granted.release_unused(units, now);
                }
                self.rejected_metrics.add(rejection, units, now);
                self.rejected_totals.add(rejection, units);
                trace!(
                    guard_rail = %self.name,
                    component = component.name(),
                    units,
                    "Permit request rejected"
                );
                for observer in &self.observers {
                    observer.on_rejected(&self.name, units, rejection, now);
                }
                return Some(rejection);
            }
        }

        for observer in &self.observers {
            observer.on_acquired(&self.name, units, now);
        }
        None
    }

    fn release_permits(&self, units: u64, outcome: O, start_nanos: u64, now: u64) {
        self.result_metrics.add(outcome, units, now);
        self.result_totals.add(outcome, units);

        let latency = now.saturating_sub(start_nanos);
        if let Some(rolling) = &self.rolling_latency {
            rolling.record(outcome, latency, now);
        }
        if let Some(interval) = &self.interval_latency {
            interval.record(outcome, latency);
        }

        for component in &self.backpressure {
            component.release_permit(units, outcome, now);
        }
        for observer in &self.observers {
            observer.on_released(&self.name, units, outcome, now);
        }
    }

    fn release_without_result(&self, units: u64, now: u64) {
        for component in self.backpressure.iter().rev() {
            component.release_unused(units, now);
        }
    }
}

/// Composite admission controller.
///
/// Cloning yields another handle to the same guard rail.
pub struct GuardRail<O: Outcome, R: Rejection> {
    inner: Arc<Inner<O, R>>,
}

impl<O: Outcome, R: Rejection> GuardRail<O, R> {
    pub fn builder(name: impl Into<String>) -> GuardRailBuilder<O, R> {
        GuardRailBuilder::new(name)
    }

    /// Acquire `units` from every component, all or nothing.
    ///
    /// Returns `None` when admitted. Every admission must be matched by
    /// exactly one [`release_permits`](Self::release_permits) or
    /// [`release_permits_without_result`](Self::release_permits_without_result).
    pub fn acquire_permits(&self, units: u64, now: u64) -> Option<R> {
        self.inner.acquire_permits(units, now)
    }

    /// Record `outcome` and return `units` to every component
    pub fn release_permits(&self, units: u64, outcome: O, start_nanos: u64, now: u64) {
        self.inner.release_permits(units, outcome, start_nanos, now);
    }

    /// Return admitted permits that were never used, recording nothing
    pub fn release_permits_without_result(&self, units: u64, now: u64) {
        self.inner.release_without_result(units, now);
    }

    /// Release callback bound to this guard rail
    pub fn release_function(&self) -> ReleaseFunction<O> {
        let inner = Arc::clone(&self.inner);
        ReleaseFunction::new(move |units, outcome, start_nanos, now| {
            inner.release_permits(units, outcome, start_nanos, now)
        })
    }

    /// Pending promise for permits the caller already acquired at `now`
    pub fn get_promise<T, E>(&self, units: u64, now: u64) -> Promise<O, T, E>
    where
        T: Clone + Send + Sync + 'static,
        E: Clone + Send + Sync + 'static,
    {
        Promise::with_permits(self.permit_context(units, now))
    }

    /// Acquire permits and wrap them in a promise
    pub fn acquire_promise<T, E>(&self, units: u64, now: u64) -> std::result::Result<Promise<O, T, E>, R>
    where
        T: Clone + Send + Sync + 'static,
        E: Clone + Send + Sync + 'static,
    {
        match self.acquire_permits(units, now) {
            Some(rejection) => Err(rejection),
            None => Ok(self.get_promise(units, now)),
        }
    }

    /// Completable for permits the caller already acquired at `now`
    pub fn get_completable(&self, units: u64, now: u64) -> Completable<O> {
        Completable::with_permits(self.permit_context(units, now))
    }

    /// Acquire permits and wrap them in a completable
    pub fn acquire_completable(&self, units: u64, now: u64) -> std::result::Result<Completable<O>, R> {
        match self.acquire_permits(units, now) {
            Some(rejection) => Err(rejection),
            None => Ok(self.get_completable(units, now)),
        }
    }

    fn permit_context(&self, units: u64, now: u64) -> PermitContext<O> {
        PermitContext::new(units, now, self.release_function(), Arc::clone(&self.inner.clock))
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn result_metrics(&self) -> &Arc<RollingCounts<O>> {
        &self.inner.result_metrics
    }

    pub fn rejected_metrics(&self) -> &Arc<RollingCounts<R>> {
        &self.inner.rejected_metrics
    }

    /// Lifetime result counts
    pub fn result_totals(&self) -> &TotalCounts<O> {
        &self.inner.result_totals
    }

    /// Lifetime rejection counts
    pub fn rejected_totals(&self) -> &TotalCounts<R> {
        &self.inner.rejected_totals
    }

    pub fn rolling_latency(&self) -> Option<&Arc<RollingLatency<O>>> {
        self.inner.rolling_latency.as_ref()
    }

    pub fn interval_latency(&self) -> Option<&Arc<IntervalLatency<O>>> {
        self.inner.interval_latency.as_ref()
    }

    pub fn backpressure(&self) -> &[Arc<dyn Backpressure<O, R>>] {
        &self.inner.backpressure
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.inner.clock
    }
}

impl<O: Outcome, R: Rejection> Clone for GuardRail<O, R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<O: Outcome, R: Rejection> std::fmt::Debug for GuardRail<O, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let components: Vec<&str> = self.inner.backpressure.iter().map(|b| b.name()).collect();
        f.debug_struct("GuardRail")
            .field("name", &self.inner.name)
            .field("backpressure", &components)
            .field("observers", &self.inner.observers.len())
            .finish()
    }
}

/// Builder for [`GuardRail`].
///
/// Metrics not supplied are created from [`RollingConfig::default`],
/// starting at the clock's current time. The clock defaults to
/// [`SystemClock`].
pub struct GuardRailBuilder<O: Outcome, R: Rejection> {
    name: String,
    result_metrics: Option<Arc<RollingCounts<O>>>,
    rejected_metrics: Option<Arc<RollingCounts<R>>>,
    rolling_latency: Option<Arc<RollingLatency<O>>>,
    interval_latency: Option<Arc<IntervalLatency<O>>>,
    backpressure: Vec<Arc<dyn Backpressure<O, R>>>,
    observers: Vec<Arc<dyn PermitObserver<O, R>>>,
    clock: Option<Arc<dyn Clock>>,
}

impl<O: Outcome, R: Rejection> GuardRailBuilder<O, R> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            result_metrics: None,
            rejected_metrics: None,
            rolling_latency: None,
            interval_latency: None,
            backpressure: Vec::new(),
            observers: Vec::new(),
            clock: None,
        }
    }

    pub fn result_metrics(mut self, metrics: Arc<RollingCounts<O>>) -> Self {
        self.result_metrics = Some(metrics);
        self
    }

    pub fn rejected_metrics(mut self, metrics: Arc<RollingCounts<R>>) -> Self {
        self.rejected_metrics = Some(metrics);
        self
    }

    pub fn rolling_latency(mut self, latency: Arc<RollingLatency<O>>) -> Self {
        self.rolling_latency = Some(latency);
        self
    }

    pub fn interval_latency(mut self, latency: Arc<IntervalLatency<O>>) -> Self {
        self.interval_latency = Some(latency);
        self
    }

    /// Append a component; components are consulted in the order added
    pub fn add_backpressure(mut self, component: Arc<dyn Backpressure<O, R>>) -> Self {
        self.backpressure.push(component);
        self
    }

    pub fn observer(mut self, observer: Arc<dyn PermitObserver<O, R>>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn build(self) -> Result<GuardRail<O, R>> {
        let clock: Arc<dyn Clock> = match self.clock {
            Some(clock) => clock,
            None => Arc::new(SystemClock::new()),
        };
        let start = clock.nanos();
        let defaults = RollingConfig::default();

        let result_metrics = match self.result_metrics {
            Some(metrics) => metrics,
            None => Arc::new(RollingCounts::from_config(&defaults, start)?),
        };
        let rejected_metrics = match self.rejected_metrics {
            Some(metrics) => metrics,
            None => Arc::new(RollingCounts::from_config(&defaults, start)?),
        };

        debug!(
            guard_rail = %self.name,
            components = self.backpressure.len(),
            "Guard rail built"
        );

        Ok(GuardRail {
            inner: Arc::new(Inner {
                name: self.name,
                result_metrics,
                rejected_metrics,
                result_totals: TotalCounts::new(),
                rejected_totals: TotalCounts::new(),
                rolling_latency: self.rolling_latency,
                interval_latency: self.interval_latency,
                backpressure: self.backpressure,
                observers: self.observers,
                clock,
            }),
        })
    }
}
