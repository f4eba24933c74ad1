//! Backpressure: the permit contract shared by every admission gate
//!
//! A component either grants `units` permits or names the reason it refused.
//! Granted permits come back exactly once: through `release_permit` with the
//! outcome of the admitted action, or through `release_unused` when a later
//! component in a guard rail chain refused and the request is rolled back.
//!
//! Implementations must be lock-free on both paths. `now` is a caller-supplied
//! nanosecond timestamp; no component reads a clock on its own.

use crate::outcome::{Outcome, Rejection};

/// An admission gate in a guard rail chain.
pub trait Backpressure<O: Outcome, R: Rejection>: Send + Sync {
    /// Try to take `units` permits.
    ///
    /// Returns `None` when granted, or the rejection reason. A rejection never
    /// consumes a permit.
    fn acquire_permit(&self, units: u64, now: u64) -> Option<R>;

    /// Return `units` permits held by an action that finished with `outcome`
    fn release_permit(&self, units: u64, outcome: O, now: u64);

    /// Return `units` permits that were granted but never used.
    ///
    /// Defaults to a no-op for components that hold no per-permit state.
    fn release_unused(&self, units: u64, now: u64) {
        let _ = (units, now);
    }

    /// Name used in logs and observer callbacks
    fn name(&self) -> &str;
}
