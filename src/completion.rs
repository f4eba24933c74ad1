//! Completion handshake between an admitted action and its permits
//!
//! A [`Promise`] (or the lighter [`Completable`]) stands for one in-flight
//! permit request. It starts pending and transitions exactly once to one of
//! success, error, timeout or cancelled. Only the first transition has any
//! effect: it releases the permits through the guard rail's
//! [`ReleaseFunction`] with the outcome now known, and, for promises, wakes
//! waiters, runs listeners in registration order and forwards the result to
//! linked promises. Every later attempt returns `false` and changes nothing.
//!
//! # Example
//!
//! ```
//! use precipice::completion::{Completion, Promise, Status};
//! use precipice::outcome::TimeoutableResult;
//!
//! let promise: Promise<TimeoutableResult, &str, String> = Promise::new();
//!
//! assert!(promise.complete(TimeoutableResult::Success, "done"));
//! assert!(!promise.cancel());
//!
//! assert_eq!(promise.status(), Status::Success);
//! assert!(matches!(promise.wait(), Completion::Success { value: "done", .. }));
//! ```

use crate::guard_rail::ReleaseFunction;
use crate::outcome::Outcome;
use crate::time::Clock;
use parking_lot::{Condvar, Mutex};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll, Waker};
use std::time::Duration;

/// Lifecycle of a promise or completable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Status {
    Pending = 0,
    Success = 1,
    Error = 2,
    Timeout = 3,
    Cancelled = 4,
}

impl Status {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Status::Success,
            2 => Status::Error,
            3 => Status::Timeout,
            4 => Status::Cancelled,
            _ => Status::Pending,
        }
    }

    pub fn is_terminal(self) -> bool {
        self != Status::Pending
    }
}

/// Terminal value of a promise
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion<O, T, E> {
    Success { outcome: O, value: T },
    Error { outcome: O, error: E },
    Timeout,
    Cancelled,
}

impl<O: Outcome, T, E> Completion<O, T, E> {
    /// Outcome recorded into metrics for this completion
    pub fn outcome(&self) -> O {
        match self {
            Completion::Success { outcome, .. } | Completion::Error { outcome, .. } => *outcome,
            Completion::Timeout => O::timeout(),
            Completion::Cancelled => O::cancelled(),
        }
    }

    pub fn status(&self) -> Status {
        match self {
            Completion::Success { .. } => Status::Success,
            Completion::Error { .. } => Status::Error,
            Completion::Timeout => Status::Timeout,
            Completion::Cancelled => Status::Cancelled,
        }
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            Completion::Success { value, .. } => Some(value),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&E> {
        match self {
            Completion::Error { error, .. } => Some(error),
            _ => None,
        }
    }

    /// Success value or the completion itself
    pub fn into_result(self) -> Result<T, Self> {
        match self {
            Completion::Success { value, .. } => Ok(value),
            other => Err(other),
        }
    }
}

/// Permits held by a pending completion, and how to give them back
pub struct PermitContext<O: Outcome> {
    units: u64,
    start_nanos: u64,
    release: ReleaseFunction<O>,
    clock: Arc<dyn Clock>,
}

impl<O: Outcome> PermitContext<O> {
    pub fn new(units: u64, start_nanos: u64, release: ReleaseFunction<O>, clock: Arc<dyn Clock>) -> Self {
        Self {
            units,
            start_nanos,
            release,
            clock,
        }
    }

    pub fn units(&self) -> u64 {
        self.units
    }

    pub fn start_nanos(&self) -> u64 {
        self.start_nanos
    }

    fn release(&self, outcome: O) {
        self.release
            .release(self.units, outcome, self.start_nanos, self.clock.nanos());
    }
}

impl<O: Outcome> std::fmt::Debug for PermitContext<O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermitContext")
            .field("units", &self.units)
            .field("start_nanos", &self.start_nanos)
            .finish()
    }
}

/// Synchronous completion without a stored value.
///
/// For callers that run the admitted action inline and only need the
/// release-once guarantee.
#[derive(Debug)]
pub struct Completable<O: Outcome> {
    status: AtomicU8,
    context: Option<PermitContext<O>>,
}

impl<O: Outcome> Completable<O> {
    /// A completable that holds no permits
    pub fn new() -> Self {
        Self {
            status: AtomicU8::new(Status::Pending as u8),
            context: None,
        }
    }

    pub fn with_permits(context: PermitContext<O>) -> Self {
        Self {
            status: AtomicU8::new(Status::Pending as u8),
            context: Some(context),
        }
    }

    pub fn complete(&self, outcome: O) -> bool {
        self.finish(Status::Success, outcome)
    }

    pub fn complete_exceptionally(&self, outcome: O) -> bool {
        self.finish(Status::Error, outcome)
    }

    pub fn complete_with_timeout(&self) -> bool {
        self.finish(Status::Timeout, O::timeout())
    }

    pub fn cancel(&self) -> bool {
        self.finish(Status::Cancelled, O::cancelled())
    }

    pub fn status(&self) -> Status {
        Status::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn is_done(&self) -> bool {
        self.status().is_terminal()
    }

    fn finish(&self, status: Status, outcome: O) -> bool {
        let won = self
            .status
            .compare_exchange(
                Status::Pending as u8,
                status as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if won {
            if let Some(context) = &self.context {
                context.release(outcome);
            }
        }
        won
    }
}

impl<O: Outcome> Default for Completable<O> {
    fn default() -> Self {
        Self::new()
    }
}

type Listener<O, T, E> = Box<dyn FnOnce(&Completion<O, T, E>) + Send>;

struct Waiters<O: Outcome, T, E> {
    wakers: Vec<Waker>,
    listeners: Vec<Listener<O, T, E>>,
    linked: Vec<Promise<O, T, E>>,
    /// Set once the completing thread has run every queued callback
    drained: bool,
}

struct Inner<O: Outcome, T, E> {
    result: OnceLock<Completion<O, T, E>>,
    context: Option<PermitContext<O>>,
    waiters: Mutex<Waiters<O, T, E>>,
    done: Condvar,
}

/// Single-assignment result of one admitted action.
///
/// Cloning yields another handle to the same promise.
pub struct Promise<O: Outcome, T, E> {
    inner: Arc<Inner<O, T, E>>,
}

impl<O, T, E> Promise<O, T, E>
where
    O: Outcome,
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// A promise that holds no permits
    pub fn new() -> Self {
        Self::from_context(None)
    }

    pub fn with_permits(context: PermitContext<O>) -> Self {
        Self::from_context(Some(context))
    }

    fn from_context(context: Option<PermitContext<O>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                result: OnceLock::new(),
                context,
                waiters: Mutex::new(Waiters {
                    wakers: Vec::new(),
                    listeners: Vec::new(),
                    linked: Vec::new(),
                    drained: false,
                }),
                done: Condvar::new(),
            }),
        }
    }

    pub fn complete(&self, outcome: O, value: T) -> bool {
        self.finish(Completion::Success { outcome, value })
    }

    pub fn complete_exceptionally(&self, outcome: O, error: E) -> bool {
        self.finish(Completion::Error { outcome, error })
    }

    pub fn complete_with_timeout(&self) -> bool {
        self.finish(Completion::Timeout)
    }

    pub fn cancel(&self) -> bool {
        self.finish(Completion::Cancelled)
    }

    pub fn status(&self) -> Status {
        self.inner
            .result
            .get()
            .map(Completion::status)
            .unwrap_or(Status::Pending)
    }

    pub fn is_done(&self) -> bool {
        self.inner.result.get().is_some()
    }

    /// Terminal value, if any
    pub fn result(&self) -> Option<&Completion<O, T, E>> {
        self.inner.result.get()
    }

    /// Block until terminal
    pub fn wait(&self) -> Completion<O, T, E> {
        if let Some(done) = self.inner.result.get() {
            return done.clone();
        }
        let mut waiters = self.inner.waiters.lock();
        loop {
            if let Some(done) = self.inner.result.get() {
                return done.clone();
            }
            self.inner.done.wait(&mut waiters);
        }
    }

    /// Block until terminal or until `timeout` passes
    pub fn wait_for(&self, timeout: Duration) -> Option<Completion<O, T, E>> {
        if let Some(done) = self.inner.result.get() {
            return Some(done.clone());
        }
        let mut waiters = self.inner.waiters.lock();
        loop {
            if let Some(done) = self.inner.result.get() {
                return Some(done.clone());
            }
            if self.inner.done.wait_for(&mut waiters, timeout).timed_out() {
                return self.inner.result.get().cloned();
            }
        }
    }

    /// Future resolving to the terminal value
    pub fn future(&self) -> PromiseFuture<O, T, E> {
        PromiseFuture {
            promise: self.clone(),
        }
    }

    /// Run `listener` on completion, immediately if already complete.
    ///
    /// Listeners run in registration order. Until the completing thread has
    /// drained the queue, a late listener joins it and runs there.
    pub fn on_complete(&self, listener: impl FnOnce(&Completion<O, T, E>) + Send + 'static) {
        let mut waiters = self.inner.waiters.lock();
        match (waiters.drained, self.inner.result.get()) {
            (true, Some(done)) => {
                drop(waiters);
                listener(done);
            }
            _ => waiters.listeners.push(Box::new(listener)),
        }
    }

    /// Forward this promise's terminal value to `external`
    pub fn link(&self, external: Promise<O, T, E>) {
        let mut waiters = self.inner.waiters.lock();
        match (waiters.drained, self.inner.result.get()) {
            (true, Some(done)) => {
                drop(waiters);
                external.finish(done.clone());
            }
            _ => waiters.linked.push(external),
        }
    }

    /// Permits this promise releases on completion
    pub fn permits(&self) -> Option<&PermitContext<O>> {
        self.inner.context.as_ref()
    }

    fn finish(&self, completion: Completion<O, T, E>) -> bool {
        let outcome = completion.outcome();
        if self.inner.result.set(completion).is_err() {
            return false;
        }

        if let Some(context) = &self.inner.context {
            context.release(outcome);
        }

        let wakers = {
            let mut waiters = self.inner.waiters.lock();
            self.inner.done.notify_all();
            std::mem::take(&mut waiters.wakers)
        };
        for waker in wakers {
            waker.wake();
        }

        if let Some(done) = self.inner.result.get() {
            self.drain_callbacks(done);
        }
        true
    }

    /// Run queued listeners and links until none are left
    fn drain_callbacks(&self, done: &Completion<O, T, E>) {
        loop {
            let (listeners, linked) = {
                let mut waiters = self.inner.waiters.lock();
                if waiters.listeners.is_empty() && waiters.linked.is_empty() {
                    waiters.drained = true;
                    return;
                }
                (
                    std::mem::take(&mut waiters.listeners),
                    std::mem::take(&mut waiters.linked),
                )
            };
            for listener in listeners {
                listener(done);
            }
            for external in linked {
                external.finish(done.clone());
            }
        }
    }
}

impl<O, T, E> Default for Promise<O, T, E>
where
    O: Outcome,
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<O: Outcome, T, E> Clone for Promise<O, T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<O: Outcome, T, E> std::fmt::Debug for Promise<O, T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = self
            .inner
            .result
            .get()
            .map(Completion::status)
            .unwrap_or(Status::Pending);
        f.debug_struct("Promise")
            .field("status", &status)
            .field("permits", &self.inner.context)
            .finish()
    }
}

/// Future returned by [`Promise::future`]
#[derive(Debug)]
pub struct PromiseFuture<O: Outcome, T, E> {
    promise: Promise<O, T, E>,
}

impl<O, T, E> Future for PromiseFuture<O, T, E>
where
    O: Outcome,
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    type Output = Completion<O, T, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let inner = &self.promise.inner;
        if let Some(done) = inner.result.get() {
            return Poll::Ready(done.clone());
        }

        let mut waiters = inner.waiters.lock();
        // Re-check under the lock: the completer takes the wakers under it
        if let Some(done) = inner.result.get() {
            return Poll::Ready(done.clone());
        }
        if !waiters.wakers.iter().any(|w| w.will_wake(cx.waker())) {
            waiters.wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}
