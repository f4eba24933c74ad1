//! Timeout service: a background deadline scheduler
//!
//! One named thread per service owns a min-heap of deadlines. Callers hand
//! it tasks over a crossbeam channel; the thread sleeps until the nearest
//! deadline or the next message, then fires every expired task. Firing a
//! promise's timeout is a completion attempt like any other, so a promise
//! that already finished ignores it.
//!
//! Deadlines are absolute nanoseconds in the service clock's timeline, so
//! the `now` passed to [`TimeoutService::schedule_timeout`] must come from
//! the same clock. The thread itself sleeps in real time.

use crate::completion::{Completable, Promise};
use crate::error::{PrecipiceError, Result};
use crate::outcome::Outcome;
use crate::time::{duration_nanos, Clock};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::BinaryHeap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info};

/// Something that can be timed out
pub trait TimeoutTask: Send + Sync {
    fn on_timeout(&self);
}

impl<O, T, E> TimeoutTask for Promise<O, T, E>
where
    O: Outcome,
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn on_timeout(&self) {
        self.complete_with_timeout();
    }
}

impl<O: Outcome> TimeoutTask for Completable<O> {
    fn on_timeout(&self) {
        self.complete_with_timeout();
    }
}

/// Configuration for a [`TimeoutService`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutServiceConfig {
    /// Name of the background thread
    pub name: String,

    /// Longer timeouts are clamped to this
    pub max_timeout_millis: u64,
}

impl Default for TimeoutServiceConfig {
    fn default() -> Self {
        Self {
            name: "precipice-timeout".to_string(),
            max_timeout_millis: 24 * 60 * 60 * 1_000,
        }
    }
}

impl TimeoutServiceConfig {
    pub fn max_timeout(&self) -> Duration {
        Duration::from_millis(self.max_timeout_millis)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(PrecipiceError::invalid("timeout service name must not be empty"));
        }
        if self.max_timeout_millis == 0 {
            return Err(PrecipiceError::invalid(
                "max_timeout_millis must be greater than 0",
            ));
        }
        Ok(())
    }
}

struct Entry {
    deadline: u64,
    seq: u64,
    task: Arc<dyn TimeoutTask>,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        (self.deadline, self.seq) == (other.deadline, other.seq)
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (self.deadline, self.seq).cmp(&(other.deadline, other.seq))
    }
}

/// Deadline-ordered task heap.
///
/// Ties on the deadline expire in scheduling order.
#[derive(Default)]
pub struct TimeoutQueue {
    heap: BinaryHeap<Reverse<Entry>>,
    next_seq: u64,
}

impl TimeoutQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, task: Arc<dyn TimeoutTask>, deadline: u64) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Reverse(Entry { deadline, seq, task }));
    }

    /// Nearest deadline, if any
    pub fn next_deadline(&self) -> Option<u64> {
        self.heap.peek().map(|Reverse(entry)| entry.deadline)
    }

    /// Remove every task whose deadline is at or before `now`, earliest first
    pub fn expire(&mut self, now: u64) -> Vec<Arc<dyn TimeoutTask>> {
        let mut expired = Vec::new();
        while self.next_deadline().is_some_and(|deadline| deadline <= now) {
            if let Some(Reverse(entry)) = self.heap.pop() {
                expired.push(entry.task);
            }
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn clear(&mut self) {
        self.heap.clear();
    }
}

impl std::fmt::Debug for TimeoutQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeoutQueue")
            .field("len", &self.heap.len())
            .field("next_deadline", &self.next_deadline())
            .finish()
    }
}

enum Message {
    Schedule { deadline: u64, task: Arc<dyn TimeoutTask> },
    Stop,
}

/// Background deadline scheduler.
///
/// # Example
///
/// ```
/// use precipice::completion::{Promise, Status};
/// use precipice::outcome::TimeoutableResult;
/// use precipice::time::{Clock, SystemClock};
/// use precipice::timeout::{TimeoutService, TimeoutServiceConfig};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// let clock = Arc::new(SystemClock::new());
/// let service = TimeoutService::new(TimeoutServiceConfig::default(), clock.clone()).unwrap();
///
/// let promise: Promise<TimeoutableResult, (), ()> = Promise::new();
/// service
///     .schedule_timeout(Arc::new(promise.clone()), Duration::from_millis(5), clock.nanos())
///     .unwrap();
///
/// assert_eq!(promise.wait().status(), Status::Timeout);
/// ```
pub struct TimeoutService {
    name: String,
    max_timeout: u64,
    sender: Sender<Message>,
    accepting: Arc<AtomicBool>,
    pending: Arc<AtomicUsize>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TimeoutService {
    /// Start the service thread
    pub fn new(config: TimeoutServiceConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;

        let max_timeout = duration_nanos(config.max_timeout());
        let (sender, receiver) = unbounded();
        let pending = Arc::new(AtomicUsize::new(0));
        let accepting = Arc::new(AtomicBool::new(true));
        let worker = Worker {
            receiver,
            clock,
            pending: Arc::clone(&pending),
            accepting: Arc::clone(&accepting),
        };
        let handle = thread::Builder::new()
            .name(config.name.clone())
            .spawn(move || worker.run())?;

        info!(service = %config.name, "Timeout service started");

        Ok(Self {
            name: config.name,
            max_timeout,
            sender,
            accepting,
            pending,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Fire `task.on_timeout()` once `timeout` has passed since `now`.
    ///
    /// Timeouts above the configured maximum are clamped to it. Fails with
    /// [`PrecipiceError::TimeoutServiceStopped`] once the service is stopped.
    pub fn schedule_timeout(&self, task: Arc<dyn TimeoutTask>, timeout: Duration, now: u64) -> Result<()> {
        if !self.is_accepting() {
            return Err(PrecipiceError::TimeoutServiceStopped);
        }

        let timeout = duration_nanos(timeout).min(self.max_timeout);
        let deadline = now.saturating_add(timeout);

        self.pending.fetch_add(1, Ordering::AcqRel);
        if self.sender.send(Message::Schedule { deadline, task }).is_err() {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            return Err(PrecipiceError::TimeoutServiceStopped);
        }
        Ok(())
    }

    /// Timeouts scheduled but not yet fired
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    pub fn max_timeout(&self) -> Duration {
        Duration::from_nanos(self.max_timeout)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stop accepting work and shut the thread down.
    ///
    /// Pending timeouts are dropped without firing. Idempotent.
    pub fn stop(&self) {
        let was_accepting = self.accepting.swap(false, Ordering::AcqRel);
        let _ = self.sender.send(Message::Stop);
        if let Some(handle) = self.handle.lock().take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
        if was_accepting {
            info!(service = %self.name, "Timeout service stopped");
        }
    }
}

impl Drop for TimeoutService {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for TimeoutService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeoutService")
            .field("name", &self.name)
            .field("accepting", &self.is_accepting())
            .field("pending", &self.pending())
            .finish()
    }
}

struct Worker {
    receiver: Receiver<Message>,
    clock: Arc<dyn Clock>,
    pending: Arc<AtomicUsize>,
    accepting: Arc<AtomicBool>,
}

impl Worker {
    fn run(self) {
        // Cleared on every exit path, unwinding included
        let _exit = ExitGuard(Arc::clone(&self.accepting));
        let mut queue = TimeoutQueue::new();

        loop {
            let expired = queue.expire(self.clock.nanos());
            if !expired.is_empty() {
                debug!(count = expired.len(), "Firing timeouts");
            }
            for task in expired {
                fire(task.as_ref());
                self.pending.fetch_sub(1, Ordering::AcqRel);
            }

            let message = match queue.next_deadline() {
                Some(deadline) => {
                    let wait = deadline.saturating_sub(self.clock.nanos());
                    self.receiver.recv_timeout(Duration::from_nanos(wait))
                }
                None => self.receiver.recv().map_err(|_| RecvTimeoutError::Disconnected),
            };

            match message {
                Ok(Message::Schedule { deadline, task }) => queue.push(task, deadline),
                Ok(Message::Stop) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {}
            }
        }

        self.pending.fetch_sub(queue.len(), Ordering::AcqRel);
        debug!(dropped = queue.len(), "Timeout service thread exiting");
    }
}

/// Run one timeout, containing a panic from the task or its listeners
fn fire(task: &dyn TimeoutTask) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| task.on_timeout())) {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        error!(panic = %message, "Timeout task panicked");
    }
}

struct ExitGuard(Arc<AtomicBool>);

impl Drop for ExitGuard {
    fn drop(&mut self) {
        if self.0.swap(false, Ordering::AcqRel) {
            error!("Timeout service thread exited while accepting work");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::Status;
    use crate::outcome::TimeoutableResult;
    use crate::time::SystemClock;
    use std::sync::atomic::AtomicU64;

    type TestPromise = Promise<TimeoutableResult, u32, ()>;

    struct Tagged {
        id: u64,
        fired: Arc<Mutex<Vec<u64>>>,
    }

    impl TimeoutTask for Tagged {
        fn on_timeout(&self) {
            self.fired.lock().push(self.id);
        }
    }

    #[test]
    fn test_queue_expires_in_deadline_order() {
        let fired = Arc::new(Mutex::new(Vec::new()));
        let mut queue = TimeoutQueue::new();
        for (id, deadline) in [(1, 30), (2, 10), (3, 20), (4, 10)] {
            queue.push(
                Arc::new(Tagged {
                    id,
                    fired: Arc::clone(&fired),
                }),
                deadline,
            );
        }
        assert_eq!(queue.next_deadline(), Some(10));

        for task in queue.expire(20) {
            task.on_timeout();
        }
        assert_eq!(*fired.lock(), vec![2, 4, 3]);
        assert_eq!(queue.len(), 1);
        assert!(queue.expire(29).is_empty());
        assert_eq!(queue.expire(u64::MAX).len(), 1);
        assert!(queue.is_empty());
    }

    fn service(max_timeout_millis: u64) -> (Arc<SystemClock>, TimeoutService) {
        let clock = Arc::new(SystemClock::new());
        let config = TimeoutServiceConfig {
            name: "test-timeout".to_string(),
            max_timeout_millis,
        };
        let service = TimeoutService::new(config, clock.clone()).unwrap();
        (clock, service)
    }

    #[test]
    fn test_times_out_pending_promise() {
        let (clock, service) = service(60_000);
        let promise = TestPromise::new();
        service
            .schedule_timeout(Arc::new(promise.clone()), Duration::from_millis(10), clock.nanos())
            .unwrap();

        assert_eq!(promise.wait().status(), Status::Timeout);
    }

    #[test]
    fn test_completed_promise_ignores_timeout() {
        let (clock, service) = service(60_000);
        let promise = TestPromise::new();
        service
            .schedule_timeout(Arc::new(promise.clone()), Duration::from_millis(10), clock.nanos())
            .unwrap();
        assert!(promise.complete(TimeoutableResult::Success, 5));

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(promise.status(), Status::Success);
        assert_eq!(service.pending(), 0);
    }

    #[test]
    fn test_timeout_is_clamped() {
        let (clock, service) = service(10);
        let promise = TestPromise::new();
        service
            .schedule_timeout(Arc::new(promise.clone()), Duration::from_secs(3_600), clock.nanos())
            .unwrap();

        let done = promise.wait_for(Duration::from_secs(5));
        assert_eq!(done.map(|c| c.status()), Some(Status::Timeout));
    }

    #[test]
    fn test_schedule_after_stop_fails() {
        let (clock, service) = service(60_000);
        let promise = TestPromise::new();
        service
            .schedule_timeout(Arc::new(promise.clone()), Duration::from_secs(60), clock.nanos())
            .unwrap();
        assert_eq!(service.pending(), 1);

        service.stop();
        assert!(!service.is_accepting());
        assert_eq!(service.pending(), 0);
        assert_eq!(promise.status(), Status::Pending);

        let err = service
            .schedule_timeout(Arc::new(TestPromise::new()), Duration::from_millis(1), clock.nanos())
            .unwrap_err();
        assert!(matches!(err, PrecipiceError::TimeoutServiceStopped));

        // Stopping twice is harmless
        service.stop();
    }

    #[test]
    fn test_nearer_deadline_preempts_wait() {
        let (clock, service) = service(60_000);
        let far = TestPromise::new();
        let near = TestPromise::new();
        service
            .schedule_timeout(Arc::new(far.clone()), Duration::from_secs(30), clock.nanos())
            .unwrap();
        service
            .schedule_timeout(Arc::new(near.clone()), Duration::from_millis(5), clock.nanos())
            .unwrap();

        let done = near.wait_for(Duration::from_secs(5));
        assert_eq!(done.map(|c| c.status()), Some(Status::Timeout));
        assert_eq!(far.status(), Status::Pending);
    }

    #[test]
    fn test_completable_timeout() {
        let (clock, service) = service(60_000);
        let completable = Arc::new(Completable::<TimeoutableResult>::new());
        service
            .schedule_timeout(completable.clone(), Duration::from_millis(1), clock.nanos())
            .unwrap();

        let polls = AtomicU64::new(0);
        while !completable.is_done() && polls.fetch_add(1, Ordering::Relaxed) < 500 {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(completable.status(), Status::Timeout);
    }

    #[test]
    fn test_panicking_listener_does_not_stall_other_timeouts() {
        let (clock, service) = service(60_000);
        let faulty = TestPromise::new();
        faulty.on_complete(|_| panic!("listener failure"));
        let bystander = TestPromise::new();

        service
            .schedule_timeout(Arc::new(faulty.clone()), Duration::from_millis(5), clock.nanos())
            .unwrap();
        service
            .schedule_timeout(Arc::new(bystander.clone()), Duration::from_millis(50), clock.nanos())
            .unwrap();

        let done = bystander.wait_for(Duration::from_secs(5));
        assert_eq!(done.map(|c| c.status()), Some(Status::Timeout));
        assert_eq!(faulty.status(), Status::Timeout);
        assert!(service.is_accepting());

        let later = TestPromise::new();
        service
            .schedule_timeout(Arc::new(later.clone()), Duration::from_millis(1), clock.nanos())
            .unwrap();
        let done = later.wait_for(Duration::from_secs(5));
        assert_eq!(done.map(|c| c.status()), Some(Status::Timeout));
    }

    #[derive(Debug, Default)]
    struct FailingClock {
        armed: AtomicBool,
    }

    impl Clock for FailingClock {
        fn nanos(&self) -> u64 {
            if self.armed.load(Ordering::SeqCst) {
                panic!("clock failure");
            }
            0
        }
    }

    #[test]
    fn test_dead_thread_stops_accepting() {
        let clock = Arc::new(FailingClock::default());
        let service = TimeoutService::new(TimeoutServiceConfig::default(), clock.clone()).unwrap();

        clock.armed.store(true, Ordering::SeqCst);
        service
            .schedule_timeout(Arc::new(TestPromise::new()), Duration::from_millis(1), 0)
            .unwrap();

        let mut polls = 0;
        while service.is_accepting() && polls < 500 {
            std::thread::sleep(Duration::from_millis(10));
            polls += 1;
        }
        assert!(!service.is_accepting());

        let err = service
            .schedule_timeout(Arc::new(TestPromise::new()), Duration::from_millis(1), 0)
            .unwrap_err();
        assert!(matches!(err, PrecipiceError::TimeoutServiceStopped));
        service.stop();
    }

    #[test]
    fn test_config_validation() {
        assert!(TimeoutServiceConfig::default().validate().is_ok());
        let bad = TimeoutServiceConfig {
            max_timeout_millis: 0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }
}
