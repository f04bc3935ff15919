//! Batching and debouncing of redefinition notifications.
//!
//! Tools tend to redefine many units together. Reacting to each one separately is wasteful
//! because the reaction (re-wiring dependent object graphs) is expensive, so the
//! [`ChangeScheduler`] collects changes into one batch and delivers it once the batch has
//! been quiet for a debounce window and no asynchronous verification is outstanding.
//!
//! # Protocol
//!
//! Every enqueue moves the deadline to `now + window` and schedules a check tagged with the
//! current epoch. A check fires only if
//!
//! 1. the deadline has passed,
//! 2. no verification is pending, and
//! 3. its epoch still matches, meaning no delivery happened since it was scheduled.
//!
//! Failing checks are no-ops; the check scheduled by the latest enqueue (or by the end of
//! the last verification) eventually succeeds. Firing drains the batch and advances the
//! epoch under the lock, then delivers outside of it. The window is a quiescence heuristic,
//! not a deadline guarantee.
//!
//! The decision logic lives in [`SchedulerState`], which takes explicit instants so it can
//! be driven without a clock; a single timer thread drives it in production.

pub mod notify;

use std::{
    cmp::Reverse,
    collections::BinaryHeap,
    mem,
    sync::{Arc, Condvar, Mutex, PoisonError},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use tracing::{debug, error, trace};

use crate::Result;

pub use notify::{ChangeListener, ChangeNotifier, ChangedUnit, NewUnit};

/// One drained batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    /// Redefined units, in enqueue order
    pub changed: Vec<ChangedUnit>,
    /// Newly introduced units, in enqueue order
    pub added: Vec<NewUnit>,
}

impl Batch {
    /// Returns `true` if the batch carries no events.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.added.is_empty()
    }
}

/// The shared mutable state of a scheduler.
#[derive(Debug, Default)]
pub struct SchedulerState {
    batch: Batch,
    pending_verification: usize,
    epoch: u64,
    deadline: Option<Instant>,
    waiting: bool,
    delivering: bool,
}

impl SchedulerState {
    /// Creates an idle state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a redefinition and restarts the window; returns the check to schedule.
    pub fn enqueue_changed(&mut self, unit: ChangedUnit, now: Instant, window: Duration) -> (Instant, u64) {
        self.batch.changed.push(unit);
        self.arm(now, window)
    }

    /// Adds a new unit and restarts the window; returns the check to schedule.
    pub fn enqueue_added(&mut self, unit: NewUnit, now: Instant, window: Duration) -> (Instant, u64) {
        self.batch.added.push(unit);
        self.arm(now, window)
    }

    fn arm(&mut self, now: Instant, window: Duration) -> (Instant, u64) {
        let deadline = now + window;
        self.deadline = Some(deadline);
        self.waiting = true;
        (deadline, self.epoch)
    }

    /// Records the start of an asynchronous verification.
    pub fn begin_verification(&mut self) {
        self.pending_verification += 1;
    }

    /// Records the end of an asynchronous verification.
    ///
    /// Returns the check to schedule if this was the last pending verification of an open
    /// batch, so a batch held back by verification fires once it completes.
    pub fn end_verification(&mut self, now: Instant) -> Option<(Instant, u64)> {
        self.pending_verification = self.pending_verification.saturating_sub(1);
        if self.pending_verification > 0 {
            return None;
        }
        self.deadline.map(|deadline| (deadline.max(now), self.epoch))
    }

    /// Runs the check scheduled for `epoch` at `now`.
    ///
    /// Returns the drained batch if the check fires. The batch may be empty if only the
    /// window was armed; it is still a settle point for waiters.
    pub fn check(&mut self, epoch: u64, now: Instant) -> Option<Batch> {
        if epoch != self.epoch || self.pending_verification > 0 {
            return None;
        }
        match self.deadline {
            Some(deadline) if now >= deadline => {}
            _ => return None,
        }
        self.epoch += 1;
        self.deadline = None;
        self.waiting = false;
        self.delivering = true;
        Some(mem::take(&mut self.batch))
    }

    /// Marks the delivery started by the last firing check as finished.
    pub fn delivered(&mut self) {
        self.delivering = false;
    }

    /// Returns `true` while a batch is open and not yet fired.
    #[must_use]
    pub fn is_waiting(&self) -> bool {
        self.waiting
    }

    /// Returns `true` if nothing is open and no delivery is running.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        !self.waiting && !self.delivering
    }

    /// Number of outstanding verifications.
    #[must_use]
    pub fn pending_verification(&self) -> usize {
        self.pending_verification
    }

    /// Current epoch; advances once per firing check.
    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}

#[derive(Default)]
struct TimerQueue {
    checks: BinaryHeap<Reverse<(Instant, u64)>>,
    shutdown: bool,
}

#[derive(Default)]
struct Inner {
    state: SchedulerState,
    timer: TimerQueue,
}

struct Shared {
    inner: Mutex<Inner>,
    wake: Condvar,
    settled: Condvar,
    window: Duration,
    notifier: Arc<ChangeNotifier>,
}

/// Debounces redefinition events into settled batches.
pub struct ChangeScheduler {
    shared: Arc<Shared>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl ChangeScheduler {
    /// Starts a scheduler with the given debounce window.
    ///
    /// # Errors
    /// Returns [`crate::Error::FileError`] if the timer thread cannot be spawned.
    pub fn new(window: Duration, notifier: Arc<ChangeNotifier>) -> Result<Self> {
        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner::default()),
            wake: Condvar::new(),
            settled: Condvar::new(),
            window,
            notifier,
        });
        let timer = {
            let shared = shared.clone();
            thread::Builder::new()
                .name("hotswap-scheduler".to_string())
                .spawn(move || run_timer(&shared))?
        };
        Ok(ChangeScheduler {
            shared,
            timer: Mutex::new(Some(timer)),
        })
    }

    /// The fan-out that receives settled batches.
    #[must_use]
    pub fn notifier(&self) -> &Arc<ChangeNotifier> {
        &self.shared.notifier
    }

    /// The debounce window.
    #[must_use]
    pub fn window(&self) -> Duration {
        self.shared.window
    }

    /// Adds a redefinition to the open batch.
    pub fn enqueue_changed(&self, unit: ChangedUnit) {
        debug!(unit = %unit.id, "redefinition enqueued");
        let mut inner = lock!(self.shared.inner);
        let check = inner
            .state
            .enqueue_changed(unit, Instant::now(), self.shared.window);
        self.schedule(&mut inner, check);
    }

    /// Adds a newly introduced unit to the open batch.
    pub fn enqueue_added(&self, unit: NewUnit) {
        trace!(unit = %unit.id, "new unit enqueued");
        let mut inner = lock!(self.shared.inner);
        let check = inner
            .state
            .enqueue_added(unit, Instant::now(), self.shared.window);
        self.schedule(&mut inner, check);
    }

    /// Holds notification back until [`ChangeScheduler::end_verification`] is called.
    pub fn begin_verification(&self) {
        lock!(self.shared.inner).state.begin_verification();
    }

    /// Releases one [`ChangeScheduler::begin_verification`].
    pub fn end_verification(&self) {
        let mut inner = lock!(self.shared.inner);
        if let Some(check) = inner.state.end_verification(Instant::now()) {
            self.schedule(&mut inner, check);
        }
    }

    fn schedule(&self, inner: &mut Inner, check: (Instant, u64)) {
        inner.timer.checks.push(Reverse(check));
        self.shared.wake.notify_one();
    }

    /// Returns `true` while a batch is open and has not fired yet.
    #[must_use]
    pub fn is_waiting(&self) -> bool {
        lock!(self.shared.inner).state.is_waiting()
    }

    /// Number of outstanding verifications.
    #[must_use]
    pub fn pending_verification(&self) -> usize {
        lock!(self.shared.inner).state.pending_verification()
    }

    /// Blocks until no batch is open and no delivery is running.
    pub fn wait_for_settle(&self) {
        let inner = lock!(self.shared.inner);
        let _settled = self
            .shared
            .settled
            .wait_while(inner, |inner| !inner.state.is_settled())
            .unwrap_or_else(PoisonError::into_inner);
    }

    /// Like [`ChangeScheduler::wait_for_settle`] but gives up after `timeout`.
    ///
    /// Returns `true` if the scheduler settled in time.
    #[must_use]
    pub fn wait_for_settle_timeout(&self, timeout: Duration) -> bool {
        let inner = lock!(self.shared.inner);
        let (inner, _) = self
            .shared
            .settled
            .wait_timeout_while(inner, timeout, |inner| !inner.state.is_settled())
            .unwrap_or_else(PoisonError::into_inner);
        inner.state.is_settled()
    }

    /// Stops the timer thread. Batches still open are dropped.
    pub fn shutdown(&self) {
        {
            let mut inner = lock!(self.shared.inner);
            inner.timer.shutdown = true;
            self.shared.wake.notify_all();
        }
        let handle = lock!(self.timer).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("scheduler timer thread panicked");
            }
        }
    }
}

impl Drop for ChangeScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_timer(shared: &Shared) {
    let mut inner = lock!(shared.inner);
    loop {
        if inner.timer.shutdown {
            return;
        }
        let now = Instant::now();
        let next = inner.timer.checks.peek().map(|Reverse(check)| *check);
        match next {
            Some((due, epoch)) if due <= now => {
                inner.timer.checks.pop();
                let Some(batch) = inner.state.check(epoch, now) else {
                    continue;
                };
                drop(inner);

                if !batch.is_empty() {
                    debug!(
                        changed = batch.changed.len(),
                        added = batch.added.len(),
                        "batch settled"
                    );
                    shared.notifier.notify(&batch.changed, &batch.added);
                }

                inner = lock!(shared.inner);
                inner.state.delivered();
                shared.settled.notify_all();
            }
            Some((due, _)) => {
                inner = shared
                    .wake
                    .wait_timeout(inner, due - now)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0;
            }
            None => {
                inner = shared
                    .wake
                    .wait(inner)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classfile::{LoaderId, UnitId};

    const WINDOW: Duration = Duration::from_millis(300);

    fn changed(name: &str) -> ChangedUnit {
        ChangedUnit {
            id: UnitId::new(name, LoaderId(1)),
            previous: Arc::from(&b"before"[..]),
            current: Arc::from(&b"after"[..]),
        }
    }

    #[test]
    fn burst_collapses_into_one_batch() {
        let start = Instant::now();
        let mut state = SchedulerState::new();
        let first = state.enqueue_changed(changed("a.A"), start, WINDOW);
        let second = state.enqueue_changed(
            changed("a.B"),
            start + Duration::from_millis(100),
            WINDOW,
        );
        assert_eq!(second.0, start + Duration::from_millis(400));

        // the first check sees a deadline moved further out
        assert!(state.check(first.1, first.0).is_none());
        assert!(state.is_waiting());

        let batch = state.check(second.1, second.0).unwrap();
        assert_eq!(batch.changed.len(), 2);
        assert_eq!(batch.changed[0].id.name, "a/A");
        assert_eq!(batch.changed[1].id.name, "a/B");
        assert!(!state.is_waiting());
        assert!(!state.is_settled());
        state.delivered();
        assert!(state.is_settled());
    }

    #[test]
    fn stale_epoch_checks_are_ignored() {
        let start = Instant::now();
        let mut state = SchedulerState::new();
        let check = state.enqueue_changed(changed("a.A"), start, WINDOW);
        assert!(state.check(check.1, check.0).is_some());
        state.delivered();

        let next = state.enqueue_changed(changed("a.B"), start, WINDOW);
        // the first check fired already; a duplicate of it must not fire the new batch
        assert!(state.check(check.1, check.0 + WINDOW).is_none());
        assert_eq!(state.check(next.1, next.0).unwrap().changed.len(), 1);
    }

    #[test]
    fn pending_verification_holds_the_batch() {
        let start = Instant::now();
        let mut state = SchedulerState::new();
        state.begin_verification();
        let check = state.enqueue_added(
            NewUnit {
                id: UnitId::new("a.New", LoaderId(1)),
            },
            start,
            WINDOW,
        );
        assert!(state.check(check.1, check.0).is_none());

        let late = start + Duration::from_secs(1);
        let rearmed = state.end_verification(late).unwrap();
        assert_eq!(rearmed, (late, check.1));
        let batch = state.check(rearmed.1, rearmed.0).unwrap();
        assert_eq!(batch.added.len(), 1);
    }

    #[test]
    fn verification_without_batch_schedules_nothing() {
        let mut state = SchedulerState::new();
        state.begin_verification();
        assert!(state.end_verification(Instant::now()).is_none());
        assert_eq!(state.pending_verification(), 0);
        assert!(state.is_settled());
    }
}
