//! Deferred-callback queue driven by an external clock.
//!
//! The acquisition controller and the thermal monitor never sleep. When they
//! need to check something again later they schedule a [`TimerTask`] here and
//! return. Whoever owns the clock (the tokio runtime in production, the test
//! itself in unit tests) asks for the next deadline, advances time, and hands
//! each due [`TimerHandle`] back to the session.
//!
//! Time is a [`Duration`] since an arbitrary epoch chosen by the caller, so the
//! queue has no dependency on wall-clock time.
//!
//! ```text
//!   schedule(task, now, delay) ──> pending ──pop_due(now)──> fired
//!                                     │
//!                                     └──cancel(handle)──> cancelled
//! ```
//!
//! Cancelling a handle that already fired or was already cancelled is not an
//! error; [`TimerQueue::cancel`] reports which of the three cases applied.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

const PENDING: u8 = 0;
const FIRED: u8 = 1;
const CANCELLED: u8 = 2;

/// The two independent callback streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerTask {
    /// Acquisition status re-check.
    AcquisitionPoll,
    /// Temperature refresh.
    TemperaturePoll,
}

/// Identifies one scheduled callback.
///
/// The handle carries the callback's fate, so the queue forgets a callback as
/// soon as it fires or is cancelled. Clones share that fate.
#[derive(Debug, Clone)]
pub struct TimerHandle {
    id: u64,
    task: TimerTask,
    deadline: Duration,
    fate: Arc<AtomicU8>,
}

impl TimerHandle {
    /// Which stream this callback belongs to.
    pub fn task(&self) -> TimerTask {
        self.task
    }

    /// When the callback is (or was) due.
    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    fn settle(&self, fate: u8) -> u8 {
        self.fate
            .compare_exchange(PENDING, fate, Ordering::AcqRel, Ordering::Acquire)
            .unwrap_or_else(|previous| previous)
    }
}

impl PartialEq for TimerHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for TimerHandle {}

/// What a cancellation actually did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The callback was pending and will not fire.
    Cancelled,
    /// The callback had already fired.
    AlreadyFired,
    /// The callback had already been cancelled.
    AlreadyCancelled,
}

/// Timer queue. See the module docs.
///
/// Only pending callbacks are stored.
#[derive(Debug, Default)]
pub struct TimerQueue {
    next_id: u64,
    pending: BTreeMap<(Duration, u64), TimerHandle>,
}

impl TimerQueue {
    /// Empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `task` to fire `delay` after `now`.
    pub fn schedule(&mut self, task: TimerTask, now: Duration, delay: Duration) -> TimerHandle {
        let id = self.next_id;
        self.next_id += 1;
        let handle = TimerHandle {
            id,
            task,
            deadline: now.saturating_add(delay),
            fate: Arc::new(AtomicU8::new(PENDING)),
        };
        self.pending.insert((handle.deadline, id), handle.clone());
        handle
    }

    /// Cancel a callback. Idempotent.
    pub fn cancel(&mut self, handle: &TimerHandle) -> CancelOutcome {
        match handle.settle(CANCELLED) {
            PENDING => {
                self.pending.remove(&(handle.deadline, handle.id));
                CancelOutcome::Cancelled
            }
            FIRED => CancelOutcome::AlreadyFired,
            _ => CancelOutcome::AlreadyCancelled,
        }
    }

    /// Cancel every pending callback of `task`. Returns how many were cancelled.
    pub fn cancel_task(&mut self, task: TimerTask) -> usize {
        let before = self.pending.len();
        self.pending.retain(|_, handle| {
            if handle.task == task {
                handle.settle(CANCELLED);
                false
            } else {
                true
            }
        });
        before - self.pending.len()
    }

    /// Cancel everything.
    pub fn cancel_all(&mut self) -> usize {
        self.cancel_task(TimerTask::AcquisitionPoll) + self.cancel_task(TimerTask::TemperaturePoll)
    }

    /// Remove and return the earliest callback due at `now`.
    pub fn pop_due(&mut self, now: Duration) -> Option<TimerHandle> {
        let mut entry = self.pending.first_entry()?;
        if entry.key().0 > now {
            return None;
        }
        let handle = entry.remove();
        handle.settle(FIRED);
        Some(handle)
    }

    /// Deadline of the earliest pending callback.
    pub fn next_deadline(&self) -> Option<Duration> {
        self.pending.keys().next().map(|(deadline, _)| *deadline)
    }

    /// True while `handle` has neither fired nor been cancelled.
    pub fn is_pending(&self, handle: &TimerHandle) -> bool {
        handle.fate.load(Ordering::Acquire) == PENDING
    }

    /// True when any callback of `task` is pending.
    pub fn has_pending(&self, task: TimerTask) -> bool {
        self.pending.values().any(|h| h.task == task)
    }

    /// Number of pending callbacks.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// True when nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
