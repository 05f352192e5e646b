//! Job-wide container counters shared by every task of the master.
//!
//! All mutation goes through atomic increments and decrements. Any change that
//! can affect the completion predicate wakes tasks blocked in
//! [`JobCounters::wait_finished`].

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use tokio::sync::Notify;

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub total: u32,
    pub requested: u32,
    pub allocated: u32,
    pub completed: u32,
    pub failed: u32,
}

impl fmt::Display for CounterSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "total={}, completed={}, allocated={}, failed={}",
            self.total, self.completed, self.allocated, self.failed
        )
    }
}

pub struct JobCounters {
    total: u32,
    requested: AtomicU32,
    allocated: AtomicU32,
    completed: AtomicU32,
    failed: AtomicU32,
    done: AtomicBool,
    changed: Notify,
}

fn decrement(counter: &AtomicU32) {
    // Never wraps below zero.
    let _ = counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1));
}

impl JobCounters {
    pub fn new(total: u32) -> Self {
        Self {
            total,
            requested: AtomicU32::new(0),
            allocated: AtomicU32::new(0),
            completed: AtomicU32::new(0),
            failed: AtomicU32::new(0),
            done: AtomicBool::new(false),
            changed: Notify::new(),
        }
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    pub fn requested(&self) -> u32 {
        self.requested.load(Ordering::SeqCst)
    }

    pub fn allocated(&self) -> u32 {
        self.allocated.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> u32 {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn failed(&self) -> u32 {
        self.failed.load(Ordering::SeqCst)
    }

    pub fn set_requested(&self, n: u32) {
        self.requested.store(n, Ordering::SeqCst);
    }

    pub fn add_requested(&self, n: u32) {
        self.requested.fetch_add(n, Ordering::SeqCst);
    }

    pub fn add_allocated(&self, n: u32) {
        self.allocated.fetch_add(n, Ordering::SeqCst);
    }

    /// A container ran its command and exited zero.
    pub fn record_success(&self) {
        self.completed.fetch_add(1, Ordering::SeqCst);
        self.changed.notify_waiters();
    }

    /// A container is finished for good without success.
    ///
    /// Shared by every failure path (bad launch context, node agent start
    /// error, nonzero exit). `completed` moves first so readers never see
    /// `failed > completed`.
    pub fn record_failed_container(&self) {
        self.completed.fetch_add(1, Ordering::SeqCst);
        self.failed.fetch_add(1, Ordering::SeqCst);
        self.changed.notify_waiters();
    }

    /// The framework took the container away; its slot goes back to the pool.
    pub fn record_lost(&self) {
        decrement(&self.allocated);
        decrement(&self.requested);
    }

    /// Fraction of containers completed, in `[0, 1]`.
    pub fn progress(&self) -> f32 {
        if self.total == 0 {
            return 1.0;
        }
        (self.completed() as f32 / self.total as f32).clamp(0.0, 1.0)
    }

    /// Set the completion flag.
    pub fn mark_done(&self) {
        self.done.store(true, Ordering::SeqCst);
        self.changed.notify_waiters();
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    /// True once at least `total` containers completed.
    pub fn all_completed(&self) -> bool {
        self.completed() >= self.total
    }

    /// True once the completion flag is set or every container completed.
    pub fn is_finished(&self) -> bool {
        self.is_done() || self.all_completed()
    }

    /// Block until [`is_finished`](Self::is_finished) holds.
    ///
    /// Woken by counter changes; `recheck` bounds how stale the check can get.
    pub async fn wait_finished(&self, recheck: Duration) {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_finished() {
                return;
            }
            let _ = tokio::time::timeout(recheck, notified).await;
        }
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            total: self.total,
            requested: self.requested(),
            allocated: self.allocated(),
            completed: self.completed(),
            failed: self.failed(),
        }
    }
}
