//! Thread synchronizer - suspend/resume for the processing thread
//!
//! The wake is latched: a `resume` that happens before the next `suspend`
//! makes that `suspend` return immediately instead of being lost.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Sleep/wake primitive shared between the processing thread and submitters
#[derive(Default)]
pub struct ThreadSynchronizer {
    /// Set by `resume`, consumed by `suspend`
    wake_pending: Mutex<bool>,
    condvar: Condvar,
    /// Number of threads currently blocked in `suspend`
    suspended: AtomicUsize,
}

impl ThreadSynchronizer {
    /// Create a synchronizer with no pending wake
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until `resume` is called. Returns immediately if a wake is
    /// already pending.
    pub fn suspend(&self) {
        let mut pending = self.wake_pending.lock();
        if !*pending {
            self.suspended.fetch_add(1, Ordering::AcqRel);
            while !*pending {
                self.condvar.wait(&mut pending);
            }
            self.suspended.fetch_sub(1, Ordering::AcqRel);
        }
        *pending = false;
    }

    /// Like `suspend` but gives up after `timeout`. Returns true if woken.
    ///
    /// Spurious wake-ups don't extend the total wait past `timeout`.
    pub fn suspend_for(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut pending = self.wake_pending.lock();
        if !*pending {
            self.suspended.fetch_add(1, Ordering::AcqRel);
            while !*pending {
                if self.condvar.wait_until(&mut pending, deadline).timed_out() {
                    break;
                }
            }
            self.suspended.fetch_sub(1, Ordering::AcqRel);
        }
        let woken = *pending;
        *pending = false;
        woken
    }

    /// Wake the suspended thread, or latch the wake for its next suspend
    pub fn resume(&self) {
        let mut pending = self.wake_pending.lock();
        *pending = true;
        self.condvar.notify_one();
    }

    /// Check if a wake is latched and not yet consumed
    pub fn is_wake_pending(&self) -> bool {
        *self.wake_pending.lock()
    }

    /// Number of threads currently suspended
    pub fn suspended_count(&self) -> usize {
        self.suspended.load(Ordering::Acquire)
    }
}
