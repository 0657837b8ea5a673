//! Binary semaphore.
//!
//! Used for state set wakeup, per-(state set, channel) get/put completion
//! and the instance "ready" signal. A signal on a full semaphore is a no-op,
//! so repeated signals collapse into one pending wakeup.

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Binary event semaphore (`full` / `empty`).
#[derive(Debug, Default)]
pub struct Semaphore {
    full: Mutex<bool>,
    cond: Condvar,
}

impl Semaphore {
    /// Create a semaphore in the given initial state.
    pub fn new(full: bool) -> Self {
        Self {
            full: Mutex::new(full),
            cond: Condvar::new(),
        }
    }

    /// Set the semaphore full and wake one waiter.
    pub fn signal(&self) {
        let mut full = self.full.lock();
        *full = true;
        self.cond.notify_one();
    }

    /// Block until full, then take it.
    pub fn wait(&self) {
        let mut full = self.full.lock();
        while !*full {
            self.cond.wait(&mut full);
        }
        *full = false;
    }

    /// Block at most `timeout`. Returns true if the semaphore was taken.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            self.wait();
            return true;
        };
        let mut full = self.full.lock();
        while !*full {
            if self.cond.wait_until(&mut full, deadline).timed_out() {
                break;
            }
        }
        std::mem::replace(&mut *full, false)
    }

    /// Take the semaphore if full, without blocking.
    pub fn try_wait(&self) -> bool {
        std::mem::replace(&mut *self.full.lock(), false)
    }

    /// Current state without taking it.
    pub fn is_full(&self) -> bool {
        *self.full.lock()
    }
}
