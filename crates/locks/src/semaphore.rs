//! Counting semaphore used to park lock waiters.
//!
//! Each queued waiter gets its own semaphore, so a release hands the lock to
//! exactly one chosen waiter instead of waking the herd.

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

pub(crate) struct Semaphore {
    permits: Mutex<u32>,
    available: Condvar,
}

impl Semaphore {
    pub(crate) fn new() -> Self {
        Semaphore {
            permits: Mutex::new(0),
            available: Condvar::new(),
        }
    }

    /// Blocks until a permit arrives or `timeout` elapses. Returns whether a
    /// permit was taken. Pass `Duration::MAX` to wait without a deadline.
    pub(crate) fn acquire(&self, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut permits = self.permits.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if *permits > 0 {
                *permits -= 1;
                return true;
            }
            let remaining = match deadline {
                Some(d) => d.saturating_duration_since(Instant::now()),
                None => Duration::MAX,
            };
            if remaining.is_zero() {
                return false;
            }
            let (guard, _) = self
                .available
                .wait_timeout(permits, remaining)
                .unwrap_or_else(|e| e.into_inner());
            permits = guard;
        }
    }

    pub(crate) fn release(&self) {
        let mut permits = self.permits.lock().unwrap_or_else(|e| e.into_inner());
        *permits += 1;
        self.available.notify_all();
    }
}
