//! Cancellation token for jobs
//!
//! Cancellation is cooperative: cancelling a running job only flips the
//! token, and the job body is expected to poll it and return
//! `JobStatus::Cancelled` at a convenient point.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

/// Cancellation token shared between a job and whoever may cancel it.
///
/// Every job carries one; the scheduler hands it to the job body on each
/// run. Multiple clones share the same underlying state via Arc.
///
/// # Example
///
/// ```
/// use foreman_scheduler::CancellationToken;
///
/// let token = CancellationToken::new();
/// let worker_token = token.clone();
///
/// // In the job body:
/// // while processing {
/// //     if worker_token.is_cancelled() {
/// //         return JobStatus::Cancelled;
/// //     }
/// //     // ... do work ...
/// // }
///
/// token.cancel();
/// ```
#[derive(Clone)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Create a new token in the non-cancelled state.
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Cancel this token.
    ///
    /// All clones of this token will also observe the cancellation.
    /// This operation is idempotent - calling it multiple times is safe.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Check if this token has been cancelled.
    ///
    /// Returns `true` if `cancel()` has been called on this token or any clone.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Reset to non-cancelled, used when a finished job is scheduled again.
    pub(crate) fn reset(&self) {
        self.cancelled.store(false, Ordering::Release);
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}
