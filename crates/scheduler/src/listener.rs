//! Job lifecycle listeners
//!
//! Listeners observe job transitions. Notifications are always delivered
//! outside the scheduler's state lock, so a listener may call back into the
//! scheduler (cancel the job it was just told is about to run, reschedule,
//! and so on). A panicking listener is logged and skipped; it never takes
//! the scheduler down or starves other listeners.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::job::{Job, JobStatus};

/// Handle used to deregister a listener.
pub type ListenerId = u64;

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_listener_id() -> ListenerId {
    NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed)
}

/// Observer of job lifecycle events. All methods default to no-ops.
pub trait JobListener: Send + Sync {
    /// The job entered the waiting or sleeping queue.
    fn scheduled(&self, job: &Job) {
        let _ = job;
    }

    /// A worker claimed the job but has not started it yet. The listener may
    /// still cancel or sleep the job here.
    fn about_to_run(&self, job: &Job) {
        let _ = job;
    }

    /// The job body is about to execute.
    fn running(&self, job: &Job) {
        let _ = job;
    }

    /// The job was put to sleep while waiting.
    fn sleeping(&self, job: &Job) {
        let _ = job;
    }

    /// A sleeping job was promoted back to the waiting queue.
    fn awake(&self, job: &Job) {
        let _ = job;
    }

    /// The job left the scheduler, with the outcome of its run. A job
    /// cancelled before it ever ran reports `JobStatus::Cancelled`.
    fn done(&self, job: &Job, status: &JobStatus) {
        let _ = (job, status);
    }
}

/// Registry of scheduler-wide listeners. Notification order follows
/// registration order; per-job listeners are notified after scheduler-wide
/// ones.
pub(crate) struct JobListeners {
    listeners: Mutex<Vec<(ListenerId, Arc<dyn JobListener>)>>,
}

impl JobListeners {
    pub(crate) fn new() -> Self {
        JobListeners {
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn add(&self, listener: Arc<dyn JobListener>) -> ListenerId {
        let id = next_listener_id();
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, listener));
        id
    }

    pub(crate) fn remove(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        let before = listeners.len();
        listeners.retain(|(l, _)| *l != id);
        listeners.len() != before
    }

    /// Snapshot of scheduler-wide plus per-job listeners, in notification
    /// order. Taken before dispatch so listeners may deregister themselves.
    fn snapshot(&self, job: &Job) -> Vec<Arc<dyn JobListener>> {
        let mut all: Vec<Arc<dyn JobListener>> = self
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, l)| l.clone())
            .collect();
        all.extend(job.core.listeners_snapshot());
        all
    }

    fn each(&self, job: &Job, event: &str, notify: impl Fn(&dyn JobListener)) {
        for listener in self.snapshot(job) {
            if catch_unwind(AssertUnwindSafe(|| notify(listener.as_ref()))).is_err() {
                log::error!(
                    "job listener panicked in {} for job '{}'",
                    event,
                    job.name()
                );
            }
        }
    }

    pub(crate) fn scheduled(&self, job: &Job) {
        self.each(job, "scheduled", |l| l.scheduled(job));
    }

    pub(crate) fn about_to_run(&self, job: &Job) {
        self.each(job, "about_to_run", |l| l.about_to_run(job));
    }

    pub(crate) fn running(&self, job: &Job) {
        self.each(job, "running", |l| l.running(job));
    }

    pub(crate) fn sleeping(&self, job: &Job) {
        self.each(job, "sleeping", |l| l.sleeping(job));
    }

    pub(crate) fn awake(&self, job: &Job) {
        self.each(job, "awake", |l| l.awake(job));
    }

    pub(crate) fn done(&self, job: &Job, status: &JobStatus) {
        self.each(job, "done", |l| l.done(job, status));
    }
}
