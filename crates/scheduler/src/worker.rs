//! Worker threads
//!
//! Each worker is a named OS thread that loops pulling jobs from the pool,
//! running their bodies, and reporting the outcome. A panic in a job body is
//! converted to a failed status; the worker itself survives and keeps
//! serving jobs.

use std::io;
use std::sync::Weak;
use std::thread::{self, JoinHandle};

use crate::job::JobStatus;
use crate::scheduler::SchedulerInner;

pub(crate) struct Worker;

impl Worker {
    pub(crate) fn spawn(
        scheduler: Weak<SchedulerInner>,
        id: u64,
    ) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name(format!("foreman-worker-{}", id))
            .spawn(move || Self::run(scheduler, id))
    }

    fn run(scheduler: Weak<SchedulerInner>, id: u64) {
        log::trace!("worker {} starting", id);
        let mut first = true;
        loop {
            // hold the scheduler only for the duration of one job so an
            // abandoned scheduler can be dropped while workers idle
            let Some(inner) = scheduler.upgrade() else {
                break;
            };
            let Some(job) = inner.pool.start_job(id, first) else {
                inner.pool.end_worker(id);
                break;
            };
            first = false;

            let status = if job.cancellation_token().is_cancelled() {
                JobStatus::Cancelled
            } else {
                log::trace!("worker {} running job '{}'", id, job.name());
                job.core.run_body()
            };
            if let JobStatus::Failed(msg) = &status {
                log::error!("job '{}' failed: {}", job.name(), msg);
            }
            inner.pool.end_job(&job, status);
        }
        log::trace!("worker {} exiting", id);
    }
}
