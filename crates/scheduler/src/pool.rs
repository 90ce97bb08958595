//! Elastic worker pool
//!
//! Workers are spawned on demand up to `max_threads` and wound down again
//! after sitting idle for `keep_alive`, keeping `min_threads` alive for
//! latency. An interactive job may spawn past the cap rather than wait
//! behind slow work.
//!
//! The pool mutex is a leaf: it is never held across calls into the
//! scheduler, the lock manager, or listeners.

use std::sync::{Condvar, Mutex, MutexGuard, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use foreman_locks::owner;

use crate::job::{Job, JobStatus};
use crate::priority::Priority;
use crate::scheduler::{SchedulerConfig, SchedulerInner};
use crate::worker::Worker;

struct WorkerRecord {
    id: u64,
    handle: Option<JoinHandle<()>>,
}

struct PoolState {
    running: bool,
    workers: Vec<WorkerRecord>,
    /// Workers currently executing a job body (or freshly spawned and not
    /// yet pulling).
    busy: usize,
    /// Workers parked on the wake condvar.
    sleeping: usize,
    /// Bumped on every `job_queued` call. A worker records the epoch before
    /// probing for work and refuses to park if it moved, closing the window
    /// between a failed claim and the condvar wait.
    epoch: u64,
    next_worker: u64,
}

pub(crate) struct WorkerPool {
    scheduler: Weak<SchedulerInner>,
    max_threads: usize,
    min_threads: usize,
    keep_alive: Duration,
    state: Mutex<PoolState>,
    wake: Condvar,
}

impl WorkerPool {
    pub(crate) fn new(scheduler: Weak<SchedulerInner>, config: &SchedulerConfig) -> Self {
        WorkerPool {
            scheduler,
            max_threads: config.max_threads.max(1),
            min_threads: config.min_threads.max(1),
            keep_alive: config.keep_alive,
            state: Mutex::new(PoolState {
                running: true,
                workers: Vec::new(),
                busy: 0,
                sleeping: 0,
                epoch: 0,
                next_worker: 0,
            }),
            wake: Condvar::new(),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn worker_count(&self) -> usize {
        self.lock_state().workers.len()
    }

    /// Called whenever a job enters the waiting queue. Wakes an idle worker
    /// if one exists, otherwise spawns when everyone is busy and there is
    /// headroom. Interactive work spawns even past the cap.
    pub(crate) fn job_queued(&self, priority: Priority) {
        let mut st = self.lock_state();
        if !st.running {
            return;
        }
        st.epoch += 1;
        if st.sleeping > 0 {
            self.wake.notify_one();
            return;
        }
        let total = st.workers.len();
        let all_busy = st.busy >= total;
        if all_busy && (total < self.max_threads || priority == Priority::Interactive) {
            let id = st.next_worker;
            st.next_worker += 1;
            match Worker::spawn(self.scheduler.clone(), id) {
                Ok(handle) => {
                    log::debug!("spawning worker {} ({} live)", id, total + 1);
                    st.workers.push(WorkerRecord {
                        id,
                        handle: Some(handle),
                    });
                    // counted busy until its first pull
                    st.busy += 1;
                }
                Err(err) => log::error!("failed to spawn worker thread: {}", err),
            }
        }
    }

    /// Blocks until a job is available for `worker_id` or the worker should
    /// exit. `first` marks the very first pull after spawning, which settles
    /// the provisional busy count.
    pub(crate) fn start_job(&self, worker_id: u64, first: bool) -> Option<Job> {
        let scheduler = self.scheduler.upgrade()?;
        if first {
            let mut st = self.lock_state();
            st.busy = st.busy.saturating_sub(1);
        }
        let mut idle_since = Instant::now();
        loop {
            let epoch = {
                let mut st = self.lock_state();
                if !st.running {
                    return None;
                }
                // over capacity after an interactive overflow spawn; the
                // overflow worker itself gets one pull before this applies
                if !first && st.workers.len() > self.max_threads {
                    st.workers.retain(|w| w.id != worker_id);
                    log::debug!("worker {} exiting, pool over capacity", worker_id);
                    return None;
                }
                st.epoch
            };
            if let Some(job) = scheduler.claim_job() {
                {
                    let mut st = self.lock_state();
                    st.busy += 1;
                }
                // the running job's rule joins the deadlock graph for as
                // long as the job executes
                if let Some(rule) = job.rule() {
                    scheduler.locks.rule_acquired(owner::current(), &rule);
                }
                return Some(job);
            }
            match scheduler.sleep_hint() {
                Some(hint) if hint.is_zero() => {
                    // work appeared while we were outside the state lock
                    thread::yield_now();
                }
                Some(hint) => {
                    idle_since = Instant::now();
                    self.sleep(hint.min(self.keep_alive), epoch);
                }
                None => {
                    self.sleep(self.keep_alive, epoch);
                    // a wake-up for fresh work must trump expiry
                    if scheduler.sleep_hint().is_none()
                        && idle_since.elapsed() >= self.keep_alive
                    {
                        let mut st = self.lock_state();
                        if st.running && st.workers.len() > self.min_threads {
                            st.workers.retain(|w| w.id != worker_id);
                            log::debug!(
                                "worker {} expiring after {:?} idle",
                                worker_id,
                                self.keep_alive
                            );
                            return None;
                        }
                    }
                }
            }
        }
    }

    /// Settles accounting after a job ran (or was cancelled mid-claim) and
    /// forwards the outcome to the scheduler.
    pub(crate) fn end_job(&self, job: &Job, status: JobStatus) {
        {
            let mut st = self.lock_state();
            st.busy = st.busy.saturating_sub(1);
        }
        if let Some(scheduler) = self.scheduler.upgrade() {
            if let Some(rule) = job.rule() {
                scheduler.locks.rule_released(owner::current(), &rule);
            }
            scheduler.finish_job(job, status);
        }
    }

    /// Drops the record of an exiting worker. Harmless when the record was
    /// already removed.
    pub(crate) fn end_worker(&self, worker_id: u64) {
        let mut st = self.lock_state();
        st.workers.retain(|w| w.id != worker_id);
    }

    /// Parks until woken or `duration` elapses. Does not park at all when a
    /// job was queued since the caller sampled `epoch`; the caller must loop
    /// and probe for work again.
    fn sleep(&self, duration: Duration, epoch: u64) {
        let mut st = self.lock_state();
        if !st.running || st.epoch != epoch {
            return;
        }
        st.sleeping += 1;
        let (mut st, _) = self
            .wake
            .wait_timeout(st, duration)
            .unwrap_or_else(|e| e.into_inner());
        st.sleeping -= 1;
    }

    /// Stops the pool and joins every worker thread.
    pub(crate) fn shutdown(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut st = self.lock_state();
            if !st.running {
                return;
            }
            st.running = false;
            st.workers
                .iter_mut()
                .filter_map(|w| w.handle.take())
                .collect()
        };
        self.wake.notify_all();
        let me = thread::current().id();
        for handle in handles {
            // a job body shutting down its own scheduler must not join itself
            if handle.thread().id() != me {
                let _ = handle.join();
            }
        }
        self.lock_state().workers.clear();
    }

    /// Stops the pool without waiting for workers to exit.
    pub(crate) fn shutdown_nowait(&self) {
        {
            let mut st = self.lock_state();
            st.running = false;
        }
        self.wake.notify_all();
    }
}
