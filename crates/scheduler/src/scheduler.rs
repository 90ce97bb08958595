//! Job scheduler
//!
//! The scheduler keeps three collections under one state lock: a waiting
//! queue ordered by effective start time, a sleeping queue ordered by wake
//! time, and the set of running jobs. Workers pull from the waiting queue;
//! a job whose rule conflicts with a running job is parked behind that job
//! and re-queued when it finishes, so the queue head never busy-waits.
//!
//! Listener notifications always happen outside the state lock. The window
//! between a worker claiming a job and confirming it as running is visible
//! to listeners as `about_to_run`; cancelling or sleeping the job there is
//! honored before the body executes.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use foreman_locks::{owner, Lock, LockManager, OwnerId, RuleRef};

use crate::error::SchedulerError;
use crate::job::{Job, JobCore, JobId, JobState, JobStatus};
use crate::listener::{JobListener, JobListeners, ListenerId};
use crate::pool::WorkerPool;
use crate::priority::Priority;
use crate::queue::{RunQueue, WakeTime};

/// Tuning knobs for the scheduler's worker pool.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Upper bound on pooled worker threads. Interactive jobs may briefly
    /// exceed it.
    pub max_threads: usize,

    /// Number of idle workers kept alive indefinitely.
    pub min_threads: usize,

    /// How long an idle worker above `min_threads` lingers before exiting.
    pub keep_alive: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_threads: 25,
            min_threads: 1,
            keep_alive: Duration::from_secs(60),
        }
    }
}

struct RunningJob {
    job: Arc<JobCore>,
    owner: OwnerId,
}

pub(crate) struct SchedState {
    alive: bool,
    waiting: RunQueue,
    sleeping: RunQueue,
    running: HashMap<JobId, RunningJob>,
    /// Jobs parked behind the running job whose rule blocks them, re-queued
    /// when that job finishes.
    blocked: HashMap<JobId, VecDeque<Arc<JobCore>>>,
    /// Jobs held back by an explicit rule scope, re-queued when the scope
    /// ends.
    barred: Vec<Arc<JobCore>>,
    /// Active explicit rule scopes, innermost last, one stack per thread.
    rule_stacks: HashMap<OwnerId, Vec<Option<RuleRef>>>,
}

impl SchedState {
    fn new() -> Self {
        SchedState {
            alive: true,
            waiting: RunQueue::new(),
            sleeping: RunQueue::new(),
            running: HashMap::new(),
            blocked: HashMap::new(),
            barred: Vec::new(),
            rule_stacks: HashMap::new(),
        }
    }
}

pub(crate) struct SchedulerInner {
    state: Mutex<SchedState>,
    /// Signalled whenever a job finishes or a rule scope ends, unblocking
    /// `begin_rule` waiters.
    rule_free: Condvar,
    pub(crate) pool: WorkerPool,
    pub(crate) listeners: JobListeners,
    pub(crate) locks: LockManager,
}

/// Wake time for a job entering the waiting queue right now.
fn wake_after(priority: Priority) -> WakeTime {
    Instant::now()
        .checked_add(priority.delay())
        .map(WakeTime::At)
        .unwrap_or(WakeTime::Never)
}

/// The running job, if any, whose rule blocks `rule`.
fn blocking_job(st: &SchedState, rule: &RuleRef) -> Option<JobId> {
    st.running
        .values()
        .find(|rj| {
            rj.job
                .rule()
                .is_some_and(|r| r.is_conflicting(rule.as_ref()))
        })
        .map(|rj| rj.job.id())
}

/// Whether another thread's outermost explicit rule scope blocks `rule`.
fn rule_scope_conflicts(st: &SchedState, me: OwnerId, rule: &RuleRef) -> bool {
    st.rule_stacks.iter().any(|(owner, stack)| {
        *owner != me
            && stack
                .first()
                .and_then(|outer| outer.as_ref())
                .is_some_and(|outer| outer.is_conflicting(rule.as_ref()))
    })
}

/// The rule context of the job the calling thread is currently running.
fn my_running_rule(st: &SchedState, me: OwnerId) -> Option<Option<RuleRef>> {
    st.running
        .values()
        .find(|rj| rj.owner == me)
        .map(|rj| rj.job.rule().cloned())
}

/// Detaches every job parked behind `blocker` and re-queues it. Returns the
/// re-queued jobs so the caller can poke the pool outside the lock.
fn release_blocked(st: &mut SchedState, blocker: JobId) -> Vec<Arc<JobCore>> {
    let mut requeued = Vec::new();
    if let Some(blocked) = st.blocked.remove(&blocker) {
        for core in blocked {
            let wake = wake_after(core.priority());
            st.waiting.enqueue(core.clone(), wake);
            requeued.push(core);
        }
    }
    requeued
}

/// Removes a waiting job that is parked in `blocked` or `barred` rather
/// than queued. Returns whether it was found.
fn remove_parked(st: &mut SchedState, id: JobId) -> bool {
    for list in st.blocked.values_mut() {
        if let Some(pos) = list.iter().position(|c| c.id() == id) {
            list.remove(pos);
            return true;
        }
    }
    if let Some(pos) = st.barred.iter().position(|c| c.id() == id) {
        st.barred.remove(pos);
        return true;
    }
    false
}

impl SchedulerInner {
    fn lock_state(&self) -> MutexGuard<'_, SchedState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Promotes expired sleepers, then pops the first waiting job not
    /// blocked by a conflicting rule. Called with the state lock held.
    fn next_job_locked(&self, st: &mut SchedState) -> Option<Arc<JobCore>> {
        let now = Instant::now();
        while let Some(WakeTime::At(t)) = st.sleeping.peek_wake() {
            if t > now {
                break;
            }
            if let Some(core) = st.sleeping.dequeue() {
                core.set_state(JobState::Waiting);
                let wake = wake_after(core.priority());
                st.waiting.enqueue(core, wake);
            }
        }
        loop {
            let core = st.waiting.dequeue()?;
            // a prior claim of this job has not been retired yet; park the
            // new incarnation behind it so the running entry is never stolen
            if st.running.contains_key(&core.id()) {
                let id = core.id();
                st.blocked.entry(id).or_default().push_back(core);
                continue;
            }
            if let Some(rule) = core.rule().cloned() {
                if let Some(blocker) = blocking_job(st, &rule) {
                    log::trace!("job '{}' parked behind running job {}", core.name(), blocker);
                    st.blocked.entry(blocker).or_default().push_back(core);
                    continue;
                }
                if rule_scope_conflicts(st, owner::current(), &rule) {
                    st.barred.push(core);
                    continue;
                }
            }
            st.running.insert(
                core.id(),
                RunningJob {
                    job: core.clone(),
                    owner: owner::current(),
                },
            );
            return Some(core);
        }
    }

    /// Claims the next runnable job for the calling worker, confirming the
    /// claim after `about_to_run` listeners had their say. Returns `None`
    /// when nothing is runnable right now.
    pub(crate) fn claim_job(&self) -> Option<Job> {
        enum Verdict {
            Confirmed,
            Cancelled(Vec<Arc<JobCore>>),
            Revoked,
        }
        loop {
            let (core, generation) = {
                let mut st = self.lock_state();
                if !st.alive {
                    return None;
                }
                let core = self.next_job_locked(&mut st)?;
                let generation = core.generation();
                (core, generation)
            };
            let job = Job::from_core(core.clone());
            self.listeners.about_to_run(&job);

            // A listener may have cancelled, slept, or even cancelled and
            // re-scheduled the claimed job. The claim stands only if the
            // running entry is still ours and the same scheduling generation
            // is still waiting.
            let verdict = {
                let mut st = self.lock_state();
                if !st.running.contains_key(&core.id()) {
                    // sleep() pulled the claim back; nothing to retire
                    Verdict::Revoked
                } else if core.state() == JobState::Waiting && core.generation() == generation {
                    core.set_state(JobState::Running);
                    Verdict::Confirmed
                } else {
                    // cancelled between claim and confirm; retire this claim
                    // without disturbing any re-scheduled incarnation
                    st.running.remove(&core.id());
                    if core.generation() == generation {
                        core.set_state(JobState::None);
                    }
                    Verdict::Cancelled(release_blocked(&mut st, core.id()))
                }
            };
            match verdict {
                Verdict::Confirmed => {
                    self.listeners.running(&job);
                    return Some(job);
                }
                Verdict::Cancelled(requeued) => {
                    self.rule_free.notify_all();
                    for waiting in &requeued {
                        self.pool.job_queued(waiting.priority());
                    }
                    self.listeners.done(&job, &JobStatus::Cancelled);
                }
                Verdict::Revoked => {}
            }
        }
    }

    /// Retires a job: clears its state, re-queues everything parked behind
    /// it, and reports `done` to listeners.
    pub(crate) fn finish_job(&self, job: &Job, status: JobStatus) {
        let requeued = {
            let mut st = self.lock_state();
            job.core.set_state(JobState::None);
            st.running.remove(&job.core.id());
            release_blocked(&mut st, job.core.id())
        };
        self.rule_free.notify_all();
        for core in &requeued {
            self.pool.job_queued(core.priority());
        }
        self.listeners.done(job, &status);
    }

    /// How long a worker may sleep before something could become runnable:
    /// zero when work is already waiting, the first sleeper's wake time
    /// otherwise, `None` when nothing is scheduled at all.
    pub(crate) fn sleep_hint(&self) -> Option<Duration> {
        let st = self.lock_state();
        if !st.waiting.is_empty() {
            return Some(Duration::ZERO);
        }
        match st.sleeping.peek_wake() {
            Some(WakeTime::At(t)) => Some(t.saturating_duration_since(Instant::now())),
            Some(WakeTime::Never) | None => None,
        }
    }
}

/// An in-process job scheduler with an elastic worker pool.
///
/// Dropping the scheduler cancels all jobs and releases the pool. There is
/// deliberately no global instance; embedders own their scheduler and its
/// lifecycle.
///
/// # Example
///
/// ```
/// use foreman_scheduler::{Job, JobScheduler, JobStatus};
///
/// let scheduler = JobScheduler::new();
/// let job = Job::builder("greeter").body(|_token| {
///     println!("hello from a worker");
///     JobStatus::Ok
/// });
/// scheduler.schedule(&job);
/// scheduler.shutdown();
/// ```
pub struct JobScheduler {
    inner: Arc<SchedulerInner>,
}

impl Default for JobScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl JobScheduler {
    pub fn new() -> Self {
        Self::with_config(SchedulerConfig::default())
    }

    pub fn with_config(config: SchedulerConfig) -> Self {
        let inner = Arc::new_cyclic(|weak| SchedulerInner {
            state: Mutex::new(SchedState::new()),
            rule_free: Condvar::new(),
            pool: WorkerPool::new(weak.clone(), &config),
            listeners: JobListeners::new(),
            locks: LockManager::new(),
        });
        JobScheduler { inner }
    }

    /// Schedules `job` to run as soon as a worker and its rule allow.
    /// Scheduling an already waiting, sleeping, or running job is a no-op.
    pub fn schedule(&self, job: &Job) {
        self.schedule_delayed(job, Duration::ZERO);
    }

    /// Schedules `job` to become runnable after `delay`. The job sleeps
    /// until the delay expires.
    pub fn schedule_delayed(&self, job: &Job, delay: Duration) {
        let core = job.core.clone();
        let scheduled = {
            let mut st = self.inner.lock_state();
            if !st.alive {
                log::warn!("schedule of '{}' ignored after shutdown", job.name());
                false
            } else if core.state() != JobState::None {
                log::trace!("'{}' already scheduled, ignoring", job.name());
                false
            } else {
                core.token().reset();
                core.bump_generation();
                if delay.is_zero() {
                    core.set_state(JobState::Waiting);
                    let wake = wake_after(core.priority());
                    st.waiting.enqueue(core.clone(), wake);
                } else {
                    core.set_state(JobState::Sleeping);
                    let wake = Instant::now()
                        .checked_add(delay)
                        .map(WakeTime::At)
                        .unwrap_or(WakeTime::Never);
                    st.sleeping.enqueue(core.clone(), wake);
                }
                true
            }
        };
        if scheduled {
            self.inner.listeners.scheduled(job);
            self.inner.pool.job_queued(core.priority());
        }
    }

    /// Cancels `job`. Waiting and sleeping jobs are removed immediately and
    /// report a `Cancelled` outcome; a running job only gets its token
    /// flipped and the body decides when to stop. Returns whether the job is
    /// guaranteed not to be running after the call. Cancelling repeatedly or
    /// cancelling an unscheduled job is harmless.
    pub fn cancel(&self, job: &Job) -> bool {
        enum Outcome {
            Removed,
            Claimed,
            Flagged,
            NoOp,
        }
        let core = &job.core;
        let outcome = {
            let mut st = self.inner.lock_state();
            match core.state() {
                JobState::Waiting => {
                    if st.waiting.remove(core.id()).is_some() || remove_parked(&mut st, core.id())
                    {
                        core.set_state(JobState::None);
                        Outcome::Removed
                    } else {
                        // claimed by a worker but not yet confirmed; the
                        // claim loop will report the cancelled outcome
                        core.set_state(JobState::None);
                        core.token().cancel();
                        Outcome::Claimed
                    }
                }
                JobState::Sleeping => {
                    st.sleeping.remove(core.id());
                    core.set_state(JobState::None);
                    Outcome::Removed
                }
                JobState::Running => {
                    core.token().cancel();
                    Outcome::Flagged
                }
                JobState::None => Outcome::NoOp,
            }
        };
        match outcome {
            Outcome::Removed => {
                self.inner.listeners.done(job, &JobStatus::Cancelled);
                true
            }
            Outcome::Claimed | Outcome::NoOp => true,
            Outcome::Flagged => false,
        }
    }

    /// Puts a waiting job to sleep indefinitely; it stays asleep until
    /// [`JobScheduler::wake_up`]. Returns false when the job is running or
    /// not scheduled. Sleeping an already sleeping job is a no-op returning
    /// true.
    pub fn sleep(&self, job: &Job) -> bool {
        let core = &job.core;
        let (slept, newly, requeued) = {
            let mut st = self.inner.lock_state();
            match core.state() {
                JobState::Waiting => {
                    let mut requeued = Vec::new();
                    if st.waiting.remove(core.id()).is_none() && !remove_parked(&mut st, core.id())
                    {
                        // claimed: pull it back out of the running set and
                        // free anything already parked behind it
                        st.running.remove(&core.id());
                        requeued = release_blocked(&mut st, core.id());
                    }
                    core.set_state(JobState::Sleeping);
                    st.sleeping.enqueue(core.clone(), WakeTime::Never);
                    (true, true, requeued)
                }
                JobState::Sleeping => (true, false, Vec::new()),
                _ => (false, false, Vec::new()),
            }
        };
        for core in &requeued {
            self.inner.pool.job_queued(core.priority());
        }
        if newly {
            self.inner.listeners.sleeping(job);
        }
        slept
    }

    /// Promotes a sleeping job to the waiting queue, applying its priority
    /// delay afresh. No-op for jobs that are not sleeping.
    pub fn wake_up(&self, job: &Job) {
        let core = &job.core;
        let woke = {
            let mut st = self.inner.lock_state();
            if core.state() == JobState::Sleeping && st.sleeping.remove(core.id()).is_some() {
                core.set_state(JobState::Waiting);
                let wake = wake_after(core.priority());
                st.waiting.enqueue(core.clone(), wake);
                true
            } else {
                false
            }
        };
        if woke {
            self.inner.listeners.awake(job);
            self.inner.pool.job_queued(core.priority());
        }
    }

    /// Changes a job's priority. A waiting job is re-sorted as if it had
    /// been submitted with the new priority; a running job is unaffected
    /// until its next schedule.
    pub fn set_priority(&self, job: &Job, priority: Priority) {
        let core = &job.core;
        let mut st = self.inner.lock_state();
        let old = core.priority();
        if old == priority {
            return;
        }
        core.set_priority(priority);
        if core.state() == JobState::Waiting {
            if let Some(WakeTime::At(t)) = st.waiting.wake_of(core.id()) {
                let base = t.checked_sub(old.delay()).unwrap_or(t);
                let wake = base
                    .checked_add(priority.delay())
                    .map(WakeTime::At)
                    .unwrap_or(WakeTime::Never);
                st.waiting.resort(core.id(), wake);
            }
        }
    }

    /// All scheduled or running jobs belonging to `family`.
    pub fn find(&self, family: &str) -> Vec<Job> {
        let st = self.inner.lock_state();
        let mut out = Vec::new();
        let push = |core: &Arc<JobCore>, out: &mut Vec<Job>| {
            if core.belongs_to(family) {
                out.push(Job::from_core(core.clone()));
            }
        };
        for rj in st.running.values() {
            push(&rj.job, &mut out);
        }
        for core in st.waiting.jobs().chain(st.sleeping.jobs()) {
            push(core, &mut out);
        }
        for list in st.blocked.values() {
            for core in list {
                push(core, &mut out);
            }
        }
        for core in &st.barred {
            push(core, &mut out);
        }
        out
    }

    /// Cancels every job in `family`; running members only get their token
    /// flipped. Returns how many jobs are guaranteed not to run.
    pub fn cancel_family(&self, family: &str) -> usize {
        self.find(family).iter().filter(|j| self.cancel(j)).count()
    }

    /// Puts every waiting job in `family` to sleep. Returns how many were
    /// put or already asleep.
    pub fn sleep_family(&self, family: &str) -> usize {
        self.find(family).iter().filter(|j| self.sleep(j)).count()
    }

    /// Wakes every sleeping job in `family`.
    pub fn wake_up_family(&self, family: &str) {
        for job in self.find(family) {
            self.wake_up(&job);
        }
    }

    /// Opens an explicit rule scope on the calling thread, blocking until no
    /// running job and no other thread's scope conflicts with `rule`.
    /// Scopes nest only inward: each inner rule must be contained in the
    /// enclosing one (or in the rule of the job this thread is running).
    /// `None` never blocks and never conflicts.
    ///
    /// Blocking here participates in deadlock detection together with
    /// ordered locks; a detected cycle suspends the victim's locks rather
    /// than hanging both threads.
    pub fn begin_rule(&self, rule: Option<RuleRef>) -> Result<(), SchedulerError> {
        let me = owner::current();
        let mut st = self.inner.lock_state();
        if !st.alive {
            return Err(SchedulerError::ShutDown);
        }

        let enclosing: Option<Option<RuleRef>> =
            match st.rule_stacks.get(&me).and_then(|s| s.last()) {
                Some(top) => Some(top.clone()),
                None => my_running_rule(&st, me),
            };
        if let Some(enclosing) = enclosing {
            match (&enclosing, &rule) {
                (Some(outer), Some(inner)) => {
                    if !outer.contains(inner.as_ref()) {
                        return Err(SchedulerError::InvalidNesting);
                    }
                }
                (None, Some(_)) => return Err(SchedulerError::InvalidNesting),
                _ => {}
            }
            // the enclosing scope already provides the exclusion
            st.rule_stacks.entry(me).or_default().push(rule);
            return Ok(());
        }

        let Some(real) = rule.clone() else {
            st.rule_stacks.entry(me).or_default().push(rule);
            return Ok(());
        };

        // Outermost real rule: win admission before the scope becomes
        // visible, so two threads cannot bar each other with scopes neither
        // has entered yet.
        let mut waited = false;
        while st.alive
            && (blocking_job(&st, &real).is_some() || rule_scope_conflicts(&st, me, &real))
        {
            if !waited {
                waited = true;
                self.inner.locks.rule_wait_start(me, &real);
            }
            st = self
                .inner
                .rule_free
                .wait(st)
                .unwrap_or_else(|e| e.into_inner());
        }
        if waited {
            self.inner.locks.rule_wait_stop(me, &real);
        }
        if !st.alive {
            return Err(SchedulerError::ShutDown);
        }
        self.inner.locks.rule_acquired(me, &real);
        st.rule_stacks.entry(me).or_default().push(rule);
        drop(st);
        // re-acquire anything deadlock resolution took from us while waiting
        self.inner.locks.resume_suspended(me);
        Ok(())
    }

    /// Closes the innermost rule scope on the calling thread. `rule` must be
    /// the same handle that was passed to the matching
    /// [`JobScheduler::begin_rule`]; on a mismatch the scope stack is left
    /// untouched.
    pub fn end_rule(&self, rule: Option<&RuleRef>) -> Result<(), SchedulerError> {
        let me = owner::current();
        let requeued = {
            let mut st = self.inner.lock_state();
            let popped = {
                let stack = st
                    .rule_stacks
                    .get_mut(&me)
                    .ok_or(SchedulerError::NoActiveRule)?;
                let top = stack.last().ok_or(SchedulerError::NoActiveRule)?;
                let matches = match (top, rule) {
                    (Some(t), Some(r)) => Arc::ptr_eq(t, r),
                    (None, None) => true,
                    _ => false,
                };
                if !matches {
                    return Err(SchedulerError::RuleMismatch);
                }
                stack.pop().flatten()
            };
            let outermost = st.rule_stacks.get(&me).is_some_and(|s| s.is_empty());
            if outermost {
                st.rule_stacks.remove(&me);
            }
            if outermost && popped.is_some() {
                if let Some(real) = popped {
                    self.inner.locks.rule_released(me, &real);
                }
                // jobs barred by this scope may be runnable again
                let barred = std::mem::take(&mut st.barred);
                let mut requeued = Vec::new();
                for core in barred {
                    let wake = wake_after(core.priority());
                    st.waiting.enqueue(core.clone(), wake);
                    requeued.push(core);
                }
                self.inner.rule_free.notify_all();
                requeued
            } else {
                Vec::new()
            }
        };
        for core in requeued {
            self.inner.pool.job_queued(core.priority());
        }
        Ok(())
    }

    /// Registers a listener for every job's lifecycle events.
    pub fn add_listener(&self, listener: Arc<dyn JobListener>) -> ListenerId {
        self.inner.listeners.add(listener)
    }

    /// Removes a scheduler-wide listener. Returns whether it was registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.listeners.remove(id)
    }

    /// Creates an ordered lock participating in this scheduler's deadlock
    /// detection, together with job rules.
    pub fn new_lock(&self) -> Lock {
        self.inner.locks.new_lock()
    }

    /// The lock manager shared by this scheduler's locks and rules.
    pub fn lock_manager(&self) -> &LockManager {
        &self.inner.locks
    }

    /// Number of live worker threads.
    pub fn worker_count(&self) -> usize {
        self.inner.pool.worker_count()
    }

    /// True when no job is scheduled, sleeping, parked, or running.
    pub fn is_idle(&self) -> bool {
        let st = self.inner.lock_state();
        st.waiting.is_empty()
            && st.sleeping.is_empty()
            && st.running.is_empty()
            && st.blocked.is_empty()
            && st.barred.is_empty()
    }

    /// Stops accepting jobs, cancels everything, and joins the worker pool.
    /// Running jobs get their tokens flipped and are waited for; queued jobs
    /// report a `Cancelled` outcome without running. Idempotent.
    pub fn shutdown(&self) {
        if self.begin_shutdown() {
            self.inner.pool.shutdown();
        }
    }

    fn begin_shutdown(&self) -> bool {
        let drained = {
            let mut st = self.inner.lock_state();
            if !st.alive {
                return false;
            }
            st.alive = false;
            for rj in st.running.values() {
                rj.job.token().cancel();
            }
            let mut drained = st.waiting.drain();
            drained.extend(st.sleeping.drain());
            for (_, list) in st.blocked.drain() {
                drained.extend(list);
            }
            drained.append(&mut st.barred);
            st.rule_stacks.clear();
            drained
        };
        self.inner.rule_free.notify_all();
        for core in drained {
            core.set_state(JobState::None);
            core.token().cancel();
            self.inner
                .listeners
                .done(&Job::from_core(core), &JobStatus::Cancelled);
        }
        true
    }
}

impl Drop for JobScheduler {
    fn drop(&mut self) {
        if self.begin_shutdown() {
            // don't block in drop; workers notice and wind down on their own
            self.inner.pool.shutdown_nowait();
        }
    }
}
