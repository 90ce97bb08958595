//! Job model
//!
//! A [`Job`] is a named unit of background work with a priority, an optional
//! scheduling rule, and a body closure. Jobs move through a small lifecycle
//! (`None` → `Waiting` → `Running` → `None`, with a `Sleeping` detour) that
//! is only ever mutated under the scheduler's state lock; readers may sample
//! the state at any time.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use foreman_locks::RuleRef;

use crate::cancel::CancellationToken;
use crate::listener::{JobListener, ListenerId};
use crate::priority::Priority;

/// Unique job identifier.
pub type JobId = u64;

static NEXT_JOB_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Not scheduled, or already finished.
    None,
    /// Queued and eligible to run as soon as a worker is free.
    Waiting,
    /// Scheduled with a delay, or put to sleep; not eligible to run.
    Sleeping,
    /// Currently executing on a worker.
    Running,
}

impl JobState {
    fn from_u8(raw: u8) -> JobState {
        match raw {
            1 => JobState::Waiting,
            2 => JobState::Sleeping,
            3 => JobState::Running,
            _ => JobState::None,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            JobState::None => 0,
            JobState::Waiting => 1,
            JobState::Sleeping => 2,
            JobState::Running => 3,
        }
    }
}

/// Outcome of one run of a job body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    /// The body ran to completion.
    Ok,
    /// The body observed cancellation and stopped, or the job was cancelled
    /// before it started.
    Cancelled,
    /// The body panicked or reported a failure.
    Failed(String),
}

type JobBody = Box<dyn FnMut(&CancellationToken) -> JobStatus + Send>;
type FamilyPredicate = Box<dyn Fn(&str) -> bool + Send + Sync>;

pub(crate) struct JobCore {
    id: JobId,
    name: String,
    state: AtomicU8,
    /// Bumped each time the job is scheduled. Lets a worker tell whether the
    /// incarnation it dequeued is still the one in play after listeners ran.
    generation: AtomicU64,
    priority: Mutex<Priority>,
    rule: Option<RuleRef>,
    family: Option<FamilyPredicate>,
    token: CancellationToken,
    body: Mutex<JobBody>,
    listeners: Mutex<Vec<(ListenerId, Arc<dyn JobListener>)>>,
}

impl JobCore {
    pub(crate) fn id(&self) -> JobId {
        self.id
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// Current lifecycle state. Transitions happen only under the scheduler
    /// state lock, but sampling is lock-free.
    pub(crate) fn state(&self) -> JobState {
        JobState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: JobState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    /// Current scheduling generation. Only meaningful while the scheduler
    /// state lock is held.
    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub(crate) fn bump_generation(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn priority(&self) -> Priority {
        *self.priority.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn set_priority(&self, priority: Priority) {
        *self.priority.lock().unwrap_or_else(|e| e.into_inner()) = priority;
    }

    pub(crate) fn rule(&self) -> Option<&RuleRef> {
        self.rule.as_ref()
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub(crate) fn belongs_to(&self, family: &str) -> bool {
        self.family.as_ref().is_some_and(|f| f(family))
    }

    pub(crate) fn listeners_snapshot(&self) -> Vec<Arc<dyn JobListener>> {
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, l)| l.clone())
            .collect()
    }

    /// Runs the body, converting a panic into `JobStatus::Failed`.
    pub(crate) fn run_body(&self) -> JobStatus {
        let token = self.token.clone();
        let mut body = self.body.lock().unwrap_or_else(|e| e.into_inner());
        match catch_unwind(AssertUnwindSafe(|| (*body)(&token))) {
            Ok(status) => status,
            Err(payload) => JobStatus::Failed(panic_message(payload.as_ref())),
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "job body panicked".to_string()
    }
}

/// Handle to a job. Cheap to clone; all clones refer to the same job.
#[derive(Clone)]
pub struct Job {
    pub(crate) core: Arc<JobCore>,
}

impl Job {
    /// Starts building a job with the given display name.
    pub fn builder(name: impl Into<String>) -> JobBuilder {
        JobBuilder {
            name: name.into(),
            priority: Priority::default(),
            rule: None,
            family: None,
        }
    }

    pub(crate) fn from_core(core: Arc<JobCore>) -> Self {
        Job { core }
    }

    pub fn id(&self) -> JobId {
        self.core.id
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn state(&self) -> JobState {
        self.core.state()
    }

    pub fn priority(&self) -> Priority {
        self.core.priority()
    }

    /// The scheduling rule this job runs under, if any.
    pub fn rule(&self) -> Option<RuleRef> {
        self.core.rule.clone()
    }

    /// The token the body polls for cancellation.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.core.token.clone()
    }

    /// Whether this job answers to `family`. Jobs without a family predicate
    /// belong to no family.
    pub fn belongs_to(&self, family: &str) -> bool {
        self.core.belongs_to(family)
    }

    /// Registers a listener notified for this job only, in addition to any
    /// listeners registered on the scheduler.
    pub fn add_listener(&self, listener: Arc<dyn JobListener>) -> ListenerId {
        let id = crate::listener::next_listener_id();
        self.core
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, listener));
        id
    }

    /// Removes a per-job listener. Returns whether it was registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self
            .core
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let before = listeners.len();
        listeners.retain(|(l, _)| *l != id);
        listeners.len() != before
    }
}

impl PartialEq for Job {
    fn eq(&self, other: &Self) -> bool {
        self.core.id == other.core.id
    }
}

impl Eq for Job {}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.core.id)
            .field("name", &self.core.name)
            .field("state", &self.core.state())
            .field("priority", &self.core.priority())
            .finish()
    }
}

/// Builder for [`Job`].
pub struct JobBuilder {
    name: String,
    priority: Priority,
    rule: Option<RuleRef>,
    family: Option<FamilyPredicate>,
}

impl JobBuilder {
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the scheduling rule. Jobs with conflicting rules never run
    /// concurrently.
    pub fn rule(mut self, rule: RuleRef) -> Self {
        self.rule = Some(rule);
        self
    }

    /// Marks the job as belonging to exactly `family`.
    pub fn family(self, family: impl Into<String>) -> Self {
        let family = family.into();
        self.family_matches(move |f| f == family)
    }

    /// Marks the job as belonging to every family the predicate accepts.
    pub fn family_matches(
        mut self,
        predicate: impl Fn(&str) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.family = Some(Box::new(predicate));
        self
    }

    /// Finishes the job with the given body. The body is re-run on every
    /// schedule of the job and receives the job's cancellation token.
    pub fn body(
        self,
        body: impl FnMut(&CancellationToken) -> JobStatus + Send + 'static,
    ) -> Job {
        Job {
            core: Arc::new(JobCore {
                id: NEXT_JOB_ID.fetch_add(1, Ordering::Relaxed),
                name: self.name,
                state: AtomicU8::new(JobState::None.as_u8()),
                generation: AtomicU64::new(0),
                priority: Mutex::new(self.priority),
                rule: self.rule,
                family: self.family,
                token: CancellationToken::new(),
                body: Mutex::new(Box::new(body)),
                listeners: Mutex::new(Vec::new()),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use foreman_locks::PathRule;

    #[test]
    fn test_builder_defaults() {
        let job = Job::builder("noop").body(|_| JobStatus::Ok);
        assert_eq!(job.state(), JobState::None);
        assert_eq!(job.priority(), Priority::Long);
        assert!(job.rule().is_none());
        assert!(!job.belongs_to("anything"));
    }

    #[test]
    fn test_ids_are_unique() {
        let a = Job::builder("a").body(|_| JobStatus::Ok);
        let b = Job::builder("b").body(|_| JobStatus::Ok);
        assert_ne!(a.id(), b.id());
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
    }

    #[test]
    fn test_family_membership() {
        let job = Job::builder("indexer")
            .family("indexing")
            .body(|_| JobStatus::Ok);
        assert!(job.belongs_to("indexing"));
        assert!(!job.belongs_to("builds"));

        let multi = Job::builder("sweeper")
            .family_matches(|f| f.starts_with("gc."))
            .body(|_| JobStatus::Ok);
        assert!(multi.belongs_to("gc.minor"));
        assert!(multi.belongs_to("gc.major"));
        assert!(!multi.belongs_to("builds"));
    }

    #[test]
    fn test_rule_is_kept() {
        let rule = PathRule::shared("/data");
        let job = Job::builder("writer").rule(rule.clone()).body(|_| JobStatus::Ok);
        assert!(Arc::ptr_eq(&job.rule().unwrap(), &rule));
    }

    #[test]
    fn test_run_body_reports_status() {
        let job = Job::builder("ok").body(|_| JobStatus::Ok);
        assert_eq!(job.core.run_body(), JobStatus::Ok);

        let job = Job::builder("fails").body(|_| JobStatus::Failed("disk full".into()));
        assert_eq!(job.core.run_body(), JobStatus::Failed("disk full".into()));
    }

    #[test]
    fn test_run_body_converts_panic_to_failure() {
        let job = Job::builder("buggy").body(|_| -> JobStatus { panic!("boom") });
        match job.core.run_body() {
            JobStatus::Failed(msg) => assert!(msg.contains("boom")),
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[test]
    fn test_body_observes_cancellation() {
        let job = Job::builder("cancellable").body(|token| {
            if token.is_cancelled() {
                JobStatus::Cancelled
            } else {
                JobStatus::Ok
            }
        });
        job.cancellation_token().cancel();
        assert_eq!(job.core.run_body(), JobStatus::Cancelled);
    }
}
