//! Foreman Job Scheduler
//!
//! An in-process, cooperative job scheduler: jobs carry a priority and an
//! optional scheduling rule, an elastic worker pool executes them, and
//! conflicting rules serialize execution. Rules and ordered locks share a
//! wait-for graph with deadlock detection.
//!
//! Priority biases dispatch order but never preempts: each level maps to a
//! scheduling delay, so higher-priority jobs overtake lower-priority ones
//! submitted at roughly the same time. Cancellation is cooperative through
//! a token the job body polls.
//!
//! # Example
//!
//! ```
//! use foreman_scheduler::{Job, JobScheduler, JobStatus, PathRule, Priority};
//!
//! let scheduler = JobScheduler::new();
//!
//! let job = Job::builder("index workspace")
//!     .priority(Priority::Long)
//!     .rule(PathRule::shared("/workspace"))
//!     .body(|token| {
//!         if token.is_cancelled() {
//!             return JobStatus::Cancelled;
//!         }
//!         // ... do the work ...
//!         JobStatus::Ok
//!     });
//!
//! scheduler.schedule(&job);
//! scheduler.shutdown();
//! ```

mod cancel;
mod error;
mod job;
mod listener;
mod pool;
mod priority;
mod queue;
mod scheduler;
mod worker;

pub use cancel::CancellationToken;
pub use error::SchedulerError;
pub use job::{Job, JobBuilder, JobId, JobState, JobStatus};
pub use listener::{JobListener, ListenerId};
pub use priority::Priority;
pub use scheduler::{JobScheduler, SchedulerConfig};

// Lock primitives share the scheduler's deadlock detection; re-exported so
// most users need only this crate.
pub use foreman_locks::{owner, Lock, LockListener, LockManager, MultiRule, OwnerId, PathRule, Rule, RuleRef};
