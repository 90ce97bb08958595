//! Scheduler error types

use thiserror::Error;

/// Errors reported by explicit rule scoping and scheduler entry points.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    /// `end_rule` was called on a thread with no active rule scope.
    #[error("no active rule scope on this thread")]
    NoActiveRule,

    /// `end_rule` was called with a rule other than the innermost one begun
    /// on this thread.
    #[error("rule does not match the innermost active rule scope")]
    RuleMismatch,

    /// `begin_rule` was called with a rule the enclosing scope does not
    /// contain.
    #[error("rule is not contained in the enclosing rule scope")]
    InvalidNesting,

    /// The scheduler has been shut down.
    #[error("scheduler has been shut down")]
    ShutDown,
}
