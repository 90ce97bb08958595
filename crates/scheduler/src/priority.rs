//! Job priority levels
//!
//! Priority never preempts a running job. It biases dispatch order instead:
//! each level maps to a scheduling delay, and the waiting queue is ordered
//! by effective start time, so a lower-priority job submitted slightly
//! earlier can still be overtaken by a higher-priority one.

use std::time::Duration;

/// Priority of a job. Higher values are dispatched sooner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    /// Cosmetic background work (lowest priority).
    Decorate = 0,

    /// Whole-workspace builds and other heavyweight batch work.
    Build = 1,

    /// Long-running background work.
    Long = 2,

    /// Short background work the user is likely waiting on.
    Short = 3,

    /// Work blocking direct user interaction (highest priority).
    Interactive = 4,
}

impl Priority {
    /// Scheduling delay applied when a job of this priority enters the
    /// waiting queue.
    pub(crate) fn delay(self) -> Duration {
        match self {
            Priority::Interactive => Duration::ZERO,
            Priority::Short => Duration::from_millis(50),
            Priority::Long => Duration::from_millis(100),
            Priority::Build => Duration::from_millis(500),
            Priority::Decorate => Duration::from_millis(1000),
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Long
    }
}
