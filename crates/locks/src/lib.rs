//! Ordered locks with deadlock detection.
//!
//! A [`LockManager`] hands out reentrant [`Lock`]s and keeps a wait-for graph
//! of which owners hold or wait for which locks and scheduling rules. When a
//! blocking acquire would close a cycle in that graph, the manager picks a
//! victim, force-releases its locks so the cycle can drain, and transparently
//! re-acquires them for the victim afterwards.
//!
//! Ownership is tracked by [`OwnerId`] rather than by raw thread handles, so
//! the graph never has to compare or retain thread objects.

mod graph;
mod lock;
mod manager;
pub mod owner;
mod rule;
mod semaphore;

pub use lock::Lock;
pub use manager::{LockListener, LockManager};
pub use owner::OwnerId;
pub use rule::{MultiRule, PathRule, Rule, RuleRef};
