//! Stable per-thread owner identity.
//!
//! Each thread gets a small integer id the first time it touches a lock or a
//! rule. Ids are never reused within a process, which keeps the wait-for
//! graph honest even after threads exit.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_OWNER: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT: OwnerId = OwnerId(NEXT_OWNER.fetch_add(1, Ordering::Relaxed));
}

/// Identity of a lock/rule owner, normally one per thread.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct OwnerId(u64);

impl OwnerId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "owner-{}", self.0)
    }
}

/// Returns the calling thread's owner id, allocating one on first use.
pub fn current() -> OwnerId {
    CURRENT.with(|id| *id)
}
