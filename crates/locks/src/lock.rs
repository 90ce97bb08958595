//! Reentrant ordered lock.
//!
//! Waiters queue in arrival order, each behind its own semaphore, and a
//! release hands ownership directly to the head waiter before its semaphore
//! is signalled. That hand-off means a late arrival can never sneak in
//! between a release and the wake-up of the next waiter.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::graph::Target;
use crate::manager::LockManager;
use crate::owner::{self, OwnerId};
use crate::semaphore::Semaphore;

/// How long to wait per slice while a lock listener keeps vetoing a
/// full-length block.
const LISTENER_SLICE: Duration = Duration::from_millis(10);

struct Waiter {
    owner: OwnerId,
    sem: Arc<Semaphore>,
}

struct LockState {
    owner: Option<OwnerId>,
    depth: u32,
    waiters: VecDeque<Waiter>,
}

/// Shared state of one lock, also referenced from the wait-for graph and
/// from suspension frames.
pub(crate) struct LockCore {
    id: u64,
    state: Mutex<LockState>,
}

impl LockCore {
    pub(crate) fn new(id: u64) -> Self {
        LockCore {
            id,
            state: Mutex::new(LockState {
                owner: None,
                depth: 0,
                waiters: VecDeque::new(),
            }),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    fn lock_state(&self) -> MutexGuard<'_, LockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Hands ownership to the head waiter, if any. The caller signals the
    /// returned semaphore after dropping the state guard.
    fn grant_next(state: &mut LockState) -> Option<Arc<Semaphore>> {
        let next = state.waiters.pop_front()?;
        state.owner = Some(next.owner);
        state.depth = 1;
        Some(next.sem)
    }

    /// Strips the current owner regardless of depth, granting the lock to
    /// the next waiter. Returns the depth to restore on resume.
    pub(crate) fn force_release(&self) -> u32 {
        let (saved, granted) = {
            let mut state = self.lock_state();
            let saved = state.depth;
            state.owner = None;
            state.depth = 0;
            (saved, Self::grant_next(&mut state))
        };
        if let Some(sem) = granted {
            sem.release();
        }
        saved
    }

    /// Restores the recursion depth after a suspended lock was re-acquired.
    pub(crate) fn restore_depth(&self, owner: OwnerId, depth: u32) {
        let mut state = self.lock_state();
        if state.owner == Some(owner) {
            state.depth = depth;
        }
    }
}

/// Acquires `core` on behalf of the calling thread, registering the wait in
/// the manager's graph and running deadlock detection before blocking.
/// Returns false only when the timeout elapsed without the lock having been
/// granted.
pub(crate) fn acquire_core(
    manager: &LockManager,
    core: &Arc<LockCore>,
    timeout: Duration,
) -> bool {
    let me = owner::current();
    let target = Target::Lock(core.clone());

    let (sem, blocker) = {
        let mut state = core.lock_state();
        if state.owner == Some(me) {
            state.depth += 1;
            return true;
        }
        if state.owner.is_none() && state.waiters.is_empty() {
            state.owner = Some(me);
            state.depth = 1;
            drop(state);
            manager.graph_acquired(me, &target);
            return true;
        }
        let sem = Arc::new(Semaphore::new());
        state.waiters.push_back(Waiter {
            owner: me,
            sem: sem.clone(),
        });
        (sem, state.owner)
    };

    manager.graph_wait_start(me, &target);

    let deadline = Instant::now().checked_add(timeout);
    let mut acquired = false;
    loop {
        let remaining = match deadline {
            Some(d) => d.saturating_duration_since(Instant::now()),
            None => Duration::MAX,
        };
        if remaining.is_zero() {
            break;
        }
        let slice = if manager.about_to_wait(blocker) {
            remaining.min(LISTENER_SLICE)
        } else {
            remaining
        };
        if sem.acquire(slice) {
            acquired = true;
            break;
        }
    }

    if !acquired {
        let mut state = core.lock_state();
        if state.owner == Some(me) {
            // A grant raced the timeout; keep the lock.
            acquired = true;
        } else if let Some(pos) = state.waiters.iter().position(|w| Arc::ptr_eq(&w.sem, &sem)) {
            state.waiters.remove(pos);
        }
    }

    manager.graph_wait_stop(me, &target);
    if acquired {
        manager.graph_acquired(me, &target);
        manager.resume_suspended(me);
    }
    acquired
}

/// A reentrant lock tied to a [`LockManager`]. Cheap to clone; clones refer
/// to the same lock.
#[derive(Clone)]
pub struct Lock {
    core: Arc<LockCore>,
    manager: LockManager,
}

impl Lock {
    pub(crate) fn new(core: Arc<LockCore>, manager: LockManager) -> Self {
        Lock { core, manager }
    }

    /// Blocks until the lock is held by the calling thread. Reentrant.
    pub fn acquire(&self) {
        while !acquire_core(&self.manager, &self.core, Duration::MAX) {}
    }

    /// Like [`Lock::acquire`] but gives up after `timeout`. Returns whether
    /// the lock was acquired.
    pub fn acquire_timeout(&self, timeout: Duration) -> bool {
        acquire_core(&self.manager, &self.core, timeout)
    }

    /// Releases one level of recursion. Releasing a lock the calling thread
    /// does not own has no effect. The final release hands the lock to the
    /// longest-waiting thread.
    pub fn release(&self) {
        let me = owner::current();
        let granted = {
            let mut state = self.core.lock_state();
            if state.owner != Some(me) {
                log::warn!("release of lock {} by non-owner ignored", self.core.id());
                return;
            }
            state.depth -= 1;
            if state.depth > 0 {
                return;
            }
            state.owner = None;
            LockCore::grant_next(&mut state)
        };
        self.manager.about_to_release();
        self.manager
            .graph_released(me, &Target::Lock(self.core.clone()));
        if let Some(sem) = granted {
            sem.release();
        }
    }

    /// Recursion depth held by the calling thread, zero when not the owner.
    pub fn depth(&self) -> u32 {
        let state = self.core.lock_state();
        if state.owner == Some(owner::current()) {
            state.depth
        } else {
            0
        }
    }
}
