//! Lock manager: wait-for graph bookkeeping, deadlock resolution, and
//! suspension frames.
//!
//! Locks and scheduling rules share one graph, so a cycle spanning both is
//! detected the same way as a pure lock cycle. Only locks can be suspended;
//! when a cycle contains rule holders the victim is picked among the owners
//! holding nothing but locks.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::graph::{DeadlockGraph, Target};
use crate::lock::{acquire_core, Lock, LockCore};
use crate::owner::OwnerId;
use crate::rule::RuleRef;

/// Observes lock waits. Installed by embedders that need to keep a thread
/// responsive (for example to pump a UI event loop) while it waits.
pub trait LockListener: Send + Sync {
    /// Called before a thread blocks on a lock held by `lock_owner`.
    /// Returning true asks the manager to wait in short slices, consulting
    /// the listener again between slices.
    fn about_to_wait(&self, lock_owner: Option<OwnerId>) -> bool {
        let _ = lock_owner;
        false
    }

    /// Called when a thread is about to release a contended lock.
    fn about_to_release(&self) {}
}

struct SuspendedLock {
    lock: Arc<LockCore>,
    depth: u32,
}

/// One deadlock resolution's worth of stripped locks. Frames stack per
/// owner; nested resolutions resume in LIFO order.
type Frame = Vec<SuspendedLock>;

struct Inner {
    graph: Mutex<DeadlockGraph>,
    suspended: Mutex<HashMap<OwnerId, Vec<Frame>>>,
    listener: Mutex<Option<Arc<dyn LockListener>>>,
    next_lock_id: AtomicU64,
}

/// Shared manager handing out [`Lock`]s. Clones refer to the same manager.
#[derive(Clone)]
pub struct LockManager {
    inner: Arc<Inner>,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LockManager {
    pub fn new() -> Self {
        LockManager {
            inner: Arc::new(Inner {
                graph: Mutex::new(DeadlockGraph::new()),
                suspended: Mutex::new(HashMap::new()),
                listener: Mutex::new(None),
                next_lock_id: AtomicU64::new(1),
            }),
        }
    }

    /// Creates a new lock participating in this manager's deadlock
    /// detection.
    pub fn new_lock(&self) -> Lock {
        let id = self.inner.next_lock_id.fetch_add(1, Ordering::Relaxed);
        Lock::new(Arc::new(LockCore::new(id)), self.clone())
    }

    /// Installs or clears the lock listener. Listener panics are caught and
    /// logged, never propagated into lock operations.
    pub fn set_lock_listener(&self, listener: Option<Arc<dyn LockListener>>) {
        *self
            .inner
            .listener
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = listener;
    }

    /// True when no owner holds or waits for anything.
    pub fn is_empty(&self) -> bool {
        self.graph().is_empty()
    }

    /// True when the calling thread holds or waits for a lock or rule.
    pub fn is_lock_owner(&self) -> bool {
        let me = crate::owner::current();
        self.graph().contains_owner(me)
    }

    // ---- rule integration (used by the job scheduler) ----

    /// Records `owner` as holding `rule`. Non-blocking; admission control is
    /// the caller's job.
    pub fn rule_acquired(&self, owner: OwnerId, rule: &RuleRef) {
        self.graph().acquired(owner, &Target::Rule(rule.clone()));
    }

    /// Removes `owner`'s hold on `rule`.
    pub fn rule_released(&self, owner: OwnerId, rule: &RuleRef) {
        self.graph().released(owner, &Target::Rule(rule.clone()));
    }

    /// Records that `owner` is about to block waiting for `rule`, running
    /// deadlock detection against the combined lock/rule graph.
    pub fn rule_wait_start(&self, owner: OwnerId, rule: &RuleRef) {
        self.wait_start(owner, &Target::Rule(rule.clone()));
    }

    pub fn rule_wait_stop(&self, owner: OwnerId, rule: &RuleRef) {
        self.graph().wait_stop(owner, &Target::Rule(rule.clone()));
    }

    /// Re-acquires the most recent frame of locks stripped from `owner` by a
    /// deadlock resolution, restoring each lock's recursion depth. No-op
    /// when nothing was suspended.
    pub fn resume_suspended(&self, owner: OwnerId) {
        let frame = {
            let mut suspended = self
                .inner
                .suspended
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            let frames = match suspended.get_mut(&owner) {
                Some(f) => f,
                None => return,
            };
            let frame = frames.pop();
            if frames.is_empty() {
                suspended.remove(&owner);
            }
            match frame {
                Some(f) => f,
                None => return,
            }
        };
        for entry in frame {
            log::debug!("{} re-acquiring suspended lock {}", owner, entry.lock.id());
            while !acquire_core(self, &entry.lock, Duration::MAX) {}
            entry.lock.restore_depth(owner, entry.depth);
        }
    }

    // ---- crate-internal plumbing used by Lock ----

    fn graph(&self) -> MutexGuard<'_, DeadlockGraph> {
        self.inner.graph.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn graph_acquired(&self, owner: OwnerId, target: &Target) {
        self.graph().acquired(owner, target);
    }

    pub(crate) fn graph_released(&self, owner: OwnerId, target: &Target) {
        self.graph().released(owner, target);
    }

    pub(crate) fn graph_wait_start(&self, owner: OwnerId, target: &Target) {
        self.wait_start(owner, target);
    }

    pub(crate) fn graph_wait_stop(&self, owner: OwnerId, target: &Target) {
        self.graph().wait_stop(owner, target);
    }

    /// Adds a wait edge and, when that closes a cycle, strips the victim's
    /// locks into a suspension frame.
    fn wait_start(&self, owner: OwnerId, target: &Target) {
        let (victim, frame) = {
            let mut graph = self.graph();
            let deadlock = match graph.wait_start(owner, target) {
                Some(d) => d,
                None => return,
            };
            let frame: Frame = deadlock
                .locks
                .into_iter()
                .map(|lock| {
                    let depth = lock.force_release();
                    graph.released(deadlock.victim, &Target::Lock(lock.clone()));
                    SuspendedLock { lock, depth }
                })
                .collect();
            (deadlock.victim, frame)
        };
        let mut suspended = self
            .inner
            .suspended
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        suspended.entry(victim).or_default().push(frame);
    }

    /// Consults the listener before a blocking wait. Returns whether to wait
    /// in short slices.
    pub(crate) fn about_to_wait(&self, lock_owner: Option<OwnerId>) -> bool {
        let listener = {
            let guard = self
                .inner
                .listener
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            guard.clone()
        };
        let Some(listener) = listener else {
            return false;
        };
        match catch_unwind(AssertUnwindSafe(|| listener.about_to_wait(lock_owner))) {
            Ok(slice) => slice,
            Err(_) => {
                log::error!("lock listener panicked in about_to_wait");
                false
            }
        }
    }

    pub(crate) fn about_to_release(&self) {
        let listener = {
            let guard = self
                .inner
                .listener
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            guard.clone()
        };
        if let Some(listener) = listener {
            if catch_unwind(AssertUnwindSafe(|| listener.about_to_release())).is_err() {
                log::error!("lock listener panicked in about_to_release");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::PathRule;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn test_rule_ownership_tracked() {
        let manager = LockManager::new();
        let rule = PathRule::shared("/a");
        let me = crate::owner::current();
        assert!(!manager.is_lock_owner());
        manager.rule_acquired(me, &rule);
        assert!(manager.is_lock_owner());
        assert!(!manager.is_empty());
        manager.rule_released(me, &rule);
        assert!(manager.is_empty());
    }

    struct CountingListener {
        waits: AtomicUsize,
        releases: AtomicUsize,
    }

    impl LockListener for CountingListener {
        fn about_to_wait(&self, _lock_owner: Option<OwnerId>) -> bool {
            self.waits.fetch_add(1, Ordering::SeqCst);
            false
        }

        fn about_to_release(&self) {
            self.releases.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_listener_sees_contended_operations() {
        let manager = LockManager::new();
        let listener = Arc::new(CountingListener {
            waits: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
        });
        manager.set_lock_listener(Some(listener.clone()));

        let lock = manager.new_lock();
        lock.acquire();
        let contender = lock.clone();
        let handle = thread::spawn(move || {
            contender.acquire();
            contender.release();
        });
        thread::sleep(Duration::from_millis(30));
        lock.release();
        handle.join().unwrap();

        assert!(listener.waits.load(Ordering::SeqCst) >= 1);
        assert!(listener.releases.load(Ordering::SeqCst) >= 1);
        assert!(manager.is_empty());
    }

    struct PanickyListener;

    impl LockListener for PanickyListener {
        fn about_to_wait(&self, _lock_owner: Option<OwnerId>) -> bool {
            panic!("listener bug");
        }
    }

    #[test]
    fn test_panicking_listener_does_not_break_acquire() {
        let manager = LockManager::new();
        manager.set_lock_listener(Some(Arc::new(PanickyListener)));
        let lock = manager.new_lock();
        lock.acquire();
        let contender = lock.clone();
        let handle = thread::spawn(move || {
            contender.acquire();
            contender.release();
        });
        thread::sleep(Duration::from_millis(20));
        lock.release();
        handle.join().unwrap();
        assert!(manager.is_empty());
    }
}
