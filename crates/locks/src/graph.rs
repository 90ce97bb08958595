//! Wait-for graph over locks and rules.
//!
//! The graph records which owners hold which targets and which single target
//! each owner is currently waiting for. A blocking acquire asks the graph
//! whether the new wait edge closes a cycle; if it does, the graph picks a
//! victim whose locks can be force-released to break the deadlock.

use std::collections::HashMap;
use std::sync::Arc;

use crate::lock::LockCore;
use crate::owner::OwnerId;
use crate::rule::RuleRef;

/// Something an owner can hold or wait for.
#[derive(Clone)]
pub(crate) enum Target {
    Lock(Arc<LockCore>),
    Rule(RuleRef),
}

impl Target {
    pub(crate) fn key(&self) -> TargetKey {
        match self {
            Target::Lock(lock) => TargetKey::Lock(lock.id()),
            Target::Rule(rule) => TargetKey::Rule(Arc::as_ptr(rule) as *const () as usize),
        }
    }

    /// Whether holding `self` blocks an owner waiting for `other`. Locks
    /// block only themselves; rules block by rule conflict. Locks and rules
    /// never block each other directly.
    fn blocks(&self, other: &Target) -> bool {
        match (self, other) {
            (Target::Lock(a), Target::Lock(b)) => a.id() == b.id(),
            (Target::Rule(a), Target::Rule(b)) => a.is_conflicting(b.as_ref()),
            _ => false,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub(crate) enum TargetKey {
    Lock(u64),
    Rule(usize),
}

struct Node {
    target: Target,
    holders: Vec<OwnerId>,
}

struct Wait {
    key: TargetKey,
    /// Monotonic sequence used to break ties when picking a victim.
    seq: u64,
}

/// A detected cycle, resolved to the owner whose locks will be suspended.
pub(crate) struct Deadlock {
    pub(crate) victim: OwnerId,
    pub(crate) locks: Vec<Arc<LockCore>>,
}

#[derive(Default)]
pub(crate) struct DeadlockGraph {
    nodes: HashMap<TargetKey, Node>,
    waits: HashMap<OwnerId, Wait>,
    next_seq: u64,
}

impl DeadlockGraph {
    pub(crate) fn new() -> Self {
        DeadlockGraph::default()
    }

    /// Records `owner` as a holder of `target`. Reentrant acquisitions must
    /// not be reported; one edge per owner/target pair.
    pub(crate) fn acquired(&mut self, owner: OwnerId, target: &Target) {
        let node = self.nodes.entry(target.key()).or_insert_with(|| Node {
            target: target.clone(),
            holders: Vec::new(),
        });
        if !node.holders.contains(&owner) {
            node.holders.push(owner);
        }
    }

    /// Removes the hold edge for `owner` on `target`.
    pub(crate) fn released(&mut self, owner: OwnerId, target: &Target) {
        let key = target.key();
        if let Some(node) = self.nodes.get_mut(&key) {
            node.holders.retain(|h| *h != owner);
        }
        self.collect(key);
    }

    /// Adds a wait edge and reports the deadlock it completes, if any.
    pub(crate) fn wait_start(&mut self, owner: OwnerId, target: &Target) -> Option<Deadlock> {
        self.nodes.entry(target.key()).or_insert_with(|| Node {
            target: target.clone(),
            holders: Vec::new(),
        });
        let seq = self.next_seq;
        self.next_seq += 1;
        self.waits.insert(
            owner,
            Wait {
                key: target.key(),
                seq,
            },
        );

        let cycle = self.find_cycle(owner)?;
        let victim = self.choose_victim(owner, &cycle);
        let locks = self.locks_of(victim);
        if locks.is_empty() {
            log::error!("deadlock detected but no lock can be suspended to break it");
            return None;
        }
        log::debug!(
            "deadlock detected among {} owners, suspending locks of {}",
            cycle.len(),
            victim
        );
        Some(Deadlock { victim, locks })
    }

    /// Removes the wait edge for `owner`, if it still targets `target`.
    pub(crate) fn wait_stop(&mut self, owner: OwnerId, target: &Target) {
        let key = target.key();
        if self.waits.get(&owner).map(|w| w.key) == Some(key) {
            self.waits.remove(&owner);
        }
        self.collect(key);
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.waits.is_empty()
    }

    pub(crate) fn contains_owner(&self, owner: OwnerId) -> bool {
        self.waits.contains_key(&owner)
            || self.nodes.values().any(|n| n.holders.contains(&owner))
    }

    /// Drops a node once nothing holds it and nothing waits for it.
    fn collect(&mut self, key: TargetKey) {
        let unused = match self.nodes.get(&key) {
            Some(node) => node.holders.is_empty() && !self.waits.values().any(|w| w.key == key),
            None => return,
        };
        if unused {
            self.nodes.remove(&key);
        }
    }

    /// Owners blocking `owner`: every holder of a target that blocks the one
    /// `owner` is waiting for. An owner never blocks itself.
    fn blockers(&self, owner: OwnerId) -> Vec<OwnerId> {
        let wait = match self.waits.get(&owner) {
            Some(w) => w,
            None => return Vec::new(),
        };
        let waited = match self.nodes.get(&wait.key) {
            Some(n) => &n.target,
            None => return Vec::new(),
        };
        let mut out = Vec::new();
        for node in self.nodes.values() {
            if !node.target.blocks(waited) {
                continue;
            }
            for holder in &node.holders {
                if *holder != owner && !out.contains(holder) {
                    out.push(*holder);
                }
            }
        }
        out
    }

    /// Depth-first search for a blocking path from `start` back to itself.
    fn find_cycle(&self, start: OwnerId) -> Option<Vec<OwnerId>> {
        let mut path = vec![start];
        let mut visited = vec![start];
        if self.search(start, start, &mut path, &mut visited) {
            Some(path)
        } else {
            None
        }
    }

    fn search(
        &self,
        start: OwnerId,
        current: OwnerId,
        path: &mut Vec<OwnerId>,
        visited: &mut Vec<OwnerId>,
    ) -> bool {
        for blocker in self.blockers(current) {
            if blocker == start {
                return true;
            }
            if visited.contains(&blocker) {
                continue;
            }
            visited.push(blocker);
            path.push(blocker);
            if self.search(start, blocker, path, visited) {
                return true;
            }
            path.pop();
        }
        false
    }

    /// Prefers a cycle member other than the initiator that holds locks and
    /// no rules; rules cannot be suspended. Among candidates the most
    /// recently blocked owner is taken. Falls back to any lock holder in the
    /// cycle, the initiator included.
    fn choose_victim(&self, initiator: OwnerId, cycle: &[OwnerId]) -> OwnerId {
        let mut best: Option<(u64, OwnerId)> = None;
        for &member in cycle {
            if member == initiator || !self.holds_only_locks(member) {
                continue;
            }
            let seq = self.waits.get(&member).map(|w| w.seq).unwrap_or(0);
            if best.map_or(true, |(s, _)| seq > s) {
                best = Some((seq, member));
            }
        }
        if let Some((_, victim)) = best {
            return victim;
        }
        cycle
            .iter()
            .copied()
            .find(|m| !self.locks_of(*m).is_empty())
            .unwrap_or(initiator)
    }

    fn holds_only_locks(&self, owner: OwnerId) -> bool {
        let mut any_lock = false;
        for node in self.nodes.values() {
            if !node.holders.contains(&owner) {
                continue;
            }
            match node.target {
                Target::Lock(_) => any_lock = true,
                Target::Rule(_) => return false,
            }
        }
        any_lock
    }

    fn locks_of(&self, owner: OwnerId) -> Vec<Arc<LockCore>> {
        self.nodes
            .values()
            .filter(|n| n.holders.contains(&owner))
            .filter_map(|n| match &n.target {
                Target::Lock(lock) => Some(lock.clone()),
                Target::Rule(_) => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::LockCore;
    use crate::rule::PathRule;

    fn lock_target(id: u64) -> Target {
        Target::Lock(Arc::new(LockCore::new(id)))
    }

    fn owner(n: u64) -> OwnerId {
        // Owner ids are opaque; tests borrow distinct thread-locals instead.
        std::thread::spawn(move || {
            let _ = n;
            crate::owner::current()
        })
        .join()
        .unwrap()
    }

    #[test]
    fn test_no_cycle_without_conflict() {
        let mut graph = DeadlockGraph::new();
        let (a, b) = (owner(1), owner(2));
        let l1 = lock_target(1);
        let l2 = lock_target(2);
        graph.acquired(a, &l1);
        graph.acquired(b, &l2);
        assert!(graph.wait_start(a, &l2).is_none());
        graph.wait_stop(a, &l2);
        graph.released(a, &l1);
        graph.released(b, &l2);
        assert!(graph.is_empty());
    }

    #[test]
    fn test_two_owner_lock_cycle() {
        let mut graph = DeadlockGraph::new();
        let (a, b) = (owner(1), owner(2));
        let l1 = lock_target(1);
        let l2 = lock_target(2);
        graph.acquired(a, &l1);
        graph.acquired(b, &l2);
        assert!(graph.wait_start(a, &l2).is_none());
        let deadlock = graph.wait_start(b, &l1).expect("cycle expected");
        // The initiator holds on; the other lock-holding member is suspended.
        assert_eq!(deadlock.victim, a);
        assert_eq!(deadlock.locks.len(), 1);
        assert_eq!(deadlock.locks[0].id(), 1);
    }

    #[test]
    fn test_rule_holder_is_not_suspended() {
        let mut graph = DeadlockGraph::new();
        let (a, b) = (owner(1), owner(2));
        let rule = Target::Rule(PathRule::shared("/r"));
        let l1 = lock_target(1);
        graph.acquired(a, &rule);
        graph.acquired(b, &l1);
        assert!(graph.wait_start(a, &l1).is_none());
        // b waits for a conflicting rule, closing the cycle; a holds a rule
        // and is ineligible, so b, holding only locks, is suspended.
        let conflicting = Target::Rule(PathRule::shared("/r/sub"));
        let deadlock = graph.wait_start(b, &conflicting).expect("cycle expected");
        assert_eq!(deadlock.victim, b);
        assert_eq!(deadlock.locks[0].id(), 1);
    }

    #[test]
    fn test_mixed_targets_do_not_block_each_other() {
        let mut graph = DeadlockGraph::new();
        let a = owner(1);
        let b = owner(2);
        let rule = Target::Rule(PathRule::shared("/r"));
        let l1 = lock_target(1);
        graph.acquired(a, &rule);
        graph.acquired(b, &l1);
        // a waits for the lock, b waits for nothing conflicting with a lock.
        assert!(graph.wait_start(a, &l1).is_none());
        assert!(graph.contains_owner(a));
        assert!(graph.contains_owner(b));
    }
}
