//! Time-ordered run queue
//!
//! Both the waiting and the sleeping queue order jobs by a wake time: for
//! waiting jobs that is the submission instant plus the priority delay, for
//! sleeping jobs the instant the sleep expires. Ties fall back to insertion
//! order, so equal-priority jobs run first come, first served.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

use crate::job::{JobCore, JobId};

/// Ordering key of a queued job. `Never` sorts after every concrete time
/// and marks jobs sleeping without a deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum WakeTime {
    At(Instant),
    Never,
}

pub(crate) struct RunQueue {
    entries: BTreeMap<(WakeTime, u64), Arc<JobCore>>,
    index: HashMap<JobId, (WakeTime, u64)>,
    next_seq: u64,
}

impl RunQueue {
    pub(crate) fn new() -> Self {
        RunQueue {
            entries: BTreeMap::new(),
            index: HashMap::new(),
            next_seq: 0,
        }
    }

    pub(crate) fn enqueue(&mut self, job: Arc<JobCore>, wake: WakeTime) {
        let key = (wake, self.next_seq);
        self.next_seq += 1;
        self.index.insert(job.id(), key);
        self.entries.insert(key, job);
    }

    /// Removes and returns the earliest entry.
    pub(crate) fn dequeue(&mut self) -> Option<Arc<JobCore>> {
        let ((_, _), job) = self.entries.pop_first()?;
        self.index.remove(&job.id());
        Some(job)
    }

    /// Wake time of the earliest entry without removing it.
    pub(crate) fn peek_wake(&self) -> Option<WakeTime> {
        self.entries.keys().next().map(|(wake, _)| *wake)
    }

    pub(crate) fn remove(&mut self, id: JobId) -> Option<Arc<JobCore>> {
        let key = self.index.remove(&id)?;
        self.entries.remove(&key)
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, id: JobId) -> bool {
        self.index.contains_key(&id)
    }

    /// Wake time of a specific entry, if queued.
    pub(crate) fn wake_of(&self, id: JobId) -> Option<WakeTime> {
        self.index.get(&id).map(|(wake, _)| *wake)
    }

    /// Re-keys an entry, keeping its insertion sequence. Returns whether the
    /// entry was present.
    pub(crate) fn resort(&mut self, id: JobId, wake: WakeTime) -> bool {
        let key = match self.index.get(&id) {
            Some(k) => *k,
            None => return false,
        };
        let job = match self.entries.remove(&key) {
            Some(j) => j,
            None => return false,
        };
        let new_key = (wake, key.1);
        self.index.insert(id, new_key);
        self.entries.insert(new_key, job);
        true
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn jobs(&self) -> impl Iterator<Item = &Arc<JobCore>> {
        self.entries.values()
    }

    pub(crate) fn drain(&mut self) -> Vec<Arc<JobCore>> {
        self.index.clear();
        let drained = std::mem::take(&mut self.entries);
        drained.into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{Job, JobStatus};
    use std::time::Duration;

    fn core(name: &str) -> Arc<JobCore> {
        Job::builder(name).body(|_| JobStatus::Ok).core
    }

    #[test]
    fn test_orders_by_wake_time() {
        let mut queue = RunQueue::new();
        let now = Instant::now();
        let late = core("late");
        let early = core("early");
        queue.enqueue(late.clone(), WakeTime::At(now + Duration::from_secs(10)));
        queue.enqueue(early.clone(), WakeTime::At(now));

        assert_eq!(queue.dequeue().unwrap().id(), early.id());
        assert_eq!(queue.dequeue().unwrap().id(), late.id());
        assert!(queue.dequeue().is_none());
    }

    #[test]
    fn test_fifo_on_equal_wake_time() {
        let mut queue = RunQueue::new();
        let now = Instant::now();
        let first = core("first");
        let second = core("second");
        queue.enqueue(first.clone(), WakeTime::At(now));
        queue.enqueue(second.clone(), WakeTime::At(now));
        assert_eq!(queue.dequeue().unwrap().id(), first.id());
        assert_eq!(queue.dequeue().unwrap().id(), second.id());
    }

    #[test]
    fn test_never_sorts_last() {
        let mut queue = RunQueue::new();
        let forever = core("forever");
        let timed = core("timed");
        queue.enqueue(forever.clone(), WakeTime::Never);
        queue.enqueue(
            timed.clone(),
            WakeTime::At(Instant::now() + Duration::from_secs(3600)),
        );
        assert_eq!(queue.peek_wake(), queue.wake_of(timed.id()));
        assert_eq!(queue.dequeue().unwrap().id(), timed.id());
    }

    #[test]
    fn test_remove_by_id() {
        let mut queue = RunQueue::new();
        let job = core("gone");
        queue.enqueue(job.clone(), WakeTime::Never);
        assert!(queue.contains(job.id()));
        assert_eq!(queue.remove(job.id()).unwrap().id(), job.id());
        assert!(!queue.contains(job.id()));
        assert!(queue.remove(job.id()).is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_resort_moves_entry() {
        let mut queue = RunQueue::new();
        let now = Instant::now();
        let slow = core("slow");
        let fast = core("fast");
        queue.enqueue(slow.clone(), WakeTime::At(now + Duration::from_secs(5)));
        queue.enqueue(fast.clone(), WakeTime::At(now + Duration::from_secs(9)));

        assert!(queue.resort(fast.id(), WakeTime::At(now)));
        assert_eq!(queue.dequeue().unwrap().id(), fast.id());
        assert!(!queue.resort(999_999, WakeTime::Never));
    }

    #[test]
    fn test_drain_empties_queue() {
        let mut queue = RunQueue::new();
        queue.enqueue(core("a"), WakeTime::Never);
        queue.enqueue(core("b"), WakeTime::Never);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.drain().len(), 2);
        assert!(queue.is_empty());
    }
}
