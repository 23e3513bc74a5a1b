//! Ordered set of deadlines keyed by absolute monotonic milliseconds.
//!
//! Grounded on the heap-backend/registry split of a pluggable timer
//! subsystem (insert returns a handle, cancel is best-effort, pop_expired
//! drains everything due), adapted from a binary heap to an ordered map so
//! `pop_due` can use a simple range split instead of repeated pops.

use rustc_hash::FxHashMap;
use std::collections::BTreeMap;

/// Opaque handle returned by [`TimerWheel::insert`], used to cancel an
/// entry before it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

struct Entry {
    task_id: u64,
    handle_id: u64,
}

/// Deadline-ordered collection of pending timer entries.
///
/// Ties between entries with the same deadline break by insertion order,
/// since the key includes a monotonically increasing sequence number.
#[derive(Default)]
pub struct TimerWheel {
    by_deadline: BTreeMap<(u64, u64), Entry>,
    handle_to_key: FxHashMap<u64, (u64, u64)>,
    next_seq: u64,
    next_handle: u64,
}

impl TimerWheel {
    /// Create an empty wheel.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new deadline for `task_id`, returning a handle that can
    /// later be passed to [`TimerWheel::cancel`].
    pub fn insert(&mut self, task_id: u64, deadline_ms: u64) -> TimerHandle {
        let seq = self.next_seq;
        self.next_seq += 1;
        let key = (deadline_ms, seq);
        let handle_id = self.next_handle;
        self.next_handle += 1;
        self.by_deadline.insert(key, Entry { task_id, handle_id });
        self.handle_to_key.insert(handle_id, key);
        TimerHandle(handle_id)
    }

    /// Remove an entry without disturbing any other pending entry.
    /// Returns `false` if the handle was already consumed or cancelled.
    pub fn cancel(&mut self, handle: TimerHandle) -> bool {
        let Some(key) = self.handle_to_key.remove(&handle.0) else {
            return false;
        };
        self.by_deadline.remove(&key).is_some()
    }

    /// The smallest pending deadline, or `None` if the wheel is empty.
    pub fn next_deadline(&self) -> Option<u64> {
        self.by_deadline.keys().next().map(|(deadline, _)| *deadline)
    }

    /// Remove and return every entry due at or before `now_ms`, in
    /// ascending deadline order (ties by insertion order).
    pub fn pop_due(&mut self, now_ms: u64) -> Vec<(TimerHandle, u64)> {
        let mut due = Vec::new();
        loop {
            let Some((&key, _)) = self.by_deadline.iter().next() else {
                break;
            };
            if key.0 > now_ms {
                break;
            }
            let entry = self.by_deadline.remove(&key).unwrap();
            self.handle_to_key.remove(&entry.handle_id);
            due.push((TimerHandle(entry.handle_id), entry.task_id));
        }
        due
    }

    /// Number of entries currently pending.
    pub fn len(&self) -> usize {
        self.by_deadline.len()
    }

    /// Whether the wheel holds no pending entries.
    pub fn is_empty(&self) -> bool {
        self.by_deadline.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pop_due_is_deadline_ordered() {
        let mut wheel = TimerWheel::new();
        wheel.insert(1, 100);
        wheel.insert(2, 50);
        wheel.insert(3, 75);

        let due = wheel.pop_due(1_000);
        let task_ids: Vec<u64> = due.iter().map(|(_, t)| *t).collect();
        assert_eq!(task_ids, vec![2, 3, 1]);
    }

    #[test]
    fn ties_break_by_insertion_order() {
        let mut wheel = TimerWheel::new();
        wheel.insert(10, 5);
        wheel.insert(20, 5);
        wheel.insert(30, 5);

        let due = wheel.pop_due(5);
        let task_ids: Vec<u64> = due.iter().map(|(_, t)| *t).collect();
        assert_eq!(task_ids, vec![10, 20, 30]);
    }

    #[test]
    fn cancel_removes_without_disturbing_others() {
        let mut wheel = TimerWheel::new();
        wheel.insert(1, 10);
        let handle2 = wheel.insert(2, 20);
        wheel.insert(3, 30);

        assert!(wheel.cancel(handle2));
        assert!(!wheel.cancel(handle2)); // already gone

        let due = wheel.pop_due(100);
        let task_ids: Vec<u64> = due.iter().map(|(_, t)| *t).collect();
        assert_eq!(task_ids, vec![1, 3]);
    }

    #[test]
    fn next_deadline_tracks_minimum() {
        let mut wheel = TimerWheel::new();
        assert_eq!(wheel.next_deadline(), None);
        wheel.insert(1, 500);
        wheel.insert(2, 100);
        assert_eq!(wheel.next_deadline(), Some(100));
        wheel.pop_due(100);
        assert_eq!(wheel.next_deadline(), Some(500));
    }

    #[test]
    fn deadline_of_zero_fires_immediately() {
        let mut wheel = TimerWheel::new();
        wheel.insert(1, 0);
        let due = wheel.pop_due(0);
        assert_eq!(due.len(), 1);
    }

    #[test]
    fn pop_due_respects_not_yet_due() {
        let mut wheel = TimerWheel::new();
        wheel.insert(1, 200);
        assert!(wheel.pop_due(100).is_empty());
        assert_eq!(wheel.len(), 1);
        assert_eq!(wheel.pop_due(200).len(), 1);
        assert!(wheel.is_empty());
    }

    proptest::proptest! {
        // However deadlines are inserted, pop_due at the maximum deadline
        // must drain everything in non-decreasing deadline order.
        #[test]
        fn pop_due_is_always_nondecreasing(deadlines in proptest::collection::vec(0u64..10_000, 0..200)) {
            let mut wheel = TimerWheel::new();
            for (i, d) in deadlines.iter().enumerate() {
                wheel.insert(i as u64, *d);
            }
            let max = deadlines.iter().copied().max().unwrap_or(0);
            let due = wheel.pop_due(max);
            proptest::prop_assert_eq!(due.len(), deadlines.len());
            proptest::prop_assert!(wheel.is_empty());

            let seen: Vec<u64> = due.iter().map(|(_, task_id)| deadlines[*task_id as usize]).collect();
            for w in seen.windows(2) {
                proptest::prop_assert!(w[0] <= w[1]);
            }
        }

        // Cancelling a handle must never remove or reorder any other entry.
        #[test]
        fn cancel_is_isolated(deadlines in proptest::collection::vec(0u64..10_000, 1..50), victim in 0usize..50) {
            let mut wheel = TimerWheel::new();
            let handles: Vec<_> = deadlines.iter().enumerate().map(|(i, d)| wheel.insert(i as u64, *d)).collect();
            let victim = victim % handles.len();
            let victim_task = victim as u64;

            proptest::prop_assert!(wheel.cancel(handles[victim]));
            let due = wheel.pop_due(u64::MAX);
            proptest::prop_assert_eq!(due.len(), deadlines.len() - 1);
            proptest::prop_assert!(due.iter().all(|(_, t)| *t != victim_task));
        }
    }
}
