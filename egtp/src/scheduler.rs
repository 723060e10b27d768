//! Delayed tasks for the event loop.
//!
//! The scheduler never runs anything itself. The event loop sleeps until [`Scheduler::next_deadline`] and then takes
//! the due tasks with [`Scheduler::pop_due`]. Cancelling a task that has already been taken does nothing.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TaskHandle(u64);

pub struct Scheduler<T> {
    queue: BTreeMap<(Instant, u64), T>,
    deadlines: HashMap<u64, Instant>,
    next_id: u64,
}

impl<T> Default for Scheduler<T> {
    fn default() -> Self {
        Scheduler { queue: BTreeMap::new(), deadlines: HashMap::new(), next_id: 0 }
    }
}

impl<T> Scheduler<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule_at(&mut self, at: Instant, task: T) -> TaskHandle {
        let id = self.next_id;
        self.next_id += 1;
        self.queue.insert((at, id), task);
        self.deadlines.insert(id, at);
        TaskHandle(id)
    }

    pub fn schedule(&mut self, delay: Duration, now: Instant, task: T) -> TaskHandle {
        self.schedule_at(now + delay, task)
    }

    /// Remove a pending task. Returns `None` if it already ran or was cancelled.
    pub fn cancel(&mut self, handle: TaskHandle) -> Option<T> {
        let at = self.deadlines.remove(&handle.0)?;
        self.queue.remove(&(at, handle.0))
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.queue.keys().next().map(|(at, _)| *at)
    }

    /// Take every task due at or before `now`, earliest first.
    pub fn pop_due(&mut self, now: Instant) -> Vec<T> {
        let mut due = Vec::new();
        while let Some(entry) = self.queue.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let ((_, id), task) = entry.remove_entry();
            self.deadlines.remove(&id);
            due.push(task);
        }
        due
    }

    /// Whether any pending task matching `pred` is due no later than `at`.
    #[cfg(test)]
    pub fn any_due_by<F: Fn(&T) -> bool>(&self, at: Instant, pred: F) -> bool {
        self.queue.range(..=(at, u64::MAX)).any(|(_, task)| pred(task))
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
        self.deadlines.clear();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn due_tasks_come_out_in_order() {
        let t0 = Instant::now();
        let mut s = Scheduler::new();
        s.schedule(Duration::from_secs(5), t0, "five");
        s.schedule(Duration::from_secs(1), t0, "one");
        s.schedule(Duration::from_secs(3), t0, "three");
        assert_eq!(s.next_deadline(), Some(t0 + Duration::from_secs(1)));
        assert_eq!(s.pop_due(t0 + Duration::from_secs(3)), vec!["one", "three"]);
        assert_eq!(s.len(), 1);
        assert!(s.pop_due(t0 + Duration::from_secs(4)).is_empty());
        assert_eq!(s.pop_due(t0 + Duration::from_secs(5)), vec!["five"]);
        assert!(s.next_deadline().is_none());
    }

    #[test]
    fn cancel_after_firing_is_a_no_op() {
        let t0 = Instant::now();
        let mut s = Scheduler::new();
        let a = s.schedule(Duration::from_secs(1), t0, 'a');
        let b = s.schedule(Duration::from_secs(2), t0, 'b');
        assert_eq!(s.cancel(b), Some('b'));
        assert_eq!(s.cancel(b), None);
        assert_eq!(s.pop_due(t0 + Duration::from_secs(10)), vec!['a']);
        assert_eq!(s.cancel(a), None);
        assert!(s.is_empty());
    }

    #[test]
    fn due_by_query() {
        let t0 = Instant::now();
        let mut s = Scheduler::new();
        s.schedule(Duration::from_secs(10), t0, 1u32);
        assert!(s.any_due_by(t0 + Duration::from_secs(10), |t| *t == 1));
        assert!(!s.any_due_by(t0 + Duration::from_secs(9), |t| *t == 1));
        assert!(!s.any_due_by(t0 + Duration::from_secs(20), |t| *t == 2));
    }
}
