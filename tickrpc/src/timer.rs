//! Deadline-ordered timer wheel.
//!
//! An ordered set keyed by `(deadline_ms, id)` plus an id index, so ready
//! timers fire in deadline order with ties broken by insertion order.
//! `drain` removes a timer from both structures *before* invoking its task,
//! so a task may freely add or cancel timers, including itself; interval
//! timers are re-armed (same id, deadline += interval) before the task runs.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

/// Timer callback: receives the timer id and the interval (0 for one-shot).
pub type TimerTask = Rc<dyn Fn(u64, u32)>;

struct TimerEntry {
    interval_ms: u32,
    task: TimerTask,
}

/// Deadline-ordered timer set with stable u64 ids (0 is never issued).
#[derive(Default)]
pub struct TimerWheel {
    queue: RefCell<BTreeMap<(u64, u64), TimerEntry>>,
    index: RefCell<HashMap<u64, u64>>,
    next_id: Cell<u64>,
}

impl TimerWheel {
    pub fn new() -> Self {
        Self::default()
    }

    fn generate_id(&self) -> u64 {
        let mut id = self.next_id.get().wrapping_add(1);
        if id == 0 {
            id = 1;
        }
        self.next_id.set(id);
        id
    }

    /// Arms a timer at `deadline_ms`; `interval_ms > 0` makes it periodic.
    /// Returns the timer id, or 0 on id-space exhaustion.
    pub fn add(&self, task: TimerTask, deadline_ms: u64, interval_ms: u32) -> u64 {
        let id = self.generate_id();
        let mut index = self.index.borrow_mut();
        if index.contains_key(&id) {
            return 0;
        }
        index.insert(id, deadline_ms);
        self.queue.borrow_mut().insert((deadline_ms, id), TimerEntry { interval_ms, task });
        id
    }

    /// Cancels a timer. Unknown ids return `false`.
    pub fn cancel(&self, id: u64) -> bool {
        let deadline = match self.index.borrow_mut().remove(&id) {
            Some(d) => d,
            None => return false,
        };
        self.queue.borrow_mut().remove(&(deadline, id));
        true
    }

    /// Fires every timer whose deadline is at or before `now_ms`, one at a
    /// time, and returns how many fired. The caller bounds total time spent
    /// here; the wheel itself does not.
    pub fn drain(&self, now_ms: u64) -> u32 {
        let mut fired = 0u32;
        loop {
            let (id, interval, task) = {
                let mut queue = self.queue.borrow_mut();
                let (&(deadline, id), _) = match queue.iter().next() {
                    Some(first) if first.0 .0 <= now_ms => first,
                    _ => break,
                };
                let entry = queue.remove(&(deadline, id)).expect("first key exists");
                let mut index = self.index.borrow_mut();
                index.remove(&id);

                // Re-arm before the task runs so the task observes the timer
                // as live and may cancel it.
                if entry.interval_ms > 0 {
                    let next = deadline + entry.interval_ms as u64;
                    index.insert(id, next);
                    queue.insert((next, id), TimerEntry {
                        interval_ms: entry.interval_ms,
                        task: Rc::clone(&entry.task),
                    });
                }
                (id, entry.interval_ms, entry.task)
            };

            task(id, interval);
            fired += 1;
        }
        fired
    }

    /// True when the timer is armed.
    pub fn exists(&self, id: u64) -> bool {
        self.index.borrow().contains_key(&id)
    }

    /// Number of armed timers.
    pub fn len(&self) -> usize {
        self.index.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.borrow().is_empty()
    }

    /// Disarms every timer.
    pub fn clear(&self) {
        self.queue.borrow_mut().clear();
        self.index.borrow_mut().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder() -> (Rc<RefCell<Vec<u64>>>, impl Fn() -> TimerTask) {
        let fired: Rc<RefCell<Vec<u64>>> = Rc::default();
        let f = fired.clone();
        (fired, move || {
            let f = f.clone();
            Rc::new(move |id, _| f.borrow_mut().push(id))
        })
    }

    #[test]
    fn fires_in_deadline_then_id_order() {
        let wheel = TimerWheel::new();
        let (fired, task) = recorder();

        let a = wheel.add(task(), 200, 0);
        let b = wheel.add(task(), 100, 0);
        let c = wheel.add(task(), 100, 0);

        assert_eq!(wheel.drain(50), 0);
        assert_eq!(wheel.drain(200), 3);
        assert_eq!(*fired.borrow(), vec![b, c, a]);
        assert!(wheel.is_empty());
    }

    #[test]
    fn cancelled_timers_never_fire() {
        let wheel = TimerWheel::new();
        let (fired, task) = recorder();

        let a = wheel.add(task(), 100, 0);
        let b = wheel.add(task(), 100, 0);
        assert!(wheel.cancel(a));
        assert!(!wheel.cancel(a), "cancel is idempotent-safe");
        assert!(!wheel.cancel(999));

        wheel.drain(1000);
        assert_eq!(*fired.borrow(), vec![b]);
    }

    #[test]
    fn fired_multiset_matches_armed_multiset() {
        let wheel = TimerWheel::new();
        let (fired, task) = recorder();

        let mut expected = Vec::new();
        let mut cancelled = Vec::new();
        for i in 0..20u64 {
            let id = wheel.add(task(), 10 * (i % 5), 0);
            if i % 3 == 0 {
                cancelled.push(id);
            } else {
                expected.push((10 * (i % 5), id));
            }
        }
        for id in &cancelled {
            wheel.cancel(*id);
        }
        wheel.drain(40);

        expected.sort_unstable();
        let expected_ids: Vec<u64> = expected.into_iter().map(|(_, id)| id).collect();
        assert_eq!(*fired.borrow(), expected_ids);
    }

    #[test]
    fn interval_timer_rearms_at_deadline_plus_interval() {
        let wheel = TimerWheel::new();
        let (fired, task) = recorder();

        let id = wheel.add(task(), 100, 50);
        assert_eq!(wheel.drain(100), 1);
        assert!(wheel.exists(id), "re-armed");
        assert_eq!(wheel.drain(149), 0);
        assert_eq!(wheel.drain(150), 1);
        assert_eq!(*fired.borrow(), vec![id, id]);
        assert!(wheel.cancel(id));
        assert_eq!(wheel.drain(10_000), 0);
    }

    #[test]
    fn task_may_cancel_itself_and_add_timers() {
        let wheel = Rc::new(TimerWheel::new());
        let fired: Rc<RefCell<Vec<&'static str>>> = Rc::default();

        let w = Rc::clone(&wheel);
        let f = fired.clone();
        let id = wheel.add(
            Rc::new(move |me, _| {
                f.borrow_mut().push("periodic");
                // Cancels its own re-armed instance and chains a one-shot.
                assert!(w.cancel(me));
                let f2 = f.clone();
                w.add(Rc::new(move |_, _| f2.borrow_mut().push("chained")), 300, 0);
            }),
            100,
            100,
        );
        assert_ne!(id, 0);

        assert_eq!(wheel.drain(100), 1);
        assert!(!wheel.exists(id));
        assert_eq!(wheel.drain(300), 1);
        assert_eq!(*fired.borrow(), vec!["periodic", "chained"]);
    }

    #[test]
    fn drain_fires_catchup_rounds_one_call() {
        // A periodic timer far behind `now` fires repeatedly within one
        // drain because each re-arm lands at deadline + interval.
        let wheel = TimerWheel::new();
        let (fired, task) = recorder();
        wheel.add(task(), 10, 10);
        assert_eq!(wheel.drain(40), 4);
        assert_eq!(fired.borrow().len(), 4);
    }
}
