//! The turn queue every continuation is deferred through.
//!
//! The engine only ever talks to the [`Scheduler`] trait; [`TurnQueue`] is the
//! single-threaded default that the [`Runtime`](crate::Runtime) uses unless a host
//! event loop is plugged in.
use std::{
    cell::{Cell, RefCell},
    cmp::Ordering,
    collections::{BinaryHeap, HashSet, VecDeque},
    time::{Duration, Instant},
};

use tracing::trace;

use crate::ClockMode;

/// A unit of work run in its own turn.
pub type Task = Box<dyn FnOnce()>;

/// Handle for a timer registered with [`Scheduler::schedule_after`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

pub trait Scheduler {
    /// Queues `task` for a later turn. Tasks scheduled from the same turn run in
    /// the order they were scheduled.
    fn schedule(&self, task: Task);

    /// Queues `task` once `delay` has elapsed.
    fn schedule_after(&self, delay: Duration, task: Task) -> TimerId;

    /// Forgets a timer that has not fired yet. Returns `false` if it already fired
    /// or was canceled before.
    fn cancel_timer(&self, id: TimerId) -> bool;

    /// Runs the next turn, returning `false` when nothing is runnable.
    fn run_turn(&self) -> bool;

    /// Time on the scheduler's clock, measured from its creation.
    fn now(&self) -> Duration;
}

struct Timer {
    deadline: Duration,
    id: u64,
    task: Task,
}

impl PartialEq for Timer {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.id == other.id
    }
}

impl Eq for Timer {}

impl PartialOrd for Timer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timer {
    // Reversed so the max-heap yields the earliest deadline first.
    fn cmp(&self, other: &Self) -> Ordering {
        (other.deadline, other.id).cmp(&(self.deadline, self.id))
    }
}

enum Clock {
    Virtual(Cell<Duration>),
    Real(Instant),
}

impl Clock {
    fn now(&self) -> Duration {
        match self {
            Clock::Virtual(now) => now.get(),
            Clock::Real(start) => start.elapsed(),
        }
    }

    fn advance_to(&self, deadline: Duration) {
        match self {
            Clock::Virtual(now) => {
                if deadline > now.get() {
                    now.set(deadline);
                }
            }
            Clock::Real(start) => {
                let elapsed = start.elapsed();
                if deadline > elapsed {
                    std::thread::sleep(deadline - elapsed);
                }
            }
        }
    }
}

/// FIFO turn queue with timers.
///
/// # Examples
///
/// ```
/// use deferred_promise::{ClockMode, Scheduler, TurnQueue};
/// use std::{cell::RefCell, rc::Rc, time::Duration};
///
/// let queue = TurnQueue::new(ClockMode::Virtual);
/// let log = Rc::new(RefCell::new(Vec::new()));
/// let (a, b) = (log.clone(), log.clone());
/// queue.schedule_after(Duration::from_secs(5), Box::new(move || a.borrow_mut().push("timer")));
/// queue.schedule(Box::new(move || b.borrow_mut().push("task")));
/// while queue.run_turn() {}
/// assert_eq!(*log.borrow(), ["task", "timer"]);
/// assert_eq!(queue.now(), Duration::from_secs(5));
/// ```
pub struct TurnQueue {
    tasks: RefCell<VecDeque<Task>>,
    timers: RefCell<BinaryHeap<Timer>>,
    canceled: RefCell<HashSet<u64>>,
    next_timer: Cell<u64>,
    clock: Clock,
}

impl TurnQueue {
    pub fn new(mode: ClockMode) -> Self {
        let clock = match mode {
            ClockMode::Virtual => Clock::Virtual(Cell::new(Duration::ZERO)),
            ClockMode::Real => Clock::Real(Instant::now()),
        };
        Self {
            tasks: RefCell::new(VecDeque::new()),
            timers: RefCell::new(BinaryHeap::new()),
            canceled: RefCell::new(HashSet::new()),
            next_timer: Cell::new(0),
            clock,
        }
    }

    /// Number of tasks ready to run, not counting timers.
    pub fn len(&self) -> usize {
        self.tasks.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.borrow().is_empty()
    }

    /// Number of timers that are still armed.
    pub fn timers(&self) -> usize {
        self.timers.borrow().len() - self.canceled.borrow().len()
    }

    // Moves every timer due at the earliest live deadline into the task queue.
    fn fire_timers(&self) -> bool {
        let deadline = loop {
            let mut timers = self.timers.borrow_mut();
            let Some(next) = timers.peek() else {
                return false;
            };
            if self.canceled.borrow_mut().remove(&next.id) {
                timers.pop();
                continue;
            }
            break next.deadline.max(self.clock.now());
        };
        self.clock.advance_to(deadline);
        let now = self.clock.now();
        let mut timers = self.timers.borrow_mut();
        let mut tasks = self.tasks.borrow_mut();
        while timers.peek().is_some_and(|timer| timer.deadline <= now) {
            if let Some(timer) = timers.pop() {
                if self.canceled.borrow_mut().remove(&timer.id) {
                    continue;
                }
                trace!(timer = timer.id, deadline = ?timer.deadline, "timer fired");
                tasks.push_back(timer.task);
            }
        }
        true
    }
}

impl Default for TurnQueue {
    fn default() -> Self {
        Self::new(ClockMode::default())
    }
}

impl Scheduler for TurnQueue {
    fn schedule(&self, task: Task) {
        self.tasks.borrow_mut().push_back(task);
    }

    fn schedule_after(&self, delay: Duration, task: Task) -> TimerId {
        let id = self.next_timer.get();
        self.next_timer.set(id + 1);
        let deadline = self.clock.now() + delay;
        self.timers.borrow_mut().push(Timer { deadline, id, task });
        TimerId(id)
    }

    fn cancel_timer(&self, id: TimerId) -> bool {
        let armed = self.timers.borrow().iter().any(|timer| timer.id == id.0);
        armed && self.canceled.borrow_mut().insert(id.0)
    }

    fn run_turn(&self) -> bool {
        let mut next = self.tasks.borrow_mut().pop_front();
        if next.is_none() && self.fire_timers() {
            next = self.tasks.borrow_mut().pop_front();
        }
        match next {
            Some(task) => {
                task();
                true
            }
            None => false,
        }
    }

    fn now(&self) -> Duration {
        self.clock.now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    fn recorder() -> (Rc<RefCell<Vec<u32>>>, impl Fn(u32) -> Task) {
        let log = Rc::new(RefCell::new(Vec::new()));
        let sink = log.clone();
        (log, move |n| {
            let sink = sink.clone();
            Box::new(move || sink.borrow_mut().push(n)) as Task
        })
    }

    #[test]
    fn test_fifo_order() {
        let queue = TurnQueue::default();
        let (log, task) = recorder();
        for n in 0..5 {
            queue.schedule(task(n));
        }
        assert_eq!(queue.len(), 5);
        assert!(log.borrow().is_empty());
        while queue.run_turn() {}
        assert_eq!(*log.borrow(), [0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_one_task_per_turn() {
        let queue = Rc::new(TurnQueue::default());
        let (log, task) = recorder();
        let inner = queue.clone();
        let nested = task(2);
        queue.schedule(Box::new(move || inner.schedule(nested)));
        queue.schedule(task(1));
        assert!(queue.run_turn());
        assert!(log.borrow().is_empty());
        assert!(queue.run_turn());
        assert_eq!(*log.borrow(), [1]);
        assert!(queue.run_turn());
        assert_eq!(*log.borrow(), [1, 2]);
        assert!(!queue.run_turn());
    }

    #[test]
    fn test_timers_fire_in_deadline_order() {
        let queue = TurnQueue::default();
        let (log, task) = recorder();
        queue.schedule_after(Duration::from_millis(30), task(30));
        queue.schedule_after(Duration::from_millis(10), task(10));
        queue.schedule_after(Duration::from_millis(10), task(11));
        queue.schedule_after(Duration::from_millis(20), task(20));
        assert_eq!(queue.timers(), 4);
        while queue.run_turn() {}
        assert_eq!(*log.borrow(), [10, 11, 20, 30]);
        assert_eq!(queue.now(), Duration::from_millis(30));
        assert_eq!(queue.timers(), 0);
    }

    #[test]
    fn test_cancel_timer() {
        let queue = TurnQueue::default();
        let (log, task) = recorder();
        let first = queue.schedule_after(Duration::from_millis(5), task(5));
        queue.schedule_after(Duration::from_millis(8), task(8));
        assert!(queue.cancel_timer(first));
        assert!(!queue.cancel_timer(first));
        assert_eq!(queue.timers(), 1);
        while queue.run_turn() {}
        assert_eq!(*log.borrow(), [8]);
        assert!(!queue.cancel_timer(first));
    }

    #[test]
    fn test_real_clock_sleeps() {
        let queue = TurnQueue::new(ClockMode::Real);
        let (log, task) = recorder();
        queue.schedule_after(Duration::from_millis(5), task(1));
        while queue.run_turn() {}
        assert_eq!(*log.borrow(), [1]);
        assert!(queue.now() >= Duration::from_millis(5));
    }
}
