//! Delayed-task scheduler with an explicit clock.
//!
//! Tasks are plain values (usually a small enum) queued against a deadline on
//! the scheduler's own clock. Nothing here sleeps: the owner advances the
//! clock and drains due tasks in deadline order, so tests drive time
//! synchronously while a daemon feeds in wall-clock elapsed time.
//!
//! Tasks scheduled for the same deadline fire in the order they were queued.

use std::collections::BTreeMap;
use std::time::Duration;

pub type TaskId = u64;

#[derive(Debug)]
pub struct Scheduler<T> {
    now: Duration,
    next_id: TaskId,
    queue: BTreeMap<(Duration, TaskId), T>,
}

impl<T> Default for Scheduler<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Scheduler<T> {
    pub fn new() -> Self {
        Self {
            now: Duration::ZERO,
            next_id: 0,
            queue: BTreeMap::new(),
        }
    }

    /// Current time on the scheduler clock.
    pub fn now(&self) -> Duration {
        self.now
    }

    /// Moves the clock forward. The clock never runs backwards.
    pub fn set_now(&mut self, now: Duration) {
        if now > self.now {
            self.now = now;
        }
    }

    pub fn schedule(&mut self, delay: Duration, task: T) -> TaskId {
        let id = self.next_id;
        self.next_id += 1;
        self.queue.insert((self.now + delay, id), task);
        id
    }

    /// Returns `true` if the task was still pending.
    pub fn cancel(&mut self, id: TaskId) -> bool {
        let key = self.queue.keys().find(|(_, task_id)| *task_id == id).copied();
        match key {
            Some(key) => self.queue.remove(&key).is_some(),
            None => false,
        }
    }

    /// Pops the earliest task due at or before `until`, moving the clock to
    /// its deadline.
    pub fn pop_due(&mut self, until: Duration) -> Option<T> {
        let (&(due, _), _) = self.queue.first_key_value()?;
        if due > until {
            return None;
        }
        let ((due, _), task) = self.queue.pop_first()?;
        self.set_now(due);
        Some(task)
    }

    /// Deadline of the earliest pending task.
    pub fn next_due(&self) -> Option<Duration> {
        self.queue.keys().next().map(|(due, _)| *due)
    }

    /// Time left until the earliest pending task, zero if already due.
    pub fn time_until_next(&self) -> Option<Duration> {
        self.next_due().map(|due| due.saturating_sub(self.now))
    }

    /// Drops every pending task. The clock is left where it is.
    pub fn clear(&mut self) {
        self.queue.clear();
    }

    pub fn pending(&self) -> impl Iterator<Item = &T> {
        self.queue.values()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
