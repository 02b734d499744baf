//! # Scheduler
//!
//! Fixed-priority preemptive scheduling with round-robin time slicing among
//! tasks of equal priority. The scheduler owns every task control block and
//! decides which saved context the trap epilogue resumes.
//!
//! ## Scheduling Algorithm
//!
//! At each tick:
//! 1. **Advance time**: increment the tick counter
//! 2. **Expire delays**: delayed tasks whose count reaches 0 become Ready
//! 3. **Decrement time slice**: if expired and another Ready task of the
//!    same priority exists, request a switch
//! 4. **Preemption**: if a task woken in step 2 outranks the running task,
//!    request a switch
//!
//! On a switch, [`Scheduler::switch_context`] saves the outgoing stack
//! pointer, checks it against the task's stack bounds and selects the
//! highest-priority runnable task. Among equals, selection rotates starting
//! after the current task, so equal-priority tasks share the CPU.
//!
//! ## Blocking
//!
//! Blocking primitives keep a [`WaitList`] of task ids. A task that must
//! wait is marked Blocked and added to the list; a give removes the
//! highest-priority waiter and makes it Ready.

use crate::config::MAX_TASKS;
use crate::task::{ContextFrame, TaskConfig, TaskControlBlock, TaskEntry, TaskId, TaskState};

/// Highest priority a task may have.
pub const MAX_PRIORITY: u8 = 31;

/// Failure to register a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CreateError {
    #[error("task table is full ({max} tasks)", max = MAX_TASKS)]
    TaskTableFull,
    #[error("priority {0} is above the maximum of {max}", max = MAX_PRIORITY)]
    PriorityTooHigh(u8),
}

/// A saved stack pointer that lies outside its task's stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackOverflow {
    pub task: TaskId,
    pub stack_pointer: usize,
}

// ---------------------------------------------------------------------------
// Wait lists
// ---------------------------------------------------------------------------

/// Set of tasks blocked on one primitive, one bit per task id.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WaitList(u32);

impl WaitList {
    pub const fn new() -> Self {
        Self(0)
    }

    #[inline]
    pub fn insert(&mut self, id: TaskId) {
        self.0 |= 1 << id;
    }

    #[inline]
    pub fn remove(&mut self, id: TaskId) {
        self.0 &= !(1 << id);
    }

    #[inline]
    pub fn contains(&self, id: TaskId) -> bool {
        self.0 & (1 << id) != 0
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = TaskId> + '_ {
        (0..MAX_TASKS).filter(move |&id| self.contains(id))
    }
}

// ---------------------------------------------------------------------------
// Scheduler struct
// ---------------------------------------------------------------------------

/// The central scheduler state. Stored in a global cell in `kernel.rs`.
///
/// ## Design Notes
///
/// - All tasks are stored inline in a fixed-size array (no heap)
/// - `current` is `None` until the first task is selected
/// - The idle task created by `kernel::start()` keeps at least one task
///   runnable at all times
pub struct Scheduler {
    /// Fixed-size array of TCBs, filled in creation order.
    tasks: [TaskControlBlock; MAX_TASKS],

    /// Index of the currently running task.
    current: Option<TaskId>,

    /// Number of allocated tasks.
    task_count: usize,

    /// Monotonic tick counter.
    tick_count: u64,
}

const EMPTY_TCB: TaskControlBlock = TaskControlBlock::empty();

impl Scheduler {
    pub const fn new() -> Self {
        Self {
            tasks: [EMPTY_TCB; MAX_TASKS],
            current: None,
            task_count: 0,
            tick_count: 0,
        }
    }

    /// Register a new Ready task that starts at `entry(argument)`.
    pub fn create_task(
        &mut self,
        entry: TaskEntry,
        config: TaskConfig,
        argument: usize,
    ) -> Result<TaskId, CreateError> {
        if config.priority > MAX_PRIORITY {
            return Err(CreateError::PriorityTooHigh(config.priority));
        }
        if self.task_count >= MAX_TASKS {
            return Err(CreateError::TaskTableFull);
        }

        let id = self.task_count;
        self.tasks[id].init(id, config, entry, argument);
        self.task_count += 1;
        Ok(id)
    }

    #[inline]
    pub fn current(&self) -> Option<TaskId> {
        self.current
    }

    #[inline]
    pub fn task_count(&self) -> usize {
        self.task_count
    }

    #[inline]
    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    pub fn task(&self, id: TaskId) -> &TaskControlBlock {
        &self.tasks[id]
    }

    fn current_priority(&self) -> Option<u8> {
        self.current.map(|id| self.tasks[id].priority())
    }

    /// Whether `id` would preempt the running task.
    fn outranks_current(&self, id: TaskId) -> bool {
        match self.current_priority() {
            Some(priority) => self.tasks[id].priority() > priority,
            None => true,
        }
    }

    /// Advance the time base by one tick. Returns whether a context switch
    /// is required.
    pub fn increment_tick(&mut self) -> bool {
        self.tick_count += 1;
        let mut switch_required = false;

        // --- Expire delays ---
        for id in 0..self.task_count {
            let task = &mut self.tasks[id];
            if task.state != TaskState::Blocked || task.delay_ticks == 0 {
                continue;
            }
            task.delay_ticks -= 1;
            if task.delay_ticks == 0 {
                task.state = TaskState::Ready;
                if self.outranks_current(id) {
                    switch_required = true;
                }
            }
        }

        // --- Time slice of the running task ---
        if let Some(current) = self.current {
            let task = &mut self.tasks[current];
            task.ticks_remaining = task.ticks_remaining.saturating_sub(1);
            if task.ticks_remaining == 0 {
                task.reset_time_slice();
                let priority = task.priority();
                let peer_ready = (0..self.task_count).any(|id| {
                    id != current
                        && self.tasks[id].state == TaskState::Ready
                        && self.tasks[id].priority() == priority
                });
                switch_required |= peer_ready;
            }
        }

        switch_required
    }

    /// Pick the task to run next and mark it Running.
    ///
    /// The highest-priority runnable task wins; ties go to the first one
    /// found scanning from the task after the current one, so the current
    /// task comes last among its equals.
    pub fn select_next(&mut self) -> TaskId {
        let count = self.task_count;
        let start = self.current.map_or(0, |id| id + 1);
        let mut best: Option<TaskId> = None;

        for offset in 0..count {
            let id = (start + offset) % count;
            if !self.tasks[id].is_runnable() {
                continue;
            }
            match best {
                Some(b) if self.tasks[b].priority() >= self.tasks[id].priority() => {}
                _ => best = Some(id),
            }
        }

        // Only reachable with no runnable task at all; the idle task
        // prevents that once started.
        let next = best.unwrap_or(0);

        if let Some(previous) = self.current {
            if self.tasks[previous].state == TaskState::Running {
                self.tasks[previous].state = TaskState::Ready;
            }
        }
        self.tasks[next].state = TaskState::Running;
        self.current = Some(next);
        next
    }

    /// Save the outgoing task's stack pointer and return the one of the task
    /// to resume.
    ///
    /// Fails if the saved frame does not lie within the outgoing task's
    /// stack; the caller treats that as fatal.
    pub fn switch_context(
        &mut self,
        stack_pointer: *mut ContextFrame,
    ) -> Result<*mut ContextFrame, StackOverflow> {
        if let Some(current) = self.current {
            let task = &mut self.tasks[current];
            if !task.stack.holds_frame(stack_pointer) {
                return Err(StackOverflow {
                    task: current,
                    stack_pointer: stack_pointer as usize,
                });
            }
            task.stack_pointer = stack_pointer;
        }

        let next = self.select_next();
        Ok(self.tasks[next].stack_pointer)
    }

    /// Record a voluntary yield from the current task.
    ///
    /// Resets its time slice; the switch itself is requested by the caller.
    pub fn yield_current(&mut self) {
        if let Some(current) = self.current {
            self.tasks[current].reset_time_slice();
        }
    }

    /// Block the current task on `waiters`.
    pub fn block_current(&mut self, waiters: &mut WaitList) {
        if let Some(current) = self.current {
            self.tasks[current].state = TaskState::Blocked;
            waiters.insert(current);
        }
    }

    /// Block the current task for `ticks` ticks. A delay of 0 does nothing.
    pub fn delay_current(&mut self, ticks: u32) {
        if ticks == 0 {
            return;
        }
        if let Some(current) = self.current {
            let task = &mut self.tasks[current];
            task.state = TaskState::Blocked;
            task.delay_ticks = ticks;
        }
    }

    /// Make the highest-priority task in `waiters` Ready and remove it from
    /// the list. Returns whether it outranks the running task.
    pub fn wake_one(&mut self, waiters: &mut WaitList) -> bool {
        let woken = waiters
            .iter()
            .max_by_key(|&id| (self.tasks[id].priority(), core::cmp::Reverse(id)));
        let Some(id) = woken else {
            return false;
        };

        waiters.remove(id);
        let task = &mut self.tasks[id];
        task.state = TaskState::Ready;
        task.delay_ticks = 0;
        self.outranks_current(id)
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_TIME_SLICE;
    use std::boxed::Box;

    extern "C" fn body(_argument: usize) {}

    fn scheduler_with(priorities: &[u8]) -> Box<Scheduler> {
        let mut scheduler = Box::new(Scheduler::new());
        for &priority in priorities {
            scheduler
                .create_task(body, TaskConfig::with_priority(priority), 0)
                .unwrap();
        }
        scheduler
    }

    #[test]
    fn task_creation() {
        let mut scheduler = scheduler_with(&[]);
        assert_eq!(
            scheduler.create_task(body, TaskConfig::with_priority(40), 0),
            Err(CreateError::PriorityTooHigh(40))
        );
        for expected in 0..MAX_TASKS {
            assert_eq!(
                scheduler.create_task(body, TaskConfig::with_priority(1), 0),
                Ok(expected)
            );
        }
        assert_eq!(
            scheduler.create_task(body, TaskConfig::with_priority(1), 0),
            Err(CreateError::TaskTableFull)
        );
    }

    #[test]
    fn creation_errors_name_the_limit() {
        assert_eq!(
            CreateError::TaskTableFull.to_string(),
            format!("task table is full ({} tasks)", MAX_TASKS)
        );
        assert_eq!(
            CreateError::PriorityTooHigh(40).to_string(),
            format!("priority 40 is above the maximum of {}", MAX_PRIORITY)
        );
    }

    #[test]
    fn highest_priority_runs_first() {
        let mut scheduler = scheduler_with(&[0, 3, 1]);
        assert_eq!(scheduler.select_next(), 1);
        assert_eq!(scheduler.task(1).state, TaskState::Running);
        assert_eq!(scheduler.current(), Some(1));
    }

    #[test]
    fn equal_priorities_rotate_on_switch() {
        let mut scheduler = scheduler_with(&[0, 2, 2, 2]);
        let first = scheduler.select_next();
        let second = scheduler.select_next();
        let third = scheduler.select_next();
        let fourth = scheduler.select_next();
        assert_eq!([first, second, third, fourth], [1, 2, 3, 1]);
        assert_eq!(scheduler.task(3).state, TaskState::Ready);
    }

    #[test]
    fn time_slice_expiry_requests_switch_only_with_a_peer() {
        let mut alone = scheduler_with(&[0, 2]);
        alone.select_next();
        for _ in 0..DEFAULT_TIME_SLICE * 2 {
            assert!(!alone.increment_tick());
        }

        let mut shared = scheduler_with(&[0, 2, 2]);
        shared.select_next();
        for _ in 1..DEFAULT_TIME_SLICE {
            assert!(!shared.increment_tick());
        }
        assert!(shared.increment_tick());
        assert_eq!(shared.tick_count(), u64::from(DEFAULT_TIME_SLICE));
    }

    #[test]
    fn expired_delay_preempts_lower_priority_task() {
        let mut scheduler = scheduler_with(&[0, 1, 5]);
        assert_eq!(scheduler.select_next(), 2);
        scheduler.delay_current(3);
        assert_eq!(scheduler.select_next(), 1);

        assert!(!scheduler.increment_tick());
        assert!(!scheduler.increment_tick());
        assert_eq!(scheduler.task(2).state, TaskState::Blocked);
        assert!(scheduler.increment_tick());
        assert_eq!(scheduler.task(2).state, TaskState::Ready);
        assert_eq!(scheduler.select_next(), 2);
    }

    #[test]
    fn wake_one_prefers_highest_priority_waiter() {
        let mut scheduler = scheduler_with(&[0, 2, 4, 1]);
        let mut waiters = WaitList::new();

        for expected in [2, 1, 3] {
            assert_eq!(scheduler.select_next(), expected);
            scheduler.block_current(&mut waiters);
        }
        assert_eq!(scheduler.select_next(), 0);
        assert!(waiters.contains(1) && waiters.contains(2) && waiters.contains(3));

        assert!(scheduler.wake_one(&mut waiters));
        assert!(!waiters.contains(2));
        assert_eq!(scheduler.task(2).state, TaskState::Ready);
        assert_eq!(scheduler.select_next(), 2);

        // Priority 2 does not outrank the running priority-4 task.
        assert!(!scheduler.wake_one(&mut waiters));
        assert!(!scheduler.wake_one(&mut WaitList::new()));
    }

    #[test]
    fn switch_context_saves_and_checks_the_outgoing_frame() {
        let mut scheduler = scheduler_with(&[0, 1, 1]);
        scheduler.select_next();
        let saved = scheduler.task(1).stack_pointer;
        let expected_next = scheduler.task(2).stack_pointer;

        assert_eq!(scheduler.switch_context(saved), Ok(expected_next));
        assert_eq!(scheduler.current(), Some(2));

        let stray = scheduler.task(1).stack_pointer;
        assert_eq!(
            scheduler.switch_context(stray),
            Err(StackOverflow {
                task: 2,
                stack_pointer: stray as usize
            })
        );
    }
}
