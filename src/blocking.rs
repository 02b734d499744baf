//! # Blocking Primitives
//!
//! The crate scheduler's implementations of the [`rtos`](crate::rtos) call
//! contract:
//!
//! - [`BinarySemaphore`]: signal, or mutex when created given
//! - [`ReentrantMutex`]: recursive mutex owned by a task (or by the boot
//!   code before the scheduler starts)
//! - [`BoundedQueue`]: fixed-capacity FIFO fed from interrupt handlers
//!
//! State is only touched with interrupts masked: inside a critical section
//! from tasks, and from handlers, which run masked. A task that has to wait
//! blocks itself on the primitive's wait list and pends a context switch,
//! which fires as soon as the critical section ends; once woken it retries.
//! Before the scheduler starts there is no task to block, so an operation
//! that would have to wait fails instead.

use core::cell::UnsafeCell;

use heapless::Deque;

use crate::arch::{Machine, Platform};
use crate::kernel;
use crate::rtos::{Queue, RecursiveMutex, Semaphore, Wait};
use crate::scheduler::{Scheduler, WaitList};
use crate::task::TaskId;

/// Where a primitive finds the scheduler and the machine it pends
/// context switches on.
trait SchedulerContext {
    type Machine: Machine;

    fn machine(&self) -> &Self::Machine;

    /// Run `f` on the scheduler with interrupts masked. Task context only.
    fn with_scheduler<R>(&self, f: impl FnOnce(&mut Scheduler) -> R) -> R;

    /// # Safety
    /// Must be called from trap context, where interrupts are masked.
    unsafe fn with_scheduler_from_isr<R>(&self, f: impl FnOnce(&mut Scheduler) -> R) -> R;
}

/// The kernel's own scheduler and port.
struct SystemContext;

impl SchedulerContext for SystemContext {
    type Machine = Platform;

    fn machine(&self) -> &Platform {
        kernel::port().machine()
    }

    fn with_scheduler<R>(&self, f: impl FnOnce(&mut Scheduler) -> R) -> R {
        kernel::with_scheduler(f)
    }

    unsafe fn with_scheduler_from_isr<R>(&self, f: impl FnOnce(&mut Scheduler) -> R) -> R {
        kernel::with_scheduler_from_isr(f)
    }
}

/// Outcome of one attempt at a blocking operation.
enum Attempt<T> {
    Done(T),
    Blocked,
}

/// Retry `attempt` until it stops blocking. A blocked attempt pends a
/// context switch, which fires once the critical section ends.
fn block_on<C: SchedulerContext, T>(
    cx: &C,
    mut attempt: impl FnMut(&mut Scheduler) -> Attempt<T>,
) -> T {
    loop {
        let outcome = cx.with_scheduler(|scheduler| match attempt(scheduler) {
            Attempt::Blocked => {
                cx.machine().request_switch();
                Attempt::Blocked
            }
            done => done,
        });
        if let Attempt::Done(value) = outcome {
            return value;
        }
    }
}

/// Whether the caller may block: it must be a task and allow waiting.
fn may_block(scheduler: &Scheduler, wait: Wait) -> bool {
    wait == Wait::Forever && scheduler.current().is_some()
}

// ---------------------------------------------------------------------------
// Binary semaphore
// ---------------------------------------------------------------------------

struct SemaphoreState {
    given: bool,
    waiters: WaitList,
}

impl SemaphoreState {
    /// Give and wake one waiter. `None` if already given, otherwise whether
    /// the woken task outranks the running one.
    fn give(&mut self, scheduler: &mut Scheduler) -> Option<bool> {
        if self.given {
            return None;
        }
        self.given = true;
        Some(scheduler.wake_one(&mut self.waiters))
    }
}

pub struct BinarySemaphore {
    state: UnsafeCell<SemaphoreState>,
}

// Safety: the state is only accessed with interrupts masked.
unsafe impl Sync for BinarySemaphore {}

impl BinarySemaphore {
    /// An empty semaphore: the first `take` waits for a `give`.
    pub const fn new() -> Self {
        Self::with_state(false)
    }

    /// A semaphore that can be taken once right away, for use as a mutex.
    pub const fn new_given() -> Self {
        Self::with_state(true)
    }

    const fn with_state(given: bool) -> Self {
        Self {
            state: UnsafeCell::new(SemaphoreState {
                given,
                waiters: WaitList::new(),
            }),
        }
    }

    fn attempt_take(&self, scheduler: &mut Scheduler, wait: Wait) -> Attempt<bool> {
        let state = unsafe { &mut *self.state.get() };
        if state.given {
            state.given = false;
            Attempt::Done(true)
        } else if may_block(scheduler, wait) {
            scheduler.block_current(&mut state.waiters);
            Attempt::Blocked
        } else {
            Attempt::Done(false)
        }
    }

    fn take_in<C: SchedulerContext>(&self, cx: &C, wait: Wait) -> bool {
        block_on(cx, |scheduler| self.attempt_take(scheduler, wait))
    }

    fn give_in<C: SchedulerContext>(&self, cx: &C) -> bool {
        cx.with_scheduler(|scheduler| {
            let state = unsafe { &mut *self.state.get() };
            match state.give(scheduler) {
                Some(preempt) => {
                    if preempt {
                        cx.machine().request_switch();
                    }
                    true
                }
                None => false,
            }
        })
    }

    /// # Safety
    /// Trap context only.
    unsafe fn give_from_isr_in<C: SchedulerContext>(&self, cx: &C) -> bool {
        cx.with_scheduler_from_isr(|scheduler| {
            let state = &mut *self.state.get();
            state.give(scheduler).unwrap_or(false)
        })
    }
}

impl Default for BinarySemaphore {
    fn default() -> Self {
        Self::new()
    }
}

impl Semaphore for BinarySemaphore {
    fn take(&self, wait: Wait) -> bool {
        self.take_in(&SystemContext, wait)
    }

    fn give(&self) -> bool {
        self.give_in(&SystemContext)
    }

    fn give_from_isr(&self) -> bool {
        unsafe { self.give_from_isr_in(&SystemContext) }
    }
}

// ---------------------------------------------------------------------------
// Recursive mutex
// ---------------------------------------------------------------------------

/// Owner id of code running before the first task is dispatched.
const BOOT_OWNER: TaskId = TaskId::MAX;

struct MutexState {
    owner: Option<TaskId>,
    depth: usize,
    waiters: WaitList,
}

pub struct ReentrantMutex {
    state: UnsafeCell<MutexState>,
}

// Safety: the state is only accessed with interrupts masked.
unsafe impl Sync for ReentrantMutex {}

impl ReentrantMutex {
    pub const fn new() -> Self {
        Self {
            state: UnsafeCell::new(MutexState {
                owner: None,
                depth: 0,
                waiters: WaitList::new(),
            }),
        }
    }

    fn attempt_take(&self, scheduler: &mut Scheduler, wait: Wait) -> Attempt<bool> {
        let state = unsafe { &mut *self.state.get() };
        let caller = scheduler.current().unwrap_or(BOOT_OWNER);
        match state.owner {
            None => {
                state.owner = Some(caller);
                state.depth = 1;
                Attempt::Done(true)
            }
            Some(owner) if owner == caller => {
                state.depth += 1;
                Attempt::Done(true)
            }
            Some(_) if may_block(scheduler, wait) => {
                scheduler.block_current(&mut state.waiters);
                Attempt::Blocked
            }
            Some(_) => Attempt::Done(false),
        }
    }

    fn take_recursive_in<C: SchedulerContext>(&self, cx: &C, wait: Wait) -> bool {
        block_on(cx, |scheduler| self.attempt_take(scheduler, wait))
    }

    fn give_recursive_in<C: SchedulerContext>(&self, cx: &C) -> bool {
        cx.with_scheduler(|scheduler| {
            let state = unsafe { &mut *self.state.get() };
            let caller = scheduler.current().unwrap_or(BOOT_OWNER);
            if state.owner != Some(caller) {
                return false;
            }
            state.depth -= 1;
            if state.depth == 0 {
                state.owner = None;
                if scheduler.wake_one(&mut state.waiters) {
                    cx.machine().request_switch();
                }
            }
            true
        })
    }
}

impl Default for ReentrantMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl RecursiveMutex for ReentrantMutex {
    fn take_recursive(&self, wait: Wait) -> bool {
        self.take_recursive_in(&SystemContext, wait)
    }

    fn give_recursive(&self) -> bool {
        self.give_recursive_in(&SystemContext)
    }
}

// ---------------------------------------------------------------------------
// Bounded queue
// ---------------------------------------------------------------------------

struct QueueState<T, const N: usize> {
    items: Deque<T, N>,
    waiters: WaitList,
}

pub struct BoundedQueue<T, const N: usize> {
    state: UnsafeCell<QueueState<T, N>>,
}

// Safety: the state is only accessed with interrupts masked; items move
// between contexts, hence `T: Send`.
unsafe impl<T: Send, const N: usize> Sync for BoundedQueue<T, N> {}

impl<T, const N: usize> BoundedQueue<T, N> {
    pub const fn new() -> Self {
        Self {
            state: UnsafeCell::new(QueueState {
                items: Deque::new(),
                waiters: WaitList::new(),
            }),
        }
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    fn receive_in<C: SchedulerContext>(&self, cx: &C, wait: Wait) -> Option<T> {
        block_on(cx, |scheduler| {
            let state = unsafe { &mut *self.state.get() };
            match state.items.pop_front() {
                Some(item) => Attempt::Done(Some(item)),
                None if may_block(scheduler, wait) => {
                    scheduler.block_current(&mut state.waiters);
                    Attempt::Blocked
                }
                None => Attempt::Done(None),
            }
        })
    }

    /// # Safety
    /// Trap context only.
    unsafe fn send_from_isr_in<C: SchedulerContext>(&self, cx: &C, item: T) -> Result<bool, T> {
        cx.with_scheduler_from_isr(|scheduler| {
            let state = &mut *self.state.get();
            state.items.push_back(item)?;
            Ok(scheduler.wake_one(&mut state.waiters))
        })
    }
}

impl<T, const N: usize> Default for BoundedQueue<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send, const N: usize> Queue<T> for BoundedQueue<T, N> {
    fn receive(&self, wait: Wait) -> Option<T> {
        self.receive_in(&SystemContext, wait)
    }

    fn send_from_isr(&self, item: T) -> Result<bool, T> {
        unsafe { self.send_from_isr_in(&SystemContext, item) }
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::host::HostMachine;
    use crate::arch::Port;
    use crate::config::IDLE_PRIORITY;
    use crate::task::{TaskConfig, TaskState};
    use std::boxed::Box;
    use std::cell::RefCell;
    use std::collections::VecDeque;

    extern "C" fn body(_argument: usize) {}

    type Event<'a> = Box<dyn FnOnce(&Sim<'a>) + 'a>;

    /// A single-core system without a real context switch.
    ///
    /// The test body is the task that calls into a primitive. When that
    /// task gets switched away, queued events run in order as whatever
    /// the scheduler picks next (another task, or an interrupt arriving
    /// while it runs) until the calling task is selected again.
    struct Sim<'a> {
        port: Port<HostMachine>,
        scheduler: RefCell<Box<Scheduler>>,
        events: RefCell<VecDeque<Event<'a>>>,
    }

    impl<'a> Sim<'a> {
        /// A system running only its idle task.
        fn new() -> Self {
            let sim = Self {
                port: Port::new(HostMachine::new()),
                scheduler: RefCell::new(Box::new(Scheduler::new())),
                events: RefCell::new(VecDeque::new()),
            };
            sim.spawn(IDLE_PRIORITY);
            sim
        }

        /// Create a task and let the scheduler pick who runs.
        fn spawn(&self, priority: u8) -> TaskId {
            let mut scheduler = self.scheduler.borrow_mut();
            let id = scheduler
                .create_task(body, TaskConfig::with_priority(priority), 0)
                .unwrap();
            scheduler.select_next();
            id
        }

        fn then(&self, event: impl FnOnce(&Sim<'a>) + 'a) {
            self.events.borrow_mut().push_back(Box::new(event));
        }

        fn current(&self) -> Option<TaskId> {
            self.scheduler.borrow().current()
        }

        fn state(&self, id: TaskId) -> TaskState {
            self.scheduler.borrow().task(id).state
        }

        fn switch_away(&self) {
            let caller = self.current();
            self.scheduler.borrow_mut().select_next();
            while self.current() != caller {
                let event = self
                    .events
                    .borrow_mut()
                    .pop_front()
                    .unwrap_or_else(|| panic!("task {:?} is never resumed", caller));
                event(self);
                self.port.machine().take_switch_request();
                self.scheduler.borrow_mut().select_next();
            }
        }
    }

    impl SchedulerContext for Sim<'_> {
        type Machine = HostMachine;

        fn machine(&self) -> &HostMachine {
            self.port.machine()
        }

        fn with_scheduler<R>(&self, f: impl FnOnce(&mut Scheduler) -> R) -> R {
            if self.port.machine().take_switch_request() {
                self.switch_away();
            }
            let mut scheduler = self.scheduler.borrow_mut();
            f(&mut **scheduler)
        }

        unsafe fn with_scheduler_from_isr<R>(&self, f: impl FnOnce(&mut Scheduler) -> R) -> R {
            let mut scheduler = self.scheduler.borrow_mut();
            f(&mut **scheduler)
        }
    }

    #[test]
    fn semaphore_take_fails_instead_of_blocking_before_start() {
        let signal = BinarySemaphore::new();
        assert!(!signal.take(Wait::Forever));
        assert!(!signal.take(Wait::Poll));

        assert!(signal.give());
        assert!(!signal.give(), "binary semaphore saturates at one");
        assert!(signal.take(Wait::Forever));
        assert!(!signal.take(Wait::Poll));
    }

    #[test]
    fn given_semaphore_acts_as_mutex() {
        let mutex = BinarySemaphore::new_given();
        assert!(mutex.take(Wait::Forever));
        assert!(!mutex.take(Wait::Poll));
        assert!(mutex.give());
        assert!(mutex.take(Wait::Poll));
    }

    #[test]
    fn give_from_isr_without_waiters_wakes_nobody() {
        let signal = BinarySemaphore::new();
        assert!(!signal.give_from_isr());
        assert!(signal.take(Wait::Poll));
    }

    #[test]
    fn recursive_mutex_counts_nested_takes() {
        let mutex = ReentrantMutex::new();
        assert!(mutex.take_recursive(Wait::Forever));
        assert!(mutex.take_recursive(Wait::Forever));
        assert!(mutex.give_recursive());
        assert!(mutex.give_recursive());
        assert!(!mutex.give_recursive(), "released more often than taken");
    }

    #[test]
    fn queue_is_fifo_and_rejects_items_when_full() {
        let queue: BoundedQueue<u8, 4> = BoundedQueue::new();
        for byte in 1..=4 {
            assert_eq!(queue.send_from_isr(byte), Ok(false));
        }
        assert_eq!(queue.send_from_isr(5), Err(5));

        for expected in 1..=4 {
            assert_eq!(queue.receive(Wait::Poll), Some(expected));
        }
        assert_eq!(queue.receive(Wait::Forever), None);
        assert_eq!(queue.capacity(), 4);
    }

    #[test]
    fn contended_mutex_hands_over_when_the_owner_releases() {
        let mutex = &ReentrantMutex::new();
        let sim = Sim::new();

        let low = sim.spawn(1);
        assert!(mutex.take_recursive_in(&sim, Wait::Forever));
        let high = sim.spawn(2);
        assert_eq!(sim.current(), Some(high));

        sim.then(move |sim| {
            assert_eq!(sim.current(), Some(low), "owner runs while high waits");
            assert_eq!(sim.state(high), TaskState::Blocked);
            assert!(mutex.give_recursive_in(sim));
            assert!(sim.machine().switch_requested(), "woken waiter outranks owner");
        });
        assert!(mutex.take_recursive_in(&sim, Wait::Forever));

        assert_eq!(sim.current(), Some(high));
        let state = unsafe { &*mutex.state.get() };
        assert_eq!(state.owner, Some(high));
        assert_eq!(state.depth, 1);
        assert!(state.waiters.is_empty());
        assert!(sim.events.borrow().is_empty());
    }

    #[test]
    fn give_wakes_the_highest_priority_waiter_only() {
        let signal = BinarySemaphore::new();
        let sim = Sim::new();

        let mut waiters = [0; 3];
        for (slot, priority) in waiters.iter_mut().zip([2, 4, 3]) {
            *slot = sim.spawn(priority);
            let outcome =
                sim.with_scheduler(|scheduler| signal.attempt_take(scheduler, Wait::Forever));
            assert!(matches!(outcome, Attempt::Blocked));
        }
        let [low, highest, middle] = waiters;

        let giver = sim.spawn(1);
        assert_eq!(sim.current(), Some(giver));
        assert!(signal.give_in(&sim));

        assert_eq!(sim.state(highest), TaskState::Ready);
        assert_eq!(sim.state(middle), TaskState::Blocked);
        assert_eq!(sim.state(low), TaskState::Blocked);
        assert!(sim.machine().switch_requested());

        let state = unsafe { &*signal.state.get() };
        assert!(state.given, "the woken task takes it once it runs");
        assert!(!state.waiters.contains(highest));
        assert!(state.waiters.contains(middle) && state.waiters.contains(low));
    }

    #[test]
    fn give_to_a_lower_priority_waiter_does_not_preempt() {
        let signal = BinarySemaphore::new();
        let sim = Sim::new();

        let waiter = sim.spawn(1);
        let outcome =
            sim.with_scheduler(|scheduler| signal.attempt_take(scheduler, Wait::Forever));
        assert!(matches!(outcome, Attempt::Blocked));

        sim.spawn(3);
        assert!(signal.give_in(&sim));
        assert_eq!(sim.state(waiter), TaskState::Ready);
        assert!(!sim.machine().switch_requested());
    }

    #[test]
    fn interrupt_send_wakes_a_blocked_reader() {
        let queue: &BoundedQueue<u8, 4> = &BoundedQueue::new();
        let sim = Sim::new();
        let reader = sim.spawn(2);

        sim.then(move |sim| {
            assert_eq!(sim.current(), Some(0), "idle runs while the reader waits");
            let woken = unsafe { queue.send_from_isr_in(sim, 7) };
            assert_eq!(woken, Ok(true));
            sim.machine().request_switch();
        });
        assert_eq!(queue.receive_in(&sim, Wait::Forever), Some(7));

        assert_eq!(sim.current(), Some(reader));
        assert!(unsafe { &*queue.state.get() }.waiters.is_empty());
        assert!(sim.events.borrow().is_empty());
    }

    #[test]
    fn woken_task_blocks_again_after_losing_the_race() {
        let signal = &BinarySemaphore::new();
        let sim = Sim::new();

        let thief = sim.spawn(3);
        sim.with_scheduler(|scheduler| scheduler.delay_current(1));
        let caller = sim.spawn(2);
        assert_eq!(sim.current(), Some(caller));

        // Tick interrupt: the thief's delay expires and the handler gives.
        sim.then(move |sim| {
            unsafe {
                sim.with_scheduler_from_isr(|scheduler| scheduler.increment_tick());
                assert!(signal.give_from_isr_in(sim));
            }
            assert_eq!(sim.state(caller), TaskState::Ready);
        });
        // The thief outranks the caller and takes the semaphore first.
        sim.then(move |sim| {
            assert_eq!(sim.current(), Some(thief));
            assert!(signal.take_in(sim, Wait::Poll));
            sim.with_scheduler(|scheduler| scheduler.delay_current(100));
        });
        // The caller retried, found nothing and is waiting again.
        sim.then(move |sim| {
            assert_eq!(sim.current(), Some(0));
            assert_eq!(sim.state(caller), TaskState::Blocked);
            assert!(unsafe { &*signal.state.get() }.waiters.contains(caller));
            assert!(unsafe { signal.give_from_isr_in(sim) });
        });

        assert!(signal.take_in(&sim, Wait::Forever));
        assert_eq!(sim.current(), Some(caller));
        assert!(sim.events.borrow().is_empty());
        assert!(!unsafe { &*signal.state.get() }.given);
    }
}
