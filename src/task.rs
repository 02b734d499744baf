//! # Task Context Model
//!
//! A suspended task is nothing but a [`ContextFrame`] on top of its private
//! stack and the stack pointer that addresses it. The trap entry sequence
//! produces frames for running tasks; [`initialize_stack`] synthesizes the
//! very same layout for a task that has never run, so the restore sequence
//! cannot tell the two apart.
//!
//! ## Frame layout (ascending addresses, from the saved stack pointer)
//!
//! ```text
//!  word  contents
//!  ----  ------------------------------------------------------------
//!     0  pc                resume address (entry point for a new task)
//!     1  x1  / ra          task-exit trap for a new task
//!   2-6  x5-x9             t0-t2, s0/fp, s1
//!     7  x10 / a0          task argument for a new task
//!  8-28  x11-x31
//!    29  critical nesting  0 for a new task
//! 30-31  reserved          pads the frame to the 16-byte alignment
//! ```
//!
//! `gp` and `tp` are constant for the whole program and are not saved; `sp`
//! is the frame address itself.

use core::mem::{offset_of, size_of};

use crate::config::{DEFAULT_TIME_SLICE, PORT_BYTE_ALIGNMENT, STACK_SIZE};

/// Entry function of a task. Receives the argument given at creation and
/// must never return.
pub type TaskEntry = extern "C" fn(usize);

// ---------------------------------------------------------------------------
// Saved context frame
// ---------------------------------------------------------------------------

/// Registers of a suspended task plus the scheduler-private nesting depth.
#[repr(C, align(16))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextFrame {
    pub pc: usize,
    pub ra: usize,
    pub x5_x9: [usize; 5],
    pub a0: usize,
    pub x11_x31: [usize; 21],
    pub critical_nesting: usize,
    _reserved: [usize; 2],
}

/// Size of a frame in machine words.
pub const CONTEXT_FRAME_WORDS: usize = size_of::<ContextFrame>() / size_of::<usize>();

const _: () = assert!(size_of::<ContextFrame>() % PORT_BYTE_ALIGNMENT == 0);
const _: () = assert!(CONTEXT_FRAME_WORDS == 32);
const _: () = assert!(offset_of!(ContextFrame, ra) == size_of::<usize>());
const _: () = assert!(offset_of!(ContextFrame, a0) == 7 * size_of::<usize>());
const _: () = assert!(offset_of!(ContextFrame, critical_nesting) == 29 * size_of::<usize>());

impl ContextFrame {
    /// The frame a task starts from: resume at `entry` with `argument` in
    /// the first-argument register, return into [`task_exit_trap`], and
    /// interrupts unmasked from the task's own point of view.
    pub fn for_new_task(entry: TaskEntry, argument: usize) -> Self {
        Self {
            pc: entry as usize,
            ra: task_exit_trap as usize,
            x5_x9: [0; 5],
            a0: argument,
            x11_x31: [0; 21],
            critical_nesting: 0,
            _reserved: [0; 2],
        }
    }
}

/// Build the initial context frame of a task below `top_of_stack` and
/// return the stack pointer to install as the task's saved context.
///
/// The top is first rounded down to [`PORT_BYTE_ALIGNMENT`]; since the
/// frame size is a multiple of the alignment, the returned pointer is
/// aligned too. Nothing outside the frame is written.
///
/// # Safety
/// The `size_of::<ContextFrame>() + PORT_BYTE_ALIGNMENT - 1` bytes below
/// `top_of_stack` must be writable and owned by the task being created.
pub unsafe fn initialize_stack(
    top_of_stack: *mut u8,
    entry: TaskEntry,
    argument: usize,
) -> *mut ContextFrame {
    let misalignment = top_of_stack as usize % PORT_BYTE_ALIGNMENT;
    let frame = top_of_stack
        .sub(misalignment)
        .sub(size_of::<ContextFrame>())
        .cast::<ContextFrame>();
    frame.write(ContextFrame::for_new_task(entry, argument));
    frame
}

/// Landing address for a task whose entry function returns.
///
/// Returning from a task body is a programming error: interrupts are
/// disabled, a diagnostic is emitted and the machine is halted. The
/// `C-unwind` ABI lets the host port's halt unwind out of it in tests.
pub extern "C-unwind" fn task_exit_trap() -> ! {
    crate::kernel::port().fatal(format_args!("task returned from its entry function"))
}

// ---------------------------------------------------------------------------
// Task stacks
// ---------------------------------------------------------------------------

/// Private stack memory of one task.
#[repr(C, align(16))]
pub struct TaskStack([u8; STACK_SIZE]);

impl TaskStack {
    pub const fn new() -> Self {
        Self([0; STACK_SIZE])
    }

    pub fn bottom(&self) -> usize {
        self.0.as_ptr() as usize
    }

    pub fn top(&self) -> usize {
        self.bottom() + STACK_SIZE
    }

    /// Whether a whole frame at `frame` lies inside this stack.
    pub fn holds_frame(&self, frame: *const ContextFrame) -> bool {
        let addr = frame as usize;
        addr >= self.bottom() && addr + size_of::<ContextFrame>() <= self.top()
    }

    /// Reset the stack to a fresh frame for `entry`.
    pub fn initialize(&mut self, entry: TaskEntry, argument: usize) -> *mut ContextFrame {
        let top = self.0.as_mut_ptr_range().end;
        // Safety: the whole array belongs to this stack and is far larger
        // than one frame.
        unsafe { initialize_stack(top, entry, argument) }
    }
}

impl Default for TaskStack {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Task control block
// ---------------------------------------------------------------------------

/// Index of a task in the scheduler's table.
pub type TaskId = usize;

/// Execution state of a task in the scheduler's state machine.
///
/// ```text
///   ┌──────────┐     schedule()      ┌─────────┐
///   │  Ready   │ ──────────────────► │ Running │
///   └──────────┘                     └─────────┘
///        ▲                                │
///        │      preempt / yield           │
///        ├────────────────────────────────┤
///        │                                │ take() / delay()
///        │     give() / delay expired     ▼
///        │                          ┌──────────┐
///        └───────────────────────── │ Blocked  │
///                                   └──────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Ready,
    Running,
    Blocked,
    /// Free slot.
    Dormant,
}

/// Static configuration for a task, set at creation time.
#[derive(Debug, Clone, Copy)]
pub struct TaskConfig {
    /// Higher value = more important. Only the idle task should use
    /// [`IDLE_PRIORITY`](crate::config::IDLE_PRIORITY).
    pub priority: u8,

    /// Time slice in ticks. If 0, uses `DEFAULT_TIME_SLICE`.
    pub time_slice: u32,
}

impl TaskConfig {
    pub const fn with_priority(priority: u8) -> Self {
        Self {
            priority,
            time_slice: 0,
        }
    }

    /// Returns the effective time slice, falling back to the system default.
    #[inline]
    pub const fn effective_time_slice(&self) -> u32 {
        if self.time_slice > 0 {
            self.time_slice
        } else {
            DEFAULT_TIME_SLICE
        }
    }
}

/// Per-task state owned by the scheduler.
pub struct TaskControlBlock {
    pub id: TaskId,
    pub state: TaskState,
    pub config: TaskConfig,

    /// Saved stack pointer, addressing the task's context frame while the
    /// task is not running.
    pub stack_pointer: *mut ContextFrame,

    pub stack: TaskStack,

    /// Remaining ticks in the current time slice.
    pub ticks_remaining: u32,

    /// Ticks left before a delayed task becomes ready again; 0 when the
    /// task is not delayed.
    pub delay_ticks: u32,
}

// Safety: `stack_pointer` always points into the task's own stack and is
// only accessed by the scheduler with interrupts masked.
unsafe impl Send for TaskControlBlock {}
unsafe impl Sync for TaskControlBlock {}

impl TaskControlBlock {
    pub const fn empty() -> Self {
        Self {
            id: 0,
            state: TaskState::Dormant,
            config: TaskConfig::with_priority(0),
            stack_pointer: core::ptr::null_mut(),
            stack: TaskStack::new(),
            ticks_remaining: 0,
            delay_ticks: 0,
        }
    }

    /// Make this slot a ready task that starts at `entry(argument)`.
    pub fn init(&mut self, id: TaskId, config: TaskConfig, entry: TaskEntry, argument: usize) {
        self.id = id;
        self.state = TaskState::Ready;
        self.config = config;
        self.stack_pointer = self.stack.initialize(entry, argument);
        self.ticks_remaining = config.effective_time_slice();
        self.delay_ticks = 0;
    }

    #[inline]
    pub fn is_runnable(&self) -> bool {
        matches!(self.state, TaskState::Ready | TaskState::Running)
    }

    #[inline]
    pub fn priority(&self) -> u8 {
        self.config.priority
    }

    pub fn reset_time_slice(&mut self) {
        self.ticks_remaining = self.config.effective_time_slice();
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use crate::arch::Machine;
    use quickcheck_macros::quickcheck;
    use std::boxed::Box;
    use std::sync::atomic::{AtomicUsize, Ordering};

    extern "C" fn spin_entry(_argument: usize) {}

    static OBSERVED_ARGUMENT: AtomicUsize = AtomicUsize::new(0);

    extern "C" fn recording_entry(argument: usize) {
        OBSERVED_ARGUMENT.store(argument, Ordering::SeqCst);
    }

    #[test]
    fn new_frame_resumes_at_entry_with_argument() {
        let mut stack = Box::new(TaskStack::new());
        let sp = stack.initialize(spin_entry, 0xdead_0001);
        let frame = unsafe { &*sp };

        assert_eq!(frame.pc, spin_entry as usize);
        assert_eq!(frame.a0, 0xdead_0001);
        assert_eq!(frame.ra, task_exit_trap as usize);
        assert_eq!(frame.critical_nesting, 0);
        assert!(frame.x5_x9.iter().chain(frame.x11_x31.iter()).all(|&r| r == 0));
        assert!(stack.holds_frame(sp));
        assert_eq!(sp as usize + size_of::<ContextFrame>(), stack.top());
    }

    #[test]
    fn initialization_writes_only_the_frame() {
        let mut memory = Box::new(TaskStack::new());
        for byte in memory.0.iter_mut() {
            *byte = 0xa5;
        }
        let sp = memory.initialize(spin_entry, 7);
        let frame_start = sp as usize - memory.bottom();
        assert!(memory.0[..frame_start].iter().all(|&b| b == 0xa5));
    }

    #[quickcheck]
    fn returned_pointer_is_aligned_for_any_top(offset: u8, argument: usize) -> bool {
        let mut memory = Box::new(TaskStack::new());
        let end = memory.0.as_mut_ptr_range().end;
        let top = unsafe { end.sub(usize::from(offset % 64)) };
        let sp = unsafe { initialize_stack(top, spin_entry, argument) };
        let frame = unsafe { &*sp };

        sp as usize % PORT_BYTE_ALIGNMENT == 0
            && sp as usize + size_of::<ContextFrame>() <= top as usize
            && frame.a0 == argument
            && frame.critical_nesting == 0
    }

    #[test]
    fn resuming_a_new_frame_runs_entry_then_lands_in_exit_trap() {
        let mut stack = Box::new(TaskStack::new());
        let sp = stack.initialize(recording_entry, 0x1234);
        let frame = unsafe { *sp };

        // What the restore sequence does: jump to `pc` with `a0` loaded.
        let entry: TaskEntry = unsafe { core::mem::transmute::<usize, TaskEntry>(frame.pc) };
        entry(frame.a0);
        assert_eq!(OBSERVED_ARGUMENT.load(Ordering::SeqCst), 0x1234);

        // The entry returned, so execution continues at `ra`.
        let exit = unsafe { core::mem::transmute::<usize, extern "C-unwind" fn() -> !>(frame.ra) };
        let outcome = std::panic::catch_unwind(|| exit());
        assert!(outcome.is_err());

        let machine = crate::kernel::port().machine();
        assert!(machine.is_halted());
        assert!(!machine.interrupts_enabled());
    }

    #[test]
    fn tcb_initialization() {
        let mut tcb = Box::new(TaskControlBlock::empty());
        assert_eq!(tcb.state, TaskState::Dormant);

        tcb.init(
            3,
            TaskConfig {
                priority: 5,
                time_slice: 15,
            },
            spin_entry,
            42,
        );

        assert_eq!(tcb.id, 3);
        assert_eq!(tcb.state, TaskState::Ready);
        assert_eq!(tcb.priority(), 5);
        assert_eq!(tcb.ticks_remaining, 15);
        assert!(tcb.stack.holds_frame(tcb.stack_pointer));
        assert_eq!(unsafe { (*tcb.stack_pointer).a0 }, 42);
    }

    #[test]
    fn effective_time_slice_default() {
        assert_eq!(TaskConfig::with_priority(1).effective_time_slice(), DEFAULT_TIME_SLICE);
    }
}
