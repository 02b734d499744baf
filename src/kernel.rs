//! # Kernel
//!
//! Process-wide state and the public API of the port: task creation, the
//! scheduler bootstrap, yielding and delays, and the trap handler the
//! assembly entry calls.
//!
//! All mutable state lives in three statics created before `main` runs:
//! the [`Port`] (machine + critical nesting counter), the [`Scheduler`] and
//! the installed [`VectorTable`]. [`System`] is the zero-sized handle that
//! binds them to the [`Kernel`] call contract for the drivers.
//!
//! ## Startup Sequence
//!
//! ```text
//! reset (riscv-rt)
//!   └─► main()
//!         ├─► kernel::init()         ← Route traps through the port
//!         ├─► logger::init()         ← Diagnostics on the char-out device
//!         ├─► kernel::create_task()  ← Register tasks (×N)
//!         └─► kernel::start(&VECTORS) ← Launch scheduler (no return)
//!               ├─► Check interrupt stack alignment
//!               ├─► Install the trap entry (again)
//!               ├─► Create the idle task
//!               ├─► Configure the tick timer
//!               └─► Restore the first task's frame via
//!                   arch::dispatch_first_task()
//! ```
//!
//! ## Trap flow
//!
//! ```text
//! trap entry (asm): save frame on task stack, switch to ISR stack
//!   └─► port_trap_handler(frame)
//!         ├─► record critical nesting in the frame
//!         ├─► VectorTable::dispatch()     ← tick, UART, ... handlers
//!         ├─► switch pending? Scheduler::switch_context()
//!         └─► restore nesting of the frame to resume
//! restore (asm): reload frame, mret
//! ```

use core::cell::UnsafeCell;
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

use crate::arch::{self, isr_stack_top, Machine, Platform, Port};
use crate::blocking::{BinarySemaphore, BoundedQueue, ReentrantMutex};
use crate::config::{IDLE_PRIORITY, PORT_BYTE_ALIGNMENT, TICK_RATE_HZ, UART_RX_QUEUE_LEN};
use crate::platform::{Interrupt, TimerRegisters, TIMER};
use crate::rtos::Kernel;
use crate::scheduler::{Scheduler, StackOverflow};
use crate::sync;
use crate::task::{ContextFrame, TaskConfig, TaskEntry, TaskId};
use crate::tick;
use crate::trap::{Trap, VectorTable};

pub use crate::scheduler::CreateError;

// ---------------------------------------------------------------------------
// Global state
// ---------------------------------------------------------------------------

static PORT: Port<Platform> = Port::new(Platform::new());

struct SchedulerCell(UnsafeCell<Scheduler>);

// Safety: accessed only through `access_scheduler`, with interrupts masked.
unsafe impl Sync for SchedulerCell {}

static SCHEDULER: SchedulerCell = SchedulerCell(UnsafeCell::new(Scheduler::new()));

static RUNNING: AtomicBool = AtomicBool::new(false);

static VECTORS: AtomicPtr<VectorTable> = AtomicPtr::new(ptr::null_mut());

/// Used until `start()` installs the application's table.
static PORT_VECTORS: VectorTable = port_vectors();

/// The host build has no real interrupt masking; unit tests running on
/// several threads take this lock instead.
#[cfg(test)]
static HOST_SCHEDULER_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

/// The process-wide port: machine access and critical nesting counter.
#[inline]
pub fn port() -> &'static Port<Platform> {
    &PORT
}

/// # Safety
/// Interrupts must be masked and no other scheduler reference may be live.
unsafe fn access_scheduler<R>(f: impl FnOnce(&mut Scheduler) -> R) -> R {
    #[cfg(test)]
    let _serialized = HOST_SCHEDULER_LOCK
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    f(&mut *SCHEDULER.0.get())
}

/// Run `f` on the scheduler inside a critical section. Task context only.
pub(crate) fn with_scheduler<R>(f: impl FnOnce(&mut Scheduler) -> R) -> R {
    sync::critical_section(|_cs| unsafe { access_scheduler(f) })
}

/// Run `f` on the scheduler from a trap handler.
///
/// # Safety
/// Must be called from trap context, where interrupts are masked.
pub(crate) unsafe fn with_scheduler_from_isr<R>(f: impl FnOnce(&mut Scheduler) -> R) -> R {
    access_scheduler(f)
}

fn vectors() -> &'static VectorTable {
    let table = VECTORS.load(Ordering::Acquire);
    if table.is_null() {
        &PORT_VECTORS
    } else {
        // Safety: only ever set from a `&'static VectorTable`.
        unsafe { &*table }
    }
}

// ---------------------------------------------------------------------------
// Kernel API
// ---------------------------------------------------------------------------

/// Create a new task and register it with the scheduler.
///
/// The task starts at `entry(argument)` the first time it is selected.
/// May be called before or after [`start`].
///
/// # Example
/// ```ignore
/// kernel::create_task(echo_task, TaskConfig::with_priority(2), 0)?;
/// ```
pub fn create_task(
    entry: TaskEntry,
    config: TaskConfig,
    argument: usize,
) -> Result<TaskId, CreateError> {
    let id = with_scheduler(|scheduler| scheduler.create_task(entry, config, argument))?;
    log::debug!("created task {} with priority {}", id, config.priority);
    Ok(id)
}

/// Route traps through the port before anything else runs.
///
/// Call first thing in `main`: from then on a fault during boot reaches the
/// default handlers (log and halt) instead of the reset runtime's. Traps
/// taken before [`start`] use [`port_vectors`].
pub fn init() {
    port().machine().install_trap_entry();
}

/// Start the scheduler. **Does not return.**
///
/// Installs `vectors` as the trap vector table, creates the idle task,
/// configures the tick timer and transfers control to the highest-priority
/// task through the same restore path a trap return uses.
pub fn start(vectors: &'static VectorTable) -> ! {
    let port = port();

    VECTORS.store(vectors as *const VectorTable as *mut VectorTable, Ordering::Release);

    // Safety: interrupts stay masked until the first task is dispatched; the
    // nesting sentinel keeps every critical section from unmasking them.
    let first = unsafe {
        access_scheduler(|scheduler| {
            prepare_start(port, scheduler, &TIMER, isr_stack_top(), &RUNNING)
        })
    };

    unsafe { arch::dispatch_first_task(first) };

    log::error!("first task dispatch returned");
    loop {
        port.machine().wait_for_interrupt();
    }
}

/// Everything [`start`] does before handing the CPU to the first task.
/// Returns the frame to restore.
///
/// On return the trap entry is installed, the idle task exists, the tick
/// timer runs with its line unmasked, `running` is set and the nesting
/// counter holds the first frame's value instead of the boot sentinel.
fn prepare_start<M: Machine>(
    port: &Port<M>,
    scheduler: &mut Scheduler,
    timer: &TimerRegisters,
    isr_top: usize,
    running: &AtomicBool,
) -> *mut ContextFrame {
    if isr_top % PORT_BYTE_ALIGNMENT != 0 {
        port.fatal(format_args!(
            "interrupt stack top {:#010x} is not {}-byte aligned",
            isr_top, PORT_BYTE_ALIGNMENT
        ));
    }

    port.machine().install_trap_entry();

    if let Err(error) =
        scheduler.create_task(idle_task, TaskConfig::with_priority(IDLE_PRIORITY), 0)
    {
        port.fatal(format_args!("cannot create the idle task: {}", error));
    }

    tick::configure_tick_timer(timer, port.machine(), TICK_RATE_HZ);
    port.machine().enable_lines(Interrupt::Software.mask());

    let first = scheduler.select_next();
    let frame = scheduler.task(first).stack_pointer;
    log::info!(
        "starting scheduler with {} tasks, task {} first",
        scheduler.task_count(),
        first
    );

    running.store(true, Ordering::Release);
    // Safety: `frame` was built by `initialize_stack` on the task's stack.
    port.critical().restore(unsafe { (*frame).critical_nesting });
    frame
}

/// Stopping the scheduler is not supported: once started, the machine
/// only leaves task execution by halting. Does nothing.
pub fn stop() {}

/// Whether the first task has been dispatched.
#[inline]
pub fn is_running() -> bool {
    RUNNING.load(Ordering::Acquire)
}

/// Id of the running task, `None` before the scheduler starts.
pub fn current_task() -> Option<TaskId> {
    with_scheduler(|scheduler| scheduler.current())
}

/// Ticks since the scheduler started.
pub fn tick_count() -> u64 {
    with_scheduler(|scheduler| scheduler.tick_count())
}

/// Voluntarily yield the CPU to other ready tasks of the same priority.
///
/// Resets the caller's time slice and pends a context switch through the
/// software interrupt.
pub fn yield_task() {
    if !is_running() {
        return;
    }
    with_scheduler(|scheduler| scheduler.yield_current());
    port().machine().request_switch();
}

/// Block the calling task for `ticks` scheduler ticks.
pub fn delay(ticks: u32) {
    if !is_running() || ticks == 0 {
        return;
    }
    with_scheduler(|scheduler| scheduler.delay_current(ticks));
    port().machine().request_switch();
}

/// Block the calling task for at least `ms` milliseconds.
pub fn delay_ms(ms: u32) {
    delay(ms_to_ticks(ms));
}

fn ms_to_ticks(ms: u32) -> u32 {
    let ticks = (u64::from(ms) * u64::from(TICK_RATE_HZ)).div_ceil(1000);
    u32::try_from(ticks).unwrap_or(u32::MAX)
}

/// Enter a critical section of the global port. Task context only.
#[inline]
pub fn enter_critical() {
    port().enter_critical();
}

/// Leave a critical section entered with [`enter_critical`].
#[inline]
pub fn exit_critical() {
    port().exit_critical();
}

extern "C" fn idle_task(_argument: usize) {
    loop {
        port().machine().wait_for_interrupt();
    }
}

// ---------------------------------------------------------------------------
// Trap handling
// ---------------------------------------------------------------------------

/// The table every application table should start from: the tick timer and
/// the yield interrupt are owned by the port, everything else is at its
/// default.
pub const fn port_vectors() -> VectorTable {
    VectorTable::new()
        .with_interrupt(Interrupt::Timer, tick_interrupt_handler)
        .with_interrupt(Interrupt::Software, yield_interrupt_handler)
}

fn tick_interrupt_handler(_trap: &mut Trap<'_>) {
    tick::on_tick(&TIMER, &System);
}

/// The pending bit is consumed by the trap epilogue.
fn yield_interrupt_handler(_trap: &mut Trap<'_>) {}

/// Called by the trap entry with the frame it saved on the interrupted
/// task's stack; returns the frame to restore.
///
/// # Safety
/// Trap context only; `frame` must be the frame just saved.
pub unsafe extern "C" fn port_trap_handler(frame: *mut ContextFrame) -> *mut ContextFrame {
    handle_trap(port(), vectors(), frame, |saved| {
        with_scheduler_from_isr(|scheduler| scheduler.switch_context(saved))
    })
}

/// Trap epilogue logic shared by the target entry and the tests.
///
/// Switches context only for interrupts: the frame of a task that trapped
/// synchronously may have been saved inside a critical section.
unsafe fn handle_trap<M: Machine>(
    port: &Port<M>,
    vectors: &VectorTable,
    frame: *mut ContextFrame,
    switch_context: impl FnOnce(*mut ContextFrame) -> Result<*mut ContextFrame, StackOverflow>,
) -> *mut ContextFrame {
    let machine = port.machine();
    let info = machine.trap_info();

    let saved = &mut *frame;
    saved.critical_nesting = port.critical().depth();

    let mut trap = Trap::new(info.cause, saved.pc, info.tval, machine);
    vectors.dispatch(&mut trap);
    saved.pc = trap.epc;

    let mut next = frame;
    if trap.cause.is_interrupt() && machine.take_switch_request() {
        next = match switch_context(frame) {
            Ok(next) => next,
            Err(StackOverflow {
                task,
                stack_pointer,
            }) => port.fatal(format_args!(
                "stack overflow for task {} (sp {:#010x})",
                task, stack_pointer
            )),
        };
    }

    port.critical().restore((*next).critical_nesting);
    next
}

// ---------------------------------------------------------------------------
// Call contract binding
// ---------------------------------------------------------------------------

/// Handle to the crate's own scheduler, implementing [`Kernel`].
#[derive(Debug, Clone, Copy, Default)]
pub struct System;

impl Kernel for System {
    type Machine = Platform;
    type Semaphore = BinarySemaphore;
    type RecursiveMutex = ReentrantMutex;
    type ByteQueue = BoundedQueue<u8, UART_RX_QUEUE_LEN>;

    fn port(&self) -> &Port<Platform> {
        port()
    }

    fn is_running(&self) -> bool {
        is_running()
    }

    /// Tick interrupt only.
    fn increment_tick(&self) -> bool {
        unsafe { with_scheduler_from_isr(|scheduler| scheduler.increment_tick()) }
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------
