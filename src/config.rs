//! # Port Configuration
//!
//! Compile-time constants governing the port layer, the reference scheduler
//! and the drivers. All limits are fixed at compile time; impossible
//! combinations are rejected by the `const` assertions at the bottom.

/// Maximum number of tasks, including the idle task created by
/// `kernel::start()`. Each task consumes `STACK_SIZE` bytes of RAM.
pub const MAX_TASKS: usize = 8;

/// Scheduler tick frequency in Hz.
pub const TICK_RATE_HZ: u32 = 1000;

/// Frequency of the clock feeding the platform timer block. The timer
/// reload value is derived from this and `TICK_RATE_HZ`.
pub const TIMER_CLOCK_HZ: u32 = 1000;

/// Default time slice in ticks. A task that exhausts its slice yields to
/// other ready tasks of the same priority.
pub const DEFAULT_TIME_SLICE: u32 = 10;

/// Per-task stack size in bytes. Must hold the deepest call chain plus one
/// saved context frame.
pub const STACK_SIZE: usize = 2048;

/// Size in bytes of the stack trap handlers run on once the scheduler has
/// started.
pub const ISR_STACK_SIZE: usize = 2048;

/// Required alignment of every stack pointer and saved context frame.
pub const PORT_BYTE_ALIGNMENT: usize = 16;

/// Value the critical nesting counter holds until the first task is
/// dispatched. Any non-zero value works; a recognisable pattern helps when
/// reading memory dumps.
pub const CRITICAL_NESTING_SENTINEL: usize = 0xaaaa_aaaa;

/// Capacity of the UART receive queue, in bytes.
pub const UART_RX_QUEUE_LEN: usize = 128;

/// Size of the region handed to the global allocator.
pub const HEAP_SIZE: usize = 32 * 1024;

/// Priority of the idle task. Application tasks should use higher values.
pub const IDLE_PRIORITY: u8 = 0;

/// Maximum level of records forwarded to the char-out logger.
pub const LOG_LEVEL: log::LevelFilter = log::LevelFilter::Info;

const _: () = assert!(TICK_RATE_HZ > 0 && TICK_RATE_HZ <= TIMER_CLOCK_HZ);
const _: () = assert!(MAX_TASKS >= 2 && MAX_TASKS <= 32);
const _: () = assert!(STACK_SIZE % PORT_BYTE_ALIGNMENT == 0);
const _: () = assert!(ISR_STACK_SIZE % PORT_BYTE_ALIGNMENT == 0);
const _: () = assert!(PORT_BYTE_ALIGNMENT.is_power_of_two());
