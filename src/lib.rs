//! # Harvey Port
//!
//! A preemptive, priority-based RTOS port layer and interrupt-driven UART
//! driver for the Harvey mini-RISC platform (RV32IM, machine mode only).
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                    Application Tasks                    │
//! ├────────────────────────────────────────────────────────┤
//! │  Kernel API (kernel.rs)          UART driver (uart.rs)  │
//! │  create_task · start · delay     read · write · ISRs    │
//! ├──────────────┬─────────────────┬──────────────────────┤
//! │  Scheduler   │ Blocking prims  │  Allocator lock      │
//! │  scheduler.rs│ blocking.rs     │  heap.rs             │
//! ├──────────────┴─────────────────┴──────────────────────┤
//! │   Call contract (rtos.rs) · Trap dispatch (trap.rs)     │
//! │   Tick timer (tick.rs) · Task frames (task.rs)          │
//! ├────────────────────────────────────────────────────────┤
//! │   Machine abstraction (arch/) · Critical nesting (sync) │
//! ├────────────────────────────────────────────────────────┤
//! │        Harvey mini-RISC hardware (platform.rs)          │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Execution Model
//!
//! - One trap entry for every interrupt and exception. It saves the running
//!   task's full register frame on the task's own stack, then runs the
//!   handler on a dedicated interrupt stack.
//! - Handlers are looked up in a [`trap::VectorTable`] indexed by cause.
//! - A context switch is only ever performed in the trap epilogue: handlers
//!   and tasks merely *request* one.
//! - Critical sections nest through a counter that is saved per task. Until
//!   the first task runs the counter holds a sentinel, so interrupts stay
//!   masked during boot regardless of what boot code does.
//!
//! ## Memory Model
//!
//! - Task control blocks and stacks are statically allocated.
//! - The optional heap is a free-list arena behind a recursive mutex, see
//!   [`heap`].
//!
//! Host builds swap the machine for a simulated one (`arch::host`) so all
//! of the above is unit-testable with `cargo test`.

#![cfg_attr(not(test), no_std)]

pub mod config;
pub mod platform;
pub mod arch;
pub mod sync;
pub mod task;
pub mod trap;
pub mod tick;
pub mod rtos;
pub mod scheduler;
pub mod blocking;
pub mod kernel;
pub mod heap;
pub mod uart;
pub mod logger;
