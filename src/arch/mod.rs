//! # Architecture Abstraction Layer
//!
//! Interrupt control primitives and the machine-specific parts of the port.
//! [`Machine`] is the boundary: everything above it (critical sections, trap
//! dispatch, the UART driver) is written against the trait, and exactly one
//! implementation is selected per build:
//!
//! - `minirisc`: the Harvey mini-RISC (RV32IM, machine mode). Real CSR access,
//!   the trap entry/restore sequence and first-task dispatch.
//! - `host`: a simulated machine built on atomics, used for host builds and
//!   unit tests.

use core::cell::UnsafeCell;
use core::fmt;

use crate::config::{CRITICAL_NESTING_SENTINEL, ISR_STACK_SIZE};
use crate::sync::CriticalNesting;

#[cfg(target_arch = "riscv32")]
pub mod minirisc;
#[cfg(target_arch = "riscv32")]
pub use minirisc::{dispatch_first_task, MiniRisc as Platform};

#[cfg(not(target_arch = "riscv32"))]
pub mod host;
#[cfg(not(target_arch = "riscv32"))]
pub use host::{dispatch_first_task, HostMachine as Platform};

/// Cause and faulting value latched by the hardware on trap entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrapInfo {
    /// Raw cause register. The top bit is set for interrupts.
    pub cause: usize,
    /// Faulting address or instruction, depending on the cause.
    pub tval: usize,
}

/// Interrupt control primitives of a single-core machine.
///
/// All methods act on the executing core and must be callable from both
/// task and trap context.
pub trait Machine: Sync {
    /// Clear the global interrupt-enable bit.
    fn disable_interrupts(&self);

    /// Set the global interrupt-enable bit.
    fn enable_interrupts(&self);

    fn interrupts_enabled(&self) -> bool;

    /// Unmask the interrupt lines selected by `mask`.
    fn enable_lines(&self, mask: u32);

    fn enabled_lines(&self) -> u32;

    /// Pend a context switch. From task context the request traps as soon
    /// as interrupts are enabled; from a handler it is consumed by the trap
    /// epilogue.
    fn request_switch(&self);

    /// Consume a pending switch request, returning whether one was pending.
    fn take_switch_request(&self) -> bool;

    fn wait_for_interrupt(&self);

    fn trap_info(&self) -> TrapInfo;

    /// Route every trap to the port's trap entry. Until this runs, traps go
    /// to whatever the reset code installed.
    fn install_trap_entry(&self);

    /// Stop the machine through the power controller.
    fn halt(&self) -> !;
}

// ---------------------------------------------------------------------------
// Port context
// ---------------------------------------------------------------------------

/// The process-wide port state: the machine and its critical nesting
/// counter. One instance lives in `kernel::PORT`; tests build their own.
pub struct Port<M> {
    machine: M,
    critical: CriticalNesting,
}

impl<M: Machine> Port<M> {
    /// Create a port whose nesting counter holds the pre-scheduler sentinel,
    /// so no critical section can unmask interrupts before the first task is
    /// dispatched.
    pub const fn new(machine: M) -> Self {
        Self {
            machine,
            critical: CriticalNesting::new(CRITICAL_NESTING_SENTINEL),
        }
    }

    #[inline]
    pub fn machine(&self) -> &M {
        &self.machine
    }

    #[inline]
    pub fn critical(&self) -> &CriticalNesting {
        &self.critical
    }

    #[inline]
    pub fn enter_critical(&self) {
        self.critical.enter(&self.machine);
    }

    #[inline]
    pub fn exit_critical(&self) {
        self.critical.exit(&self.machine);
    }

    /// Report an unrecoverable condition and stop the machine.
    pub fn fatal(&self, args: fmt::Arguments<'_>) -> ! {
        fatal(&self.machine, args)
    }
}

/// Disable interrupts, log `args` and halt `machine`. Usable from trap
/// context, where only the machine is at hand.
pub fn fatal<M: Machine + ?Sized>(machine: &M, args: fmt::Arguments<'_>) -> ! {
    machine.disable_interrupts();
    log::error!("{}", args);
    machine.halt()
}

// ---------------------------------------------------------------------------
// Interrupt stack
// ---------------------------------------------------------------------------

/// Stack used by trap handlers. The trap entry switches to it after saving
/// the interrupted context on the task stack.
#[repr(C, align(16))]
pub struct IsrStack(UnsafeCell<[u8; ISR_STACK_SIZE]>);

// Safety: only the trap entry sequence touches the memory, with interrupts
// disabled.
unsafe impl Sync for IsrStack {}

pub static ISR_STACK: IsrStack = IsrStack(UnsafeCell::new([0; ISR_STACK_SIZE]));

/// Address one past the end of the interrupt stack.
pub fn isr_stack_top() -> usize {
    ISR_STACK.0.get() as usize + ISR_STACK_SIZE
}
