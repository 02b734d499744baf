//! # Mini-RISC Port
//!
//! Machine-mode implementation of [`Machine`] for the Harvey mini-RISC core
//! (RV32IM), plus the two assembly paths of the port:
//!
//! - **Trap entry**: saves a [`ContextFrame`] on the interrupted task's
//!   stack, switches to the interrupt stack and calls the kernel's trap
//!   handler, which returns the frame to resume (the same one, or another
//!   task's after a context switch).
//! - **Context restore**: reloads a frame and `mret`s into it. The
//!   first-task bootstrap jumps straight here, as if returning from a trap.
//!
//! ## Frame offsets used by the assembly
//!
//! | Offset | Register            |
//! |--------|---------------------|
//! | 0      | `mepc` (resume pc)  |
//! | 4      | `x1` / `ra`         |
//! | 8..28  | `x5`..`x9`          |
//! | 28     | `x10` / `a0`        |
//! | 32..116| `x11`..`x31`        |
//!
//! The critical nesting word (offset 116) is handled in Rust by the trap
//! handler, not by the assembly.

use core::arch::{asm, global_asm};

use tock_registers::interfaces::Writeable;

use super::{Machine, TrapInfo};
use crate::config::ISR_STACK_SIZE;
use crate::platform::{Interrupt, POWERDOWN, POWERDOWN_REQUEST};
use crate::task::ContextFrame;

/// `mstatus` bits the platform uses as global interrupt enable.
const MSTATUS_INTERRUPT_ENABLE: usize = 0x9;

/// `mstatus.MPIE | mstatus.MPP = machine`: what `mret` needs to land in a
/// task with interrupts enabled.
const MSTATUS_RETURN_TO_TASK: usize = 0x1880;

/// The mini-RISC core. All state lives in CSRs.
pub struct MiniRisc {
    _private: (),
}

impl MiniRisc {
    pub const fn new() -> Self {
        Self { _private: () }
    }

    #[inline]
    fn pending_lines(&self) -> u32 {
        let mip: u32;
        unsafe { asm!("csrr {0}, mip", out(reg) mip, options(nomem, nostack)) };
        mip
    }
}

impl Default for MiniRisc {
    fn default() -> Self {
        Self::new()
    }
}

impl Machine for MiniRisc {
    #[inline(always)]
    fn disable_interrupts(&self) {
        unsafe { asm!("csrc mstatus, {0}", in(reg) MSTATUS_INTERRUPT_ENABLE) };
    }

    #[inline(always)]
    fn enable_interrupts(&self) {
        unsafe { asm!("csrs mstatus, {0}", in(reg) MSTATUS_INTERRUPT_ENABLE) };
    }

    #[inline]
    fn interrupts_enabled(&self) -> bool {
        riscv::register::mstatus::read().mie()
    }

    #[inline]
    fn enable_lines(&self, mask: u32) {
        unsafe { asm!("csrs mie, {0}", in(reg) mask) };
    }

    #[inline]
    fn enabled_lines(&self) -> u32 {
        let mie: u32;
        unsafe { asm!("csrr {0}, mie", out(reg) mie, options(nomem, nostack)) };
        mie
    }

    #[inline]
    fn request_switch(&self) {
        unsafe { asm!("csrs mip, {0}", in(reg) Interrupt::Software.mask()) };
    }

    fn take_switch_request(&self) -> bool {
        let requested = self.pending_lines() & Interrupt::Software.mask() != 0;
        if requested {
            unsafe { asm!("csrc mip, {0}", in(reg) Interrupt::Software.mask()) };
        }
        requested
    }

    #[inline]
    fn wait_for_interrupt(&self) {
        unsafe { riscv::asm::wfi() };
    }

    fn trap_info(&self) -> TrapInfo {
        TrapInfo {
            cause: riscv::register::mcause::read().bits(),
            tval: riscv::register::mtval::read(),
        }
    }

    fn install_trap_entry(&self) {
        unsafe { asm!("csrw mtvec, {0}", in(reg) harvey_trap_entry as usize) };
    }

    fn halt(&self) -> ! {
        POWERDOWN.req.set(POWERDOWN_REQUEST);
        loop {
            unsafe { riscv::asm::wfi() };
        }
    }
}

// ---------------------------------------------------------------------------
// Trap entry and context restore
// ---------------------------------------------------------------------------

global_asm!(
    ".section .text.harvey_trap, \"ax\"",
    ".global harvey_trap_entry",
    ".align 4",
    "harvey_trap_entry:",
    "    addi sp, sp, -128",
    "    sw   x1,    4(sp)",
    "    sw   x5,    8(sp)",
    "    sw   x6,   12(sp)",
    "    sw   x7,   16(sp)",
    "    sw   x8,   20(sp)",
    "    sw   x9,   24(sp)",
    "    sw   x10,  28(sp)",
    "    sw   x11,  32(sp)",
    "    sw   x12,  36(sp)",
    "    sw   x13,  40(sp)",
    "    sw   x14,  44(sp)",
    "    sw   x15,  48(sp)",
    "    sw   x16,  52(sp)",
    "    sw   x17,  56(sp)",
    "    sw   x18,  60(sp)",
    "    sw   x19,  64(sp)",
    "    sw   x20,  68(sp)",
    "    sw   x21,  72(sp)",
    "    sw   x22,  76(sp)",
    "    sw   x23,  80(sp)",
    "    sw   x24,  84(sp)",
    "    sw   x25,  88(sp)",
    "    sw   x26,  92(sp)",
    "    sw   x27,  96(sp)",
    "    sw   x28, 100(sp)",
    "    sw   x29, 104(sp)",
    "    sw   x30, 108(sp)",
    "    sw   x31, 112(sp)",
    "    csrr t0, mepc",
    "    sw   t0,    0(sp)",
    // a0 = frame; run the handler on the interrupt stack.
    "    mv   a0, sp",
    "    la   sp, {isr_stack}",
    "    li   t0, {isr_stack_size}",
    "    add  sp, sp, t0",
    "    call {handler}",
    "    mv   sp, a0",
    ".global harvey_restore_context",
    "harvey_restore_context:",
    "    lw   t0,    0(sp)",
    "    csrw mepc, t0",
    "    lw   x1,    4(sp)",
    "    lw   x6,   12(sp)",
    "    lw   x7,   16(sp)",
    "    lw   x8,   20(sp)",
    "    lw   x9,   24(sp)",
    "    lw   x10,  28(sp)",
    "    lw   x11,  32(sp)",
    "    lw   x12,  36(sp)",
    "    lw   x13,  40(sp)",
    "    lw   x14,  44(sp)",
    "    lw   x15,  48(sp)",
    "    lw   x16,  52(sp)",
    "    lw   x17,  56(sp)",
    "    lw   x18,  60(sp)",
    "    lw   x19,  64(sp)",
    "    lw   x20,  68(sp)",
    "    lw   x21,  72(sp)",
    "    lw   x22,  76(sp)",
    "    lw   x23,  80(sp)",
    "    lw   x24,  84(sp)",
    "    lw   x25,  88(sp)",
    "    lw   x26,  92(sp)",
    "    lw   x27,  96(sp)",
    "    lw   x28, 100(sp)",
    "    lw   x29, 104(sp)",
    "    lw   x30, 108(sp)",
    "    lw   x31, 112(sp)",
    "    lw   x5,    8(sp)",
    "    addi sp, sp, 128",
    "    mret",
    isr_stack = sym super::ISR_STACK,
    isr_stack_size = const ISR_STACK_SIZE,
    handler = sym crate::kernel::port_trap_handler,
);

extern "C" {
    fn harvey_trap_entry();
}

/// Transfer control to the first task by restoring its frame as if
/// returning from a trap.
///
/// Arranges for `mret` to enable interrupts and jumps into the shared
/// restore path. Never returns.
///
/// # Safety
/// `frame` must be a frame built by
/// [`initialize_stack`](crate::task::initialize_stack) (or saved by the trap
/// entry) on a live task stack, the critical nesting counter must already
/// hold the frame's nesting value, and the trap entry must be installed.
pub unsafe fn dispatch_first_task(frame: *mut ContextFrame) {
    asm!(
        "csrs mstatus, {status}",
        "mv   sp, {frame}",
        "j    harvey_restore_context",
        status = in(reg) MSTATUS_RETURN_TO_TASK,
        frame = in(reg) frame,
        options(noreturn),
    );
}
