//! # Host Port
//!
//! A simulated machine for builds that do not target the mini-RISC core.
//! Interrupt-enable state, line masks, the switch request and the trap
//! entry installation are plain atomics, which makes every component above
//! [`Machine`] observable from unit tests. Halting panics with `"machine halted"` so tests can assert on
//! fatal paths.

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use super::{Machine, TrapInfo};
use crate::task::ContextFrame;

pub struct HostMachine {
    interrupts_enabled: AtomicBool,
    enabled_lines: AtomicU32,
    switch_requested: AtomicBool,
    trap_entry_installed: AtomicBool,
    halted: AtomicBool,
    trap_cause: AtomicUsize,
    trap_value: AtomicUsize,
}

impl HostMachine {
    /// A machine fresh out of reset: interrupts globally masked, no line
    /// enabled, nothing pending.
    pub const fn new() -> Self {
        Self {
            interrupts_enabled: AtomicBool::new(false),
            enabled_lines: AtomicU32::new(0),
            switch_requested: AtomicBool::new(false),
            trap_entry_installed: AtomicBool::new(false),
            halted: AtomicBool::new(false),
            trap_cause: AtomicUsize::new(0),
            trap_value: AtomicUsize::new(0),
        }
    }

    /// Latch the cause registers as the hardware would on trap entry.
    pub fn latch_trap(&self, cause: usize, tval: usize) {
        self.trap_cause.store(cause, Ordering::SeqCst);
        self.trap_value.store(tval, Ordering::SeqCst);
    }

    pub fn trap_entry_installed(&self) -> bool {
        self.trap_entry_installed.load(Ordering::SeqCst)
    }

    pub fn switch_requested(&self) -> bool {
        self.switch_requested.load(Ordering::SeqCst)
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }
}

impl Default for HostMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl Machine for HostMachine {
    fn disable_interrupts(&self) {
        self.interrupts_enabled.store(false, Ordering::SeqCst);
    }

    fn enable_interrupts(&self) {
        self.interrupts_enabled.store(true, Ordering::SeqCst);
    }

    fn interrupts_enabled(&self) -> bool {
        self.interrupts_enabled.load(Ordering::SeqCst)
    }

    fn enable_lines(&self, mask: u32) {
        self.enabled_lines.fetch_or(mask, Ordering::SeqCst);
    }

    fn enabled_lines(&self) -> u32 {
        self.enabled_lines.load(Ordering::SeqCst)
    }

    fn request_switch(&self) {
        self.switch_requested.store(true, Ordering::SeqCst);
    }

    fn take_switch_request(&self) -> bool {
        self.switch_requested.swap(false, Ordering::SeqCst)
    }

    fn wait_for_interrupt(&self) {
        core::hint::spin_loop();
    }

    fn trap_info(&self) -> TrapInfo {
        TrapInfo {
            cause: self.trap_cause.load(Ordering::SeqCst),
            tval: self.trap_value.load(Ordering::SeqCst),
        }
    }

    fn install_trap_entry(&self) {
        self.trap_entry_installed.store(true, Ordering::SeqCst);
    }

    fn halt(&self) -> ! {
        self.halted.store(true, Ordering::SeqCst);
        panic!("machine halted");
    }
}

/// Tasks cannot be dispatched on the host; the caller falls through to its
/// spin loop.
///
/// # Safety
/// Trivially safe; `unsafe` only to match the target signature.
pub unsafe fn dispatch_first_task(_frame: *mut ContextFrame) {
    log::error!("first-task dispatch is not available on the host port");
}
