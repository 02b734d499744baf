//! # Critical-Section Manager
//!
//! Multiplexes any number of nested "disable interrupts" requests onto the
//! single global interrupt-enable bit. Interrupts are masked on every
//! `enter` and unmasked only by the `exit` that brings the nesting counter
//! back to zero.
//!
//! The counter starts at a large non-zero sentinel (see
//! [`CRITICAL_NESTING_SENTINEL`](crate::config::CRITICAL_NESTING_SENTINEL)),
//! so critical sections used during early boot never unmask interrupts. The
//! first task dispatch loads the value saved in that task's context frame,
//! which is 0 for a fresh task.
//!
//! These primitives are for task context only. Trap handlers run with
//! interrupts masked by the hardware and never touch the counter.

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::arch::{Machine, Port};

/// Nesting depth of critical sections on the (single) core.
///
/// Only plain loads and stores are used: the counter is modified with
/// interrupts masked, and the target has no atomic read-modify-write.
pub struct CriticalNesting {
    depth: AtomicUsize,
}

impl CriticalNesting {
    pub const fn new(initial: usize) -> Self {
        Self {
            depth: AtomicUsize::new(initial),
        }
    }

    /// Mask interrupts, then record one more level of nesting.
    #[inline]
    pub fn enter<M: Machine + ?Sized>(&self, machine: &M) {
        machine.disable_interrupts();
        let depth = self.depth.load(Ordering::Relaxed);
        self.depth.store(depth + 1, Ordering::Relaxed);
    }

    /// Drop one level of nesting, unmasking interrupts when none remain.
    ///
    /// Must pair with a preceding [`enter`](Self::enter).
    #[inline]
    pub fn exit<M: Machine + ?Sized>(&self, machine: &M) {
        let depth = self.depth.load(Ordering::Relaxed);
        debug_assert!(depth > 0, "exit_critical without a matching enter_critical");
        let depth = depth.wrapping_sub(1);
        self.depth.store(depth, Ordering::Relaxed);
        if depth == 0 {
            machine.enable_interrupts();
        }
    }

    #[inline]
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    /// Install the depth saved in a context frame. Does not touch the
    /// interrupt-enable bit: the context restore sequence does that.
    #[inline]
    pub fn restore(&self, depth: usize) {
        self.depth.store(depth, Ordering::Relaxed);
    }
}

/// Proof that the holder runs with interrupts masked.
pub struct CriticalSection {
    _private: (),
}

impl CriticalSection {
    /// # Safety
    /// Interrupts must be masked for the lifetime of the token.
    #[inline]
    pub unsafe fn new() -> Self {
        Self { _private: () }
    }
}

/// Leaves the critical section entered by [`CriticalGuard::enter`] on drop.
pub struct CriticalGuard<'a, M: Machine> {
    port: &'a Port<M>,
    cs: CriticalSection,
}

impl<'a, M: Machine> CriticalGuard<'a, M> {
    pub fn enter(port: &'a Port<M>) -> Self {
        port.enter_critical();
        Self {
            port,
            cs: unsafe { CriticalSection::new() },
        }
    }

    pub fn token(&self) -> &CriticalSection {
        &self.cs
    }
}

impl<M: Machine> Drop for CriticalGuard<'_, M> {
    fn drop(&mut self) {
        self.port.exit_critical();
    }
}

/// Execute a closure within a critical section of the global port.
///
/// # Usage
/// ```ignore
/// sync::critical_section(|_cs| {
///     // Access shared state safely
/// });
/// ```
#[inline]
pub fn critical_section<F, R>(f: F) -> R
where
    F: FnOnce(&CriticalSection) -> R,
{
    let guard = CriticalGuard::enter(crate::kernel::port());
    f(guard.token())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::host::HostMachine;
    use crate::config::CRITICAL_NESTING_SENTINEL;
    use quickcheck_macros::quickcheck;

    #[test]
    fn single_section_masks_and_restores() {
        let machine = HostMachine::new();
        machine.enable_interrupts();
        let nesting = CriticalNesting::new(0);

        nesting.enter(&machine);
        assert!(!machine.interrupts_enabled());
        assert_eq!(nesting.depth(), 1);

        nesting.exit(&machine);
        assert!(machine.interrupts_enabled());
        assert_eq!(nesting.depth(), 0);
    }

    #[test]
    fn sentinel_keeps_interrupts_masked_before_first_dispatch() {
        let port = Port::new(HostMachine::new());
        for _ in 0..4 {
            port.enter_critical();
            port.exit_critical();
            assert!(!port.machine().interrupts_enabled());
        }
        assert_eq!(port.critical().depth(), CRITICAL_NESTING_SENTINEL);
    }

    #[test]
    fn restore_does_not_touch_hardware() {
        let machine = HostMachine::new();
        let nesting = CriticalNesting::new(CRITICAL_NESTING_SENTINEL);
        nesting.restore(0);
        assert_eq!(nesting.depth(), 0);
        assert!(!machine.interrupts_enabled());
    }

    #[test]
    fn guard_exits_on_drop() {
        let port = Port::new(HostMachine::new());
        port.critical().restore(0);
        port.machine().enable_interrupts();
        {
            let _outer = CriticalGuard::enter(&port);
            {
                let _inner = CriticalGuard::enter(&port);
                assert_eq!(port.critical().depth(), 2);
            }
            assert!(!port.machine().interrupts_enabled());
        }
        assert!(port.machine().interrupts_enabled());
    }

    #[quickcheck]
    fn nested_sections_unmask_only_after_last_exit(depth: u8) -> bool {
        let depth = usize::from(depth % 64) + 1;
        let machine = HostMachine::new();
        machine.enable_interrupts();
        let nesting = CriticalNesting::new(0);

        for level in 1..=depth {
            nesting.enter(&machine);
            if machine.interrupts_enabled() || nesting.depth() != level {
                return false;
            }
        }
        for level in (1..depth).rev() {
            nesting.exit(&machine);
            if machine.interrupts_enabled() || nesting.depth() != level {
                return false;
            }
        }
        nesting.exit(&machine);
        machine.interrupts_enabled() && nesting.depth() == 0
    }
}
