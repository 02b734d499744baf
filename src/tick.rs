//! # Preemption Trigger
//!
//! Programs the platform timer to interrupt at the scheduler tick rate and
//! turns each timer interrupt into exactly one scheduler tick.
//!
//! The timer counts at [`TIMER_CLOCK_HZ`] and fires every `ARR + 1` clock
//! periods, so the reload value for a tick rate `f` is
//! `(TIMER_CLOCK_HZ - f) / f`.
//!
//! The tick handler never switches context itself. When the scheduler
//! reports that a higher-priority task became ready, it only pends a switch,
//! which the trap epilogue performs on the way out.

use tock_registers::interfaces::Writeable;

use crate::arch::Machine;
use crate::config::TIMER_CLOCK_HZ;
use crate::platform::{Interrupt, TimerControl, TimerRegisters};
use crate::rtos::Kernel;

/// Auto-reload value giving `tick_rate_hz` interrupts per second.
///
/// Rates outside `1..=TIMER_CLOCK_HZ` are clamped into that range.
pub const fn timer_reload(tick_rate_hz: u32) -> u32 {
    let rate = if tick_rate_hz == 0 {
        1
    } else if tick_rate_hz > TIMER_CLOCK_HZ {
        TIMER_CLOCK_HZ
    } else {
        tick_rate_hz
    };
    (TIMER_CLOCK_HZ - rate) / rate
}

/// Stop the timer, program it for `tick_rate_hz` and unmask its interrupt
/// line. Global interrupts stay as they are.
pub fn configure_tick_timer<M: Machine + ?Sized>(
    timer: &TimerRegisters,
    machine: &M,
    tick_rate_hz: u32,
) {
    timer.cr.set(0);
    timer.sr.set(0);
    timer.cnt.set(0);
    timer.arr.set(timer_reload(tick_rate_hz));
    timer.cr.write(TimerControl::EN::SET + TimerControl::IE::SET);
    machine.enable_lines(Interrupt::Timer.mask());
}

/// Timer interrupt body: acknowledge, advance the time base once, and pend
/// a context switch if the scheduler asks for one.
pub fn on_tick<K: Kernel>(timer: &TimerRegisters, kernel: &K) {
    timer.sr.set(0);
    let switch_required = kernel.increment_tick();
    kernel.yield_from_isr(switch_required);
}
