//! # Scheduler Call Contract
//!
//! The small set of primitives the port layer and its drivers consume from
//! the scheduler core. The UART driver and the allocator wrapper are
//! written only against these traits; [`kernel::System`](crate::kernel::System)
//! binds them to the crate's own scheduler, and unit tests bind them to
//! host mocks.
//!
//! | Primitive        | Used by                                   |
//! |------------------|-------------------------------------------|
//! | [`RecursiveMutex`] | allocator lock                          |
//! | [`Queue`]        | UART receive path (ISR producer)          |
//! | [`Semaphore`]    | UART transmit mutex and completion signal |
//! | [`Kernel`]       | "scheduler running" query, tick, yield    |

use crate::arch::{Machine, Port};

/// How long a blocking operation may wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    /// Block until the operation succeeds.
    Forever,
    /// Never block; fail if the operation cannot complete immediately.
    Poll,
}

/// Counting or binary signal. A binary semaphore created "given" doubles as
/// a non-recursive mutex.
pub trait Semaphore: Sync {
    /// Decrement, blocking according to `wait` while the count is 0.
    /// Returns `false` if the semaphore could not be taken.
    fn take(&self, wait: Wait) -> bool;

    /// Increment from task context. Returns `false` if the count was
    /// already at its maximum.
    fn give(&self) -> bool;

    /// Increment from an interrupt handler. Returns whether a task of
    /// higher priority than the interrupted one was woken.
    fn give_from_isr(&self) -> bool;
}

/// Mutex that the owning task may take again without deadlocking.
pub trait RecursiveMutex: Sync {
    fn take_recursive(&self, wait: Wait) -> bool;

    /// Release one level of ownership. Returns `false` if the caller does
    /// not own the mutex.
    fn give_recursive(&self) -> bool;
}

/// Bounded FIFO of fixed-size items.
pub trait Queue<T>: Sync {
    fn receive(&self, wait: Wait) -> Option<T>;

    /// Enqueue from an interrupt handler. `Ok(woken)` reports whether a
    /// higher-priority task was woken; `Err(item)` hands the item back when
    /// the queue is full.
    fn send_from_isr(&self, item: T) -> Result<bool, T>;
}

/// The scheduler core as seen from the port layer.
pub trait Kernel: Sync {
    type Machine: Machine;
    type Semaphore: Semaphore;
    type RecursiveMutex: RecursiveMutex;
    type ByteQueue: Queue<u8>;

    fn port(&self) -> &Port<Self::Machine>;

    /// Whether the first task has been dispatched. Before that there is no
    /// context to block in.
    fn is_running(&self) -> bool;

    /// Advance the time base by one tick. Returns whether a context switch
    /// is now required.
    fn increment_tick(&self) -> bool;

    /// Pend a context switch from an interrupt handler if
    /// `switch_required`. The switch happens in the trap epilogue.
    fn yield_from_isr(&self, switch_required: bool) {
        if switch_required {
            self.port().machine().request_switch();
        }
    }
}

// ---------------------------------------------------------------------------
// Host mocks
// ---------------------------------------------------------------------------
