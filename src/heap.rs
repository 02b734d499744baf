//! # Allocator Lock
//!
//! [`LockedAllocator`] makes a non-reentrant allocator usable as the
//! `#[global_allocator]` of a preemptive system: every allocation and
//! release runs under one recursive mutex. The mutex is recursive so that
//! code already holding it (a failure hook, a fault handler that formats a
//! message) can allocate again without deadlocking its own task, while any
//! other task still waits.
//!
//! The lock is a plain `const` value, so it exists before `main` and before
//! anything can allocate. Failing to take it is fatal. A failed allocation
//! calls the failure hook, which by default logs the request and halts.
//!
//! [`FreeListHeap`] is the underlying allocator used by the firmware: a
//! first-fit free list over a static arena, initialised on first use.

use core::alloc::{GlobalAlloc, Layout};
use core::cell::UnsafeCell;
use core::ptr::{self, NonNull};

use linked_list_allocator::Heap;

use crate::kernel;
use crate::rtos::{RecursiveMutex, Wait};

/// An allocator that is not safe to enter concurrently.
pub trait RawAllocator {
    /// # Safety
    /// The caller must hold the allocator lock.
    unsafe fn allocate(&self, layout: Layout) -> *mut u8;

    /// # Safety
    /// The caller must hold the allocator lock, and `ptr` must come from
    /// [`allocate`](Self::allocate) with the same `layout`.
    unsafe fn release(&self, ptr: *mut u8, layout: Layout);
}

/// Called after an allocation of `layout` failed.
pub type AllocFailedHook = fn(Layout);

/// Default failure hook: report the request and halt.
pub fn halt_on_alloc_failure(layout: Layout) {
    kernel::port().fatal(format_args!(
        "out of memory allocating {} bytes (align {})",
        layout.size(),
        layout.align()
    ))
}

pub struct LockedAllocator<L, A> {
    lock: L,
    inner: A,
    on_failure: AllocFailedHook,
}

impl<L: RecursiveMutex, A: RawAllocator> LockedAllocator<L, A> {
    pub const fn new(lock: L, inner: A) -> Self {
        Self::with_failure_hook(lock, inner, halt_on_alloc_failure)
    }

    pub const fn with_failure_hook(lock: L, inner: A, on_failure: AllocFailedHook) -> Self {
        Self {
            lock,
            inner,
            on_failure,
        }
    }

    pub fn inner(&self) -> &A {
        &self.inner
    }

    fn lock(&self) {
        if !self.lock.take_recursive(Wait::Forever) {
            kernel::port().fatal(format_args!("cannot take the allocator lock"));
        }
    }

    fn unlock(&self) {
        let released = self.lock.give_recursive();
        debug_assert!(released, "allocator lock released by a non-owner");
    }
}

unsafe impl<L: RecursiveMutex, A: RawAllocator> GlobalAlloc for LockedAllocator<L, A> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.lock();
        let ptr = self.inner.allocate(layout);
        self.unlock();

        if ptr.is_null() {
            (self.on_failure)(layout);
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        self.lock();
        self.inner.release(ptr, layout);
        self.unlock();
    }
}

// ---------------------------------------------------------------------------
// Free-list heap
// ---------------------------------------------------------------------------

/// Heap storage, aligned so that the first block can serve any alignment up
/// to 16 bytes.
#[repr(C, align(16))]
struct Arena<const N: usize>([u8; N]);

/// First-fit heap over an `N`-byte static arena.
pub struct FreeListHeap<const N: usize> {
    heap: UnsafeCell<Heap>,
    initialized: UnsafeCell<bool>,
    arena: UnsafeCell<Arena<N>>,
}

// Safety: all access goes through `RawAllocator`, whose callers hold the
// allocator lock.
unsafe impl<const N: usize> Sync for FreeListHeap<N> {}

impl<const N: usize> FreeListHeap<N> {
    pub const fn new() -> Self {
        Self {
            heap: UnsafeCell::new(Heap::empty()),
            initialized: UnsafeCell::new(false),
            arena: UnsafeCell::new(Arena([0; N])),
        }
    }

    /// The heap, initialised over the arena on first use. The arena must
    /// not move afterwards, which holds for the statics this type is meant
    /// for.
    ///
    /// # Safety
    /// The caller must hold the allocator lock.
    unsafe fn heap(&self) -> &mut Heap {
        let heap = &mut *self.heap.get();
        let initialized = &mut *self.initialized.get();
        if !*initialized {
            let arena = &mut *self.arena.get();
            heap.init(arena.0.as_mut_ptr(), N);
            *initialized = true;
        }
        heap
    }

    /// Bytes currently handed out.
    ///
    /// # Safety
    /// The caller must hold the allocator lock.
    pub unsafe fn used(&self) -> usize {
        self.heap().used()
    }
}

impl<const N: usize> Default for FreeListHeap<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> RawAllocator for FreeListHeap<N> {
    unsafe fn allocate(&self, layout: Layout) -> *mut u8 {
        self.heap()
            .allocate_first_fit(layout)
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn release(&self, ptr: *mut u8, layout: Layout) {
        if let Some(ptr) = NonNull::new(ptr) {
            self.heap().deallocate(ptr, layout);
        }
    }
}
