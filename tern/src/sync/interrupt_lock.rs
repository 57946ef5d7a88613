//! The kernel critical section.
//!
//! A single global interrupts-disabled region protects every kernel data
//! structure: the ready queue, wait lists, the timer delta list, the heap
//! and the IRQ table. Sections are short and never held across a context
//! switch. Nesting is tracked with a counter so acquisitions compose; the
//! interrupt state saved by the outermost acquisition is the one restored.
//!
//! Holding the lock is witnessed by an [`IntKey`], which the locked-data
//! accessors demand as a parameter. Keys are `Copy` but cannot outlive
//! the section that created them.

use crate::kernel::hal;
use core::marker::PhantomData;
use core::sync::atomic::{AtomicUsize, Ordering};

static LOCK_NESTING: AtomicUsize = AtomicUsize::new(0);

pub struct InterruptLock;

impl InterruptLock {
    pub fn with<R>(f: impl FnOnce(IntKey<'_>) -> R) -> R {
        let restore_state = hal::acquire();
        // Interrupts go off before the count moves so that no window
        // exists where the count says "locked" but interrupts can fire.
        LOCK_NESTING.fetch_add(1, Ordering::Acquire);
        let result = f(unsafe { IntKey::new() });
        if LOCK_NESTING.fetch_sub(1, Ordering::Release) == 1 {
            hal::restore(restore_state);
        }
        result
    }

    /// Current nesting depth; zero when the lock is free.
    pub fn nesting() -> usize {
        LOCK_NESTING.load(Ordering::Relaxed)
    }
}

/// Witness that the kernel critical section is held.
#[derive(Clone, Copy)]
pub struct IntKey<'lock> {
    _private: PhantomData<&'lock ()>,
}

impl IntKey<'_> {
    /// # Safety
    ///
    /// Only valid while interrupts are masked by [`InterruptLock::with`].
    #[inline(always)]
    pub(crate) unsafe fn new() -> Self {
        IntKey {
            _private: PhantomData,
        }
    }
}
