//! The system tick.
//!
//! One hardware timer interrupt per tick drives all kernel time: the tick
//! counter, the timer delta list, and the running thread's round-robin
//! quantum. Anything the tick makes runnable is picked up by the context
//! switch the tick pends on its way out.

use crate::cell::LockedCell;
use crate::kernel::{irq, sched, timer};
use crate::sync::interrupt_lock::{IntKey, InterruptLock};

static TICK_COUNT: LockedCell<u64> = LockedCell::new(0);

/// Ticks since the kernel started.
pub fn current_tick() -> u64 {
    InterruptLock::with(|key| TICK_COUNT.get(key))
}

pub(crate) fn current_tick_locked(key: IntKey<'_>) -> u64 {
    TICK_COUNT.get(key)
}

/// Rewind time to zero. Host test support only.
#[cfg(any(test, feature = "khal-host"))]
pub(crate) fn reset(key: IntKey<'_>) {
    TICK_COUNT.set(key, 0);
}

#[no_mangle]
pub extern "C" fn _tern_tick_isr() {
    irq::isr_enter();
    InterruptLock::with(|key| {
        TICK_COUNT.set(key, TICK_COUNT.get(key) + 1);
        timer::tick(key);
        sched::quantum_tick(key);
    });
    irq::isr_exit();
}
