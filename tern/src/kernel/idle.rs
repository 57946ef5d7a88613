//! The idle thread.
//!
//! Always present at the lowest priority and never queued, so the
//! scheduler always has something to run. Between wait-for-interrupt
//! naps it reaps terminated threads, returning their stacks and TCBs to
//! the heap.

use crate::error::Result;
use crate::kernel::thread::{self, Priority, Tcb};
use crate::kernel::{hal, sched, NUM_PRIORITIES};
use crate::sync::interrupt_lock::InterruptLock;
use core::ptr::NonNull;

pub(crate) const IDLE_PRIORITY: Priority = (NUM_PRIORITIES - 1) as Priority;

const IDLE_STACK_SIZE: usize = 1024;

fn idle_main(_arg: *mut ()) {
    loop {
        reap_terminated();
        hal::idle_wait();
    }
}

fn reap_terminated() {
    loop {
        let victim = InterruptLock::with(sched::pop_reap);
        match victim {
            Some(tcb) => unsafe { thread::destroy_tcb(tcb) },
            None => break,
        }
    }
}

pub(crate) fn init() -> Result<NonNull<Tcb>> {
    let tcb = thread::create_tcb(
        "[idle]",
        IDLE_PRIORITY,
        IDLE_STACK_SIZE,
        idle_main,
        core::ptr::null_mut(),
    )?;
    InterruptLock::with(|key| sched::set_idle(key, tcb));
    Ok(tcb)
}
