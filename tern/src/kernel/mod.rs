//! The kernel core: scheduler, threads, timers, heap, and interrupt
//! dispatch.

pub mod list;

pub mod exception;
pub(crate) mod hal;
pub mod heap;
pub(crate) mod idle;
pub mod irq;
pub mod printk;
pub(crate) mod sched;
pub(crate) mod stack;
pub mod thread;
pub mod tick;
pub mod timer;

use const_env::from_env;
use thread::{Priority, Thread};

/// Kernel heap arena size in bytes. Override with the `TERN_HEAP_SIZE`
/// build environment variable.
#[from_env("TERN_HEAP_SIZE")]
pub const HEAP_SIZE: usize = 64 * 1024;

/// Number of thread priority levels; level `NUM_PRIORITIES - 1` belongs
/// to the idle thread. Override with `TERN_PRIORITY_LEVELS`.
#[from_env("TERN_PRIORITY_LEVELS")]
pub const NUM_PRIORITIES: usize = 16;

/// Round-robin time slice in ticks. Override with `TERN_QUANTUM_TICKS`.
#[from_env("TERN_QUANTUM_TICKS")]
pub const QUANTUM_TICKS: u32 = 10;

const _: () = assert!(NUM_PRIORITIES >= 2 && NUM_PRIORITIES <= 32);
const _: () = assert!(QUANTUM_TICKS > 0);

/// Bring the kernel up and enter the scheduler. Called from the reset
/// handler before any thread exists; never returns.
///
/// Initialization order: heap, platform (vectors and console), idle
/// thread, the first application thread, then the scheduler, which
/// enables the tick and performs the first context switch.
pub fn start(
    main_name: &'static str,
    main_priority: Priority,
    main_stack_size: usize,
    main_entry: fn(*mut ()),
    main_arg: *mut (),
) -> ! {
    heap::init();
    unsafe { hal::platform_init() };

    if idle::init().is_err() {
        panic!("kernel init: idle thread");
    }
    if Thread::create(main_name, main_priority, main_stack_size, main_entry, main_arg).is_err() {
        panic!("kernel init: main thread");
    }

    sched::start()
}

/// Host-side driving and teardown for the test suite.
#[cfg(feature = "khal-host")]
pub mod test_support {
    use super::{heap, idle, irq, sched, thread, tick, timer};
    use crate::kernel::thread::Thread;
    use crate::sync::interrupt_lock::InterruptLock;
    use tern_khal_host as host;

    /// Reset the kernel to a pristine state with a fresh current thread
    /// named `[test-main]`, standing in for the thread the calling test
    /// is running as.
    ///
    /// Kernel state is process-global; tests using this must be
    /// serialized.
    pub fn init() -> Thread {
        host::bind_kernel(host::KernelEntry {
            tick_isr: tick::_tern_tick_isr,
            irq_isr: irq::_tern_irq_isr,
            switch_context: sched::_tern_switch_context,
        });
        host::clear_reschedule_hook();
        host::run_pending_switch();

        heap::init();
        irq::reset();
        InterruptLock::with(|key| {
            timer::reset(key);
            tick::reset(key);
            sched::reset(key);
        });

        idle::init().expect("idle thread");
        let main = thread::create_tcb(
            "[test-main]",
            8,
            1024,
            |_| {},
            core::ptr::null_mut(),
        )
        .expect("test-main thread");
        InterruptLock::with(|key| sched::adopt(key, main));
        Thread::from_tcb(main)
    }

    /// Make `thread` current, as a completed context switch would.
    pub fn adopt(thread: Thread) {
        InterruptLock::with(|key| sched::adopt(key, thread.tcb()));
    }

    /// Ready-queue depth at `prio`.
    pub fn ready_len(prio: thread::Priority) -> usize {
        InterruptLock::with(|key| sched::ready_len(key, prio))
    }

    /// The running thread, as the scheduler sees it.
    pub fn current() -> Thread {
        InterruptLock::with(|key| Thread::from_tcb(sched::current_tcb(key)))
    }

    /// Sum of deltas on the timer list: distance to the furthest armed
    /// expiry.
    pub fn timer_horizon() -> u64 {
        InterruptLock::with(timer::horizon)
    }
}
