//! tern — a small preemptive real-time kernel for Cortex-M4 class
//! microcontrollers.
//!
//! The kernel provides priority-scheduled threads with round-robin within
//! a priority band, mutexes, events and message queues, tick-driven
//! delays and timers, a software interrupt dispatch table, and a dynamic
//! heap serving kernel metadata and user allocations alike. Board support
//! and device drivers sit on top, consuming only the [`device`] contract,
//! the IRQ registry, the blocking primitives, and the heap.
//!
//! Bring-up from a reset handler:
//!
//! ```no_run
//! fn app_main(_arg: *mut ()) {
//!     // threads, drivers, timers...
//! }
//!
//! fn reset() -> ! {
//!     tern::kernel::start("main", 4, 4096, app_main, core::ptr::null_mut())
//! }
//! ```

#![cfg_attr(not(test), no_std)]

pub(crate) mod cell;

#[macro_use]
pub mod kernel;

pub mod device;
pub mod error;
pub mod sync;
pub mod time;

pub use error::{Error, Result};
pub use kernel::hal::TICK_HZ;
pub use kernel::irq::{in_interrupt, irq_disable, irq_enable, irq_register};
pub use kernel::thread::{exit, sleep, yield_now, Priority, Thread, ThreadInfo, ThreadState};
pub use kernel::tick::current_tick;
pub use kernel::timer::Timer;
pub use kernel::heap::{HeapStats, KernelAllocator};

pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::kernel::thread::{exit, sleep, yield_now, Priority, Thread};
    pub use crate::sync::{Event, Mutex, Queue};
    pub use crate::time::{Duration, Instant, Timeout};
}
