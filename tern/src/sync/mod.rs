//! Inter-thread synchronisation.
//!
//! Three blocking primitives — [`Mutex`], [`Event`], and [`Queue`] — all
//! interact with the scheduler the same way: blocking inserts the caller
//! into the object's wait list in priority order (FIFO among equals), and
//! every release detaches the head and moves it to Ready. Each accepts a
//! [`Timeout`](crate::time::Timeout): try-once, bounded, or forever.
//!
//! [`InterruptLock`] is the kernel's own critical section; it underpins
//! everything else here.

pub mod event;
pub mod interrupt_lock;
pub mod mutex;
pub mod queue;

pub use event::Event;
pub use interrupt_lock::InterruptLock;
pub use mutex::Mutex;
pub use queue::{Queue, TryRecvError, TrySendError};
