//! A blocking mutex with tracked ownership.
//!
//! Deliberately cheap: no priority inheritance, no recursion. Waiters
//! queue in priority order (FIFO among equals) and release hands
//! ownership straight to the head waiter, so there is never a window
//! where the mutex is free while threads wait. Releasing a mutex the
//! caller does not own, or re-acquiring one it already holds, reports
//! `InvalidState`.
//!
//! A mutex must outlive every thread waiting on it and must not be moved
//! while any thread waits; place it in a static or other stable storage.

use crate::cell::LockedCell;
use crate::error::{Error, Result};
use crate::kernel::exception::RuntimeError;
use crate::kernel::sched::{self, WaitList};
use crate::kernel::thread::{Tcb, WakeReason};
use crate::kernel::{hal, irq, tick};
use crate::runtime_error;
use crate::sync::interrupt_lock::InterruptLock;
use crate::time::Timeout;
use core::ptr::NonNull;

pub struct Mutex {
    owner: LockedCell<Option<NonNull<Tcb>>>,
    waiters: WaitList,
}

unsafe impl Send for Mutex {}
unsafe impl Sync for Mutex {}

enum Step {
    Done(Result<()>),
    Wait,
}

impl Mutex {
    pub const fn new() -> Mutex {
        Mutex {
            owner: LockedCell::new(None),
            waiters: WaitList::new(),
        }
    }

    /// Acquire the mutex, blocking up to `timeout`.
    ///
    /// Interrupt handlers must not call this; doing so is fatal.
    pub fn acquire(&self, timeout: Timeout) -> Result<()> {
        if irq::in_interrupt() {
            runtime_error!(RuntimeError::BlockingInInterrupt);
        }

        let me = InterruptLock::with(|key| sched::current_tcb(key));
        let deadline = InterruptLock::with(|key| timeout.deadline(tick::current_tick_locked(key)));

        loop {
            let step = InterruptLock::with(|key| {
                let t = unsafe { me.as_ref() };
                match t.wake.get(key) {
                    WakeReason::Signaled => {
                        // Release handed us the mutex while we slept.
                        t.wake.set(key, WakeReason::None);
                        debug_assert_eq!(self.owner.get(key), Some(me));
                        return Step::Done(Ok(()));
                    }
                    WakeReason::TimedOut => {
                        t.wake.set(key, WakeReason::None);
                        return Step::Done(Err(Error::Timeout));
                    }
                    WakeReason::None => {}
                }

                match self.owner.get(key) {
                    None => {
                        self.owner.set(key, Some(me));
                        Step::Done(Ok(()))
                    }
                    Some(owner) if owner == me => Step::Done(Err(Error::InvalidState)),
                    Some(_) => {
                        if timeout == Timeout::Poll {
                            return Step::Done(Err(Error::WouldBlock));
                        }
                        let ticks = match deadline {
                            Some(deadline) => {
                                let now = tick::current_tick_locked(key);
                                if deadline <= now {
                                    return Step::Done(Err(Error::Timeout));
                                }
                                Some(deadline - now)
                            }
                            None => None,
                        };
                        sched::block_current_on(
                            key,
                            me,
                            self.waiters.as_ptr(),
                            self as *const _ as *const (),
                            ticks,
                        );
                        Step::Wait
                    }
                }
            });

            match step {
                Step::Done(result) => return result,
                Step::Wait => hal::reschedule_point(),
            }
        }
    }

    /// Acquire without blocking; `WouldBlock` if the mutex is held.
    pub fn try_acquire(&self) -> Result<()> {
        self.acquire(Timeout::Poll)
    }

    /// Release the mutex, handing it to the highest-priority waiter if
    /// one exists. Only the owner may release.
    pub fn release(&self) -> Result<()> {
        InterruptLock::with(|key| {
            let me = sched::current_tcb(key);
            if self.owner.get(key) != Some(me) {
                return Err(Error::InvalidState);
            }
            match self.waiters.pop_front(key) {
                Some(next) => {
                    // Ownership transfers before the waiter runs; no
                    // window where the mutex is free with waiters queued.
                    self.owner.set(key, Some(next));
                    sched::wake(key, next, WakeReason::Signaled);
                }
                None => self.owner.set(key, None),
            }
            Ok(())
        })
    }

    /// Whether the calling thread holds the mutex.
    pub fn is_held_by_current(&self) -> bool {
        InterruptLock::with(|key| self.owner.get(key) == Some(sched::current_tcb(key)))
    }
}

impl Default for Mutex {
    fn default() -> Mutex {
        Mutex::new()
    }
}
