//! Binary events.
//!
//! The default event is auto-reset: a signal wakes exactly the
//! highest-priority waiter (FIFO among equals), and only latches the flag
//! when nobody is waiting; the next waiter then consumes and clears it.
//! The manual-reset variant latches on every signal, wakes all waiters,
//! and stays signalled until `reset`.
//!
//! `signal` is interrupt-safe; `wait` from interrupt context is fatal.
//! An event must outlive and stay in place for every thread waiting on
//! it.

use crate::cell::LockedCell;
use crate::error::{Error, Result};
use crate::kernel::exception::RuntimeError;
use crate::kernel::sched::{self, WaitList};
use crate::kernel::thread::WakeReason;
use crate::kernel::{hal, irq, tick};
use crate::runtime_error;
use crate::sync::interrupt_lock::InterruptLock;
use crate::time::Timeout;

pub struct Event {
    signalled: LockedCell<bool>,
    manual_reset: bool,
    waiters: WaitList,
}

unsafe impl Send for Event {}
unsafe impl Sync for Event {}

enum Step {
    Done(Result<()>),
    Wait,
}

impl Event {
    /// An auto-reset event: each signal satisfies one wait.
    pub const fn new() -> Event {
        Event {
            signalled: LockedCell::new(false),
            manual_reset: false,
            waiters: WaitList::new(),
        }
    }

    /// A manual-reset event: once signalled, every wait succeeds until
    /// `reset`.
    pub const fn new_manual_reset() -> Event {
        Event {
            signalled: LockedCell::new(false),
            manual_reset: true,
            waiters: WaitList::new(),
        }
    }

    /// Wait for the event, blocking up to `timeout`.
    pub fn wait(&self, timeout: Timeout) -> Result<()> {
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
                        t.wake.set(key, WakeReason::None);
                        return Step::Done(Ok(()));
                    }
                    WakeReason::TimedOut => {
                        t.wake.set(key, WakeReason::None);
                        return Step::Done(Err(Error::Timeout));
                    }
                    WakeReason::None => {}
                }

                if self.signalled.get(key) {
                    if !self.manual_reset {
                        self.signalled.set(key, false);
                    }
                    return Step::Done(Ok(()));
                }

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
            });

            match step {
                Step::Done(result) => return result,
                Step::Wait => hal::reschedule_point(),
            }
        }
    }

    /// Consume the event without blocking; `WouldBlock` if unsignalled.
    pub fn try_wait(&self) -> Result<()> {
        self.wait(Timeout::Poll)
    }

    /// Signal the event. Safe from interrupt context.
    pub fn signal(&self) {
        InterruptLock::with(|key| {
            if self.manual_reset {
                self.signalled.set(key, true);
                while let Some(waiter) = self.waiters.pop_front(key) {
                    sched::wake(key, waiter, WakeReason::Signaled);
                }
            } else {
                match self.waiters.pop_front(key) {
                    Some(waiter) => sched::wake(key, waiter, WakeReason::Signaled),
                    None => self.signalled.set(key, true),
                }
            }
        });
    }

    /// Clear the flag. Waiters are unaffected.
    pub fn reset(&self) {
        InterruptLock::with(|key| self.signalled.set(key, false));
    }

    /// Whether the flag is currently latched.
    pub fn is_signalled(&self) -> bool {
        InterruptLock::with(|key| self.signalled.get(key))
    }
}

impl Default for Event {
    fn default() -> Event {
        Event::new()
    }
}
