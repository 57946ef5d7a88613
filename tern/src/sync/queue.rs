//! Bounded message queues.
//!
//! A queue is a fixed ring of `capacity` slots, each `size_of::<T>()`
//! bytes, allocated from the kernel heap. Producers block when the ring
//! is full, consumers when it is empty, each on their own priority-ordered
//! list; every enqueue wakes exactly one consumer and every dequeue
//! exactly one producer. Receives observe sends in FIFO order.
//!
//! The non-blocking `try_send`/`try_recv` are interrupt-safe; blocking
//! from interrupt context is fatal. The queue's storage is heap-pinned,
//! so the `Queue` handle itself may move freely.

use crate::error::{Error, Result};
use crate::kernel::exception::RuntimeError;
use crate::kernel::list::List;
use crate::kernel::sched;
use crate::kernel::thread::{RunQueueTag, Tcb, WakeReason};
use crate::kernel::{hal, heap, irq, tick};
use crate::runtime_error;
use crate::sync::interrupt_lock::{IntKey, InterruptLock};
use crate::time::Timeout;
use core::marker::PhantomData;
use core::ptr::NonNull;

#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum TryRecvError {
    Empty,
}

#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum TrySendError<T> {
    Full(T),
}

struct Inner {
    buf: *mut u8,
    capacity: usize,
    slot_size: usize,
    head: usize,
    tail: usize,
    count: usize,
    senders: List<Tcb, RunQueueTag>,
    receivers: List<Tcb, RunQueueTag>,
}

pub struct Queue<T> {
    inner: NonNull<Inner>,
    _marker: PhantomData<T>,
}

unsafe impl<T: Send> Send for Queue<T> {}
unsafe impl<T: Send> Sync for Queue<T> {}

enum Step<R> {
    Done(R),
    Wait,
}

impl<T> Queue<T> {
    /// Create a queue of `capacity` slots on the kernel heap.
    pub fn create(capacity: usize) -> Result<Queue<T>> {
        if capacity == 0 || core::mem::align_of::<T>() > heap::HEAP_ALIGN {
            return Err(Error::InvalidArgument);
        }

        let slot_size = core::mem::size_of::<T>();
        let buf = if slot_size == 0 {
            core::ptr::null_mut()
        } else {
            match heap::alloc(capacity * slot_size) {
                Some(p) => p.as_ptr(),
                None => return Err(Error::OutOfMemory),
            }
        };

        let inner = match heap::alloc(core::mem::size_of::<Inner>()) {
            Some(p) => p.cast::<Inner>(),
            None => {
                if let Some(p) = NonNull::new(buf) {
                    let _ = unsafe { heap::free(p) };
                }
                return Err(Error::OutOfMemory);
            }
        };

        unsafe {
            inner.as_ptr().write(Inner {
                buf,
                capacity,
                slot_size,
                head: 0,
                tail: 0,
                count: 0,
                senders: List::new(),
                receivers: List::new(),
            });
        }

        Ok(Queue {
            inner,
            _marker: PhantomData,
        })
    }

    fn inner(&self, _key: IntKey<'_>) -> &mut Inner {
        unsafe { &mut *self.inner.as_ptr() }
    }

    fn slot(inner: &Inner, index: usize) -> *mut T {
        if inner.slot_size == 0 {
            NonNull::dangling().as_ptr()
        } else {
            unsafe { inner.buf.add(index * inner.slot_size) as *mut T }
        }
    }

    fn enqueue(inner: &mut Inner, key: IntKey<'_>, item: T) {
        unsafe { Self::slot(inner, inner.tail).write(item) };
        inner.tail = (inner.tail + 1) % inner.capacity;
        inner.count += 1;
        if let Some(waiter) = inner.receivers.pop_front() {
            sched::wake(key, waiter, WakeReason::Signaled);
        }
    }

    fn dequeue(inner: &mut Inner, key: IntKey<'_>) -> T {
        let item = unsafe { Self::slot(inner, inner.head).read() };
        inner.head = (inner.head + 1) % inner.capacity;
        inner.count -= 1;
        if let Some(waiter) = inner.senders.pop_front() {
            sched::wake(key, waiter, WakeReason::Signaled);
        }
        item
    }

    /// Send `item`, blocking up to `timeout` while the queue is full. The
    /// item is dropped if the operation fails.
    pub fn send(&self, item: T, timeout: Timeout) -> Result<()> {
        let mut item = Some(item);
        let me = InterruptLock::with(|key| sched::current_tcb(key));
        let deadline = InterruptLock::with(|key| timeout.deadline(tick::current_tick_locked(key)));

        loop {
            let step = InterruptLock::with(|key| {
                let t = unsafe { me.as_ref() };
                match t.wake.get(key) {
                    WakeReason::TimedOut => {
                        t.wake.set(key, WakeReason::None);
                        return Step::Done(Err(Error::Timeout));
                    }
                    // A dequeue signalled free space; re-check the count.
                    _ => t.wake.set(key, WakeReason::None),
                }

                let inner = self.inner(key);
                if inner.count < inner.capacity {
                    Self::enqueue(inner, key, item.take().unwrap());
                    return Step::Done(Ok(()));
                }

                if timeout == Timeout::Poll {
                    return Step::Done(Err(Error::WouldBlock));
                }
                if irq::in_interrupt() {
                    runtime_error!(RuntimeError::BlockingInInterrupt);
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
                    &mut inner.senders as *mut _,
                    self.inner.as_ptr() as *const (),
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

    /// Receive the oldest item, blocking up to `timeout` while the queue
    /// is empty.
    pub fn recv(&self, timeout: Timeout) -> Result<T> {
        let me = InterruptLock::with(|key| sched::current_tcb(key));
        let deadline = InterruptLock::with(|key| timeout.deadline(tick::current_tick_locked(key)));

        loop {
            let step = InterruptLock::with(|key| {
                let t = unsafe { me.as_ref() };
                match t.wake.get(key) {
                    WakeReason::TimedOut => {
                        t.wake.set(key, WakeReason::None);
                        return Step::Done(Err(Error::Timeout));
                    }
                    // An enqueue signalled data; re-check the count.
                    _ => t.wake.set(key, WakeReason::None),
                }

                let inner = self.inner(key);
                if inner.count > 0 {
                    return Step::Done(Ok(Self::dequeue(inner, key)));
                }

                if timeout == Timeout::Poll {
                    return Step::Done(Err(Error::WouldBlock));
                }
                if irq::in_interrupt() {
                    runtime_error!(RuntimeError::BlockingInInterrupt);
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
                    &mut inner.receivers as *mut _,
                    self.inner.as_ptr() as *const (),
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

    /// Enqueue without blocking; hands the item back when full. Safe from
    /// interrupt context.
    pub fn try_send(&self, item: T) -> core::result::Result<(), TrySendError<T>> {
        InterruptLock::with(|key| {
            let inner = self.inner(key);
            if inner.count == inner.capacity {
                return Err(TrySendError::Full(item));
            }
            Self::enqueue(inner, key, item);
            Ok(())
        })
    }

    /// Dequeue without blocking. Safe from interrupt context.
    pub fn try_recv(&self) -> core::result::Result<T, TryRecvError> {
        InterruptLock::with(|key| {
            let inner = self.inner(key);
            if inner.count == 0 {
                return Err(TryRecvError::Empty);
            }
            Ok(Self::dequeue(inner, key))
        })
    }

    pub fn capacity(&self) -> usize {
        InterruptLock::with(|key| self.inner(key).capacity)
    }

    pub fn len(&self) -> usize {
        InterruptLock::with(|key| self.inner(key).count)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        InterruptLock::with(|key| {
            let inner = self.inner(key);
            inner.count == inner.capacity
        })
    }
}

impl<T> Drop for Queue<T> {
    fn drop(&mut self) {
        InterruptLock::with(|_key| {
            let inner = unsafe { &mut *self.inner.as_ptr() };
            while inner.count > 0 {
                let item = unsafe { Self::slot(inner, inner.head).read() };
                inner.head = (inner.head + 1) % inner.capacity;
                inner.count -= 1;
                drop(item);
            }
        });
        unsafe {
            if let Some(buf) = NonNull::new(self.inner.as_ref().buf) {
                let _ = heap::free(buf);
            }
            let _ = heap::free(self.inner.cast());
        }
    }
}
