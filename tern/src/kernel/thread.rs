//! Threads.
//!
//! A thread is a TCB and a stack, both allocated from the kernel heap at
//! creation and returned to it after exit by the idle thread's reaper.
//! The TCB embeds the intrusive node that carries the thread through the
//! ready queue or a wait list — never both — plus a timer entry that
//! serves sleeps and every timed-out blocking operation.

use crate::cell::LockedCell;
use crate::error::{Error, Result};
use crate::kernel::exception::RuntimeError;
use crate::kernel::list::{impl_linked, ListTag, Node};
use crate::kernel::stack::StackRegion;
use crate::kernel::timer::{TimerAction, TimerEntry};
use crate::kernel::{hal, heap, irq, sched, timer, NUM_PRIORITIES};
use crate::runtime_error;
use crate::sync::interrupt_lock::InterruptLock;
use crate::time::Duration;
use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::ptr::NonNull;
use tern_khal::ContextFrame;

/// Thread priority; 0 is the highest, `NUM_PRIORITIES - 1` the idle
/// level.
pub type Priority = u8;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ThreadState {
    /// Queued on the ready queue, waiting to be selected.
    Ready,

    /// The one thread currently executing.
    Running,

    /// Parked on a wait object's blocked list.
    Blocked,

    /// Off every queue until its wakeup time.
    Sleeping,

    /// Exited; awaiting the reaper.
    Terminated,
}

/// Why a blocked or sleeping thread was made ready again.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum WakeReason {
    None,
    /// A release path handed the thread whatever it was waiting for.
    Signaled,
    /// Its timeout fired first.
    TimedOut,
}

pub struct RunQueueTag;

impl ListTag for RunQueueTag {}

#[repr(C)]
pub(crate) struct Tcb {
    pub(crate) name: &'static str,
    pub(crate) priority: LockedCell<Priority>,
    pub(crate) state: LockedCell<ThreadState>,
    pub(crate) quantum: LockedCell<u32>,
    pub(crate) wake: LockedCell<WakeReason>,

    /// The object this thread is blocked on; null unless `Blocked`.
    pub(crate) wait_object: LockedCell<*const ()>,

    entry: fn(*mut ()),
    arg: *mut (),

    pub(crate) stack: StackRegion,
    context: UnsafeCell<MaybeUninit<hal::Context>>,

    /// Wakeup entry on the kernel delta list, for sleeps and wait
    /// timeouts.
    pub(crate) timer: TimerEntry,

    /// Carries the thread through the ready queue or one wait list.
    pub(crate) run_link: Node<Tcb, RunQueueTag>,
}

impl_linked!(run_link, Tcb, RunQueueTag);

impl Tcb {
    pub(crate) fn context_ptr(&self) -> *mut hal::Context {
        unsafe { (*self.context.get()).as_mut_ptr() }
    }
}

/// Allocate and initialize a TCB without scheduling it.
pub(crate) fn create_tcb(
    name: &'static str,
    priority: Priority,
    stack_size: usize,
    entry: fn(*mut ()),
    arg: *mut (),
) -> Result<NonNull<Tcb>> {
    if priority as usize >= NUM_PRIORITIES {
        return Err(Error::InvalidArgument);
    }
    let stack = StackRegion::alloc(stack_size)?;

    let raw = match heap::alloc(core::mem::size_of::<Tcb>()) {
        Some(raw) => raw,
        None => {
            unsafe { stack.release() };
            return Err(Error::OutOfMemory);
        }
    };
    let tcb = raw.cast::<Tcb>();

    unsafe {
        tcb.as_ptr().write(Tcb {
            name,
            priority: LockedCell::new(priority),
            state: LockedCell::new(ThreadState::Ready),
            quantum: LockedCell::new(crate::kernel::QUANTUM_TICKS),
            wake: LockedCell::new(WakeReason::None),
            wait_object: LockedCell::new(core::ptr::null()),
            entry,
            arg,
            stack,
            context: UnsafeCell::new(MaybeUninit::uninit()),
            timer: TimerEntry::new(),
            run_link: Node::new(),
        });

        let t = tcb.as_ref();
        hal::Context::init(
            thread_springboard,
            tcb.as_ptr() as *mut (),
            t.stack.top(),
            t.context_ptr(),
        );
    }

    InterruptLock::with(|key| {
        unsafe { tcb.as_ref() }
            .timer
            .set_action(key, TimerAction::Wake(tcb));
    });

    Ok(tcb)
}

/// Free a terminated thread's stack and TCB.
///
/// # Safety
///
/// The thread must be off every kernel list and must never run again.
pub(crate) unsafe fn destroy_tcb(tcb: NonNull<Tcb>) {
    unsafe {
        tcb.as_ref().stack.release();
        let _ = heap::free(tcb.cast());
    }
}

extern "C" fn thread_springboard(arg: *mut ()) {
    let tcb = arg as *mut Tcb;
    let (entry, entry_arg) = unsafe { ((*tcb).entry, (*tcb).arg) };
    entry(entry_arg);
    exit();
}

/// Handle to a thread. Copyable; the kernel owns the TCB behind it.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Thread {
    tcb: NonNull<Tcb>,
}

unsafe impl Send for Thread {}
unsafe impl Sync for Thread {}

impl Thread {
    /// Create a thread and make it ready. Preempts the caller immediately
    /// if the new thread has higher priority.
    pub fn create(
        name: &'static str,
        priority: Priority,
        stack_size: usize,
        entry: fn(*mut ()),
        arg: *mut (),
    ) -> Result<Thread> {
        let tcb = create_tcb(name, priority, stack_size, entry, arg)?;
        InterruptLock::with(|key| sched::insert_ready(key, tcb));
        hal::reschedule_point();
        Ok(Thread { tcb })
    }

    /// The calling thread.
    pub fn current() -> Thread {
        InterruptLock::with(|key| Thread {
            tcb: sched::current_tcb(key),
        })
    }

    pub fn name(&self) -> &'static str {
        unsafe { self.tcb.as_ref() }.name
    }

    pub fn state(&self) -> ThreadState {
        InterruptLock::with(|key| unsafe { self.tcb.as_ref() }.state.get(key))
    }

    pub fn priority(&self) -> Priority {
        InterruptLock::with(|key| unsafe { self.tcb.as_ref() }.priority.get(key))
    }

    /// Change the thread's priority, repositioning it in whatever queue
    /// currently holds it.
    pub fn set_priority(&self, new: Priority) -> Result<()> {
        if new as usize >= NUM_PRIORITIES {
            return Err(Error::InvalidArgument);
        }
        InterruptLock::with(|key| {
            let t = unsafe { self.tcb.as_ref() };
            match t.state.get(key) {
                ThreadState::Ready => sched::requeue_ready(key, self.tcb, new),
                ThreadState::Running => {
                    t.priority.set(key, new);
                    sched::preempt_check(key);
                }
                ThreadState::Blocked => {
                    // Reposition within the wait list so release order
                    // keeps following priority.
                    let node = &t.run_link;
                    let list = node.containing_list();
                    node.unlink();
                    t.priority.set(key, new);
                    if let Some(mut list) = list {
                        unsafe { list.as_mut() }.insert_by(self.tcb, |queued| {
                            queued.priority.get(key) <= new
                        });
                    }
                }
                ThreadState::Sleeping | ThreadState::Terminated => {
                    t.priority.set(key, new);
                }
            }
        });
        hal::reschedule_point();
        Ok(())
    }

    /// A consistent snapshot of the thread's descriptive state, for debug
    /// listings.
    pub fn info(&self) -> ThreadInfo {
        InterruptLock::with(|key| {
            let t = unsafe { self.tcb.as_ref() };
            ThreadInfo {
                name: t.name,
                state: t.state.get(key),
                priority: t.priority.get(key),
                stack_size: t.stack.size(),
            }
        })
    }

    pub(crate) fn from_tcb(tcb: NonNull<Tcb>) -> Thread {
        Thread { tcb }
    }

    pub(crate) fn tcb(&self) -> NonNull<Tcb> {
        self.tcb
    }
}

/// Point-in-time description of a thread.
#[derive(Copy, Clone, Debug)]
pub struct ThreadInfo {
    pub name: &'static str,
    pub state: ThreadState,
    pub priority: Priority,
    pub stack_size: usize,
}

impl core::fmt::Debug for Thread {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Thread({})", self.name())
    }
}

/// Give up the processor; equal-priority threads ahead in the ready queue
/// run before the caller does again.
pub fn yield_now() {
    InterruptLock::with(|key| sched::yield_current(key));
    hal::reschedule_point();
}

/// Suspend the calling thread for at least `duration`. A zero duration
/// degenerates to a yield.
pub fn sleep(duration: Duration) {
    let ticks = duration.as_ticks();
    if ticks == 0 {
        return yield_now();
    }
    if irq::in_interrupt() {
        runtime_error!(RuntimeError::BlockingInInterrupt);
    }

    let me = InterruptLock::with(|key| sched::current_tcb(key));
    loop {
        let done = InterruptLock::with(|key| {
            let t = unsafe { me.as_ref() };
            match t.wake.get(key) {
                WakeReason::None => {
                    t.state.set(key, ThreadState::Sleeping);
                    timer::arm(key, &t.timer, ticks, 0);
                    hal::request_switch();
                    false
                }
                _ => {
                    t.wake.set(key, WakeReason::None);
                    true
                }
            }
        });
        if done {
            return;
        }
        hal::reschedule_point();
    }
}

/// Terminate the calling thread. Its stack and TCB are reclaimed by the
/// idle thread.
pub fn exit() -> ! {
    if irq::in_interrupt() {
        runtime_error!(RuntimeError::BlockingInInterrupt);
    }
    InterruptLock::with(|key| {
        let me = sched::current_tcb(key);
        let t = unsafe { me.as_ref() };
        timer::cancel(key, &t.timer);
        t.state.set(key, ThreadState::Terminated);
        sched::push_reap(key, me);
        hal::request_switch();
    });
    loop {
        hal::reschedule_point();
        hal::idle_wait();
    }
}
