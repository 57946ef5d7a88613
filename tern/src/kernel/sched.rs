//! The scheduler.
//!
//! Ready threads sit on per-priority FIFO sublists; a bitmap of non-empty
//! levels makes next-to-run selection a `trailing_zeros`. The running
//! thread is never on the ready queue — it is the one the `current`
//! pointer names — so every thread is on at most one list at any time.
//!
//! Scheduling decisions happen in two halves. Kernel paths change thread
//! state (ready a thread, block the caller, rotate a quantum) and pend
//! the context-switch interrupt; the switch handler then calls
//! [`switch_context`], which picks the next thread, files the outgoing
//! one, and swaps stack pointers. The switch interrupt has the lowest
//! priority in the system, so by the time it runs every other handler
//! has finished and the decision it takes is final.

use crate::cell::RacyCell;
use crate::kernel::exception::RuntimeError;
use crate::kernel::list::List;
use crate::kernel::thread::{Priority, RunQueueTag, Tcb, ThreadState, WakeReason};
use crate::kernel::{hal, timer, NUM_PRIORITIES, QUANTUM_TICKS};
use crate::runtime_error;
use crate::sync::interrupt_lock::{IntKey, InterruptLock};
use core::cell::UnsafeCell;
use core::ptr::NonNull;

pub(crate) struct ReadyQueue {
    bitmap: u32,
    level: [List<Tcb, RunQueueTag>; NUM_PRIORITIES],
}

impl ReadyQueue {
    const fn new() -> ReadyQueue {
        ReadyQueue {
            bitmap: 0,
            level: [const { List::new() }; NUM_PRIORITIES],
        }
    }

    fn push_back(&mut self, key: IntKey<'_>, tcb: NonNull<Tcb>) {
        let prio = unsafe { tcb.as_ref() }.priority.get(key) as usize;
        self.level[prio].push_back(tcb);
        self.bitmap |= 1 << prio;
    }

    fn remove(&mut self, key: IntKey<'_>, tcb: NonNull<Tcb>) {
        let prio = unsafe { tcb.as_ref() }.priority.get(key) as usize;
        self.level[prio].remove(tcb);
        if self.level[prio].is_empty() {
            self.bitmap &= !(1 << prio);
        }
    }

    /// Priority of the best ready thread, if any.
    fn top_priority(&self) -> Option<Priority> {
        if self.bitmap == 0 {
            None
        } else {
            Some(self.bitmap.trailing_zeros() as Priority)
        }
    }

    fn pop_level(&mut self, prio: Priority) -> Option<NonNull<Tcb>> {
        let tcb = self.level[prio as usize].pop_front();
        if self.level[prio as usize].is_empty() {
            self.bitmap &= !(1 << prio);
        }
        tcb
    }

    fn level_len(&self, prio: Priority) -> usize {
        self.level[prio as usize].len()
    }
}

pub(crate) struct Scheduler {
    ready: ReadyQueue,
    current: Option<NonNull<Tcb>>,
    idle: Option<NonNull<Tcb>>,
    reap: List<Tcb, RunQueueTag>,
}

impl Scheduler {
    const fn new() -> Scheduler {
        Scheduler {
            ready: ReadyQueue::new(),
            current: None,
            idle: None,
            reap: List::new(),
        }
    }
}

static SCHEDULER: RacyCell<Scheduler> = RacyCell::new(Scheduler::new());

fn sched(_key: IntKey<'_>) -> &'static mut Scheduler {
    unsafe { SCHEDULER.get_mut() }
}

/// The running thread's TCB. Panics before the scheduler has a current
/// thread.
pub(crate) fn current_tcb(key: IntKey<'_>) -> NonNull<Tcb> {
    sched(key).current.expect("scheduler not started")
}

pub(crate) fn set_idle(key: IntKey<'_>, tcb: NonNull<Tcb>) {
    let s = sched(key);
    s.idle = Some(tcb);
    // The idle thread is always ready but never queued.
    unsafe { tcb.as_ref() }.state.set(key, ThreadState::Ready);
}

/// Make `tcb` ready and preempt the running thread if it is outranked.
pub(crate) fn insert_ready(key: IntKey<'_>, tcb: NonNull<Tcb>) {
    let s = sched(key);
    let t = unsafe { tcb.as_ref() };
    t.state.set(key, ThreadState::Ready);
    if s.idle == Some(tcb) {
        return;
    }
    s.ready.push_back(key, tcb);
    preempt_check(key);
}

/// Move a Ready thread to a new priority level, keeping FIFO order at the
/// destination.
pub(crate) fn requeue_ready(key: IntKey<'_>, tcb: NonNull<Tcb>, new: Priority) {
    let s = sched(key);
    s.ready.remove(key, tcb);
    unsafe { tcb.as_ref() }.priority.set(key, new);
    if s.idle == Some(tcb) {
        return;
    }
    s.ready.push_back(key, tcb);
    preempt_check(key);
}

/// Pend a switch if a ready thread outranks the running one.
pub(crate) fn preempt_check(key: IntKey<'_>) {
    let s = sched(key);
    let Some(cur) = s.current else {
        return;
    };
    let cur_prio = unsafe { cur.as_ref() }.priority.get(key);
    match s.ready.top_priority() {
        Some(top) if top < cur_prio => hal::request_switch(),
        _ => {}
    }
}

/// Block the running thread on `wait_list`, ordered by priority with FIFO
/// among equals, optionally arming its timeout timer.
pub(crate) fn block_current_on(
    key: IntKey<'_>,
    me: NonNull<Tcb>,
    wait_list: *mut List<Tcb, RunQueueTag>,
    wait_object: *const (),
    timeout_ticks: Option<u64>,
) {
    let s = sched(key);
    if s.idle == Some(me) {
        runtime_error!(RuntimeError::IdleThreadViolation);
    }

    let t = unsafe { me.as_ref() };
    t.state.set(key, ThreadState::Blocked);
    t.wait_object.set(key, wait_object);

    let prio = t.priority.get(key);
    unsafe { &mut *wait_list }.insert_by(me, |queued| queued.priority.get(key) <= prio);

    if let Some(ticks) = timeout_ticks {
        timer::arm(key, &t.timer, ticks.max(1), 0);
    }
    hal::request_switch();
}

/// Move a blocked or sleeping thread back to Ready, recording why.
pub(crate) fn wake(key: IntKey<'_>, tcb: NonNull<Tcb>, reason: WakeReason) {
    let t = unsafe { tcb.as_ref() };
    match t.state.get(key) {
        ThreadState::Blocked => t.run_link.unlink(),
        ThreadState::Sleeping => {}
        // Ready, Running, Terminated: nothing to wake.
        _ => return,
    }
    timer::cancel(key, &t.timer);
    t.wake.set(key, reason);
    t.wait_object.set(key, core::ptr::null());
    insert_ready(key, tcb);
}

/// Round-robin rotation: let an equal-priority peer run, if one is ready.
pub(crate) fn yield_current(key: IntKey<'_>) {
    let s = sched(key);
    let Some(cur) = s.current else {
        return;
    };
    let prio = unsafe { cur.as_ref() }.priority.get(key);
    if matches!(s.ready.top_priority(), Some(top) if top <= prio) {
        hal::request_switch();
    }
}

/// Per-tick quantum accounting for the running thread.
pub(crate) fn quantum_tick(key: IntKey<'_>) {
    let s = sched(key);
    let Some(cur) = s.current else {
        return;
    };
    if s.idle == Some(cur) {
        return;
    }
    let t = unsafe { cur.as_ref() };
    if t.state.get(key) != ThreadState::Running {
        return;
    }
    let quantum = t.quantum.get(key).saturating_sub(1);
    t.quantum.set(key, quantum);
    if quantum == 0 {
        t.quantum.set(key, QUANTUM_TICKS);
        // Rotate only if a peer exists at this priority.
        if s.ready.level_len(t.priority.get(key)) > 0 {
            hal::request_switch();
        }
    }
}

pub(crate) fn push_reap(key: IntKey<'_>, tcb: NonNull<Tcb>) {
    sched(key).reap.push_back(tcb);
}

pub(crate) fn pop_reap(key: IntKey<'_>) -> Option<NonNull<Tcb>> {
    sched(key).reap.pop_front()
}

/// Select and install the next thread to run. Called from the context
/// switch interrupt with the outgoing stack pointer; returns the stack
/// pointer to resume.
fn switch_context(key: IntKey<'_>, old_sp: *mut u8) -> *mut u8 {
    use tern_khal::ContextFrame;

    let s = sched(key);
    let Some(cur) = s.current else {
        return old_sp;
    };
    let cur_t = unsafe { cur.as_ref() };

    if cur_t.state.get(key) != ThreadState::Terminated {
        if !old_sp.is_null() {
            unsafe { (*cur_t.context_ptr()).set_stack_top(old_sp) };
        }
        if !cur_t.stack.is_alive() {
            runtime_error!(RuntimeError::StackOverflow);
        }
    }

    let cur_runnable = cur_t.state.get(key) == ThreadState::Running;
    let cur_prio = cur_t.priority.get(key);

    let next = match s.ready.top_priority() {
        Some(top) if !cur_runnable || top <= cur_prio => s.ready.pop_level(top),
        _ => {
            if cur_runnable {
                None
            } else {
                s.idle
            }
        }
    };

    let Some(next) = next else {
        // Nothing better to run; keep the current thread.
        return old_sp;
    };

    if next == cur {
        // The current thread was re-readied (woken before the switch
        // executed); just keep running it.
        cur_t.state.set(key, ThreadState::Running);
        cur_t.quantum.set(key, QUANTUM_TICKS);
        return old_sp;
    }

    if cur_runnable {
        cur_t.state.set(key, ThreadState::Ready);
        if s.idle != Some(cur) {
            s.ready.push_back(key, cur);
        }
    }

    let next_t = unsafe { next.as_ref() };
    next_t.state.set(key, ThreadState::Running);
    next_t.quantum.set(key, QUANTUM_TICKS);
    s.current = Some(next);

    unsafe { (*next_t.context_ptr()).stack_top() }
}

#[no_mangle]
pub extern "C" fn _tern_switch_context(old_sp: *mut u8) -> *mut u8 {
    InterruptLock::with(|key| switch_context(key, old_sp))
}

/// Start scheduling: install the best ready thread (or idle) as current
/// and launch it. Never returns.
pub(crate) fn start() -> ! {
    let context = InterruptLock::with(|key| {
        let s = sched(key);
        let first = match s.ready.top_priority() {
            Some(top) => s.ready.pop_level(top).unwrap(),
            None => s.idle.expect("no idle thread"),
        };
        let t = unsafe { first.as_ref() };
        t.state.set(key, ThreadState::Running);
        t.quantum.set(key, QUANTUM_TICKS);
        s.current = Some(first);
        t.context_ptr()
    });
    hal::start_tick();
    hal::start_first_thread(context)
}

/// Make `tcb` the current thread directly, filing the previous current
/// thread as ready. Host test support only.
#[cfg(any(test, feature = "khal-host"))]
pub(crate) fn adopt(key: IntKey<'_>, tcb: NonNull<Tcb>) {
    let s = sched(key);
    if let Some(prev) = s.current {
        let prev_t = unsafe { prev.as_ref() };
        if prev_t.state.get(key) == ThreadState::Running {
            prev_t.state.set(key, ThreadState::Ready);
            if s.idle != Some(prev) {
                s.ready.push_back(key, prev);
            }
        }
    }
    s.ready.remove(key, tcb);
    let t = unsafe { tcb.as_ref() };
    t.state.set(key, ThreadState::Running);
    t.quantum.set(key, QUANTUM_TICKS);
    s.current = Some(tcb);
}

/// Tear down all scheduler state, freeing every thread it still owns.
/// Host test support only.
#[cfg(any(test, feature = "khal-host"))]
pub(crate) fn reset(key: IntKey<'_>) {
    use crate::kernel::thread::destroy_tcb;

    let s = sched(key);
    for prio in 0..NUM_PRIORITIES {
        while let Some(tcb) = s.ready.pop_level(prio as Priority) {
            timer::cancel(key, &unsafe { tcb.as_ref() }.timer);
            unsafe { destroy_tcb(tcb) };
        }
    }
    while let Some(tcb) = s.reap.pop_front() {
        unsafe { destroy_tcb(tcb) };
    }
    if let Some(cur) = s.current.take() {
        timer::cancel(key, &unsafe { cur.as_ref() }.timer);
        unsafe { destroy_tcb(cur) };
    }
    if let Some(idle) = s.idle.take() {
        timer::cancel(key, &unsafe { idle.as_ref() }.timer);
        unsafe { destroy_tcb(idle) };
    }
}

/// Number of ready threads at `prio`. Host test support only.
#[cfg(any(test, feature = "khal-host"))]
pub(crate) fn ready_len(key: IntKey<'_>, prio: Priority) -> usize {
    sched(key).ready.level_len(prio)
}

/// Shared-list wrapper for the blocked lists inside sync objects. The
/// list is only touched under the kernel critical section.
pub(crate) struct WaitList(UnsafeCell<List<Tcb, RunQueueTag>>);

unsafe impl Send for WaitList {}
unsafe impl Sync for WaitList {}

impl WaitList {
    pub const fn new() -> WaitList {
        WaitList(UnsafeCell::new(List::new()))
    }

    pub fn as_ptr(&self) -> *mut List<Tcb, RunQueueTag> {
        self.0.get()
    }

    pub fn pop_front(&self, _key: IntKey<'_>) -> Option<NonNull<Tcb>> {
        unsafe { &mut *self.0.get() }.pop_front()
    }
}
