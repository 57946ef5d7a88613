//! Time events.
//!
//! All pending timeouts live on one delta list: each armed entry stores
//! the tick distance to its predecessor, so advancing time on every tick
//! touches only the head, and the sum of deltas from the head to any
//! entry is its distance from now. Entries either run a callback in the
//! tick interrupt or move a waiting thread back to Ready; sleeping
//! threads and every timed-out blocking operation ride the same list
//! through the timer entry embedded in each TCB.
//!
//! Cancellation folds the entry's delta into its successor, which leaves
//! every other expiry in place.

use crate::cell::{LockedCell, RacyCell};
use crate::error::{Error, Result};
use crate::kernel::list::{impl_linked, List, ListTag, Node};
use crate::kernel::thread::{Tcb, WakeReason};
use crate::kernel::{heap, sched};
use crate::sync::interrupt_lock::{IntKey, InterruptLock};
use crate::time::Duration;
use core::ptr::NonNull;

pub struct TimerListTag;

impl ListTag for TimerListTag {}

#[derive(Copy, Clone)]
pub(crate) enum TimerAction {
    None,
    Callback { func: fn(*mut ()), arg: *mut () },
    Wake(NonNull<Tcb>),
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub(crate) enum TimerState {
    Idle,
    Armed,
    Firing,
}

pub(crate) struct TimerEntry {
    delta: LockedCell<u64>,
    period: LockedCell<u64>,
    state: LockedCell<TimerState>,
    action: LockedCell<TimerAction>,
    link: Node<TimerEntry, TimerListTag>,
}

impl_linked!(link, TimerEntry, TimerListTag);

impl TimerEntry {
    pub const fn new() -> TimerEntry {
        TimerEntry {
            delta: LockedCell::new(0),
            period: LockedCell::new(0),
            state: LockedCell::new(TimerState::Idle),
            action: LockedCell::new(TimerAction::None),
            link: Node::new(),
        }
    }

    pub fn set_action(&self, key: IntKey<'_>, action: TimerAction) {
        self.action.set(key, action);
    }

    pub fn is_armed(&self, key: IntKey<'_>) -> bool {
        self.state.get(key) == TimerState::Armed
    }
}

static TIMERS: RacyCell<List<TimerEntry, TimerListTag>> = RacyCell::new(List::new());

fn timers(_key: IntKey<'_>) -> &'static mut List<TimerEntry, TimerListTag> {
    unsafe { TIMERS.get_mut() }
}

/// Arm `entry` to fire `ticks` from now; `period` of zero makes it
/// one-shot. Re-arming an armed entry restarts it.
pub(crate) fn arm(key: IntKey<'_>, entry: &TimerEntry, ticks: u64, period: u64) {
    debug_assert!(ticks > 0);
    if entry.state.get(key) == TimerState::Armed {
        cancel(key, entry);
    }

    let list = timers(key);
    let entry_ptr = NonNull::from(entry);
    let mut remaining = ticks;
    list.insert_by(entry_ptr, |ahead| {
        let d = ahead.delta.get(key);
        if d <= remaining {
            remaining -= d;
            true
        } else {
            false
        }
    });
    entry.delta.set(key, remaining);
    entry.period.set(key, period);
    entry.state.set(key, TimerState::Armed);

    if let Some(next) = list.next_of(entry_ptr) {
        let next = unsafe { next.as_ref() };
        next.delta.set(key, next.delta.get(key) - remaining);
    }
}

/// Disarm `entry`, leaving every other expiry unchanged.
pub(crate) fn cancel(key: IntKey<'_>, entry: &TimerEntry) {
    if entry.state.get(key) != TimerState::Armed {
        return;
    }
    let list = timers(key);
    let entry_ptr = NonNull::from(entry);
    if let Some(next) = list.next_of(entry_ptr) {
        let next = unsafe { next.as_ref() };
        next.delta.set(key, next.delta.get(key) + entry.delta.get(key));
    }
    list.remove(entry_ptr);
    entry.state.set(key, TimerState::Idle);
}

/// Advance the delta list by one tick and fire everything due. Runs in
/// the tick interrupt; callbacks must not block.
pub(crate) fn tick(key: IntKey<'_>) {
    {
        let Some(head) = timers(key).head() else {
            return;
        };
        let head = unsafe { head.as_ref() };
        head.delta.set(key, head.delta.get(key).saturating_sub(1));
    }

    loop {
        let Some(head_ptr) = timers(key).head() else {
            return;
        };
        let head = unsafe { head_ptr.as_ref() };
        if head.delta.get(key) != 0 {
            return;
        }

        timers(key).remove(head_ptr);
        head.state.set(key, TimerState::Firing);

        match head.action.get(key) {
            TimerAction::Callback { func, arg } => func(arg),
            TimerAction::Wake(tcb) => sched::wake(key, tcb, WakeReason::TimedOut),
            TimerAction::None => {}
        }

        let period = head.period.get(key);
        if period > 0 {
            arm(key, head, period, period);
        } else {
            head.state.set(key, TimerState::Idle);
        }
    }
}

/// Tick distance covered by the whole delta list: the furthest armed
/// expiry relative to now.
#[allow(dead_code)]
pub(crate) fn horizon(key: IntKey<'_>) -> u64 {
    timers(key)
        .iter()
        .map(|e| unsafe { e.as_ref() }.delta.get(key))
        .sum()
}

/// Disarm everything. Host test support only.
#[cfg(any(test, feature = "khal-host"))]
pub(crate) fn reset(key: IntKey<'_>) {
    while let Some(entry) = timers(key).pop_front() {
        unsafe { entry.as_ref() }.state.set(key, TimerState::Idle);
    }
}

/// A one-shot or periodic timer running a callback in the tick interrupt.
///
/// The entry is allocated from the kernel heap so the handle can move
/// freely; `delete` returns the storage.
pub struct Timer {
    entry: NonNull<TimerEntry>,
}

unsafe impl Send for Timer {}
unsafe impl Sync for Timer {}

impl Timer {
    /// Create a timer that calls `func(arg)` when it fires.
    pub fn create(func: fn(*mut ()), arg: *mut ()) -> Result<Timer> {
        let raw = heap::alloc(core::mem::size_of::<TimerEntry>()).ok_or(Error::OutOfMemory)?;
        let entry = raw.cast::<TimerEntry>();
        unsafe { entry.as_ptr().write(TimerEntry::new()) };
        InterruptLock::with(|key| {
            unsafe { entry.as_ref() }.set_action(key, TimerAction::Callback { func, arg });
        });
        Ok(Timer { entry })
    }

    /// Fire once, `after` from now.
    pub fn start(&self, after: Duration) -> Result<()> {
        let ticks = after.as_ticks();
        if ticks == 0 {
            return Err(Error::InvalidArgument);
        }
        InterruptLock::with(|key| arm(key, unsafe { self.entry.as_ref() }, ticks, 0));
        Ok(())
    }

    /// Fire every `period`, first fire one period from now.
    pub fn start_periodic(&self, period: Duration) -> Result<()> {
        let ticks = period.as_ticks();
        if ticks == 0 {
            return Err(Error::InvalidArgument);
        }
        InterruptLock::with(|key| arm(key, unsafe { self.entry.as_ref() }, ticks, ticks));
        Ok(())
    }

    pub fn stop(&self) {
        InterruptLock::with(|key| cancel(key, unsafe { self.entry.as_ref() }));
    }

    pub fn is_armed(&self) -> bool {
        InterruptLock::with(|key| unsafe { self.entry.as_ref() }.is_armed(key))
    }

    /// Disarm and return the timer's storage to the heap.
    pub fn delete(self) -> Result<()> {
        self.stop();
        unsafe { heap::free(self.entry.cast()) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::interrupt_lock::InterruptLock;

    fn fired_order(entries: &[&TimerEntry]) -> std::vec::Vec<usize> {
        InterruptLock::with(|key| {
            timers(key)
                .iter()
                .map(|e| {
                    entries
                        .iter()
                        .position(|x| core::ptr::eq(*x, e.as_ptr()))
                        .unwrap()
                })
                .collect()
        })
    }

    // The delta list is process-global; timer tests take turns.
    static TEST_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

    fn with_clean_list<R>(f: impl FnOnce() -> R) -> R {
        let _serial = TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        InterruptLock::with(|key| reset(key));
        let r = f();
        InterruptLock::with(|key| reset(key));
        r
    }

    #[test]
    fn deltas_encode_expiry_order() {
        with_clean_list(|| {
            let a = TimerEntry::new();
            let b = TimerEntry::new();
            let c = TimerEntry::new();

            InterruptLock::with(|key| {
                arm(key, &b, 20, 0);
                arm(key, &a, 10, 0);
                arm(key, &c, 15, 0);

                assert_eq!(a.delta.get(key), 10);
                assert_eq!(c.delta.get(key), 5);
                assert_eq!(b.delta.get(key), 5);
                assert_eq!(horizon(key), 20);
            });
            assert_eq!(fired_order(&[&a, &b, &c]), std::vec![0, 2, 1]);
        });
    }

    #[test]
    fn cancel_preserves_other_expiries() {
        with_clean_list(|| {
            let a = TimerEntry::new();
            let b = TimerEntry::new();
            let c = TimerEntry::new();

            InterruptLock::with(|key| {
                arm(key, &a, 10, 0);
                arm(key, &b, 15, 0);
                arm(key, &c, 30, 0);

                cancel(key, &b);
                assert_eq!(a.delta.get(key), 10);
                assert_eq!(c.delta.get(key), 20);
                assert_eq!(horizon(key), 30);
                assert_eq!(b.state.get(key), TimerState::Idle);
            });
        });
    }

    #[test]
    fn tick_fires_due_entries() {
        with_clean_list(|| {
            static FIRED: core::sync::atomic::AtomicUsize =
                core::sync::atomic::AtomicUsize::new(0);
            FIRED.store(0, core::sync::atomic::Ordering::SeqCst);

            fn bump(_arg: *mut ()) {
                FIRED.fetch_add(1, core::sync::atomic::Ordering::SeqCst);
            }

            let a = TimerEntry::new();
            let b = TimerEntry::new();
            InterruptLock::with(|key| {
                a.set_action(key, TimerAction::Callback {
                    func: bump,
                    arg: core::ptr::null_mut(),
                });
                b.set_action(key, TimerAction::Callback {
                    func: bump,
                    arg: core::ptr::null_mut(),
                });
                arm(key, &a, 3, 0);
                arm(key, &b, 3, 0);

                tick(key);
                tick(key);
                assert_eq!(FIRED.load(core::sync::atomic::Ordering::SeqCst), 0);
                tick(key);
                // Both share the expiry tick and fire together.
                assert_eq!(FIRED.load(core::sync::atomic::Ordering::SeqCst), 2);
                assert_eq!(a.state.get(key), TimerState::Idle);
            });
        });
    }

    #[test]
    fn periodic_rearms_with_period() {
        with_clean_list(|| {
            static FIRED: core::sync::atomic::AtomicUsize =
                core::sync::atomic::AtomicUsize::new(0);
            FIRED.store(0, core::sync::atomic::Ordering::SeqCst);

            fn bump(_arg: *mut ()) {
                FIRED.fetch_add(1, core::sync::atomic::Ordering::SeqCst);
            }

            let t = TimerEntry::new();
            InterruptLock::with(|key| {
                t.set_action(key, TimerAction::Callback {
                    func: bump,
                    arg: core::ptr::null_mut(),
                });
                arm(key, &t, 2, 2);

                for _ in 0..6 {
                    tick(key);
                }
                assert_eq!(FIRED.load(core::sync::atomic::Ordering::SeqCst), 3);
                assert_eq!(t.state.get(key), TimerState::Armed);
                cancel(key, &t);
            });
        });
    }

    #[test]
    fn rearm_restarts() {
        with_clean_list(|| {
            let t = TimerEntry::new();
            InterruptLock::with(|key| {
                arm(key, &t, 10, 0);
                arm(key, &t, 3, 0);
                assert_eq!(horizon(key), 3);
                cancel(key, &t);
            });
        });
    }
}
