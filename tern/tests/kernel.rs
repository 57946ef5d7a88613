//! Kernel behavior tests over the host KHAL.
//!
//! The host KHAL records switch requests instead of swapping register
//! frames, time moves only through `advance_ticks`, and the reschedule
//! hook plays the part of "the rest of the system" while the calling
//! thread is blocked. Kernel state is process-global, so every test
//! serializes on one mutex and starts from `test_support::init`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex as StdMutex, MutexGuard};
use tern::kernel::{test_support, QUANTUM_TICKS};
use tern::prelude::*;
use tern::sync::{Event, Mutex, Queue, TrySendError};
use tern::ThreadState;
use tern_khal_host as host;

static SERIAL: StdMutex<()> = StdMutex::new(());

fn setup() -> (MutexGuard<'static, ()>, Thread) {
    let guard = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    let main = test_support::init();
    (guard, main)
}

fn spawn(name: &'static str, priority: Priority) -> Thread {
    Thread::create(name, priority, 512, |_| {}, core::ptr::null_mut()).unwrap()
}

#[test]
fn higher_priority_thread_preempts_on_ready() {
    let (_guard, main) = setup();
    assert_eq!(test_support::current(), main);

    let low = spawn("low", 12);
    assert_eq!(test_support::current(), main);
    assert_eq!(low.state(), ThreadState::Ready);

    let high = spawn("high", 2);
    assert_eq!(test_support::current(), high);
    assert_eq!(high.state(), ThreadState::Running);
    assert_eq!(main.state(), ThreadState::Ready);
}

#[test]
fn round_robin_rotates_on_quantum_expiry() {
    let (_guard, _main) = setup();

    let a = spawn("a", 2);
    let b = spawn("b", 2);
    let c = spawn("c", 2);
    assert_eq!(test_support::current(), a);
    assert_eq!(test_support::ready_len(2), 2);

    host::advance_ticks(QUANTUM_TICKS as u64);
    assert_eq!(test_support::current(), b);

    host::advance_ticks(QUANTUM_TICKS as u64);
    assert_eq!(test_support::current(), c);

    host::advance_ticks(QUANTUM_TICKS as u64);
    assert_eq!(test_support::current(), a);
}

#[test]
fn quantum_does_not_rotate_without_a_peer() {
    let (_guard, _main) = setup();

    let a = spawn("a", 2);
    assert_eq!(test_support::current(), a);

    host::advance_ticks(3 * QUANTUM_TICKS as u64);
    assert_eq!(test_support::current(), a);
}

#[test]
fn yield_rotates_among_equals() {
    let (_guard, main) = setup();

    let peer = spawn("peer", 8);
    assert_eq!(test_support::current(), main);

    tern::yield_now();
    assert_eq!(test_support::current(), peer);

    tern::yield_now();
    assert_eq!(test_support::current(), main);
}

#[test]
fn sleep_returns_after_duration() {
    let (_guard, main) = setup();

    host::set_reschedule_hook(Box::new(move || {
        assert_eq!(main.state(), ThreadState::Sleeping);
        host::advance_ticks(5);
    }));
    tern::sleep(Duration::from_ticks(5));
    host::clear_reschedule_hook();

    assert_eq!(tern::current_tick(), 5);
    assert_eq!(test_support::current(), main);
}

#[test]
fn event_signal_wakes_the_waiter() {
    static EVENT: Event = Event::new();
    let (_guard, main) = setup();

    host::set_reschedule_hook(Box::new(move || {
        assert_eq!(main.state(), ThreadState::Blocked);
        EVENT.signal();
    }));
    EVENT.wait(Timeout::Forever).unwrap();
    host::clear_reschedule_hook();

    // The grant went to the waiter; nothing latched.
    assert_eq!(EVENT.try_wait(), Err(Error::WouldBlock));
}

#[test]
fn event_latches_when_nobody_waits() {
    static EVENT: Event = Event::new();
    let (_guard, _main) = setup();

    EVENT.signal();
    assert!(EVENT.is_signalled());
    EVENT.wait(Timeout::Poll).unwrap();
    // Auto-reset: consumed and cleared.
    assert_eq!(EVENT.try_wait(), Err(Error::WouldBlock));
}

#[test]
fn event_wait_times_out_in_window() {
    static EVENT: Event = Event::new();
    let (_guard, _main) = setup();

    host::set_reschedule_hook(Box::new(|| host::advance_ticks(11)));
    let result = EVENT.wait(Timeout::Ticks(10));
    host::clear_reschedule_hook();

    assert_eq!(result, Err(Error::Timeout));
    assert!(tern::current_tick() >= 10);
}

#[test]
fn manual_reset_event_stays_signalled() {
    static EVENT: Event = Event::new_manual_reset();
    let (_guard, _main) = setup();

    EVENT.signal();
    EVENT.wait(Timeout::Poll).unwrap();
    EVENT.wait(Timeout::Poll).unwrap();
    EVENT.reset();
    assert_eq!(EVENT.try_wait(), Err(Error::WouldBlock));
}

#[test]
fn mutex_ownership_is_enforced() {
    static MUTEX: Mutex = Mutex::new();
    let (_guard, main) = setup();

    MUTEX.acquire(Timeout::Forever).unwrap();
    assert!(MUTEX.is_held_by_current());

    // Non-recursive: a second acquire by the owner is a caller error.
    assert_eq!(MUTEX.acquire(Timeout::Poll), Err(Error::InvalidState));

    // A thread that does not own the mutex cannot release it.
    let other = spawn("other", 2);
    assert_eq!(test_support::current(), other);
    assert_eq!(MUTEX.release(), Err(Error::InvalidState));

    test_support::adopt(main);
    MUTEX.release().unwrap();
    assert_eq!(MUTEX.release(), Err(Error::InvalidState));

    MUTEX.try_acquire().unwrap();
    MUTEX.release().unwrap();
}

#[test]
fn mutex_release_hands_off_to_blocked_waiter() {
    static MUTEX: Mutex = Mutex::new();
    let (_guard, main) = setup();

    MUTEX.acquire(Timeout::Forever).unwrap();

    // Preempt to a high-priority thread and block it on the mutex.
    let waiter = spawn("waiter", 2);
    assert_eq!(test_support::current(), waiter);
    assert_eq!(MUTEX.try_acquire(), Err(Error::WouldBlock));

    host::set_reschedule_hook(Box::new(move || {
        assert_eq!(waiter.state(), ThreadState::Blocked);
        test_support::adopt(main);
        MUTEX.release().unwrap();
    }));
    MUTEX.acquire(Timeout::Forever).unwrap();
    host::clear_reschedule_hook();

    // Ownership moved directly to the waiter, which runs again.
    assert_eq!(test_support::current(), waiter);
    assert!(MUTEX.is_held_by_current());
    MUTEX.release().unwrap();
}

#[test]
fn mutex_acquire_times_out() {
    static MUTEX: Mutex = Mutex::new();
    let (_guard, main) = setup();

    MUTEX.acquire(Timeout::Forever).unwrap();

    let waiter = spawn("waiter", 2);
    assert_eq!(test_support::current(), waiter);

    host::set_reschedule_hook(Box::new(|| host::advance_ticks(6)));
    let result = MUTEX.acquire(Timeout::Ticks(5));
    host::clear_reschedule_hook();
    assert_eq!(result, Err(Error::Timeout));

    test_support::adopt(main);
    MUTEX.release().unwrap();
}

#[test]
fn queue_delivers_in_fifo_order() {
    let (_guard, _main) = setup();

    let queue: &'static Queue<u32> = Box::leak(Box::new(Queue::create(4).unwrap()));
    for i in 0..4 {
        queue.try_send(i).unwrap();
    }
    assert!(queue.is_full());
    assert_eq!(queue.try_send(4), Err(TrySendError::Full(4)));

    for i in 0..4 {
        assert_eq!(queue.try_recv().unwrap(), i);
    }
    assert_eq!(queue.recv(Timeout::Poll), Err(Error::WouldBlock));
}

#[test]
fn queue_send_blocks_until_space_frees() {
    let (_guard, main) = setup();

    let queue: &'static Queue<u32> = Box::leak(Box::new(Queue::create(4).unwrap()));
    for i in 0..4 {
        queue.try_send(i).unwrap();
    }

    host::set_reschedule_hook(Box::new(move || {
        assert_eq!(main.state(), ThreadState::Blocked);
        assert_eq!(queue.try_recv().unwrap(), 0);
    }));
    queue.send(4, Timeout::Forever).unwrap();
    host::clear_reschedule_hook();

    // The blocked producer's item went in behind the others.
    for i in 1..=4 {
        assert_eq!(queue.try_recv().unwrap(), i);
    }
}

#[test]
fn queue_recv_blocks_until_data_arrives() {
    let (_guard, _main) = setup();

    let queue: &'static Queue<u32> = Box::leak(Box::new(Queue::create(2).unwrap()));

    host::set_reschedule_hook(Box::new(move || {
        queue.try_send(7).unwrap();
    }));
    assert_eq!(queue.recv(Timeout::Forever).unwrap(), 7);
    host::clear_reschedule_hook();
}

#[test]
fn queue_recv_times_out_when_empty() {
    let (_guard, _main) = setup();

    let queue: &'static Queue<u32> = Box::leak(Box::new(Queue::create(2).unwrap()));

    host::set_reschedule_hook(Box::new(|| host::advance_ticks(4)));
    assert_eq!(queue.recv(Timeout::Ticks(3)), Err(Error::Timeout));
    host::clear_reschedule_hook();
}

#[test]
fn irq_dispatch_honors_registration_and_masking() {
    static FIRED: AtomicUsize = AtomicUsize::new(0);

    fn handler(arg: *mut ()) {
        assert!(tern::in_interrupt());
        assert!(arg.is_null());
        FIRED.fetch_add(1, Ordering::SeqCst);
    }

    let (_guard, _main) = setup();
    FIRED.store(0, Ordering::SeqCst);

    assert_eq!(
        tern::irq_register(10_000, handler, core::ptr::null_mut()),
        Err(Error::InvalidArgument)
    );
    assert_eq!(tern::irq_enable(7), Err(Error::InvalidState));

    tern::irq_register(7, handler, core::ptr::null_mut()).unwrap();
    tern::irq_enable(7).unwrap();
    host::raise_irq(7);
    assert_eq!(FIRED.load(Ordering::SeqCst), 1);

    tern::irq_disable(7).unwrap();
    host::raise_irq(7);
    assert_eq!(FIRED.load(Ordering::SeqCst), 1);
}

#[test]
fn irq_handler_wake_preempts_on_exit() {
    static EVENT: Event = Event::new();

    fn handler(_arg: *mut ()) {
        EVENT.signal();
    }

    let (_guard, main) = setup();

    tern::irq_register(3, handler, core::ptr::null_mut()).unwrap();
    tern::irq_enable(3).unwrap();

    host::set_reschedule_hook(Box::new(move || {
        assert_eq!(main.state(), ThreadState::Blocked);
        host::raise_irq(3);
    }));
    EVENT.wait(Timeout::Forever).unwrap();
    host::clear_reschedule_hook();
    assert_eq!(test_support::current(), main);
}

#[test]
fn periodic_timer_fires_until_stopped() {
    static FIRED: AtomicUsize = AtomicUsize::new(0);

    fn bump(_arg: *mut ()) {
        FIRED.fetch_add(1, Ordering::SeqCst);
    }

    let (_guard, _main) = setup();
    FIRED.store(0, Ordering::SeqCst);

    let timer = tern::Timer::create(bump, core::ptr::null_mut()).unwrap();
    timer.start_periodic(Duration::from_ticks(3)).unwrap();
    assert!(timer.is_armed());
    assert_eq!(test_support::timer_horizon(), 3);

    host::advance_ticks(9);
    assert_eq!(FIRED.load(Ordering::SeqCst), 3);

    timer.stop();
    host::advance_ticks(9);
    assert_eq!(FIRED.load(Ordering::SeqCst), 3);

    timer.delete().unwrap();
}

#[test]
fn one_shot_timer_fires_once() {
    static FIRED: AtomicUsize = AtomicUsize::new(0);

    fn bump(_arg: *mut ()) {
        FIRED.fetch_add(1, Ordering::SeqCst);
    }

    let (_guard, _main) = setup();
    FIRED.store(0, Ordering::SeqCst);

    let timer = tern::Timer::create(bump, core::ptr::null_mut()).unwrap();
    assert_eq!(
        timer.start(Duration::from_ticks(0)),
        Err(Error::InvalidArgument)
    );
    timer.start(Duration::from_ticks(2)).unwrap();

    host::advance_ticks(10);
    assert_eq!(FIRED.load(Ordering::SeqCst), 1);
    assert!(!timer.is_armed());

    timer.delete().unwrap();
}

#[test]
fn thread_creation_validates_arguments() {
    let (_guard, _main) = setup();

    assert_eq!(
        Thread::create("bad-prio", 16, 512, |_| {}, core::ptr::null_mut()).unwrap_err(),
        Error::InvalidArgument
    );
    assert_eq!(
        Thread::create("bad-stack", 4, 64, |_| {}, core::ptr::null_mut()).unwrap_err(),
        Error::InvalidArgument
    );
}

#[test]
fn set_priority_repositions_threads() {
    let (_guard, main) = setup();

    let worker = spawn("worker", 9);
    assert_eq!(test_support::current(), main);

    // Raising a ready thread above the running one preempts.
    worker.set_priority(2).unwrap();
    assert_eq!(test_support::current(), worker);

    // Dropping the running thread below a ready one switches away.
    worker.set_priority(12).unwrap();
    assert_eq!(test_support::current(), main);
    assert_eq!(worker.priority(), 12);
}

#[test]
fn heap_stats_balance() {
    let (_guard, _main) = setup();

    let stats = tern::kernel::heap::stats();
    assert!(stats.used > 0);
    assert!(stats.free > 0);
    assert!(stats.used + stats.free <= stats.total);
    assert!(stats.largest_free <= stats.free);
}
