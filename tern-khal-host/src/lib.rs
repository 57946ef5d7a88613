//! Hosted implementation of the tern KHAL, for running the kernel's test
//! suite on a development machine.
//!
//! Nothing here switches real register frames. Interrupt masking is a
//! process-global flag, switch requests are recorded instead of executed,
//! and time only moves when a test calls [`advance_ticks`]. Tests drive
//! the kernel's interrupt-side entry points directly:
//!
//! - [`advance_ticks`] delivers tick interrupts,
//! - [`raise_irq`] delivers an external interrupt,
//! - [`run_pending_switch`] runs the context-switch callback if a switch
//!   has been requested, the way PendSV would on hardware,
//! - [`set_reschedule_hook`] installs a closure that runs whenever a
//!   blocked thread would have been switched out, so a test can play the
//!   part of "the other thread" (signal the event, advance time, ...).
//!
//! Because the whole kernel state is process-global, tests that go through
//! this KHAL must be serialized; the kernel's integration suite does so
//! with a plain mutex.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use tern_khal::{ContextFrame, FlowControl, IrqControl, IrqNumber, Platform, TickControl, Ticks};

/// The kernel's interrupt-side entry points. On hardware these are bound
/// by symbol name from the first-level handlers; on the host the kernel
/// hands them over at init so this crate stays linkable on its own.
#[derive(Copy, Clone)]
pub struct KernelEntry {
    pub tick_isr: extern "C" fn(),
    pub irq_isr: extern "C" fn(u16),
    pub switch_context: extern "C" fn(*mut u8) -> *mut u8,
}

static KERNEL: Mutex<Option<KernelEntry>> = Mutex::new(None);

fn kernel() -> KernelEntry {
    KERNEL
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .expect("kernel entry points not registered; call bind_kernel first")
}

/// Register the kernel's interrupt-side entry points. Called by the
/// kernel's host test support before anything else.
pub fn bind_kernel(entry: KernelEntry) {
    *KERNEL.lock().unwrap_or_else(|e| e.into_inner()) = Some(entry);
}

static INTERRUPTS_ENABLED: AtomicBool = AtomicBool::new(true);
static SWITCH_PENDING: AtomicBool = AtomicBool::new(false);
static SWITCH_REQUESTS: AtomicUsize = AtomicUsize::new(0);

static RESCHEDULE_HOOK: Mutex<Option<Box<dyn FnMut() + Send>>> = Mutex::new(None);

/// Saved context of a host "thread". Threads never actually run on the
/// host, so this only remembers what the kernel put into the frame.
#[repr(C)]
pub struct Context {
    sp: *mut u8,
    entry: usize,
    arg: *mut (),
}

impl ContextFrame for Context {
    unsafe fn init(
        entry: extern "C" fn(*mut ()),
        arg: *mut (),
        stack_top: *mut u8,
        context: *mut Self,
    ) {
        unsafe {
            (*context).sp = stack_top;
            (*context).entry = entry as usize;
            (*context).arg = arg;
        }
    }

    fn stack_top(&self) -> *mut u8 {
        self.sp
    }

    fn set_stack_top(&mut self, sp: *mut u8) {
        self.sp = sp;
    }
}

pub struct Khal;

impl FlowControl for Khal {
    type Context = Context;

    fn acquire() -> bool {
        INTERRUPTS_ENABLED.swap(false, Ordering::SeqCst)
    }

    fn restore(state: bool) {
        if state {
            INTERRUPTS_ENABLED.store(true, Ordering::SeqCst);
        }
    }

    fn request_switch() {
        SWITCH_PENDING.store(true, Ordering::SeqCst);
        SWITCH_REQUESTS.fetch_add(1, Ordering::SeqCst);
    }

    fn reschedule_point() {
        // Let the test play the part of the rest of the system while this
        // "thread" is switched out, then run the switch it requested.
        let hook = RESCHEDULE_HOOK.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(mut hook) = hook {
            hook();
            let mut slot = RESCHEDULE_HOOK.lock().unwrap_or_else(|e| e.into_inner());
            if slot.is_none() {
                *slot = Some(hook);
            }
        }
        run_pending_switch();
    }

    fn start_first_thread(_context: *mut Context) -> ! {
        panic!("the host KHAL cannot launch threads; drive the kernel through test_support");
    }

    fn idle_wait() {}

    fn abort() -> ! {
        std::process::abort();
    }

    fn console_write(s: &str) {
        print!("{s}");
    }
}

impl IrqControl for Khal {
    const MAX_IRQS: usize = 64;

    fn enable_irq(irq: IrqNumber) {
        irq_state(irq).store(true, Ordering::SeqCst);
    }

    fn disable_irq(irq: IrqNumber) {
        irq_state(irq).store(false, Ordering::SeqCst);
    }

    fn set_irq_priority(_irq: IrqNumber, _priority: u8) {}
}

impl TickControl for Khal {
    const TICK_HZ: Ticks = 1_000;

    fn start_tick() {}
}

impl Platform for Khal {
    const NAME: &'static str = "host";

    unsafe fn init() {}
}

static IRQ_LINES: [AtomicBool; Khal::MAX_IRQS] =
    [const { AtomicBool::new(false) }; Khal::MAX_IRQS];

fn irq_state(irq: IrqNumber) -> &'static AtomicBool {
    &IRQ_LINES[irq as usize]
}

/// Whether a line is unmasked at the (simulated) interrupt controller.
pub fn irq_line_enabled(irq: IrqNumber) -> bool {
    irq_state(irq).load(Ordering::SeqCst)
}

/// Whether a context switch has been requested and not yet executed.
pub fn switch_pending() -> bool {
    SWITCH_PENDING.load(Ordering::SeqCst)
}

/// Total number of switch requests since process start.
pub fn switch_request_count() -> usize {
    SWITCH_REQUESTS.load(Ordering::SeqCst)
}

/// Run the kernel's context-switch callback if a switch is pending, as
/// PendSV would once interrupts are unmasked. Returns true if a switch
/// callback ran.
pub fn run_pending_switch() -> bool {
    if SWITCH_PENDING.swap(false, Ordering::SeqCst) {
        // Null tells the kernel there is no live register frame to save;
        // host threads do not have one.
        (kernel().switch_context)(core::ptr::null_mut());
        true
    } else {
        false
    }
}

/// Deliver `n` tick interrupts, running any switch each tick requests.
pub fn advance_ticks(n: u64) {
    for _ in 0..n {
        (kernel().tick_isr)();
        run_pending_switch();
    }
}

/// Deliver external interrupt `irq` if the line is unmasked.
pub fn raise_irq(irq: IrqNumber) {
    if irq_line_enabled(irq) {
        (kernel().irq_isr)(irq);
        run_pending_switch();
    }
}

/// Install the closure that runs when a blocked thread reaches its
/// reschedule point. Replaces any previous hook.
pub fn set_reschedule_hook(hook: Box<dyn FnMut() + Send>) {
    *RESCHEDULE_HOOK.lock().unwrap_or_else(|e| e.into_inner()) = Some(hook);
}

/// Remove the reschedule hook.
pub fn clear_reschedule_hook() {
    *RESCHEDULE_HOOK.lock().unwrap_or_else(|e| e.into_inner()) = None;
}
