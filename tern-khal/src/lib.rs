//! Hardware abstraction layer for the tern kernel.
//!
//! The kernel is portable over anything that can provide four things: a way
//! to mask interrupts globally, a software-triggered context-switch
//! interrupt with the lowest priority in the system, a periodic tick
//! interrupt, and per-IRQ enable/disable control. Those capabilities are
//! expressed as the traits in this crate; each target implements them in
//! its own `tern-khal-*` crate and the kernel binds to exactly one
//! implementation at build time.
//!
//! The KHAL calls back into the kernel through the `extern "C"` symbols
//! declared in [`callbacks`]:
//!
//! - `_tern_tick_isr` from the tick interrupt,
//! - `_tern_irq_isr` from the first-level handler of every external
//!   interrupt,
//! - `_tern_switch_context` from the context-switch interrupt, with the
//!   outgoing thread's stack pointer; the kernel returns the incoming
//!   thread's stack pointer.
//!
//! Implementations must guarantee that the context-switch interrupt has
//! the lowest priority of all interrupts so that it tail-chains after any
//! other pending handler, and that `acquire`/`restore` really do mask
//! every interrupt the kernel can observe.

#![no_std]

pub mod callbacks;

pub use aligned::{Aligned, Alignment, A8};
pub use callbacks::KernelCallbacks;

/// Hardware interrupt request number, as indexed by the vector table.
pub type IrqNumber = u16;

/// Kernel time unit; one tick of the periodic system timer.
pub type Ticks = u64;

/// Architecture-specific saved thread context.
///
/// The only state the kernel keeps per thread is the saved stack pointer;
/// the register frame itself lives on the thread's own stack. `init`
/// fabricates the frame a brand new thread needs so that the first switch
/// into it "returns" into `entry(arg)`.
pub trait ContextFrame: Sized {
    /// Push the initial register frame for a new thread onto its stack and
    /// record the resulting stack pointer in `context`.
    ///
    /// # Safety
    ///
    /// `stack_top` must point one past the end of a writable region large
    /// enough for the initial frame, and `context` must point to storage
    /// that outlives the thread.
    unsafe fn init(
        entry: extern "C" fn(*mut ()),
        arg: *mut (),
        stack_top: *mut u8,
        context: *mut Self,
    );

    /// The saved stack pointer; valid only while the thread is switched
    /// out.
    fn stack_top(&self) -> *mut u8;

    /// Record the stack pointer of a thread being switched out.
    fn set_stack_top(&mut self, sp: *mut u8);
}

/// Execution flow control: interrupt masking, context switching, and the
/// ways a system can stop.
pub trait FlowControl {
    type Context: ContextFrame;

    /// Mask all interrupts. Returns the previous state for `restore`.
    fn acquire() -> bool;

    /// Restore the interrupt mask saved by `acquire`.
    fn restore(state: bool);

    /// Pend the context-switch interrupt. The switch itself happens once
    /// interrupts are unmasked and every higher-priority handler has
    /// retired.
    fn request_switch();

    /// A point at which a pended switch has taken effect by the time the
    /// call returns. On hardware this is a no-op (the switch interrupt ran
    /// the moment interrupts were unmasked); the host implementation uses
    /// it to run test hooks.
    fn reschedule_point();

    /// Launch the very first thread. Never returns.
    fn start_first_thread(context: *mut Self::Context) -> !;

    /// Hint that the system has nothing to run (WFI on ARM).
    fn idle_wait();

    /// Halt the system after an unrecoverable error.
    fn abort() -> !;

    /// Write kernel console output.
    fn console_write(s: &str);
}

/// Control over the hardware interrupt controller.
pub trait IrqControl {
    /// Number of external interrupt lines the controller supports. Sizes
    /// the kernel's dispatch table.
    const MAX_IRQS: usize;

    fn enable_irq(irq: IrqNumber);

    fn disable_irq(irq: IrqNumber);

    /// Set the hardware priority of an interrupt line. Larger values are
    /// lower priority, matching the NVIC convention.
    fn set_irq_priority(irq: IrqNumber, priority: u8);
}

/// The periodic system tick.
pub trait TickControl {
    /// Tick interrupt frequency.
    const TICK_HZ: Ticks;

    /// Configure and start the tick interrupt. Called once when the
    /// scheduler starts.
    fn start_tick();
}

/// A complete platform: everything the kernel needs from the hardware.
pub trait Platform: FlowControl + IrqControl + TickControl {
    const NAME: &'static str;

    /// One-time hardware bring-up: console, interrupt controller state,
    /// and the vectors for the tick and context-switch interrupts.
    ///
    /// # Safety
    ///
    /// Must be called exactly once, before any other KHAL function, with
    /// interrupts still disabled from reset.
    unsafe fn init();
}
