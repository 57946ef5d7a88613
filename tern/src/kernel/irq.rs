//! Software interrupt-vector dispatch.
//!
//! Hardware first-level handlers are thin trampolines that land in
//! [`_tern_irq_isr`] with the interrupt number; the registered handler
//! and its argument are looked up in a table the kernel owns. Handlers
//! run with the critical section released, so higher-priority interrupts
//! nest normally. A handler that wakes a thread does so through the
//! standard primitives, which pend a context switch that takes effect on
//! interrupt exit.

use crate::cell::RacyCell;
use crate::error::{Error, Result};
use crate::kernel::hal;
use crate::sync::interrupt_lock::InterruptLock;
use core::sync::atomic::{AtomicUsize, Ordering};

/// A registered interrupt handler: a callable and its opaque argument.
#[derive(Copy, Clone)]
pub struct IrqHandler {
    pub func: fn(*mut ()),
    pub arg: *mut (),
}

#[derive(Copy, Clone)]
struct IrqSlot {
    handler: Option<IrqHandler>,
    enabled: bool,
}

const EMPTY_SLOT: IrqSlot = IrqSlot {
    handler: None,
    enabled: false,
};

static TABLE: RacyCell<[IrqSlot; hal::MAX_IRQS]> = RacyCell::new([EMPTY_SLOT; hal::MAX_IRQS]);

static ISR_NESTING: AtomicUsize = AtomicUsize::new(0);

/// True while executing in interrupt context.
pub fn in_interrupt() -> bool {
    ISR_NESTING.load(Ordering::Relaxed) != 0
}

pub(crate) fn isr_enter() {
    ISR_NESTING.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn isr_exit() {
    ISR_NESTING.fetch_sub(1, Ordering::Relaxed);
}

/// Install `func(arg)` as the handler for interrupt `irq`. Re-registering
/// replaces the previous handler; the line stays disabled until
/// [`irq_enable`].
pub fn irq_register(irq: u16, func: fn(*mut ()), arg: *mut ()) -> Result<()> {
    if irq as usize >= hal::MAX_IRQS {
        return Err(Error::InvalidArgument);
    }
    InterruptLock::with(|_key| {
        let table = unsafe { TABLE.get_mut() };
        table[irq as usize] = IrqSlot {
            handler: Some(IrqHandler { func, arg }),
            enabled: false,
        };
    });
    Ok(())
}

/// Unmask interrupt `irq` at the hardware controller. The line must have
/// a registered handler.
pub fn irq_enable(irq: u16) -> Result<()> {
    if irq as usize >= hal::MAX_IRQS {
        return Err(Error::InvalidArgument);
    }
    InterruptLock::with(|_key| {
        let table = unsafe { TABLE.get_mut() };
        let slot = &mut table[irq as usize];
        if slot.handler.is_none() {
            return Err(Error::InvalidState);
        }
        slot.enabled = true;
        hal::enable_irq(irq);
        Ok(())
    })
}

/// Mask interrupt `irq` at the hardware controller.
pub fn irq_disable(irq: u16) -> Result<()> {
    if irq as usize >= hal::MAX_IRQS {
        return Err(Error::InvalidArgument);
    }
    InterruptLock::with(|_key| {
        let table = unsafe { TABLE.get_mut() };
        table[irq as usize].enabled = false;
        hal::disable_irq(irq);
    });
    Ok(())
}

#[no_mangle]
pub extern "C" fn _tern_irq_isr(irq: u16) {
    isr_enter();
    let dispatch = InterruptLock::with(|_key| {
        let table = unsafe { TABLE.get_mut() };
        match table.get(irq as usize) {
            Some(slot) if slot.enabled => slot.handler,
            _ => None,
        }
    });
    if let Some(handler) = dispatch {
        (handler.func)(handler.arg);
    }
    isr_exit();
}

/// Clear the whole dispatch table. Host test support only.
#[cfg(any(test, feature = "khal-host"))]
pub(crate) fn reset() {
    InterruptLock::with(|_key| {
        let table = unsafe { TABLE.get_mut() };
        for slot in table.iter_mut() {
            *slot = EMPTY_SLOT;
        }
    });
}
