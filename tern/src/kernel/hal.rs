//! Binding to the selected KHAL implementation.
//!
//! Exactly one `khal-*` cargo feature selects the platform; the rest of
//! the kernel goes through the free functions here and never names the
//! implementation crate.

use tern_khal::{FlowControl, IrqControl, Platform, TickControl};

#[cfg(all(feature = "khal-cortex-m", feature = "khal-host"))]
compile_error!("features `khal-cortex-m` and `khal-host` are mutually exclusive");

#[cfg(not(any(feature = "khal-cortex-m", feature = "khal-host")))]
compile_error!("select a KHAL implementation: feature `khal-cortex-m` or `khal-host`");

#[cfg(feature = "khal-cortex-m")]
pub(crate) use tern_khal_cortex_m as khal;
#[cfg(feature = "khal-host")]
pub(crate) use tern_khal_host as khal;

pub(crate) type Pal = khal::Khal;

pub type Context = <Pal as FlowControl>::Context;

pub(crate) const MAX_IRQS: usize = <Pal as IrqControl>::MAX_IRQS;
pub const TICK_HZ: u64 = <Pal as TickControl>::TICK_HZ;

#[inline(always)]
pub(crate) fn acquire() -> bool {
    Pal::acquire()
}

#[inline(always)]
pub(crate) fn restore(state: bool) {
    Pal::restore(state)
}

#[inline(always)]
pub(crate) fn request_switch() {
    Pal::request_switch()
}

#[inline(always)]
pub(crate) fn reschedule_point() {
    Pal::reschedule_point()
}

#[inline(always)]
pub(crate) fn start_first_thread(context: *mut Context) -> ! {
    Pal::start_first_thread(context)
}

#[inline(always)]
pub(crate) fn idle_wait() {
    Pal::idle_wait()
}

#[inline(always)]
pub fn abort() -> ! {
    Pal::abort()
}

#[inline(always)]
pub(crate) fn console_write(s: &str) {
    Pal::console_write(s)
}

#[inline(always)]
pub(crate) fn enable_irq(irq: u16) {
    Pal::enable_irq(irq)
}

#[inline(always)]
pub(crate) fn disable_irq(irq: u16) {
    Pal::disable_irq(irq)
}

#[allow(dead_code)]
#[inline(always)]
pub(crate) fn set_irq_priority(irq: u16, priority: u8) {
    Pal::set_irq_priority(irq, priority)
}

#[inline(always)]
pub(crate) fn start_tick() {
    Pal::start_tick()
}

#[inline(always)]
pub(crate) unsafe fn platform_init() {
    unsafe { Pal::init() }
}
