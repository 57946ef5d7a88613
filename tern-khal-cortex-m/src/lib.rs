//! Cortex-M4 implementation of the tern KHAL.
//!
//! The context switch runs in PendSV, configured to the lowest NVIC
//! priority so that it tail-chains after every other pending handler. The
//! system tick comes from SysTick. External interrupts all funnel through
//! the `cortex-m-rt` `DefaultHandler` into the kernel's software dispatch
//! table, and the global critical section is PRIMASK.
//!
//! Threads run on the process stack (PSP); handlers and the early boot
//! path stay on the main stack (MSP).

#![no_std]

use core::cell::{RefCell, UnsafeCell};
use core::mem::MaybeUninit;
use cortex_m::interrupt::InterruptNumber;
use cortex_m::peripheral::scb::SystemHandler;
use cortex_m::peripheral::{NVIC, SCB, SYST};
use cortex_m::register::primask;
use critical_section::Mutex;
use rtt_target::{rprint, rtt_init_print};
use tern_khal::{ContextFrame, FlowControl, IrqControl, IrqNumber, Platform, TickControl, Ticks};

#[cfg(all(target_arch = "arm", target_os = "none"))]
use core::arch::global_asm;

use const_env::from_env;

/// Core clock in Hz; boards override with the `CPU_HZ` build environment
/// variable.
#[from_env]
pub const CPU_HZ: u64 = 16_000_000;

/// System tick rate.
#[from_env]
pub const TICK_HZ: u64 = 1_000;

/// External interrupt lines serviced through the dispatch table.
#[from_env]
pub const MAX_IRQS: usize = 96;

const NVIC_PRIO_LOWEST: u8 = 0xff;

// Software-saved part of a suspended thread's frame: r4-r11 plus the
// EXC_RETURN value, pushed below the hardware exception frame.
const SW_FRAME_WORDS: usize = 9;
const HW_FRAME_WORDS: usize = 8;

const EXC_RETURN_THREAD_PSP: u32 = 0xFFFF_FFFD;
const XPSR_THUMB: u32 = 0x0100_0000;

/// Saved context of a suspended thread. The register frame itself lives on
/// the thread's stack; only the stack pointer is kept here.
#[repr(C)]
pub struct Context {
    sp: *mut u8,
}

impl ContextFrame for Context {
    unsafe fn init(
        entry: extern "C" fn(*mut ()),
        arg: *mut (),
        stack_top: *mut u8,
        context: *mut Self,
    ) {
        unsafe {
            // Hardware exception frame goes at the very top of the stack,
            // the software-saved frame below it. The first switch into the
            // thread unstacks both and "returns" into `entry(arg)`.
            let hw = (stack_top as *mut u32).sub(HW_FRAME_WORDS);
            hw.add(0).write(arg as usize as u32); // r0
            hw.add(1).write(0); // r1
            hw.add(2).write(0); // r2
            hw.add(3).write(0); // r3
            hw.add(4).write(0); // r12
            hw.add(5).write(thread_return_trap as usize as u32); // lr
            hw.add(6).write(entry as usize as u32); // pc
            hw.add(7).write(XPSR_THUMB); // xPSR

            let sw = hw.sub(SW_FRAME_WORDS);
            for i in 0..8 {
                sw.add(i).write(0); // r4-r11
            }
            sw.add(8).write(EXC_RETURN_THREAD_PSP);

            (*context).sp = sw as *mut u8;
        }
    }

    fn stack_top(&self) -> *mut u8 {
        self.sp
    }

    fn set_stack_top(&mut self, sp: *mut u8) {
        self.sp = sp;
    }
}

/// Landing pad for a thread entry function that returns. The kernel's
/// springboard never lets this happen, so reaching it means a corrupted
/// frame.
extern "C" fn thread_return_trap() -> ! {
    Khal::abort();
}

/// Raw NVIC line number, so the dispatch table can drive interrupts the
/// kernel only knows by index.
#[derive(Copy, Clone)]
struct RawIrq(u16);

unsafe impl InterruptNumber for RawIrq {
    fn number(self) -> u16 {
        self.0
    }
}

struct Peripherals {
    nvic: Mutex<RefCell<NVIC>>,
    syst: Mutex<RefCell<SYST>>,
}

struct HalCell(UnsafeCell<MaybeUninit<Peripherals>>);

unsafe impl Sync for HalCell {}

static HAL: HalCell = HalCell(UnsafeCell::new(MaybeUninit::uninit()));

fn hal() -> &'static Peripherals {
    // SAFETY: written once in Platform::init before any other KHAL call.
    unsafe { (*HAL.0.get()).assume_init_ref() }
}

pub struct Khal;

impl FlowControl for Khal {
    type Context = Context;

    #[inline(always)]
    fn acquire() -> bool {
        let was_enabled = primask::read().is_active();
        cortex_m::interrupt::disable();
        was_enabled
    }

    #[inline(always)]
    fn restore(state: bool) {
        if state {
            // SAFETY: only re-enables what `acquire` disabled.
            unsafe { cortex_m::interrupt::enable() };
        }
    }

    #[inline(always)]
    fn request_switch() {
        SCB::set_pendsv();
    }

    #[inline(always)]
    fn reschedule_point() {
        // PendSV has already run by the time interrupts were re-enabled.
    }

    fn start_first_thread(context: *mut Context) -> ! {
        #[cfg(all(target_arch = "arm", target_os = "none"))]
        unsafe {
            core::arch::asm!(
                // Saved stack pointer is the first context field; it points
                // at the software frame, with the hardware frame above it.
                "ldr r4, [r0]",
                "add r4, r4, #36",
                // Entry point and link register from the hardware frame.
                "ldr r5, [r4, #6*4]",
                "ldr lr, [r4, #5*4]",
                "ldmia r4, {{r0-r3, r12}}",
                // Pop the hardware frame and run the thread on PSP.
                "add r4, r4, #32",
                "msr psp, r4",
                "isb",
                "movs r4, #2",
                "msr control, r4",
                "isb",
                "bx r5",
                in("r0") context,
                options(noreturn)
            )
        }

        #[cfg(not(all(target_arch = "arm", target_os = "none")))]
        {
            let _ = context;
            unimplemented!("thread launch requires a Cortex-M target");
        }
    }

    #[inline(always)]
    fn idle_wait() {
        cortex_m::asm::wfi();
    }

    fn abort() -> ! {
        #[cfg(feature = "semihosting")]
        semihosting::process::abort();

        #[cfg(not(feature = "semihosting"))]
        loop {
            cortex_m::asm::wfi();
        }
    }

    fn console_write(s: &str) {
        rprint!("{}", s);
    }
}

impl IrqControl for Khal {
    const MAX_IRQS: usize = MAX_IRQS;

    fn enable_irq(irq: IrqNumber) {
        // SAFETY: the kernel only unmasks lines it has a registered
        // handler for.
        unsafe { NVIC::unmask(RawIrq(irq)) };
    }

    fn disable_irq(irq: IrqNumber) {
        NVIC::mask(RawIrq(irq));
    }

    fn set_irq_priority(irq: IrqNumber, priority: u8) {
        critical_section::with(|cs| {
            let mut nvic = hal().nvic.borrow_ref_mut(cs);
            unsafe { nvic.set_priority(RawIrq(irq), priority) };
        });
    }
}

impl TickControl for Khal {
    const TICK_HZ: Ticks = TICK_HZ;

    fn start_tick() {
        let reload = (CPU_HZ / TICK_HZ - 1) as u32;
        debug_assert!(reload <= 0x00ff_ffff);

        critical_section::with(|cs| {
            let mut syst = hal().syst.borrow_ref_mut(cs);
            syst.set_clock_source(cortex_m::peripheral::syst::SystClkSource::Core);
            syst.set_reload(reload);
            syst.clear_current();
            syst.enable_interrupt();
            syst.enable_counter();
        });
    }
}

impl Platform for Khal {
    const NAME: &'static str = "cortex-m4";

    unsafe fn init() {
        rtt_init_print!();

        let cortex_m::Peripherals {
            NVIC: nvic,
            SYST: syst,
            SCB: mut scb,
            ..
        } = unsafe { cortex_m::Peripherals::steal() };

        unsafe {
            // The context switch must be the last handler to run so that
            // it tail-chains after anything that woke a thread.
            scb.set_priority(SystemHandler::PendSV, NVIC_PRIO_LOWEST);
            scb.set_priority(SystemHandler::SysTick, NVIC_PRIO_LOWEST - 1);

            (*HAL.0.get()).write(Peripherals {
                nvic: Mutex::new(RefCell::new(nvic)),
                syst: Mutex::new(RefCell::new(syst)),
            });
        }
    }
}

#[cfg(all(target_arch = "arm", target_os = "none"))]
mod handlers {
    use cortex_m_rt::exception;
    use tern_khal::KernelCallbacks;

    #[exception]
    fn SysTick() {
        unsafe { super::Khal::kernel_tick_isr() };
    }

    #[exception]
    unsafe fn DefaultHandler(irqn: i16) {
        if irqn >= 0 {
            unsafe { super::Khal::kernel_irq_isr(irqn as u16) };
        }
    }
}

// PendSV saves the outgoing thread's callee-saved registers and EXC_RETURN
// below the hardware frame on its process stack, hands the stack pointer
// to the kernel, and unstacks the frame of whichever thread the kernel
// returns.
#[cfg(all(target_arch = "arm", target_os = "none"))]
global_asm!(
    ".cfi_sections .debug_frame
     .section .PendSV.user, \"ax\"
     .global PendSV
     .type PendSV,%function
     .thumb_func",
    ".cfi_startproc
    PendSV:",
    "mrs    r0, psp",
    "isb",
    "stmdb  r0!, {{r4-r11, lr}}",
    "bl     _tern_switch_context",
    "ldmia  r0!, {{r4-r11, lr}}",
    "msr    psp, r0",
    "isb",
    "bx     lr",
    ".cfi_endproc
     .size PendSV, . - PendSV",
);
