//! Unrecoverable kernel errors.
//!
//! Caller mistakes come back as [`Error`](crate::error::Error) values;
//! the conditions here cannot be reported to anyone, so the kernel logs
//! them and halts.

use crate::kernel::hal;
use crate::printkln;

#[derive(Copy, Clone, Debug)]
pub enum RuntimeError {
    /// A blocking primitive was used from interrupt context.
    BlockingInInterrupt,

    /// A thread ran through its stack canary.
    StackOverflow,

    /// The idle thread attempted to block or exit.
    IdleThreadViolation,
}

impl RuntimeError {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuntimeError::BlockingInInterrupt => "BlockingInInterrupt",
            RuntimeError::StackOverflow => "StackOverflow",
            RuntimeError::IdleThreadViolation => "IdleThreadViolation",
        }
    }
}

#[macro_export]
macro_rules! runtime_error {
    ($kind:expr) => {
        $crate::kernel::exception::handle_runtime_error($kind)
    };
}

pub fn handle_runtime_error(error: RuntimeError) -> ! {
    printkln!("kernel: unrecoverable error: {}", error.as_str());
    hal::abort()
}

#[cfg(all(feature = "khal-cortex-m", not(test)))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    printkln!("{}", info);
    hal::abort()
}
