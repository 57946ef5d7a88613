//! Kernel console output.
//!
//! `printk!`/`printkln!` format through the KHAL console: RTT on
//! hardware, stdout on the host.

use crate::kernel::hal;
use core::fmt::{Error, Write};

pub struct Printk;

impl Write for Printk {
    fn write_str(&mut self, s: &str) -> Result<(), Error> {
        hal::console_write(s);
        Ok(())
    }
}

#[macro_export]
macro_rules! printk {
    ($($arg:tt)*) => {{
        use ::core::fmt::Write;
        let _ = ::core::write!($crate::kernel::printk::Printk, $($arg)*);
    }};
}

#[macro_export]
macro_rules! printkln {
    () => ($crate::printk!("\r\n"));
    ($fmt:expr) => ({
        $crate::printk!(concat!($fmt, "\r\n"))
    });
    ($fmt:expr, $($arg:tt)*) => ({
        $crate::printk!(concat!($fmt, "\r\n"), $($arg)*)
    });
}
