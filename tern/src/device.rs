//! The device contract.
//!
//! Drivers expose byte-oriented devices as an opaque [`Device`] carrying
//! per-instance state and a table of operations. The kernel only provides
//! the registry: drivers register themselves by name at init and users
//! look them up; what bytes mean — framing, buffering, byte order — is
//! entirely the driver's business.
//!
//! Driver interrupt handlers may signal events and use the non-blocking
//! queue operations, but must not allocate or take mutexes from interrupt
//! context.

use crate::cell::RacyCell;
use crate::error::{Error, Result};
use crate::kernel::list::{impl_linked, List, ListTag, Node};
use crate::sync::InterruptLock;

/// Operations a driver implements for its device.
pub struct DeviceOps {
    pub open: fn(&Device) -> Result<()>,
    pub close: fn(&Device) -> Result<()>,
    pub read: fn(&Device, &mut [u8]) -> Result<usize>,
    pub write: fn(&Device, &[u8]) -> Result<usize>,
    pub ioctl: fn(&Device, u32, usize) -> Result<usize>,
}

pub struct DeviceListTag;

impl ListTag for DeviceListTag {}

/// A registered device: a name, an operation table, and opaque
/// per-instance state.
pub struct Device {
    name: &'static str,
    ops: &'static DeviceOps,
    state: *mut (),
    registry_link: Node<Device, DeviceListTag>,
}

impl_linked!(registry_link, Device, DeviceListTag);

unsafe impl Send for Device {}
unsafe impl Sync for Device {}

impl Device {
    pub const fn new(name: &'static str, ops: &'static DeviceOps, state: *mut ()) -> Device {
        Device {
            name,
            ops,
            state,
            registry_link: Node::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The driver's per-instance state pointer.
    pub fn state(&self) -> *mut () {
        self.state
    }

    pub fn open(&self) -> Result<()> {
        (self.ops.open)(self)
    }

    pub fn close(&self) -> Result<()> {
        (self.ops.close)(self)
    }

    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        (self.ops.read)(self, buf)
    }

    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        (self.ops.write)(self, buf)
    }

    pub fn ioctl(&self, request: u32, arg: usize) -> Result<usize> {
        (self.ops.ioctl)(self, request, arg)
    }
}

static REGISTRY: RacyCell<List<Device, DeviceListTag>> = RacyCell::new(List::new());

/// Register a device under its name. Names must be unique;
/// `InvalidState` if the name is taken.
pub fn register(device: &'static Device) -> Result<()> {
    InterruptLock::with(|_key| {
        let registry = unsafe { REGISTRY.get_mut() };
        let taken = registry
            .iter()
            .any(|d| unsafe { d.as_ref() }.name == device.name);
        if taken {
            return Err(Error::InvalidState);
        }
        registry.push_back(core::ptr::NonNull::from(device));
        Ok(())
    })
}

/// Find a registered device by name.
pub fn lookup(name: &str) -> Option<&'static Device> {
    InterruptLock::with(|_key| {
        let registry = unsafe { REGISTRY.get_mut() };
        registry
            .iter()
            .find(|d| unsafe { d.as_ref() }.name == name)
            .map(|d| unsafe { &*d.as_ptr() })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nop_open(_dev: &Device) -> Result<()> {
        Ok(())
    }

    fn nop_close(_dev: &Device) -> Result<()> {
        Ok(())
    }

    fn echo_read(dev: &Device, buf: &mut [u8]) -> Result<usize> {
        let state = dev.state() as *const u8;
        for b in buf.iter_mut() {
            *b = unsafe { *state };
        }
        Ok(buf.len())
    }

    fn count_write(_dev: &Device, buf: &[u8]) -> Result<usize> {
        Ok(buf.len())
    }

    fn nop_ioctl(_dev: &Device, _request: u32, _arg: usize) -> Result<usize> {
        Ok(0)
    }

    static OPS: DeviceOps = DeviceOps {
        open: nop_open,
        close: nop_close,
        read: echo_read,
        write: count_write,
        ioctl: nop_ioctl,
    };

    static FILL: u8 = 0x42;

    #[test]
    fn register_lookup_and_dispatch() {
        static UART9: Device =
            Device::new("uart9", &OPS, &FILL as *const u8 as *mut ());

        register(&UART9).unwrap();
        assert!(register(&UART9).is_err());

        let dev = lookup("uart9").unwrap();
        dev.open().unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(dev.read(&mut buf).unwrap(), 4);
        assert_eq!(buf, [0x42; 4]);
        assert_eq!(dev.write(b"xyz").unwrap(), 3);
        dev.close().unwrap();

        assert!(lookup("uart10").is_none());
    }
}
