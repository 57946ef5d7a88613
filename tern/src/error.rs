/// Errors surfaced by kernel operations.
///
/// The kernel never aborts on a caller mistake; every fallible operation
/// reports one of these and leaves the system running. Misuse that cannot
/// be reported — blocking from an interrupt handler, a smashed stack — is
/// handled by [`runtime_error!`](crate::runtime_error) instead.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// The kernel heap could not satisfy the allocation.
    OutOfMemory,

    /// A blocking operation reached its deadline before completing.
    Timeout,

    /// The operation is not valid in the object's current state, such as
    /// releasing a mutex the caller does not own, re-acquiring a
    /// non-recursive mutex, or freeing a pointer that did not come from
    /// the kernel heap.
    InvalidState,

    /// A parameter was out of range: bad priority, undersized stack,
    /// unknown IRQ number.
    InvalidArgument,

    /// A non-blocking operation would have had to block.
    WouldBlock,
}

impl Error {
    pub fn as_str(&self) -> &'static str {
        match self {
            Error::OutOfMemory => "OutOfMemory",
            Error::Timeout => "Timeout",
            Error::InvalidState => "InvalidState",
            Error::InvalidArgument => "InvalidArgument",
            Error::WouldBlock => "WouldBlock",
        }
    }
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type Result<T> = core::result::Result<T, Error>;
