//! Mach-style Inter-Process Communication
//!
//! All communication happens through ports. This module tree implements the
//! port object itself; spaces, message queues, and port sets appear only in
//! the narrow forms the port lifecycle needs.

pub mod kmsg;
pub mod mqueue;
pub mod notify;
pub mod port;
pub mod pset;
pub mod right;
pub mod space;
pub mod table;

/// Port name type (like Mach's mach_port_t)
///
/// Names are space-relative; the kernel-side port object carries no global
/// name of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PortName(u32);

impl PortName {
    /// The null name: denotes no right at all.
    pub const NULL: Self = Self(0);

    /// The dead name sentinel: denotes a right whose port has died.
    pub const DEAD: Self = Self(u32::MAX);

    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }

    pub fn is_dead(&self) -> bool {
        self.0 == u32::MAX
    }

    /// Get the underlying value of the port name.
    pub fn raw(&self) -> u32 {
        self.0
    }
}

/// IPC error types
///
/// These cover the recoverable conditions only. Precondition violations
/// (operating on an inactive port where activity is part of the contract,
/// over-releasing a right) are caller bugs and assert instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcError {
    /// Table or queue capacity exhausted
    NoSpace,
    /// Requested name is already in use
    NameExists,
    /// Name is not usable (null or the dead sentinel)
    InvalidName,
    /// The right is not of the kind the operation needs
    InvalidRight,
    /// The port (or space, or set) is no longer active
    PortDied,
    /// The operation cannot complete without blocking
    WouldBlock,
}

/// Result type for IPC operations
pub type IpcResult<T> = Result<T, IpcError>;
