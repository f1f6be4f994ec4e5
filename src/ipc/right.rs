//! IPC Rights - typed port right handles
//!
//! Based on Mach4 ipc/ipc_right.c
//!
//! A right is ownership of one unit of a port's right count plus one
//! reference on the port object. Rights are move-only: consuming one
//! (releasing it, storing it in a notification slot, carrying it in a
//! message) transfers exactly that one count and one reference, so
//! over-release is unrepresentable rather than merely asserted.
//!
//! Receive rights have no wrapper type: holding the port object itself with
//! the state machine in `Receiver`, `Limbo`, or `Transit` is the receive
//! right, matching how the kernel passes `ipc_port_t` around.

use core::fmt;

use alloc::sync::Arc;

use super::port::{self, PortRef};
use super::space::IpcSpace;
use super::PortName;

// ============================================================================
// Send right
// ============================================================================

/// A capability to enqueue messages on a port.
///
/// Created by `port::make_send` / `port::copy_send`, consumed by
/// `port::release_send` or by being carried in a message.
#[must_use]
pub struct SendRight {
    port: PortRef,
}

impl SendRight {
    pub(crate) fn new(port: PortRef) -> Self {
        Self { port }
    }

    /// The port this right names.
    pub fn port(&self) -> &PortRef {
        &self.port
    }

    pub(crate) fn into_port(self) -> PortRef {
        self.port
    }
}

impl fmt::Debug for SendRight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SendRight")
            .field(&Arc::as_ptr(&self.port))
            .finish()
    }
}

// ============================================================================
// Send-once right
// ============================================================================

/// A capability to send exactly one message (usually a notification).
///
/// Created by `port::make_sonce`, consumed by `port::release_sonce` or by a
/// notification delivery.
#[must_use]
pub struct SendOnceRight {
    port: PortRef,
}

impl SendOnceRight {
    pub(crate) fn new(port: PortRef) -> Self {
        Self { port }
    }

    /// The port this right names.
    pub fn port(&self) -> &PortRef {
        &self.port
    }

    pub(crate) fn into_port(self) -> PortRef {
        self.port
    }
}

impl fmt::Debug for SendOnceRight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SendOnceRight")
            .field(&Arc::as_ptr(&self.port))
            .finish()
    }
}

// ============================================================================
// Send rights in message slots
// ============================================================================

/// A send right as it appears in a message slot: possibly absent, possibly
/// denoting a port that has already died.
#[derive(Debug)]
pub enum CopiedSend {
    /// No right at all
    Null,
    /// The right's port died; only the sentinel remains
    Dead,
    /// A live send right
    Right(SendRight),
}

impl CopiedSend {
    /// Duplicate the slot. Sentinels copy as themselves; a live right is
    /// copied through the port, which may report the port has since died.
    pub fn copy(&self) -> CopiedSend {
        match self {
            CopiedSend::Null => CopiedSend::Null,
            CopiedSend::Dead => CopiedSend::Dead,
            CopiedSend::Right(right) => port::copy_send(right),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, CopiedSend::Null)
    }

    pub fn is_dead(&self) -> bool {
        matches!(self, CopiedSend::Dead)
    }

    pub fn as_right(&self) -> Option<&SendRight> {
        match self {
            CopiedSend::Right(r) => Some(r),
            _ => None,
        }
    }
}

// ============================================================================
// Copyout
// ============================================================================

/// Insert a send right into a space, returning the name it got.
///
/// Copyout never leaves the caller holding a right it cannot name: on any
/// failure the right is released and a sentinel name is returned instead.
/// A dead port (or a right that went dead in transit) copies out as
/// `PortName::DEAD`; a space that cannot accept the entry yields
/// `PortName::NULL`.
pub fn copyout_send(space: &Arc<IpcSpace>, send: CopiedSend) -> PortName {
    let right = match send {
        CopiedSend::Null => return PortName::NULL,
        CopiedSend::Dead => return PortName::DEAD,
        CopiedSend::Right(right) => right,
    };

    if !right.port().is_active() {
        port::release_send(right);
        return PortName::DEAD;
    }

    match space.copyout_send(right) {
        Ok(name) => name,
        Err(right) => {
            port::release_send(right);
            PortName::NULL
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
