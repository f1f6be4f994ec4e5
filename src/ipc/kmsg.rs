//! IPC Kernel Message - minimal internal message representation
//!
//! Based on Mach4 ipc/ipc_kmsg.h
//!
//! The port subsystem only needs the destruction / ownership-transfer
//! surface of kernel messages: a message carries the right it was addressed
//! with (which doubles as the structural reference keeping the queued-on
//! port alive) and a typed payload that may itself hold rights. Content
//! marshalling lives elsewhere.

use alloc::vec::Vec;

use super::port::{self, PortRef};
use super::right::{SendOnceRight, SendRight};
use super::PortName;

/// Message ID type
pub type MsgId = i32;

/// The right a message was addressed with.
#[derive(Debug)]
pub enum DestRight {
    Send(SendRight),
    SendOnce(SendOnceRight),
}

impl DestRight {
    /// Give the right back to the port subsystem.
    pub(crate) fn release(self) {
        match self {
            DestRight::Send(right) => port::release_send(right),
            DestRight::SendOnce(right) => port::release_sonce(right),
        }
    }
}

/// Typed message payload.
///
/// User messages carry inline bytes; the notification payloads match the
/// bodies of the corresponding Mach notification messages.
#[derive(Debug)]
pub enum Payload {
    None,
    Inline(Vec<u8>),
    /// Dead-name notification body: the name that became meaningless
    DeadName(PortName),
    /// No-senders notification body: make-send count at the zero crossing
    NoSenders(u32),
    /// Port-destroyed notification body: the dying port's receive right
    PortDestroyed(PortRef),
}

/// A kernel message as queued on a port.
#[derive(Debug)]
pub struct Kmsg {
    pub id: MsgId,
    /// The right this message was sent with; `None` once detached during
    /// queue teardown.
    pub dest: Option<DestRight>,
    pub payload: Payload,
    /// Sequence number, stamped at dequeue time.
    pub seqno: u32,
}

impl Kmsg {
    pub fn new(id: MsgId, dest: Option<DestRight>, payload: Payload) -> Self {
        Self {
            id,
            dest,
            payload,
            seqno: 0,
        }
    }
}

/// Destroy a message, releasing every right it carries.
pub fn destroy(kmsg: Kmsg) {
    let Kmsg { dest, payload, .. } = kmsg;
    if let Some(dest) = dest {
        dest.release();
    }
    match payload {
        // An undelivered receive right unwinds with the message.
        Payload::PortDestroyed(port) => port::release_receive(port),
        Payload::None | Payload::Inline(_) | Payload::DeadName(_) | Payload::NoSenders(_) => {}
    }
}

// ============================================================================
// Tests
// ============================================================================
