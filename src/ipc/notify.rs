//! IPC Notifications - no-senders, port-destroyed, dead-name delivery
//!
//! Based on Mach4 ipc/ipc_notify.c
//!
//! State transitions decide to notify while holding a port lock; the
//! decision is captured as a `Notification` value and handed to `deliver`
//! only after every lock is released, because delivery locks the target
//! port. Each notification consumes exactly one send-once right, whether it
//! is delivered, dropped with a dead target, or declared moot.

use alloc::vec::Vec;

use super::kmsg::{self, DestRight, Kmsg, MsgId, Payload};
use super::mqueue;
use super::port;
use super::right::SendOnceRight;
use super::PortName;

// ============================================================================
// Notification message IDs
// ============================================================================

pub const MACH_NOTIFY_DEAD_NAME: MsgId = 0x0041;
pub const MACH_NOTIFY_NO_SENDERS: MsgId = 0x0046;
pub const MACH_NOTIFY_SEND_ONCE: MsgId = 0x0047;
pub const MACH_NOTIFY_PORT_DELETED: MsgId = 0x0048;
pub const MACH_NOTIFY_PORT_DESTROYED: MsgId = 0x0049;

// ============================================================================
// Notification commands
// ============================================================================

/// A pending notification decided under a port lock.
#[derive(Debug)]
pub enum Notification {
    /// Send rights hit zero; payload is the make-send count at that moment.
    NoSenders { notify: SendOnceRight, mscount: u32 },
    /// A port with a backup died; payload is the port itself, now in
    /// transit toward the backup.
    PortDestroyed { notify: SendOnceRight, port: port::PortRef },
    /// A name in some space now denotes nothing.
    DeadName { notify: SendOnceRight, name: PortName },
    /// The right will never be used; consume it without delivering.
    SendOnceMoot { right: SendOnceRight },
}

/// Perform one delivery. Must be called with no port locks held.
pub fn deliver(notification: Notification) {
    match notification {
        Notification::NoSenders { notify, mscount } => {
            send_notification(notify, MACH_NOTIFY_NO_SENDERS, Payload::NoSenders(mscount));
        }
        Notification::PortDestroyed { notify, port } => {
            send_notification(notify, MACH_NOTIFY_PORT_DESTROYED, Payload::PortDestroyed(port));
        }
        Notification::DeadName { notify, name } => {
            send_notification(notify, MACH_NOTIFY_DEAD_NAME, Payload::DeadName(name));
        }
        Notification::SendOnceMoot { right } => port::release_sonce(right),
    }
}

/// Deliver a batch in order.
pub fn deliver_all(batch: Vec<Notification>) {
    for notification in batch {
        deliver(notification);
    }
}

fn send_notification(notify: SendOnceRight, id: MsgId, payload: Payload) {
    let target = notify.port().clone();
    let kmsg = Kmsg::new(id, Some(DestRight::SendOnce(notify)), payload);
    if let Err(kmsg) = mqueue::send_always(&target, kmsg) {
        // The target was torn down concurrently. Fire-and-forget: the right
        // and any carried payload unwind with the message.
        kmsg::destroy(kmsg);
    }
}

// ============================================================================
// Tests
// ============================================================================
