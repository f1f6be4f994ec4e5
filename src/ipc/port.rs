//! IPC Ports - the port object and its lifecycle
//!
//! Based on Mach4 ipc/ipc_port.c
//!
//! A port is a protected message queue with one receive right and counted
//! send and send-once rights. The receive right moves the port through an
//! explicit state machine:
//!
//! - `Receiver`: the receive right sits in some space under a name
//! - `Limbo`: the receive right is held by the kernel, attached to nothing
//! - `Transit`: the receive right is inside a message bound for `dest`
//! - `Dead`: the port is destroyed; only the death timestamp remains
//!
//! Every port-level operation locks the port body internally. Two global
//! locks back the per-port lock: `MULTIPLE_LOCK` serializes whole-chain
//! walks in the circularity check, and the timestamp counter has its own
//! lock so a death stamp can be taken while a port lock is held.
//!
//! Notifications are never delivered under a lock: the decision is taken
//! locked, captured as a `Notification`, and delivered after unlock.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use core::fmt;
use core::mem;

use spin::Mutex;

use super::kmsg;
use super::mqueue::{MessageQueue, WaitResult, QLIMIT_DEFAULT, QLIMIT_MAX};
use super::notify::{self, Notification};
use super::pset::PortSet;
use super::right::{CopiedSend, SendOnceRight, SendRight};
use super::space::{IpcSpace, SpaceEntry, SpaceId};
use super::table::{self, RequestTable, SlotIndex};
use super::{IpcError, IpcResult, PortName};

/// Shared handle to a port. The strong count of the `Arc` is the port's
/// reference count; rights, space entries, queued messages, and transit
/// destinations each hold one.
pub type PortRef = Arc<Port>;

// ============================================================================
// Global locks
// ============================================================================

/// Serializes multi-port lock acquisition in the circularity slow path.
static MULTIPLE_LOCK: Mutex<()> = Mutex::new(());

/// Death timestamp generator. Has its own lock so it can be read while a
/// port lock is held.
static PORT_TIMESTAMP: Mutex<u64> = Mutex::new(0);

/// Next death timestamp. Strictly increasing across all port deaths, used
/// to order a port's death against dead-name right creation.
pub fn timestamp() -> u64 {
    let mut stamp = PORT_TIMESTAMP.lock();
    let value = *stamp;
    *stamp += 1;
    value
}

// ============================================================================
// Port state
// ============================================================================

/// Where the receive right currently is.
#[derive(Debug)]
pub enum PortState {
    /// Held in `space` under `name`.
    Receiver { space: SpaceId, name: PortName },
    /// Held by the kernel, attached to nothing.
    Limbo,
    /// Inside a message destined for `dest`.
    Transit { dest: PortRef },
    /// Destroyed at `timestamp`.
    Dead { timestamp: u64 },
}

// ============================================================================
// Port body
// ============================================================================

/// Everything behind the port lock.
#[derive(Debug)]
pub(crate) struct PortBody {
    pub(crate) state: PortState,
    /// Outstanding send rights.
    pub(crate) srights: u32,
    /// Outstanding send-once rights.
    pub(crate) sorights: u32,
    /// Make-send count: total send rights ever made by the receiver.
    pub(crate) mscount: u32,
    /// Sequence number stamped on the next received message.
    pub(crate) seqno: u32,
    pub(crate) qlimit: u32,
    /// Port-destroyed (backup) notification request.
    pub(crate) pdrequest: Option<SendOnceRight>,
    /// No-senders notification request.
    pub(crate) nsrequest: Option<SendOnceRight>,
    /// Dead-name notification requests.
    pub(crate) dnrequests: Option<Box<RequestTable>>,
    pub(crate) messages: MessageQueue,
    /// The set this port belongs to, if in Receiver state.
    pub(crate) pset: Option<Arc<PortSet>>,
    /// Kernel-object teardown hook, run after the port dies.
    pub(crate) kobject: Option<fn()>,
}

impl PortBody {
    pub(crate) fn is_active(&self) -> bool {
        !matches!(self.state, PortState::Dead { .. })
    }

    pub(crate) fn has_receiver(&self) -> bool {
        matches!(self.state, PortState::Receiver { .. })
    }

    /// The port this one is in transit toward, if any.
    pub(crate) fn destination(&self) -> Option<&PortRef> {
        match &self.state {
            PortState::Transit { dest } => Some(dest),
            _ => None,
        }
    }
}

/// A Mach-style IPC port.
pub struct Port {
    pub(crate) body: Mutex<PortBody>,
}

impl Port {
    pub(crate) fn create(state: PortState) -> PortRef {
        Arc::new(Self {
            body: Mutex::new(PortBody {
                state,
                srights: 0,
                sorights: 0,
                mscount: 0,
                seqno: 0,
                qlimit: QLIMIT_DEFAULT,
                pdrequest: None,
                nsrequest: None,
                dnrequests: None,
                messages: MessageQueue::new(),
                pset: None,
                kobject: None,
            }),
        })
    }

    pub fn is_active(&self) -> bool {
        self.body.lock().is_active()
    }

    pub fn srights(&self) -> u32 {
        self.body.lock().srights
    }

    pub fn sorights(&self) -> u32 {
        self.body.lock().sorights
    }

    pub fn mscount(&self) -> u32 {
        self.body.lock().mscount
    }

    pub fn seqno(&self) -> u32 {
        self.body.lock().seqno
    }

    pub fn qlimit(&self) -> u32 {
        self.body.lock().qlimit
    }

    pub fn msgcount(&self) -> u32 {
        self.body.lock().messages.msgcount()
    }

    /// The name the receive right sits under, while in Receiver state.
    pub fn receiver_name(&self) -> Option<PortName> {
        match self.body.lock().state {
            PortState::Receiver { name, .. } => Some(name),
            _ => None,
        }
    }

    /// The transit destination, while in Transit state.
    pub fn destination(&self) -> Option<PortRef> {
        self.body.lock().destination().cloned()
    }

    /// The death timestamp, once dead.
    pub fn death_timestamp(&self) -> Option<u64> {
        match self.body.lock().state {
            PortState::Dead { timestamp } => Some(timestamp),
            _ => None,
        }
    }

    /// Capacity of the dead-name request table.
    pub fn dnrequest_size(&self) -> usize {
        self.body.lock().dnrequests.as_ref().map_or(0, |t| t.size())
    }
}

impl fmt::Debug for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.body.try_lock() {
            Some(body) => f
                .debug_struct("Port")
                .field("state", &body.state)
                .field("srights", &body.srights)
                .field("sorights", &body.sorights)
                .finish_non_exhaustive(),
            None => f.write_str("Port { <locked> }"),
        }
    }
}

// ============================================================================
// Allocation
// ============================================================================

/// Allocate a port, inserting its receive right into `space` under a fresh
/// name.
pub fn alloc(space: &Arc<IpcSpace>) -> IpcResult<(PortName, PortRef)> {
    let name = space.alloc_name()?;
    let port = Port::create(PortState::Receiver {
        space: space.id(),
        name,
    });
    if let Err(err) = space.insert(name, SpaceEntry::Receive(port.clone())) {
        clear_receiver(&port);
        destroy(port);
        return Err(err);
    }
    Ok((name, port))
}

/// Allocate a port under a caller-chosen name.
pub fn alloc_name(space: &Arc<IpcSpace>, name: PortName) -> IpcResult<PortRef> {
    if name.is_null() || name.is_dead() {
        return Err(IpcError::InvalidName);
    }
    let port = Port::create(PortState::Receiver {
        space: space.id(),
        name,
    });
    if let Err(err) = space.insert(name, SpaceEntry::Receive(port.clone())) {
        clear_receiver(&port);
        destroy(port);
        return Err(err);
    }
    Ok(port)
}

/// Allocate a special port: the receive right belongs to `space` but has no
/// entry in its name table.
pub fn alloc_special(space: SpaceId) -> PortRef {
    Port::create(PortState::Receiver {
        space,
        // Special ports carry a placeholder name; they are never looked up.
        name: PortName::from_raw(1),
    })
}

/// Destroy a special port. It must still hold its receive right in `space`.
pub fn dealloc_special(port: PortRef, space: SpaceId) {
    let mut body = port.body.lock();
    assert!(body.is_active(), "special port already dead");
    match body.state {
        PortState::Receiver { space: holder, .. } => assert_eq!(holder, space),
        _ => panic!("special port without its receive right"),
    }
    // Special ports are never members of a port set.
    assert!(body.pset.is_none());
    body.messages.wake_all_receivers(WaitResult::PortDied);
    body.state = PortState::Limbo;
    body.mscount = 0;
    body.seqno = 0;
    drop(body);
    destroy(port);
}

// ============================================================================
// Send rights
// ============================================================================

/// Make a send right from the receive right, bumping the make-send count.
pub fn make_send(port: &PortRef) -> SendRight {
    let mut body = port.body.lock();
    assert!(body.is_active(), "make_send on a dead port");
    body.srights += 1;
    body.mscount += 1;
    drop(body);
    SendRight::new(port.clone())
}

/// Duplicate an existing send right. Does not touch the make-send count.
pub fn copy_send(right: &SendRight) -> CopiedSend {
    let port = right.port();
    let mut body = port.body.lock();
    if !body.is_active() {
        return CopiedSend::Dead;
    }
    assert!(body.srights > 0);
    body.srights += 1;
    drop(body);
    CopiedSend::Right(SendRight::new(port.clone()))
}

/// Consume a send right. Firing the no-senders notification if this was the
/// last one and a request is armed.
pub fn release_send(right: SendRight) {
    let port = right.into_port();
    let mut body = port.body.lock();
    if !body.is_active() {
        return;
    }
    assert!(body.srights > 0, "send right count underflow");
    body.srights -= 1;
    if body.srights == 0 {
        if let Some(notify) = body.nsrequest.take() {
            let mscount = body.mscount;
            drop(body);
            notify::deliver(Notification::NoSenders { notify, mscount });
        }
    }
}

/// Make a send-once right from the receive right.
pub fn make_sonce(port: &PortRef) -> SendOnceRight {
    let mut body = port.body.lock();
    assert!(body.is_active(), "make_sonce on a dead port");
    body.sorights += 1;
    drop(body);
    SendOnceRight::new(port.clone())
}

/// Consume a send-once right without sending anything.
pub fn release_sonce(right: SendOnceRight) {
    let port = right.into_port();
    let mut body = port.body.lock();
    if !body.is_active() {
        return;
    }
    assert!(body.sorights > 0, "send-once right count underflow");
    body.sorights -= 1;
}

// ============================================================================
// Notification requests
// ============================================================================

/// Register (or clear) the no-senders request, returning the previous one.
///
/// If there are already no send rights and `sync` does not exceed the
/// make-send count, the notification fires immediately instead of arming.
pub fn nsrequest(
    port: &PortRef,
    sync: u32,
    notify: Option<SendOnceRight>,
) -> Option<SendOnceRight> {
    let mut body = port.body.lock();
    assert!(body.is_active(), "nsrequest on a dead port");
    let previous = body.nsrequest.take();
    match notify {
        Some(notify) if body.srights == 0 && sync <= body.mscount => {
            let mscount = body.mscount;
            drop(body);
            notify::deliver(Notification::NoSenders { notify, mscount });
        }
        other => body.nsrequest = other,
    }
    previous
}

/// Register (or clear) the port-destroyed (backup) request, returning the
/// previous one.
pub fn pdrequest(port: &PortRef, notify: Option<SendOnceRight>) -> Option<SendOnceRight> {
    let mut body = port.body.lock();
    assert!(body.is_active(), "pdrequest on a dead port");
    mem::replace(&mut body.pdrequest, notify)
}

/// Register a dead-name request for `name`. `Err(NoSpace)` means the table
/// is missing or full; the caller grows it with `dngrow` and retries.
pub fn dnrequest(
    port: &PortRef,
    name: PortName,
    soright: SendOnceRight,
) -> Result<SlotIndex, (IpcError, SendOnceRight)> {
    debug_assert!(!name.is_null(), "dead-name request for the null name");
    let mut body = port.body.lock();
    if !body.is_active() {
        return Err((IpcError::PortDied, soright));
    }
    match body.dnrequests.as_mut() {
        None => Err((IpcError::NoSpace, soright)),
        Some(table) => table
            .alloc(name, soright)
            .map_err(|right| (IpcError::NoSpace, right)),
    }
}

/// Withdraw the dead-name request at `index`, recovering its right.
pub fn dncancel(port: &PortRef, name: PortName, index: SlotIndex) -> SendOnceRight {
    let mut body = port.body.lock();
    let requests = body
        .dnrequests
        .as_mut()
        .expect("dncancel without a request table");
    requests.cancel(name, index)
}

/// Grow the dead-name request table to hold at least `target` slots (one
/// more than now, if `None`). The new table is allocated with no locks
/// held; a concurrent grower may win, in which case the allocation is
/// discarded.
pub fn dngrow(port: &PortRef, target: Option<usize>) -> IpcResult<()> {
    let body = port.body.lock();
    assert!(body.is_active(), "dngrow on a dead port");
    let current = body.dnrequests.as_ref().map_or(0, |t| t.size());
    let want = target.unwrap_or(current + 1);
    if current >= want {
        return Ok(());
    }
    let new_size = table::next_size(want).ok_or(IpcError::NoSpace)?;
    drop(body);

    let fresh = RequestTable::with_size(new_size);

    let mut body = port.body.lock();
    if !body.is_active() {
        // Died while unlocked; the dead-name requests already fired.
        return Ok(());
    }
    let current = body.dnrequests.as_ref().map_or(0, |t| t.size());
    if current >= new_size {
        // Lost the race to another grower.
        return Ok(());
    }
    let requests = match body.dnrequests.take() {
        Some(old) => fresh.absorb(old),
        None => fresh,
    };
    body.dnrequests = Some(requests);
    Ok(())
}

// ============================================================================
// Queue control
// ============================================================================

/// Change the queue limit, waking blocked senders when it rises.
pub fn set_qlimit(port: &PortRef, qlimit: u32) {
    let mut body = port.body.lock();
    assert!(body.is_active(), "set_qlimit on a dead port");
    let qlimit = qlimit.min(QLIMIT_MAX);
    if qlimit > body.qlimit && body.messages.msgcount() < qlimit {
        let room = (qlimit - body.messages.msgcount()) as usize;
        body.messages.wake_senders(room, WaitResult::Success);
    }
    body.qlimit = qlimit;
}

/// Set the sequence number stamped on the next received message.
pub fn set_seqno(port: &PortRef, seqno: u32) {
    port.body.lock().seqno = seqno;
}

/// Install a teardown hook, run once after the port dies.
pub fn set_kobject(port: &PortRef, hook: fn()) {
    let mut body = port.body.lock();
    assert!(body.is_active(), "set_kobject on a dead port");
    body.kobject = Some(hook);
}

// ============================================================================
// Lifecycle
// ============================================================================

/// Take the receive right out of its space: detach from any port set, wake
/// blocked receivers, and move to Limbo. The space entry itself is removed
/// by the caller.
pub fn clear_receiver(port: &PortRef) {
    let mut body = port.body.lock();
    assert!(body.is_active(), "clear_receiver on a dead port");
    assert!(body.has_receiver(), "clear_receiver without the receive right");
    // Lock order: port, then set.
    if let Some(pset) = body.pset.take() {
        pset.remove_member(port);
    }
    body.messages.wake_all_receivers(WaitResult::PortDied);
    body.state = PortState::Limbo;
    body.mscount = 0;
    body.seqno = 0;
}

/// Destroy a port whose receive right is in Limbo.
///
/// If a backup is registered the port is handed to it in a port-destroyed
/// notification instead of dying, unless that would create a cycle. A real
/// death wakes all waiters, stamps the timestamp, destroys the queued
/// messages, and fires the armed notifications, all after unlocking.
pub fn destroy(port: PortRef) {
    let mut body = port.body.lock();
    assert!(body.is_active(), "destroying a dead port");
    debug_assert!(matches!(body.state, PortState::Limbo));

    if let Some(backup) = body.pdrequest.take() {
        drop(body);
        let backup_dest = backup.port().clone();
        if !check_circularity(&port, &backup_dest) {
            // The port is now in transit inside the notification message.
            notify::deliver(Notification::PortDestroyed {
                notify: backup,
                port,
            });
            return;
        }
        // The backup sits somewhere on this port's own destination chain;
        // redirecting would create a cycle. Consume the request and die.
        notify::deliver(Notification::SendOnceMoot { right: backup });
        body = port.body.lock();
    }

    body.messages.wake_all_senders(WaitResult::Success);
    body.messages.wake_all_receivers(WaitResult::PortDied);

    body.state = PortState::Dead {
        timestamp: timestamp(),
    };
    let nsrequest = body.nsrequest.take();
    let mscount = body.mscount;
    let dnrequests = body.dnrequests.take();
    let kmsgs = body.messages.take_all();
    let kobject = body.kobject.take();
    drop(body);

    if let Some(notify) = nsrequest {
        notify::deliver(Notification::NoSenders { notify, mscount });
    }
    for kmsg in kmsgs {
        kmsg::destroy(kmsg);
    }
    if let Some(requests) = dnrequests {
        requests.notify_all_dead();
    }
    if let Some(hook) = kobject {
        hook();
    }
}

/// Consume a receive right held outside any space (Limbo or Transit),
/// destroying the port. A transit destination's reference is dropped only
/// after the destruction completes.
pub fn release_receive(port: PortRef) {
    let mut body = port.body.lock();
    assert!(body.is_active(), "releasing a dead receive right");
    assert!(!body.has_receiver(), "receive right still in a space");
    let previous = mem::replace(&mut body.state, PortState::Limbo);
    drop(body);
    destroy(port);
    drop(previous);
}

// ============================================================================
// Circularity
// ============================================================================

/// Lock a port and keep it locked past the guard's scope. Paired with
/// `force_unlock` in the circularity slow path.
fn lock_leak(port: &PortRef) -> *mut PortBody {
    spin::MutexGuard::leak(port.body.lock()) as *mut PortBody
}

fn commit_transit(body: &mut PortBody, dest: &PortRef) {
    assert!(matches!(body.state, PortState::Limbo));
    body.state = PortState::Transit {
        dest: dest.clone(),
    };
}

/// Decide whether moving `port`'s receive right into a message for `dest`
/// would make `port` reachable from itself through destination chains.
///
/// Returns `true` if it would (the move must not happen; `port` stays in
/// Limbo). Returns `false` after committing `port` to Transit toward
/// `dest`.
///
/// The fast path handles the common case where `dest` is a chain base. The
/// slow path takes `MULTIPLE_LOCK` and locks every port on the chain from
/// `dest` down to its base, so the chain cannot change underfoot.
pub fn check_circularity(port: &PortRef, dest: &PortRef) -> bool {
    if Arc::ptr_eq(port, dest) {
        return true;
    }

    {
        let mut body = port.body.lock();
        if let Some(dest_body) = dest.body.try_lock() {
            let base = dest_body.destination().is_none();
            drop(dest_body);
            if base {
                commit_transit(&mut body, dest);
                return false;
            }
        }
    }

    let _multiple = MULTIPLE_LOCK.lock();

    let mut chain: Vec<PortRef> = Vec::new();
    let mut next = dest.clone();
    let circular = loop {
        if Arc::ptr_eq(&next, port) {
            break true;
        }
        let raw = lock_leak(&next);
        // SAFETY: `raw` points at the body locked just above; the lock is
        // held until the force_unlock below, and nothing else aliases it.
        let dest_of = unsafe { (*raw).destination().cloned() };
        chain.push(next);
        match dest_of {
            Some(dest) => next = dest,
            None => break false,
        }
    };

    if !circular {
        // `port` is not on the chain, so its lock nests freely under the
        // chain locks.
        let mut body = port.body.lock();
        commit_transit(&mut body, dest);
    }

    for link in chain.iter().rev() {
        // SAFETY: every chain port was locked by `lock_leak` above and is
        // unlocked exactly once here.
        unsafe { link.body.force_unlock() };
    }
    circular
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::kmsg::{DestRight, Kmsg, Payload};
    use crate::ipc::mqueue::{self, Waiter};
    use crate::ipc::notify::{MACH_NOTIFY_NO_SENDERS, MACH_NOTIFY_PORT_DESTROYED};
    use crate::ipc::pset;
    use core::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_references_track_rights() {
        let space = IpcSpace::new();
        let (name, port) = alloc(&space).unwrap();
        // Ours plus the space entry.
        assert_eq!(Arc::strong_count(&port), 2);

        let sright = make_send(&port);
        assert_eq!(Arc::strong_count(&port), 3);
        release_send(sright);
        assert_eq!(Arc::strong_count(&port), 2);

        drop(space.remove(name));
        assert_eq!(Arc::strong_count(&port), 1);
    }

    #[test]
    fn test_make_and_copy_send_counts() {
        let space = IpcSpace::new();
        let (_, port) = alloc(&space).unwrap();

        let original = make_send(&port);
        assert_eq!((port.srights(), port.mscount()), (1, 1));

        let copy = copy_send(&original);
        // Copying does not count as a make.
        assert_eq!((port.srights(), port.mscount()), (2, 1));

        release_send(match copy {
            CopiedSend::Right(right) => right,
            other => panic!("expected a live copy, got {:?}", other),
        });
        release_send(original);
        assert_eq!(port.srights(), 0);
    }

    #[test]
    fn test_no_senders_fires_on_last_release() {
        let space = IpcSpace::new();
        let (_, port) = alloc(&space).unwrap();
        let (_, monitor) = alloc(&space).unwrap();

        let a = make_send(&port);
        let b = make_send(&port);
        assert!(nsrequest(&port, port.mscount(), Some(make_sonce(&monitor))).is_none());

        release_send(a);
        assert_eq!(monitor.msgcount(), 0);
        release_send(b);
        assert_eq!(monitor.msgcount(), 1);

        let kmsg = mqueue::receive(&monitor).unwrap();
        assert_eq!(kmsg.id, MACH_NOTIFY_NO_SENDERS);
        assert!(matches!(kmsg.payload, Payload::NoSenders(2)));
        kmsg::destroy(kmsg);

        // Re-arm: the request fires once and must be registered again.
        let c = make_send(&port);
        assert!(nsrequest(&port, port.mscount(), Some(make_sonce(&monitor))).is_none());
        release_send(c);
        assert_eq!(monitor.msgcount(), 1);
        kmsg::destroy(mqueue::receive(&monitor).unwrap());
    }

    #[test]
    fn test_no_senders_immediate_fire() {
        let space = IpcSpace::new();
        let (_, port) = alloc(&space).unwrap();
        let (_, monitor) = alloc(&space).unwrap();

        // No send rights exist, so the request fires instead of arming.
        assert!(nsrequest(&port, 0, Some(make_sonce(&monitor))).is_none());
        assert_eq!(monitor.msgcount(), 1);
        kmsg::destroy(mqueue::receive(&monitor).unwrap());
    }

    #[test]
    fn test_nsrequest_replaces_previous() {
        let space = IpcSpace::new();
        let (_, port) = alloc(&space).unwrap();
        let (_, monitor) = alloc(&space).unwrap();

        let keep_alive = make_send(&port);
        assert!(nsrequest(&port, 1, Some(make_sonce(&monitor))).is_none());
        let previous = nsrequest(&port, 1, Some(make_sonce(&monitor))).unwrap();
        release_sonce(previous);
        assert_eq!(monitor.sorights(), 1);
        release_send(keep_alive);
    }

    #[test]
    fn test_circularity_self() {
        let space = IpcSpace::new();
        let (_, port) = alloc(&space).unwrap();
        clear_receiver(&port);
        assert!(check_circularity(&port, &port));
        destroy(port);
    }

    #[test]
    fn test_circularity_chain() {
        let space = IpcSpace::new();
        let (_, a) = alloc(&space).unwrap();
        let (_, b) = alloc(&space).unwrap();
        let (_, c) = alloc(&space).unwrap();

        // Build a -> b -> c.
        clear_receiver(&a);
        assert!(!check_circularity(&a, &b));
        clear_receiver(&b);
        assert!(!check_circularity(&b, &c));
        assert!(Arc::ptr_eq(&a.destination().unwrap(), &b));

        // c -> a would close the loop; c stays in Limbo.
        clear_receiver(&c);
        assert!(check_circularity(&c, &a));
        assert!(c.destination().is_none());

        // An outside port can still point into the chain.
        let (_, d) = alloc(&space).unwrap();
        let refs = Arc::strong_count(&a);
        clear_receiver(&d);
        assert!(!check_circularity(&d, &a));
        assert!(Arc::ptr_eq(&d.destination().unwrap(), &a));
        assert_eq!(Arc::strong_count(&a), refs + 1);

        destroy(c);
        release_receive(d);
        release_receive(a);
    }

    #[test]
    fn test_release_receive_in_transit() {
        let space = IpcSpace::new();
        let (_, a) = alloc(&space).unwrap();
        let (_, b) = alloc(&space).unwrap();

        clear_receiver(&a);
        assert!(!check_circularity(&a, &b));
        let refs = Arc::strong_count(&b);

        release_receive(a.clone());
        assert!(!a.is_active());
        assert_eq!(Arc::strong_count(&b), refs - 1);
    }

    #[test]
    fn test_destroy_drains_queue() {
        let space = IpcSpace::new();
        let (name, port) = alloc(&space).unwrap();

        for id in 0..3 {
            let kmsg = Kmsg::new(id, Some(DestRight::Send(make_send(&port))), Payload::None);
            mqueue::send(&port, kmsg).unwrap();
        }
        assert_eq!(port.msgcount(), 3);
        assert_eq!(port.srights(), 3);

        clear_receiver(&port);
        destroy(port.clone());

        assert!(!port.is_active());
        assert_eq!(port.msgcount(), 0);
        drop(space.remove(name));
        // The drained messages gave their rights (and references) back.
        assert_eq!(Arc::strong_count(&port), 1);
    }

    #[test]
    fn test_destroy_fires_dead_name_requests() {
        let space = IpcSpace::new();
        let (_, port) = alloc(&space).unwrap();
        let (_, monitor) = alloc(&space).unwrap();

        dngrow(&port, Some(2)).unwrap();
        dnrequest(&port, PortName::from_raw(77), make_sonce(&monitor)).unwrap();

        clear_receiver(&port);
        destroy(port.clone());

        let kmsg = mqueue::receive(&monitor).unwrap();
        assert!(matches!(kmsg.payload, Payload::DeadName(name) if name.raw() == 77));
        kmsg::destroy(kmsg);
        assert_eq!(monitor.sorights(), 0);
    }

    #[test]
    fn test_dncancel_recovers_right() {
        let space = IpcSpace::new();
        let (_, port) = alloc(&space).unwrap();
        let (_, monitor) = alloc(&space).unwrap();

        dngrow(&port, None).unwrap();
        let index = dnrequest(&port, PortName::from_raw(5), make_sonce(&monitor)).unwrap();
        let right = dncancel(&port, PortName::from_raw(5), index);
        release_sonce(right);
        assert_eq!(monitor.sorights(), 0);

        // A cancelled request does not fire at death.
        clear_receiver(&port);
        destroy(port);
        assert_eq!(monitor.msgcount(), 0);
    }

    #[test]
    fn test_dngrow_race_keeps_registrations() {
        let space = IpcSpace::new();
        let (_, port) = alloc(&space).unwrap();
        let (_, monitor) = alloc(&space).unwrap();

        dngrow(&port, Some(2)).unwrap();
        let index = dnrequest(&port, PortName::from_raw(9), make_sonce(&monitor)).unwrap();

        let first = {
            let port = port.clone();
            std::thread::spawn(move || dngrow(&port, Some(64)))
        };
        let second = {
            let port = port.clone();
            std::thread::spawn(move || dngrow(&port, Some(64)))
        };
        first.join().unwrap().unwrap();
        second.join().unwrap().unwrap();

        // One grower won; the loser's table was discarded without touching
        // the registration.
        assert_eq!(port.dnrequest_size(), 64);
        let right = dncancel(&port, PortName::from_raw(9), index);
        release_sonce(right);
    }

    #[test]
    fn test_backup_redirects_destruction() {
        let space = IpcSpace::new();
        let (_, port) = alloc(&space).unwrap();
        let (_, backup) = alloc(&space).unwrap();

        assert!(pdrequest(&port, Some(make_sonce(&backup))).is_none());
        clear_receiver(&port);
        destroy(port.clone());

        // The port survived, in transit toward its backup.
        assert!(port.is_active());
        assert!(Arc::ptr_eq(&port.destination().unwrap(), &backup));

        let kmsg = mqueue::receive(&backup).unwrap();
        assert_eq!(kmsg.id, MACH_NOTIFY_PORT_DESTROYED);
        assert!(matches!(&kmsg.payload, Payload::PortDestroyed(p) if Arc::ptr_eq(p, &port)));

        // Nobody claims the carried receive right; it unwinds, and this
        // time the port really dies.
        kmsg::destroy(kmsg);
        assert!(!port.is_active());
    }

    #[test]
    fn test_backup_cycle_falls_through_to_death() {
        let space = IpcSpace::new();
        let (_, port) = alloc(&space).unwrap();

        // Backup is the port itself: redirection would be circular.
        assert!(pdrequest(&port, Some(make_sonce(&port))).is_none());
        clear_receiver(&port);
        destroy(port.clone());

        assert!(!port.is_active());
        assert_eq!(port.sorights(), 0);
        assert!(port.death_timestamp().is_some());
    }

    #[test]
    fn test_death_timestamps_increase() {
        let space = IpcSpace::new();
        let (_, first) = alloc(&space).unwrap();
        let (_, second) = alloc(&space).unwrap();

        clear_receiver(&first);
        destroy(first.clone());
        clear_receiver(&second);
        destroy(second.clone());

        let t1 = first.death_timestamp().unwrap();
        let t2 = second.death_timestamp().unwrap();
        assert!(t1 < t2);
    }

    #[test]
    fn test_clear_receiver_resets_counters() {
        let space = IpcSpace::new();
        let (_, port) = alloc(&space).unwrap();
        let set = pset::PortSet::new();

        pset::add_member(&set, &port).unwrap();
        let sright = make_send(&port);
        set_seqno(&port, 17);
        assert_eq!((port.mscount(), port.seqno()), (1, 17));

        clear_receiver(&port);
        assert_eq!((port.mscount(), port.seqno()), (0, 0));
        assert!(port.receiver_name().is_none());
        assert_eq!(set.member_count(), 0);

        release_send(sright);
        destroy(port);
    }

    #[test]
    fn test_qlimit_raise_wakes_blocked_senders() {
        let space = IpcSpace::new();
        let (_, port) = alloc(&space).unwrap();
        set_qlimit(&port, 1);

        let kmsg = Kmsg::new(1, Some(DestRight::Send(make_send(&port))), Payload::None);
        mqueue::send(&port, kmsg).unwrap();

        let waiter = Waiter::new();
        let kmsg = Kmsg::new(2, Some(DestRight::Send(make_send(&port))), Payload::None);
        let (err, kmsg) = mqueue::send_wait(&port, kmsg, &waiter).unwrap_err();
        assert_eq!(err, IpcError::WouldBlock);

        set_qlimit(&port, 5);
        assert_eq!(waiter.result(), Some(mqueue::WaitResult::Success));
        mqueue::send(&port, kmsg).unwrap();

        // Over-max requests clamp.
        set_qlimit(&port, QLIMIT_MAX + 100);
        assert_eq!(port.qlimit(), QLIMIT_MAX);
    }

    #[test]
    #[should_panic(expected = "set_qlimit on a dead port")]
    fn test_set_qlimit_on_dead_port_asserts() {
        let space = IpcSpace::new();
        let (_, port) = alloc(&space).unwrap();
        clear_receiver(&port);
        destroy(port.clone());
        set_qlimit(&port, 10);
    }

    #[test]
    #[should_panic(expected = "dead-name request for the null name")]
    fn test_dnrequest_null_name_asserts() {
        let space = IpcSpace::new();
        let (_, port) = alloc(&space).unwrap();
        let (_, monitor) = alloc(&space).unwrap();
        dngrow(&port, None).unwrap();
        let _ = dnrequest(&port, PortName::NULL, make_sonce(&monitor));
    }

    #[test]
    fn test_alloc_name_validation() {
        let space = IpcSpace::new();
        assert_eq!(
            alloc_name(&space, PortName::NULL).unwrap_err(),
            IpcError::InvalidName
        );
        assert_eq!(
            alloc_name(&space, PortName::DEAD).unwrap_err(),
            IpcError::InvalidName
        );

        let port = alloc_name(&space, PortName::from_raw(100)).unwrap();
        assert_eq!(port.receiver_name(), Some(PortName::from_raw(100)));
        assert_eq!(
            alloc_name(&space, PortName::from_raw(100)).unwrap_err(),
            IpcError::NameExists
        );
    }

    #[test]
    fn test_special_port_lifecycle() {
        let id = SpaceId(999);
        let port = alloc_special(id);
        assert!(port.is_active());
        assert_eq!(port.receiver_name(), Some(PortName::from_raw(1)));

        let sright = make_send(&port);
        release_send(sright);

        dealloc_special(port.clone(), id);
        assert!(!port.is_active());
    }

    #[test]
    fn test_kobject_hook_runs_after_death() {
        static HOOK_RUNS: AtomicU32 = AtomicU32::new(0);
        fn hook() {
            HOOK_RUNS.fetch_add(1, Ordering::SeqCst);
        }

        let space = IpcSpace::new();
        let (_, port) = alloc(&space).unwrap();
        set_kobject(&port, hook);

        clear_receiver(&port);
        destroy(port.clone());
        assert!(!port.is_active());
        assert_eq!(HOOK_RUNS.load(Ordering::SeqCst), 1);
    }
}
