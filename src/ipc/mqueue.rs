//! IPC Message Queue - per-port message queue and waiter lists
//!
//! Based on Mach4 ipc/ipc_mqueue.c
//!
//! The queue lives inside the port body and is protected by the port lock;
//! there is no separate queue lock. Blocked senders and receivers are
//! represented as waiter handles with a wake result, not real threads: the
//! scheduler is an external collaborator and only "wake up and mark result"
//! is modelled here.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::mem;
use core::sync::atomic::{AtomicU32, Ordering};

use super::kmsg::Kmsg;
use super::port::PortRef;
use super::{IpcError, IpcResult};

// ============================================================================
// Queue Limits
// ============================================================================

/// Default queue limit (number of messages)
pub const QLIMIT_DEFAULT: u32 = 5;

/// Maximum queue limit
pub const QLIMIT_MAX: u32 = 1024;

// ============================================================================
// Waiters
// ============================================================================

const WAIT_PENDING: u32 = 0;
const WAIT_SUCCESS: u32 = 1;
const WAIT_PORT_DIED: u32 = 2;

/// Outcome handed to a blocked thread when it is woken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    /// Retry the operation; it should now make progress (or observe the
    /// port's death itself).
    Success,
    /// The port died while the thread was blocked.
    PortDied,
}

/// A thread blocked on a message queue.
///
/// Wake-up is sticky: the first result wins and later wakes are ignored.
#[derive(Debug)]
pub struct Waiter {
    state: AtomicU32,
}

impl Waiter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: AtomicU32::new(WAIT_PENDING),
        })
    }

    pub(crate) fn wake(&self, result: WaitResult) {
        let value = match result {
            WaitResult::Success => WAIT_SUCCESS,
            WaitResult::PortDied => WAIT_PORT_DIED,
        };
        let _ = self
            .state
            .compare_exchange(WAIT_PENDING, value, Ordering::SeqCst, Ordering::SeqCst);
    }

    /// The wake result, once woken.
    pub fn result(&self) -> Option<WaitResult> {
        match self.state.load(Ordering::SeqCst) {
            WAIT_SUCCESS => Some(WaitResult::Success),
            WAIT_PORT_DIED => Some(WaitResult::PortDied),
            _ => None,
        }
    }
}

// ============================================================================
// Message Queue
// ============================================================================

/// FIFO message queue plus waiter lists, embedded in the port body.
#[derive(Debug)]
pub(crate) struct MessageQueue {
    kmsgs: VecDeque<Kmsg>,
    msgcount: u32,
    blocked_senders: VecDeque<Arc<Waiter>>,
    blocked_receivers: VecDeque<Arc<Waiter>>,
}

impl MessageQueue {
    pub(crate) fn new() -> Self {
        Self {
            kmsgs: VecDeque::new(),
            msgcount: 0,
            blocked_senders: VecDeque::new(),
            blocked_receivers: VecDeque::new(),
        }
    }

    pub(crate) fn msgcount(&self) -> u32 {
        self.msgcount
    }

    pub(crate) fn blocked_sender_count(&self) -> usize {
        self.blocked_senders.len()
    }

    pub(crate) fn push(&mut self, kmsg: Kmsg) {
        self.kmsgs.push_back(kmsg);
        self.msgcount += 1;
    }

    pub(crate) fn pop(&mut self) -> Option<Kmsg> {
        let kmsg = self.kmsgs.pop_front()?;
        self.msgcount -= 1;
        Some(kmsg)
    }

    pub(crate) fn enqueue_sender(&mut self, waiter: Arc<Waiter>) {
        self.blocked_senders.push_back(waiter);
    }

    pub(crate) fn enqueue_receiver(&mut self, waiter: Arc<Waiter>) {
        self.blocked_receivers.push_back(waiter);
    }

    /// Wake up to `n` blocked senders in FIFO order.
    pub(crate) fn wake_senders(&mut self, n: usize, result: WaitResult) {
        for _ in 0..n {
            match self.blocked_senders.pop_front() {
                Some(waiter) => waiter.wake(result),
                None => break,
            }
        }
    }

    pub(crate) fn wake_all_senders(&mut self, result: WaitResult) {
        for waiter in self.blocked_senders.drain(..) {
            waiter.wake(result);
        }
    }

    pub(crate) fn wake_one_receiver(&mut self, result: WaitResult) {
        if let Some(waiter) = self.blocked_receivers.pop_front() {
            waiter.wake(result);
        }
    }

    pub(crate) fn wake_all_receivers(&mut self, result: WaitResult) {
        for waiter in self.blocked_receivers.drain(..) {
            waiter.wake(result);
        }
    }

    /// Remove every queued message, zeroing the count. Used by port
    /// destruction; the caller destroys the messages with no locks held.
    pub(crate) fn take_all(&mut self) -> VecDeque<Kmsg> {
        self.msgcount = 0;
        mem::take(&mut self.kmsgs)
    }
}

// ============================================================================
// Port-level operations
// ============================================================================

/// Enqueue a message (non-blocking).
///
/// The message's destination right is the structural reference that keeps
/// the port alive while the message is queued.
pub fn send(port: &PortRef, kmsg: Kmsg) -> Result<(), (IpcError, Kmsg)> {
    let mut body = port.body.lock();
    if !body.is_active() {
        drop(body);
        return Err((IpcError::PortDied, kmsg));
    }
    if body.messages.msgcount() >= body.qlimit {
        drop(body);
        return Err((IpcError::NoSpace, kmsg));
    }
    body.messages.push(kmsg);
    body.messages.wake_one_receiver(WaitResult::Success);
    Ok(())
}

/// Enqueue a message, registering `waiter` on the blocked-sender list if the
/// queue is at its limit. The caller suspends on the waiter and retries when
/// woken.
pub fn send_wait(
    port: &PortRef,
    kmsg: Kmsg,
    waiter: &Arc<Waiter>,
) -> Result<(), (IpcError, Kmsg)> {
    let mut body = port.body.lock();
    if !body.is_active() {
        drop(body);
        return Err((IpcError::PortDied, kmsg));
    }
    if body.messages.msgcount() >= body.qlimit {
        body.messages.enqueue_sender(waiter.clone());
        drop(body);
        return Err((IpcError::WouldBlock, kmsg));
    }
    body.messages.push(kmsg);
    body.messages.wake_one_receiver(WaitResult::Success);
    Ok(())
}

/// Enqueue ignoring the queue limit. Notification deliveries use this; a
/// send-once send is never subject to flow control.
pub(crate) fn send_always(port: &PortRef, kmsg: Kmsg) -> Result<(), Kmsg> {
    let mut body = port.body.lock();
    if !body.is_active() {
        drop(body);
        return Err(kmsg);
    }
    body.messages.push(kmsg);
    body.messages.wake_one_receiver(WaitResult::Success);
    Ok(())
}

/// Dequeue a message (non-blocking), stamping its sequence number and waking
/// one blocked sender now that there is room.
pub fn receive(port: &PortRef) -> IpcResult<Kmsg> {
    let mut body = port.body.lock();
    match body.messages.pop() {
        Some(mut kmsg) => {
            kmsg.seqno = body.seqno;
            body.seqno = body.seqno.wrapping_add(1);
            if body.messages.msgcount() < body.qlimit {
                body.messages.wake_senders(1, WaitResult::Success);
            }
            Ok(kmsg)
        }
        None => {
            if body.is_active() {
                Err(IpcError::WouldBlock)
            } else {
                Err(IpcError::PortDied)
            }
        }
    }
}

/// Register a receiver waiter on an empty queue. Woken by the next send, or
/// with `PortDied` when the receive right is cleared or the port destroyed.
pub fn receive_wait(port: &PortRef, waiter: &Arc<Waiter>) -> IpcResult<Kmsg> {
    match receive(port) {
        Ok(kmsg) => Ok(kmsg),
        Err(IpcError::WouldBlock) => {
            let mut body = port.body.lock();
            if !body.is_active() {
                return Err(IpcError::PortDied);
            }
            body.messages.enqueue_receiver(waiter.clone());
            Err(IpcError::WouldBlock)
        }
        Err(err) => Err(err),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::kmsg::{self, DestRight, Payload};
    use crate::ipc::port;
    use crate::ipc::space::IpcSpace;

    fn user_kmsg(port: &PortRef, id: i32) -> Kmsg {
        let sright = port::make_send(port);
        Kmsg::new(id, Some(DestRight::Send(sright)), Payload::None)
    }

    #[test]
    fn test_send_receive_fifo_and_seqno() {
        let space = IpcSpace::new();
        let (_, port) = port::alloc(&space).unwrap();

        send(&port, user_kmsg(&port, 1)).unwrap();
        send(&port, user_kmsg(&port, 2)).unwrap();
        assert_eq!(port.msgcount(), 2);

        let first = receive(&port).unwrap();
        let second = receive(&port).unwrap();
        assert_eq!((first.id, first.seqno), (1, 0));
        assert_eq!((second.id, second.seqno), (2, 1));
        assert_eq!(port.msgcount(), 0);

        kmsg::destroy(first);
        kmsg::destroy(second);
    }

    #[test]
    fn test_send_full_queue() {
        let space = IpcSpace::new();
        let (_, port) = port::alloc(&space).unwrap();
        port::set_qlimit(&port, 1);

        send(&port, user_kmsg(&port, 1)).unwrap();
        let (err, kmsg) = send(&port, user_kmsg(&port, 2)).unwrap_err();
        assert_eq!(err, IpcError::NoSpace);
        kmsg::destroy(kmsg);
    }

    #[test]
    fn test_send_wait_then_receive_wakes_sender() {
        let space = IpcSpace::new();
        let (_, port) = port::alloc(&space).unwrap();
        port::set_qlimit(&port, 1);

        send(&port, user_kmsg(&port, 1)).unwrap();

        let waiter = Waiter::new();
        let (err, kmsg) = send_wait(&port, user_kmsg(&port, 2), &waiter).unwrap_err();
        assert_eq!(err, IpcError::WouldBlock);
        assert_eq!(waiter.result(), None);
        assert_eq!(port.body.lock().messages.blocked_sender_count(), 1);

        let received = receive(&port).unwrap();
        assert_eq!(waiter.result(), Some(WaitResult::Success));
        assert_eq!(port.body.lock().messages.blocked_sender_count(), 0);

        kmsg::destroy(received);
        kmsg::destroy(kmsg);
    }

    #[test]
    fn test_receive_wait_woken_by_send() {
        let space = IpcSpace::new();
        let (_, port) = port::alloc(&space).unwrap();

        let waiter = Waiter::new();
        let err = receive_wait(&port, &waiter).unwrap_err();
        assert_eq!(err, IpcError::WouldBlock);
        assert_eq!(waiter.result(), None);

        send(&port, user_kmsg(&port, 1)).unwrap();
        assert_eq!(waiter.result(), Some(WaitResult::Success));

        // The woken receiver retries and finds the message.
        let kmsg = receive(&port).unwrap();
        assert_eq!(kmsg.id, 1);
        kmsg::destroy(kmsg);
    }

    #[test]
    fn test_blocked_receiver_woken_when_receiver_cleared() {
        let space = IpcSpace::new();
        let (_, port) = port::alloc(&space).unwrap();

        let waiter = Waiter::new();
        let err = receive_wait(&port, &waiter).unwrap_err();
        assert_eq!(err, IpcError::WouldBlock);

        port::clear_receiver(&port);
        assert_eq!(waiter.result(), Some(WaitResult::PortDied));
    }

    #[test]
    fn test_receive_from_dead_port() {
        let space = IpcSpace::new();
        let (_, port) = port::alloc(&space).unwrap();
        port::clear_receiver(&port);
        port::destroy(port.clone());

        assert_eq!(receive(&port).unwrap_err(), IpcError::PortDied);
    }
}
