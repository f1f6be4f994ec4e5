//! IPC Port Sets - receive-right grouping
//!
//! Based on Mach4 ipc/ipc_pset.c
//!
//! Only the membership side matters to the port lifecycle: a port in
//! Receiver state may belong to at most one set, and clearing the receive
//! right detaches it. Lock order is port first, then set.

use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use super::port::{PortRef, PortState};
use super::{IpcError, IpcResult};

#[derive(Debug)]
struct PsetBody {
    active: bool,
    members: Vec<PortRef>,
}

/// A set of receive rights that can be received from as one queue.
#[derive(Debug)]
pub struct PortSet {
    body: Mutex<PsetBody>,
}

impl PortSet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            body: Mutex::new(PsetBody {
                active: true,
                members: Vec::new(),
            }),
        })
    }

    pub fn is_active(&self) -> bool {
        self.body.lock().active
    }

    pub fn member_count(&self) -> usize {
        self.body.lock().members.len()
    }

    /// Deactivate the set and drop its membership references. Each member
    /// port's back-pointer is cleared lazily by `clear_receiver`.
    pub fn destroy(&self) {
        let mut body = self.body.lock();
        body.active = false;
        body.members.clear();
    }

    /// Drop `port` from the member list. Caller holds the port lock.
    pub(crate) fn remove_member(&self, port: &PortRef) -> bool {
        let mut body = self.body.lock();
        let before = body.members.len();
        body.members.retain(|member| !Arc::ptr_eq(member, port));
        body.members.len() != before
    }
}

/// Add a receiver-state port to a set.
///
/// Fails with `InvalidRight` if the port does not hold a local receive
/// right or already belongs to a set, and `PortDied` if the set is dead.
pub fn add_member(set: &Arc<PortSet>, port: &PortRef) -> IpcResult<()> {
    let mut port_body = port.body.lock();
    if !matches!(port_body.state, PortState::Receiver { .. }) {
        return Err(IpcError::InvalidRight);
    }
    if port_body.pset.is_some() {
        return Err(IpcError::InvalidRight);
    }

    let mut set_body = set.body.lock();
    if !set_body.active {
        return Err(IpcError::PortDied);
    }
    set_body.members.push(port.clone());
    drop(set_body);

    port_body.pset = Some(set.clone());
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
