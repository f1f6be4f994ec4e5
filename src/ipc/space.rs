//! IPC Space - per-task port name space
//!
//! Based on Mach4 ipc/ipc_space.c
//!
//! A space maps names to rights for one task. The port lifecycle only needs
//! a small surface of it: name allocation, entry insertion and removal, and
//! the send-right copyout path that coalesces user references onto an
//! existing entry.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use spin::Mutex;

use super::port::PortRef;
use super::right::{SendOnceRight, SendRight};
use super::{port, IpcError, IpcResult, PortName};

/// Space identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SpaceId(pub u64);

static NEXT_SPACE_ID: AtomicU32 = AtomicU32::new(1);

/// Maximum entries per space
pub const SPACE_MAX_ENTRIES: usize = 4096;

// ============================================================================
// Entries
// ============================================================================

/// What a name denotes within a space.
#[derive(Debug)]
pub enum SpaceEntry {
    /// The receive right for a port.
    Receive(PortRef),
    /// A send right with a user reference count; the space holds one
    /// port-level right no matter how many urefs.
    Send { right: SendRight, urefs: u32 },
    /// A send-once right.
    SendOnce(SendOnceRight),
}

impl SpaceEntry {
    fn port(&self) -> &PortRef {
        match self {
            SpaceEntry::Receive(port) => port,
            SpaceEntry::Send { right, .. } => right.port(),
            SpaceEntry::SendOnce(right) => right.port(),
        }
    }
}

#[derive(Debug)]
struct SpaceTable {
    next_name: u32,
    entries: BTreeMap<PortName, SpaceEntry>,
}

impl SpaceTable {
    /// Pick an unused, non-sentinel name.
    fn alloc_name(&mut self) -> IpcResult<PortName> {
        if self.entries.len() >= SPACE_MAX_ENTRIES {
            return Err(IpcError::NoSpace);
        }
        loop {
            let raw = self.next_name;
            self.next_name = self.next_name.wrapping_add(1);
            let name = PortName::from_raw(raw);
            if name.is_null() || name.is_dead() || self.entries.contains_key(&name) {
                continue;
            }
            return Ok(name);
        }
    }
}

// ============================================================================
// Space
// ============================================================================

/// A task's port name space.
#[derive(Debug)]
pub struct IpcSpace {
    id: SpaceId,
    active: AtomicBool,
    table: Mutex<SpaceTable>,
}

impl IpcSpace {
    pub fn new() -> Arc<Self> {
        let raw = NEXT_SPACE_ID.fetch_add(1, Ordering::SeqCst);
        Arc::new(Self {
            id: SpaceId(raw as u64),
            active: AtomicBool::new(true),
            table: Mutex::new(SpaceTable {
                next_name: 1,
                entries: BTreeMap::new(),
            }),
        })
    }

    pub fn id(&self) -> SpaceId {
        self.id
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Mark the space dead. Entries are reclaimed by the task-teardown
    /// path, which removes and releases them one by one.
    pub fn destroy(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    /// Reserve a fresh name with no entry yet.
    pub(crate) fn alloc_name(&self) -> IpcResult<PortName> {
        self.table.lock().alloc_name()
    }

    /// Bind `name` to `entry`.
    pub(crate) fn insert(&self, name: PortName, entry: SpaceEntry) -> IpcResult<()> {
        let mut table = self.table.lock();
        if table.entries.len() >= SPACE_MAX_ENTRIES {
            return Err(IpcError::NoSpace);
        }
        if table.entries.contains_key(&name) {
            return Err(IpcError::NameExists);
        }
        table.entries.insert(name, entry);
        Ok(())
    }

    /// Unbind `name`, handing its entry (and the rights inside) to the
    /// caller.
    pub fn remove(&self, name: PortName) -> Option<SpaceEntry> {
        self.table.lock().entries.remove(&name)
    }

    pub fn contains(&self, name: PortName) -> bool {
        self.table.lock().entries.contains_key(&name)
    }

    /// The port behind `name`, if any.
    pub fn entry_port(&self, name: PortName) -> Option<PortRef> {
        let table = self.table.lock();
        table.entries.get(&name).map(|entry| entry.port().clone())
    }

    /// User reference count of the send entry at `name`.
    pub fn send_urefs(&self, name: PortName) -> Option<u32> {
        let table = self.table.lock();
        match table.entries.get(&name) {
            Some(SpaceEntry::Send { urefs, .. }) => Some(*urefs),
            _ => None,
        }
    }

    /// Insert a send right, coalescing onto an existing send entry for the
    /// same port. On failure the right comes back to the caller untouched.
    pub(crate) fn copyout_send(&self, right: SendRight) -> Result<PortName, SendRight> {
        if !self.is_active() {
            return Err(right);
        }

        let mut table = self.table.lock();
        let existing = table.entries.iter_mut().find_map(|(name, entry)| {
            match entry {
                SpaceEntry::Send {
                    right: held,
                    urefs,
                } if Arc::ptr_eq(held.port(), right.port()) => Some((*name, urefs)),
                _ => None,
            }
        });

        if let Some((name, urefs)) = existing {
            *urefs += 1;
            drop(table);
            // The entry already holds a port-level send right; fold this one
            // into it. srights stays above zero, so no notification fires.
            port::release_send(right);
            return Ok(name);
        }

        let name = match table.alloc_name() {
            Ok(name) => name,
            Err(_) => return Err(right),
        };
        table.entries.insert(name, SpaceEntry::Send { right, urefs: 1 });
        Ok(name)
    }
}

// ============================================================================
// Tests
// ============================================================================
