//! Dead-name request table - per-port registration slots
//!
//! Based on Mach4 ipc/ipc_table.c and the ipc_port_request_t machinery in
//! ipc/ipc_port.c
//!
//! Each port may carry a table of dead-name requests: (name, send-once
//! right) pairs keyed by slot index. Free slots are threaded through the
//! table itself; slot 0 is never handed out and serves as the head of the
//! free list. Tables grow by replacement: a bigger table is allocated with
//! no locks held, then the old entries are absorbed under the port lock.

use alloc::boxed::Box;
use alloc::vec::Vec;

use spin::Once;

use super::notify::{self, Notification};
use super::right::SendOnceRight;
use super::PortName;

/// Index of a registration within a port's request table.
pub type SlotIndex = usize;

/// Largest request table size.
pub const REQUEST_TABLE_MAX: usize = 1024;

// ============================================================================
// Size classes
// ============================================================================

static TABLE_SIZES: Once<heapless::Vec<usize, 16>> = Once::new();

fn table_sizes() -> &'static heapless::Vec<usize, 16> {
    TABLE_SIZES.call_once(|| {
        let mut sizes = heapless::Vec::new();
        let mut size = 2;
        while size <= REQUEST_TABLE_MAX {
            // Cannot overflow the backing array: 2..=1024 is 10 classes.
            let _ = sizes.push(size);
            size *= 2;
        }
        sizes
    })
}

/// Smallest size class holding at least `want` slots.
pub fn next_size(want: usize) -> Option<usize> {
    table_sizes().iter().copied().find(|&size| size >= want)
}

// ============================================================================
// Request table
// ============================================================================

#[derive(Debug)]
enum Slot {
    /// Free slot, threaded into the free list. `next == 0` ends the list.
    Free { next: SlotIndex },
    /// Live registration.
    Used {
        name: PortName,
        soright: SendOnceRight,
    },
}

/// A port's dead-name request table.
///
/// `slots[0]` is the free-list head and never holds a registration, so the
/// index 0 is available as a "no slot" sentinel to callers.
#[derive(Debug)]
pub struct RequestTable {
    slots: Vec<Slot>,
}

impl RequestTable {
    /// Allocate a table with `size` usable slots.
    pub fn with_size(size: usize) -> Box<Self> {
        let mut slots = Vec::with_capacity(size + 1);
        for _ in 0..=size {
            slots.push(Slot::Free { next: 0 });
        }
        let mut table = Box::new(Self { slots });
        table.rethread_free();
        table
    }

    /// Number of usable slots.
    pub fn size(&self) -> usize {
        self.slots.len() - 1
    }

    /// Claim a free slot for (`name`, `soright`). Gives the right back if
    /// the table is full.
    pub fn alloc(
        &mut self,
        name: PortName,
        soright: SendOnceRight,
    ) -> Result<SlotIndex, SendOnceRight> {
        let head = match self.slots[0] {
            Slot::Free { next } => next,
            Slot::Used { .. } => unreachable!("slot 0 is never a registration"),
        };
        if head == 0 {
            return Err(soright);
        }
        let next = match self.slots[head] {
            Slot::Free { next } => next,
            Slot::Used { .. } => unreachable!("free list pointed at a used slot"),
        };
        self.slots[0] = Slot::Free { next };
        self.slots[head] = Slot::Used { name, soright };
        Ok(head)
    }

    /// Withdraw the registration at `index`, returning its send-once right.
    ///
    /// `index` must hold a registration for `name`.
    pub fn cancel(&mut self, name: PortName, index: SlotIndex) -> SendOnceRight {
        assert!(index != 0 && index < self.slots.len());
        let head = match self.slots[0] {
            Slot::Free { next } => next,
            Slot::Used { .. } => unreachable!("slot 0 is never a registration"),
        };
        let slot = core::mem::replace(&mut self.slots[index], Slot::Free { next: head });
        match slot {
            Slot::Used {
                name: registered,
                soright,
            } => {
                assert_eq!(registered, name);
                self.slots[0] = Slot::Free { next: index };
                soright
            }
            Slot::Free { .. } => panic!("cancel of a free request slot"),
        }
    }

    /// Move every registration out of `old` into this (larger) table,
    /// keeping slot indices stable, then rebuild the free list.
    pub fn absorb(mut self: Box<Self>, mut old: Box<Self>) -> Box<Self> {
        debug_assert!(self.size() >= old.size());
        for index in 1..old.slots.len() {
            if matches!(old.slots[index], Slot::Used { .. }) {
                let slot = core::mem::replace(&mut old.slots[index], Slot::Free { next: 0 });
                self.slots[index] = slot;
            }
        }
        self.rethread_free();
        self
    }

    /// Thread every free slot into an ascending-order free list.
    fn rethread_free(&mut self) {
        let mut head = 0;
        for index in (1..self.slots.len()).rev() {
            if let Slot::Free { next } = &mut self.slots[index] {
                *next = head;
                head = index;
            }
        }
        self.slots[0] = Slot::Free { next: head };
    }

    /// Number of live registrations.
    pub fn used(&self) -> usize {
        self.slots[1..]
            .iter()
            .filter(|slot| matches!(slot, Slot::Used { .. }))
            .count()
    }

    /// Consume the table, turning every registration into a dead-name
    /// notification, delivered in ascending slot order. Called with no
    /// locks held when a port dies.
    pub fn notify_all_dead(self: Box<Self>) {
        let mut batch = Vec::new();
        for slot in self.slots.into_iter().skip(1) {
            if let Slot::Used { name, soright } = slot {
                batch.push(Notification::DeadName {
                    notify: soright,
                    name,
                });
            }
        }
        notify::deliver_all(batch);
    }
}

// ============================================================================
// Tests
// ============================================================================
