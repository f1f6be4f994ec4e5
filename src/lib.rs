//! Mach_R IPC - the port subsystem of the Mach_R kernel as a standalone crate
//!
//! This crate provides the Mach-style port: a named, reference-counted
//! communication endpoint through which messages, rights, and notifications
//! flow between tasks. It covers right counting (send, send-once, receive),
//! the port lifecycle state machine (receiver, limbo, in-transit, dead),
//! circularity detection over the in-transit destination graph, dead-name
//! request tables, and the no-senders / port-deleted / dead-name
//! notification machinery.
//!
//! Message content marshalling, port-set receive multiplexing, and the full
//! space rights-accounting model live elsewhere in the kernel tree; they are
//! reached here only through narrow collaborator interfaces.

#![cfg_attr(not(test), no_std)]
// Kernel types have specialized initialization that doesn't fit Default
#![allow(clippy::new_without_default)]

extern crate alloc;

pub mod ipc;
