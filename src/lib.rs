//! Mbox_R - Kernel mailbox IPC in Rust
//!
//! This crate provides the message-passing core of a small kernel:
//! a registry of mailboxes, one shared pool of message buffers, and
//! blocking send/receive with FIFO delivery across concurrent senders.
//!
//! The crate does no scheduling of its own. Blocking operations are
//! futures that suspend through a [`Scheduler`](kern::Scheduler)
//! supplied by the embedder; [`kern::coop`] offers a deterministic one.

#![cfg_attr(not(any(test, feature = "std")), no_std)]
// Kernel-appropriate clippy configuration
// Table types have specialized initialization that doesn't fit Default
#![allow(clippy::new_without_default)]

// Standard library replacement for no_std
extern crate alloc;

// Core types
pub mod config;
pub mod types;

// Subsystems
pub mod device;
pub mod ipc;
pub mod kern;

pub use config::{ConfigError, MailboxConfig, MAX_MAILBOXES, MAX_MESSAGE, MAX_PROCESSES, MAX_SLOTS};
pub use device::{DeviceKind, DeviceLayout, DeviceMailboxes};
pub use ipc::{IpcError, IpcResult, MailboxInfo, MailboxManager, PoolStats};
pub use types::{BufferId, MailboxId, ProcessId, WaitId};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name
pub const NAME: &str = "Mbox_R";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert_eq!(NAME, "Mbox_R");
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_message_limit() {
        assert_eq!(MAX_MESSAGE, 150);
    }
}
