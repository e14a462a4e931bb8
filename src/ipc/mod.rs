//! Mailbox Inter-Process Communication
//!
//! Processes exchange bounded-size messages through numbered mailboxes.
//! A mailbox either buffers up to `capacity` messages in buffers drawn
//! from one global pool, or (capacity zero) hands each payload directly
//! from a sender to a receiver.
//!
//! All state lives in one [`MailboxManager`]; blocking operations are
//! futures driven by the process scheduler.

use thiserror::Error;

pub mod mailbox;
pub mod mbox_ops;
pub mod slot;
pub mod table;
pub mod wait;

pub use mailbox::{Mailbox, MailboxInfo, MailboxStatus, SenderWaiter};
pub use mbox_ops::MailboxManager;
pub use slot::{MessagePool, MessageSlot, PoolStats};
pub use table::{CircularTable, TableEntry};
pub use wait::{WaitEntry, WaitOutcome, WaitQueueKind, WaitTable};

/// IPC error types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum IpcError {
    /// Malformed mailbox id, size, or capacity
    #[error("invalid argument")]
    InvalidArgument,
    /// Global buffer pool (or wait table) is full
    #[error("no free message buffers")]
    ResourceExhausted,
    /// A conditional operation would have had to block
    #[error("operation would block")]
    WouldBlock,
    /// The mailbox was released while the caller was blocked
    #[error("mailbox released while waiting")]
    Interrupted,
}

impl IpcError {
    /// Integer status for system-call glue
    ///
    /// `-1` bad argument, `-2` no room (would block or out of buffers),
    /// `-3` mailbox released.
    pub fn status(self) -> i32 {
        match self {
            IpcError::InvalidArgument => -1,
            IpcError::ResourceExhausted | IpcError::WouldBlock => -2,
            IpcError::Interrupted => -3,
        }
    }
}

/// Result type for IPC operations
pub type IpcResult<T> = Result<T, IpcError>;
