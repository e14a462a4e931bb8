//! Common types used across Mbox_R
//!
//! This module defines shared identifiers to avoid circular dependencies.
//! All of them are plain indices into fixed-size tables.

use core::fmt;

/// Process identifier, as handed out by the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ProcessId(pub u32);

impl ProcessId {
    /// Context with no process attached (boot code, interrupt handlers)
    pub const KERNEL: Self = Self(0);
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pid {}", self.0)
    }
}

/// Mailbox identifier (index into the mailbox registry)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MailboxId(pub usize);

impl MailboxId {
    /// Registry index
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for MailboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mbox {}", self.0)
    }
}

/// Message buffer identifier (index into the buffer pool)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BufferId(pub usize);

/// Wait entry identifier (index into the wait-entry table)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WaitId(pub usize);
