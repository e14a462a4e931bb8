//! Mailbox subsystem limits
//!
//! Compile-time limits bound the inline storage of every message. The table
//! sizes are chosen at runtime through [`MailboxConfig`] so a host can shrink
//! them for tests or small targets.

use thiserror::Error;

// ============================================================================
// Compile-time Limits
// ============================================================================

/// Largest payload any mailbox can carry, in bytes
pub const MAX_MESSAGE: usize = 150;

/// Default number of mailboxes in the registry
pub const MAX_MAILBOXES: usize = 2000;

/// Default number of message buffers in the global pool
pub const MAX_SLOTS: usize = 2500;

/// Default number of concurrently blocked callers
pub const MAX_PROCESSES: usize = 50;

// ============================================================================
// Runtime Configuration
// ============================================================================

/// Table sizes for a [`MailboxManager`](crate::ipc::MailboxManager)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MailboxConfig {
    /// Registry size
    pub max_mailboxes: usize,
    /// Buffers in the shared message pool
    pub pool_slots: usize,
    /// Wait entries (upper bound on simultaneously blocked callers)
    pub max_waiters: usize,
}

/// Invalid configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// The registry must hold at least one mailbox
    #[error("mailbox registry must hold at least one mailbox")]
    NoMailboxes,
    /// The buffer pool must hold at least one buffer
    #[error("message pool must hold at least one buffer")]
    NoBuffers,
    /// The wait table must hold at least one entry
    #[error("wait table must hold at least one entry")]
    NoWaiters,
}

impl MailboxConfig {
    /// Configuration with the default system limits
    pub const fn new() -> Self {
        Self {
            max_mailboxes: MAX_MAILBOXES,
            pool_slots: MAX_SLOTS,
            max_waiters: MAX_PROCESSES,
        }
    }

    /// Set the registry size
    pub const fn with_mailboxes(mut self, n: usize) -> Self {
        self.max_mailboxes = n;
        self
    }

    /// Set the pool size
    pub const fn with_pool_slots(mut self, n: usize) -> Self {
        self.pool_slots = n;
        self
    }

    /// Set the wait table size
    pub const fn with_waiters(mut self, n: usize) -> Self {
        self.max_waiters = n;
        self
    }

    /// Check the configuration can back a working manager
    ///
    /// Every table needs at least one slot. Sends are refused outright on an
    /// exhausted pool, rendezvous included, so an empty pool is rejected too.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_mailboxes == 0 {
            return Err(ConfigError::NoMailboxes);
        }
        if self.pool_slots == 0 {
            return Err(ConfigError::NoBuffers);
        }
        if self.max_waiters == 0 {
            return Err(ConfigError::NoWaiters);
        }
        Ok(())
    }
}

impl Default for MailboxConfig {
    fn default() -> Self {
        Self::new()
    }
}
