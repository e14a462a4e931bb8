//! Message Buffer Pool
//!
//! One pool of fixed-size message buffers ("slots") shared by every
//! mailbox in the system. A bounded mailbox takes one slot per buffered
//! message, so the pool caps the number of messages buffered system-wide,
//! not per mailbox. Zero-capacity mailboxes never touch the pool.

use heapless::Vec as InlineVec;

use super::table::{CircularTable, TableEntry};
use super::{IpcError, IpcResult};
use crate::config::MAX_MESSAGE;
use crate::types::{BufferId, MailboxId};

// ============================================================================
// Message Slot
// ============================================================================

/// Slot status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotStatus {
    /// Available in the pool
    Free,
    /// Holding a message
    InUse,
}

/// One message buffer
#[derive(Debug)]
pub struct MessageSlot {
    /// Mailbox the message was sent to
    owner: Option<MailboxId>,
    status: SlotStatus,
    data: InlineVec<u8, MAX_MESSAGE>,
}

impl MessageSlot {
    const fn empty() -> Self {
        Self {
            owner: None,
            status: SlotStatus::Free,
            data: InlineVec::new(),
        }
    }

    /// Mailbox holding this message
    pub fn owner(&self) -> Option<MailboxId> {
        self.owner
    }

    /// Slot status
    pub fn status(&self) -> SlotStatus {
        self.status
    }

    /// Message size in bytes
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Message payload
    pub fn payload(&self) -> &[u8] {
        &self.data
    }
}

impl TableEntry for MessageSlot {
    fn is_free(&self) -> bool {
        self.status == SlotStatus::Free
    }

    fn reset(&mut self) {
        self.owner = None;
        self.status = SlotStatus::Free;
        self.data.clear();
    }
}

// ============================================================================
// Pool Statistics
// ============================================================================

/// Pool usage counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Successful allocations
    pub allocs: u64,
    /// Buffers returned
    pub frees: u64,
    /// Buffers currently holding a message
    pub in_use: usize,
    /// Highest `in_use` ever seen
    pub max_in_use: usize,
    /// Allocations refused because the pool was exhausted
    pub failures: u64,
}

// ============================================================================
// Pool
// ============================================================================

/// The global message buffer pool
#[derive(Debug)]
pub struct MessagePool {
    slots: CircularTable<MessageSlot>,
    stats: PoolStats,
}

impl MessagePool {
    /// Create a pool of `len` free buffers
    pub fn new(len: usize) -> Self {
        Self {
            slots: CircularTable::new(len, |_| MessageSlot::empty()),
            stats: PoolStats::default(),
        }
    }

    /// Claim a buffer for `owner` and copy `payload` into it
    ///
    /// Fails with `ResourceExhausted` when a full circular pass finds no
    /// free buffer, and with `InvalidArgument` for a payload larger than
    /// [`MAX_MESSAGE`].
    pub fn alloc(&mut self, owner: MailboxId, payload: &[u8]) -> IpcResult<BufferId> {
        if payload.len() > MAX_MESSAGE {
            return Err(IpcError::InvalidArgument);
        }

        let claimed = self.slots.claim(|_, slot| {
            slot.owner = Some(owner);
            slot.status = SlotStatus::InUse;
            slot.data.clear();
            // Length checked above
            let _ = slot.data.extend_from_slice(payload);
        });

        match claimed {
            Some(idx) => {
                self.stats.allocs += 1;
                self.stats.in_use = self.slots.in_use();
                self.stats.max_in_use = self.stats.max_in_use.max(self.stats.in_use);
                Ok(BufferId(idx))
            }
            None => {
                self.stats.failures += 1;
                log::warn!("message pool exhausted ({} buffers)", self.capacity());
                Err(IpcError::ResourceExhausted)
            }
        }
    }

    /// Return a buffer to the pool
    pub fn free(&mut self, id: BufferId) {
        if self.slots.release(id.0) {
            self.stats.frees += 1;
            self.stats.in_use = self.slots.in_use();
        }
    }

    /// Buffer `id` if it currently holds a message
    pub fn get(&self, id: BufferId) -> Option<&MessageSlot> {
        self.slots.get(id.0).filter(|slot| !slot.is_free())
    }

    /// Size of the message in buffer `id` (zero for a free buffer)
    pub fn size(&self, id: BufferId) -> usize {
        self.get(id).map_or(0, MessageSlot::size)
    }

    /// Copy the message in `id` to the front of `out`; returns its size
    ///
    /// `out` must be at least [`size`](Self::size) bytes long.
    pub fn copy_out(&self, id: BufferId, out: &mut [u8]) -> usize {
        match self.get(id) {
            Some(slot) => {
                let n = slot.size();
                out[..n].copy_from_slice(slot.payload());
                n
            }
            None => 0,
        }
    }

    /// True when no buffer is free
    pub fn is_exhausted(&self) -> bool {
        self.slots.is_exhausted()
    }

    /// Total number of buffers
    pub fn capacity(&self) -> usize {
        self.slots.capacity()
    }

    /// Number of free buffers
    pub fn available(&self) -> usize {
        self.slots.capacity() - self.slots.in_use()
    }

    /// Usage counters
    pub fn stats(&self) -> PoolStats {
        self.stats
    }
}
