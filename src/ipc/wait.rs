//! Wait Entries - one per blocked caller
//!
//! A caller that has to block claims a wait entry, links its index into
//! exactly one mailbox queue and suspends. Whoever wakes it unlinks the
//! entry, records an outcome and resumes the process; the caller reads the
//! outcome when it runs again and frees the entry before returning.

use alloc::vec::Vec;
use heapless::Vec as InlineVec;

use super::table::{CircularTable, TableEntry};
use super::{IpcError, IpcResult};
use crate::config::MAX_MESSAGE;
use crate::types::{BufferId, MailboxId, ProcessId, WaitId};

// ============================================================================
// Entry State
// ============================================================================

/// Entry status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    /// Unused
    Free,
    /// Owned by a caller that is (or was until just now) suspended
    Blocked,
}

/// Mailbox queue an entry is linked into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitQueueKind {
    /// Blocked senders
    Senders,
    /// Blocked receivers
    Receivers,
    /// Senders waiting for an older sender to deliver
    Ordering,
}

/// Why a blocked caller was woken
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Still waiting
    Pending,
    /// Receiver: a message was handed over. Rendezvous sender: the payload
    /// was taken.
    Delivered,
    /// Sender: the mailbox changed, try again
    Retry,
    /// Receiver: the offered message did not fit its buffer
    TooLarge,
    /// The mailbox was released
    Interrupted,
}

// ============================================================================
// Wait Entry
// ============================================================================

/// Blocking descriptor for one caller
#[derive(Debug)]
pub struct WaitEntry {
    /// Process to resume
    pub pid: ProcessId,
    /// Entry status
    pub status: WaitStatus,
    /// Mailbox waited on, with its generation at block time
    pub mailbox: Option<(MailboxId, u32)>,
    /// Queue membership, `None` once woken
    pub queue: Option<WaitQueueKind>,
    /// Wake outcome
    pub outcome: WaitOutcome,
    /// Buffer handed to a bounded receiver
    pub assigned: Option<BufferId>,
    /// Rendezvous payload: stashed by a blocked sender, or filled in for a
    /// blocked receiver
    pub handoff: InlineVec<u8, MAX_MESSAGE>,
    /// Receiver buffer size
    pub max_size: usize,
    /// Sender ticket
    pub ticket: Option<u64>,
}

impl WaitEntry {
    const fn empty() -> Self {
        Self {
            pid: ProcessId::KERNEL,
            status: WaitStatus::Free,
            mailbox: None,
            queue: None,
            outcome: WaitOutcome::Pending,
            assigned: None,
            handoff: InlineVec::new(),
            max_size: 0,
            ticket: None,
        }
    }

    /// Has someone woken this entry?
    pub fn is_woken(&self) -> bool {
        self.outcome != WaitOutcome::Pending
    }
}

impl TableEntry for WaitEntry {
    fn is_free(&self) -> bool {
        self.status == WaitStatus::Free
    }

    fn reset(&mut self) {
        *self = Self::empty();
    }
}

// ============================================================================
// Wait Table
// ============================================================================

/// Fixed-size table of wait entries
#[derive(Debug)]
pub struct WaitTable {
    entries: CircularTable<WaitEntry>,
}

impl WaitTable {
    /// Create a table of `len` entries
    pub fn new(len: usize) -> Self {
        Self {
            entries: CircularTable::new(len, |_| WaitEntry::empty()),
        }
    }

    /// Claim an entry for `pid` blocking on `mailbox` (of generation `generation`)
    pub fn create(
        &mut self,
        pid: ProcessId,
        mailbox: MailboxId,
        generation: u32,
        queue: WaitQueueKind,
    ) -> IpcResult<WaitId> {
        self.entries
            .claim(|_, entry| {
                entry.pid = pid;
                entry.status = WaitStatus::Blocked;
                entry.mailbox = Some((mailbox, generation));
                entry.queue = Some(queue);
                entry.outcome = WaitOutcome::Pending;
            })
            .map(WaitId)
            .ok_or_else(|| {
                log::warn!("wait table full, {} cannot block", pid);
                IpcError::ResourceExhausted
            })
    }

    /// Entry `id` if in use
    pub fn get(&self, id: WaitId) -> Option<&WaitEntry> {
        self.entries.get(id.0).filter(|e| !e.is_free())
    }

    /// Mutable entry `id` if in use
    pub fn get_mut(&mut self, id: WaitId) -> Option<&mut WaitEntry> {
        self.entries.get_mut(id.0).filter(|e| !e.is_free())
    }

    /// Has entry `id` been woken? A freed entry counts as woken.
    pub fn is_woken(&self, id: WaitId) -> bool {
        self.get(id).map_or(true, WaitEntry::is_woken)
    }

    /// Wake entry `id`: unlink it, record `outcome`, queue its pid for resume
    pub fn wake(&mut self, id: WaitId, outcome: WaitOutcome, wakeups: &mut Vec<ProcessId>) {
        if let Some(entry) = self.get_mut(id) {
            log::trace!("waking {} ({:?})", entry.pid, outcome);
            entry.queue = None;
            entry.outcome = outcome;
            wakeups.push(entry.pid);
        }
    }

    /// Free entry `id`
    pub fn free(&mut self, id: WaitId) {
        self.entries.release(id.0);
    }

    /// Number of entries in use
    pub fn in_use(&self) -> usize {
        self.entries.in_use()
    }

    /// Table size
    pub fn capacity(&self) -> usize {
        self.entries.capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_wake() {
        let mut table = WaitTable::new(2);
        let id = table
            .create(ProcessId(4), MailboxId(1), 7, WaitQueueKind::Receivers)
            .unwrap();

        let entry = table.get(id).unwrap();
        assert_eq!(entry.pid, ProcessId(4));
        assert_eq!(entry.mailbox, Some((MailboxId(1), 7)));
        assert!(!table.is_woken(id));

        let mut wakeups = Vec::new();
        table.wake(id, WaitOutcome::Delivered, &mut wakeups);
        assert_eq!(wakeups, [ProcessId(4)]);
        assert!(table.is_woken(id));
        assert_eq!(table.get(id).unwrap().queue, None);

        table.free(id);
        assert!(table.get(id).is_none());
        assert_eq!(table.in_use(), 0);
    }

    #[test]
    fn test_table_full() {
        let mut table = WaitTable::new(1);
        table
            .create(ProcessId(1), MailboxId(0), 1, WaitQueueKind::Senders)
            .unwrap();
        assert_eq!(
            table.create(ProcessId(2), MailboxId(0), 1, WaitQueueKind::Senders),
            Err(IpcError::ResourceExhausted)
        );
    }

    #[test]
    fn test_free_resets_entry() {
        let mut table = WaitTable::new(1);
        let id = table
            .create(ProcessId(1), MailboxId(0), 1, WaitQueueKind::Senders)
            .unwrap();
        {
            let entry = table.get_mut(id).unwrap();
            entry.ticket = Some(3);
            let _ = entry.handoff.extend_from_slice(b"hi");
        }
        table.free(id);

        let id = table
            .create(ProcessId(2), MailboxId(0), 1, WaitQueueKind::Receivers)
            .unwrap();
        let entry = table.get(id).unwrap();
        assert_eq!(entry.ticket, None);
        assert!(entry.handoff.is_empty());
    }
}
