//! Mailbox Registry entries
//!
//! A mailbox owns index queues into the buffer pool and the wait table:
//!
//! - `messages`: buffered messages, oldest first
//! - `senders`: senders blocked on a full mailbox (or, for a zero-capacity
//!   mailbox, waiting for a receiver), kept in ticket order
//! - `receivers`: receivers blocked on an empty mailbox, FIFO
//! - `ordering`: senders that found room but saw an older sender still
//!   pending
//!
//! ## Send tickets
//!
//! Every sender draws a ticket from `next_msg_index` when it arrives.
//! A bounded sender may only deliver when its ticket equals `sent_count`,
//! so messages are appended in arrival order whatever order the scheduler
//! resumes blocked senders in. A ticket is retired when its sender delivers
//! or gives up; tickets retired out of order are parked in `retired` until
//! `sent_count` catches up with them.

use alloc::collections::{BTreeSet, VecDeque};

use super::table::TableEntry;
use super::wait::WaitQueueKind;
use crate::types::{BufferId, MailboxId, WaitId};

/// Mailbox status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailboxStatus {
    /// Slot available for `create`
    Free,
    /// Created and not yet released
    InUse,
}

/// A blocked sender and its ticket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SenderWaiter {
    /// Wait entry
    pub wait: WaitId,
    /// Ticket drawn on arrival
    pub ticket: u64,
}

/// Point-in-time view of a mailbox
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MailboxInfo {
    /// Mailbox id
    pub id: MailboxId,
    /// Configured capacity (0 = rendezvous)
    pub capacity: usize,
    /// Largest accepted message
    pub max_size: usize,
    /// Buffers currently charged to the mailbox
    pub used: usize,
    /// Messages waiting in the queue
    pub queued: usize,
    /// Blocked senders
    pub blocked_senders: usize,
    /// Blocked receivers
    pub blocked_receivers: usize,
    /// Senders waiting for their turn
    pub ordering: usize,
}

/// One registry slot
#[derive(Debug)]
pub struct Mailbox {
    id: MailboxId,
    status: MailboxStatus,
    generation: u32,
    capacity: usize,
    max_size: usize,
    /// Buffers charged to this mailbox, including ones already handed to a
    /// woken receiver that has not consumed them yet
    pub(crate) used: usize,
    pub(crate) messages: VecDeque<BufferId>,
    pub(crate) senders: VecDeque<SenderWaiter>,
    pub(crate) receivers: VecDeque<WaitId>,
    pub(crate) ordering: VecDeque<WaitId>,
    next_msg_index: u64,
    sent_count: u64,
    retired: BTreeSet<u64>,
}

impl Mailbox {
    /// A free registry slot
    pub fn new(id: MailboxId) -> Self {
        Self {
            id,
            status: MailboxStatus::Free,
            generation: 0,
            capacity: 0,
            max_size: 0,
            used: 0,
            messages: VecDeque::new(),
            senders: VecDeque::new(),
            receivers: VecDeque::new(),
            ordering: VecDeque::new(),
            next_msg_index: 0,
            sent_count: 0,
            retired: BTreeSet::new(),
        }
    }

    /// Bring a free slot into use
    pub(crate) fn open(&mut self, capacity: usize, max_size: usize) {
        self.status = MailboxStatus::InUse;
        self.generation = self.generation.wrapping_add(1);
        self.capacity = capacity;
        self.max_size = max_size;
    }

    /// Mailbox id
    pub fn id(&self) -> MailboxId {
        self.id
    }

    /// Mailbox status
    pub fn status(&self) -> MailboxStatus {
        self.status
    }

    /// Bumped every time the slot is created
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Configured capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Largest accepted message
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Is the mailbox created?
    pub fn is_in_use(&self) -> bool {
        self.status == MailboxStatus::InUse
    }

    /// Still the same mailbox a waiter blocked on?
    pub fn is_generation(&self, generation: u32) -> bool {
        self.is_in_use() && self.generation == generation
    }

    /// Rendezvous mailbox?
    pub fn is_zero_capacity(&self) -> bool {
        self.capacity == 0
    }

    /// Is there room for another buffered message?
    pub fn has_room(&self) -> bool {
        self.used < self.capacity
    }

    // ========================================================================
    // Tickets
    // ========================================================================

    /// Draw the next send ticket
    pub(crate) fn take_ticket(&mut self) -> u64 {
        let ticket = self.next_msg_index;
        self.next_msg_index += 1;
        ticket
    }

    /// Is it `ticket`'s turn to deliver?
    pub(crate) fn is_turn(&self, ticket: u64) -> bool {
        self.sent_count == ticket
    }

    /// No sender holds an unserved ticket
    pub(crate) fn no_pending_senders(&self) -> bool {
        self.next_msg_index == self.sent_count
    }

    /// Mark `ticket` served; true if `sent_count` moved forward
    pub(crate) fn retire(&mut self, ticket: u64) -> bool {
        if ticket != self.sent_count {
            if ticket > self.sent_count {
                self.retired.insert(ticket);
            }
            return false;
        }

        self.sent_count += 1;
        while self.retired.remove(&self.sent_count) {
            self.sent_count += 1;
        }
        true
    }

    // ========================================================================
    // Waiter Queues
    // ========================================================================

    /// Queue a blocked sender behind every sender holding an older ticket
    pub(crate) fn push_sender(&mut self, waiter: SenderWaiter) {
        let at = self.senders.partition_point(|s| s.ticket < waiter.ticket);
        self.senders.insert(at, waiter);
    }

    /// Unlink `wait` from queue `kind`
    pub(crate) fn unlink(&mut self, wait: WaitId, kind: WaitQueueKind) {
        match kind {
            WaitQueueKind::Senders => self.senders.retain(|s| s.wait != wait),
            WaitQueueKind::Receivers => self.receivers.retain(|w| *w != wait),
            WaitQueueKind::Ordering => self.ordering.retain(|w| *w != wait),
        }
    }

    /// Snapshot for diagnostics
    pub fn info(&self) -> MailboxInfo {
        MailboxInfo {
            id: self.id,
            capacity: self.capacity,
            max_size: self.max_size,
            used: self.used,
            queued: self.messages.len(),
            blocked_senders: self.senders.len(),
            blocked_receivers: self.receivers.len(),
            ordering: self.ordering.len(),
        }
    }
}

impl TableEntry for Mailbox {
    fn is_free(&self) -> bool {
        self.status == MailboxStatus::Free
    }

    /// Keeps `id` and `generation`, everything else goes
    fn reset(&mut self) {
        self.status = MailboxStatus::Free;
        self.capacity = 0;
        self.max_size = 0;
        self.used = 0;
        self.messages.clear();
        self.senders.clear();
        self.receivers.clear();
        self.ordering.clear();
        self.next_msg_index = 0;
        self.sent_count = 0;
        self.retired.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(capacity: usize) -> Mailbox {
        let mut mbox = Mailbox::new(MailboxId(0));
        mbox.open(capacity, 8);
        mbox
    }

    #[test]
    fn test_open_bumps_generation() {
        let mut mbox = open(2);
        assert!(mbox.is_in_use());
        assert_eq!(mbox.generation(), 1);
        assert!(mbox.is_generation(1));

        mbox.reset();
        assert!(!mbox.is_generation(1));
        mbox.open(0, 4);
        assert_eq!(mbox.generation(), 2);
        assert!(mbox.is_zero_capacity());
    }

    #[test]
    fn test_tickets_in_order() {
        let mut mbox = open(1);
        let a = mbox.take_ticket();
        let b = mbox.take_ticket();
        assert!(mbox.is_turn(a));
        assert!(!mbox.is_turn(b));
        assert!(!mbox.no_pending_senders());

        assert!(mbox.retire(a));
        assert!(mbox.is_turn(b));
        assert!(mbox.retire(b));
        assert!(mbox.no_pending_senders());
    }

    #[test]
    fn test_out_of_order_retire() {
        let mut mbox = open(1);
        let a = mbox.take_ticket();
        let b = mbox.take_ticket();
        let c = mbox.take_ticket();

        // b gives up before a delivers
        assert!(!mbox.retire(b));
        assert!(mbox.is_turn(a));

        // a delivering skips straight to c
        assert!(mbox.retire(a));
        assert!(mbox.is_turn(c));
    }

    #[test]
    fn test_senders_sorted_by_ticket() {
        let mut mbox = open(1);
        mbox.push_sender(SenderWaiter { wait: WaitId(0), ticket: 5 });
        mbox.push_sender(SenderWaiter { wait: WaitId(1), ticket: 2 });
        mbox.push_sender(SenderWaiter { wait: WaitId(2), ticket: 9 });

        let tickets: alloc::vec::Vec<u64> = mbox.senders.iter().map(|s| s.ticket).collect();
        assert_eq!(tickets, [2, 5, 9]);

        mbox.unlink(WaitId(0), WaitQueueKind::Senders);
        assert_eq!(mbox.senders.len(), 2);
    }

    #[test]
    fn test_reset_clears_queues() {
        let mut mbox = open(3);
        mbox.used = 2;
        mbox.messages.push_back(BufferId(1));
        mbox.receivers.push_back(WaitId(4));
        mbox.take_ticket();
        mbox.reset();

        let info = mbox.info();
        assert_eq!(info.used, 0);
        assert_eq!(info.queued, 0);
        assert_eq!(info.blocked_receivers, 0);
        assert!(mbox.no_pending_senders());
        assert_eq!(mbox.status(), MailboxStatus::Free);
    }
}
