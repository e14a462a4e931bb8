//! Mailbox Operations - create, release, send, receive
//!
//! [`MailboxManager`] owns the registry, the buffer pool and the wait
//! table behind one lock. Every operation runs as a sequence of steps; a
//! step takes the lock, mutates state to a consistent point, drops the
//! lock and only then resumes any processes it woke. Blocking operations
//! suspend between steps, never inside one.
//!
//! ## Bounded mailboxes
//!
//! A sender delivers when its ticket is up and the mailbox has room,
//! otherwise it waits on the sender queue (mailbox full) or the ordering
//! queue (room, but an older sender is still pending). Each delivery wakes
//! the whole ordering queue. Each receive wakes the oldest blocked sender.
//!
//! ## Zero-capacity mailboxes
//!
//! A send and a receive meet directly. Whichever side arrives first blocks
//! with its wait entry queued; the second side copies the payload through
//! the waiting party's entry and wakes it.

use alloc::vec::Vec;
use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll};
use spin::Mutex;

use super::mailbox::{Mailbox, MailboxInfo, SenderWaiter};
use super::slot::{MessagePool, PoolStats};
use super::table::CircularTable;
use super::wait::{WaitOutcome, WaitQueueKind, WaitTable};
use super::{IpcError, IpcResult};
use crate::config::{ConfigError, MailboxConfig, MAX_MESSAGE};
use crate::kern::sched_prim::{Scheduler, WaitReason};
use crate::types::{MailboxId, ProcessId, WaitId};

/// Processes to resume once the state lock is dropped
type Wakeups = Vec<ProcessId>;

/// Result of one non-suspending step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step<T> {
    /// Operation complete
    Done(T),
    /// Caller must suspend on this wait entry
    Wait(WaitId),
}

// ============================================================================
// Manager State
// ============================================================================

#[derive(Debug)]
struct IpcState {
    mailboxes: CircularTable<Mailbox>,
    pool: MessagePool,
    waits: WaitTable,
}

/// In-use mailbox `id`, or `InvalidArgument`
fn in_use(mailboxes: &mut CircularTable<Mailbox>, id: MailboxId) -> IpcResult<&mut Mailbox> {
    mailboxes
        .get_mut(id.index())
        .filter(|m| m.is_in_use())
        .ok_or(IpcError::InvalidArgument)
}

/// The mailbox a wait entry blocked on, unless it was released since
fn same_mailbox(
    mailboxes: &mut CircularTable<Mailbox>,
    blocked_on: Option<(MailboxId, u32)>,
) -> Option<&mut Mailbox> {
    let (id, generation) = blocked_on?;
    mailboxes
        .get_mut(id.index())
        .filter(|m| m.is_generation(generation))
}

/// Hand queued messages to waiting receivers, both in queue order
///
/// A receiver whose buffer is too small for the message at the head of
/// the queue is woken with `TooLarge`.
fn hand_off(mbox: &mut Mailbox, pool: &MessagePool, waits: &mut WaitTable, wk: &mut Wakeups) {
    loop {
        let (Some(&buf), Some(&rid)) = (mbox.messages.front(), mbox.receivers.front()) else {
            break;
        };
        mbox.receivers.pop_front();

        let Some(max_size) = waits.get(rid).map(|e| e.max_size) else {
            continue;
        };
        if pool.size(buf) > max_size {
            waits.wake(rid, WaitOutcome::TooLarge, wk);
            continue;
        }

        mbox.messages.pop_front();
        if let Some(entry) = waits.get_mut(rid) {
            entry.assigned = Some(buf);
        }
        waits.wake(rid, WaitOutcome::Delivered, wk);
    }
}

/// The send turn moved on: let waiting senders re-check
fn kick(mbox: &mut Mailbox, waits: &mut WaitTable, wk: &mut Wakeups) {
    for wid in mbox.ordering.drain(..) {
        waits.wake(wid, WaitOutcome::Retry, wk);
    }
    if mbox.has_room() {
        if let Some(sender) = mbox.senders.pop_front() {
            waits.wake(sender.wait, WaitOutcome::Retry, wk);
        }
    }
}

/// A buffered message was consumed: free its charge, wake the oldest sender
fn consumed(mbox: &mut Mailbox, waits: &mut WaitTable, wk: &mut Wakeups) {
    mbox.used = mbox.used.saturating_sub(1);
    if let Some(sender) = mbox.senders.pop_front() {
        waits.wake(sender.wait, WaitOutcome::Retry, wk);
    }
}

impl IpcState {
    fn new(config: &MailboxConfig) -> Self {
        Self {
            mailboxes: CircularTable::new(config.max_mailboxes, |i| Mailbox::new(MailboxId(i))),
            pool: MessagePool::new(config.pool_slots),
            waits: WaitTable::new(config.max_waiters),
        }
    }

    fn mailbox(&self, id: MailboxId) -> IpcResult<&Mailbox> {
        self.mailboxes
            .get(id.index())
            .filter(|m| m.is_in_use())
            .ok_or(IpcError::InvalidArgument)
    }

    /// Scheduler tag for a still-pending wait entry
    fn pending_reason(&self, wait: WaitId) -> Option<WaitReason> {
        let entry = self.waits.get(wait).filter(|e| !e.is_woken())?;
        Some(match entry.queue {
            Some(WaitQueueKind::Senders) => WaitReason::IpcSend,
            Some(WaitQueueKind::Ordering) => WaitReason::IpcOrdering,
            _ => WaitReason::IpcReceive,
        })
    }

    // ========================================================================
    // Registry
    // ========================================================================

    fn create(&mut self, capacity: usize, max_size: usize) -> IpcResult<MailboxId> {
        if capacity > self.pool.capacity() || max_size > MAX_MESSAGE {
            return Err(IpcError::InvalidArgument);
        }

        self.mailboxes
            .claim(|_, mbox| mbox.open(capacity, max_size))
            .map(MailboxId)
            .ok_or(IpcError::ResourceExhausted)
    }

    fn release(&mut self, id: MailboxId, wk: &mut Wakeups) -> IpcResult<()> {
        let Self {
            mailboxes,
            pool,
            waits,
        } = self;
        let mbox = in_use(mailboxes, id)?;

        for sender in mbox.senders.drain(..) {
            waits.wake(sender.wait, WaitOutcome::Interrupted, wk);
        }
        for wid in mbox.receivers.drain(..).chain(mbox.ordering.drain(..)) {
            waits.wake(wid, WaitOutcome::Interrupted, wk);
        }
        for buf in mbox.messages.drain(..) {
            pool.free(buf);
        }

        mailboxes.release(id.index());
        Ok(())
    }

    // ========================================================================
    // Send
    // ========================================================================

    fn check_send(&self, id: MailboxId, len: usize) -> IpcResult<()> {
        let mbox = self.mailbox(id)?;
        if len > mbox.max_size() {
            return Err(IpcError::InvalidArgument);
        }
        if self.pool.is_exhausted() {
            return Err(IpcError::ResourceExhausted);
        }
        Ok(())
    }

    /// Would a send of `len` bytes to `id` have to suspend right now?
    fn send_would_block(&self, id: MailboxId, len: usize) -> bool {
        let Ok(mbox) = self.mailbox(id) else {
            return false;
        };
        if mbox.is_zero_capacity() {
            !mbox
                .receivers
                .iter()
                .any(|w| self.waits.get(*w).is_some_and(|e| e.max_size >= len))
        } else {
            !(mbox.no_pending_senders() && mbox.has_room())
        }
    }

    fn send_begin(
        &mut self,
        id: MailboxId,
        payload: &[u8],
        pid: ProcessId,
        conditional: bool,
        wk: &mut Wakeups,
    ) -> IpcResult<Step<()>> {
        self.check_send(id, payload.len())?;
        if conditional && self.send_would_block(id, payload.len()) {
            return Err(IpcError::WouldBlock);
        }

        if self.mailbox(id)?.is_zero_capacity() {
            self.rendezvous_send(id, payload, pid, wk)
        } else {
            self.bounded_send(id, payload, pid, wk)
        }
    }

    fn rendezvous_send(
        &mut self,
        id: MailboxId,
        payload: &[u8],
        pid: ProcessId,
        wk: &mut Wakeups,
    ) -> IpcResult<Step<()>> {
        let Self {
            mailboxes, waits, ..
        } = self;
        let mbox = in_use(mailboxes, id)?;

        while let Some(rid) = mbox.receivers.pop_front() {
            let Some(entry) = waits.get_mut(rid) else {
                continue;
            };
            if entry.max_size < payload.len() {
                waits.wake(rid, WaitOutcome::TooLarge, wk);
                continue;
            }

            entry.handoff.clear();
            // Bounded by the mailbox max size, itself <= MAX_MESSAGE
            let _ = entry.handoff.extend_from_slice(payload);
            waits.wake(rid, WaitOutcome::Delivered, wk);
            return Ok(Step::Done(()));
        }

        let wid = waits.create(pid, id, mbox.generation(), WaitQueueKind::Senders)?;
        let ticket = mbox.take_ticket();
        if let Some(entry) = waits.get_mut(wid) {
            let _ = entry.handoff.extend_from_slice(payload);
        }
        mbox.push_sender(SenderWaiter { wait: wid, ticket });
        log::trace!("{} waits for a receiver on {}", pid, id);
        Ok(Step::Wait(wid))
    }

    fn bounded_send(
        &mut self,
        id: MailboxId,
        payload: &[u8],
        pid: ProcessId,
        wk: &mut Wakeups,
    ) -> IpcResult<Step<()>> {
        let mbox = in_use(&mut self.mailboxes, id)?;
        let immediate = mbox.no_pending_senders() && mbox.has_room();
        let ticket = mbox.take_ticket();
        let generation = mbox.generation();

        if immediate {
            return self.deliver(id, ticket, payload, wk).map(Step::Done);
        }

        let wid = match self
            .waits
            .create(pid, id, generation, WaitQueueKind::Senders)
        {
            Ok(wid) => wid,
            Err(e) => {
                let mbox = in_use(&mut self.mailboxes, id)?;
                if mbox.retire(ticket) {
                    kick(mbox, &mut self.waits, wk);
                }
                return Err(e);
            }
        };
        if let Some(entry) = self.waits.get_mut(wid) {
            entry.ticket = Some(ticket);
        }
        self.park_sender(id, wid, ticket)?;
        Ok(Step::Wait(wid))
    }

    /// Queue sender `wid` on the sender or ordering queue
    fn park_sender(&mut self, id: MailboxId, wid: WaitId, ticket: u64) -> IpcResult<()> {
        let Self {
            mailboxes, waits, ..
        } = self;
        let mbox = in_use(mailboxes, id)?;
        let entry = waits.get_mut(wid).ok_or(IpcError::InvalidArgument)?;
        entry.outcome = WaitOutcome::Pending;

        if mbox.has_room() {
            entry.queue = Some(WaitQueueKind::Ordering);
            mbox.ordering.push_back(wid);
            log::trace!("{} waits for its turn on {}", entry.pid, id);
        } else {
            entry.queue = Some(WaitQueueKind::Senders);
            mbox.push_sender(SenderWaiter { wait: wid, ticket });
            log::trace!("{} waits for room on {}", entry.pid, id);
        }
        Ok(())
    }

    /// Buffer the message for `ticket`, which must be the current turn
    fn deliver(
        &mut self,
        id: MailboxId,
        ticket: u64,
        payload: &[u8],
        wk: &mut Wakeups,
    ) -> IpcResult<()> {
        let Self {
            mailboxes,
            pool,
            waits,
        } = self;
        let mbox = in_use(mailboxes, id)?;

        let buf = match pool.alloc(id, payload) {
            Ok(buf) => buf,
            Err(e) => {
                if mbox.retire(ticket) {
                    kick(mbox, waits, wk);
                }
                return Err(e);
            }
        };

        mbox.used += 1;
        let advanced = mbox.retire(ticket);
        mbox.messages.push_back(buf);
        hand_off(mbox, pool, waits, wk);
        if advanced {
            kick(mbox, waits, wk);
        }
        Ok(())
    }

    fn send_resume(
        &mut self,
        wid: WaitId,
        payload: &[u8],
        wk: &mut Wakeups,
    ) -> IpcResult<Step<()>> {
        let Some(entry) = self.waits.get(wid) else {
            return Err(IpcError::Interrupted);
        };
        let outcome = entry.outcome;
        let ticket = entry.ticket;
        let pid = entry.pid;
        let Some((id, generation)) = entry.mailbox else {
            self.waits.free(wid);
            return Err(IpcError::Interrupted);
        };

        let alive = self
            .mailboxes
            .get(id.index())
            .is_some_and(|m| m.is_generation(generation));

        match (outcome, ticket) {
            // Rendezvous payload taken, the mailbox may be gone since
            (WaitOutcome::Delivered, _) => {
                self.waits.free(wid);
                Ok(Step::Done(()))
            }
            (WaitOutcome::Retry, Some(ticket)) if alive => {
                let mbox = in_use(&mut self.mailboxes, id)?;
                if mbox.is_turn(ticket) && mbox.has_room() {
                    self.waits.free(wid);
                    self.deliver(id, ticket, payload, wk).map(Step::Done)
                } else {
                    self.park_sender(id, wid, ticket)?;
                    Ok(Step::Wait(wid))
                }
            }
            _ => {
                self.waits.free(wid);
                log::debug!("{}: send on {} interrupted", pid, id);
                Err(IpcError::Interrupted)
            }
        }
    }

    // ========================================================================
    // Receive
    // ========================================================================

    /// Would a receive on `id` have to suspend right now?
    fn recv_would_block(&self, id: MailboxId) -> bool {
        match self.mailbox(id) {
            Ok(mbox) if mbox.is_zero_capacity() => mbox.senders.is_empty(),
            Ok(mbox) => mbox.messages.is_empty(),
            Err(_) => false,
        }
    }

    fn recv_begin(
        &mut self,
        id: MailboxId,
        out: &mut [u8],
        pid: ProcessId,
        conditional: bool,
        wk: &mut Wakeups,
    ) -> IpcResult<Step<usize>> {
        self.mailbox(id)?;
        if conditional && self.recv_would_block(id) {
            return Err(IpcError::WouldBlock);
        }

        let Self {
            mailboxes,
            pool,
            waits,
        } = self;
        let mbox = in_use(mailboxes, id)?;

        if mbox.is_zero_capacity() {
            loop {
                let Some(&sender) = mbox.senders.front() else {
                    break;
                };
                let Some(entry) = waits.get(sender.wait) else {
                    mbox.senders.pop_front();
                    continue;
                };

                let n = entry.handoff.len();
                if n > out.len() {
                    return Err(IpcError::InvalidArgument);
                }
                out[..n].copy_from_slice(&entry.handoff);
                mbox.senders.pop_front();
                waits.wake(sender.wait, WaitOutcome::Delivered, wk);
                return Ok(Step::Done(n));
            }
        } else if let Some(&buf) = mbox.messages.front() {
            let n = pool.size(buf);
            if n > out.len() {
                return Err(IpcError::InvalidArgument);
            }
            mbox.messages.pop_front();
            pool.copy_out(buf, out);
            pool.free(buf);
            consumed(mbox, waits, wk);
            return Ok(Step::Done(n));
        }

        let wid = waits.create(pid, id, mbox.generation(), WaitQueueKind::Receivers)?;
        if let Some(entry) = waits.get_mut(wid) {
            entry.max_size = out.len();
        }
        mbox.receivers.push_back(wid);
        log::trace!("{} waits for a message on {}", pid, id);
        Ok(Step::Wait(wid))
    }

    fn recv_resume(&mut self, wid: WaitId, out: &mut [u8], wk: &mut Wakeups) -> IpcResult<usize> {
        let Self {
            mailboxes,
            pool,
            waits,
        } = self;
        let Some(entry) = waits.get(wid) else {
            return Err(IpcError::Interrupted);
        };
        let outcome = entry.outcome;
        let assigned = entry.assigned;
        let pid = entry.pid;
        let mailbox = entry.mailbox;

        let result = match (outcome, assigned) {
            (WaitOutcome::Delivered, Some(buf)) => {
                let n = pool.copy_out(buf, out);
                pool.free(buf);
                // Only charge the mailbox this buffer was sent to
                if let Some(mbox) = same_mailbox(mailboxes, mailbox) {
                    consumed(mbox, waits, wk);
                }
                Ok(n)
            }
            (WaitOutcome::Delivered, None) => {
                let n = entry.handoff.len();
                out[..n].copy_from_slice(&entry.handoff);
                Ok(n)
            }
            (WaitOutcome::TooLarge, _) => Err(IpcError::InvalidArgument),
            (_, assigned) => {
                if let Some(buf) = assigned {
                    pool.free(buf);
                }
                log::debug!("{}: receive interrupted", pid);
                Err(IpcError::Interrupted)
            }
        };

        waits.free(wid);
        result
    }

    // ========================================================================
    // Cancellation
    // ========================================================================

    /// Tear down the wait entry of a dropped operation
    fn abandon(&mut self, wid: WaitId, wk: &mut Wakeups) {
        let Self {
            mailboxes,
            pool,
            waits,
        } = self;
        let Some(entry) = waits.get(wid) else {
            return;
        };
        let queue = entry.queue;
        let assigned = entry.assigned;
        let ticket = entry.ticket;
        let mailbox = entry.mailbox;

        match same_mailbox(mailboxes, mailbox) {
            Some(mbox) => {
                if let Some(kind) = queue {
                    mbox.unlink(wid, kind);
                }
                if let Some(buf) = assigned {
                    mbox.messages.push_front(buf);
                    hand_off(mbox, pool, waits, wk);
                }
                if let Some(ticket) = ticket {
                    if mbox.retire(ticket) {
                        kick(mbox, waits, wk);
                    }
                }
            }
            None => {
                if let Some(buf) = assigned {
                    pool.free(buf);
                }
            }
        }

        log::debug!("abandoned wait entry {:?}", wid);
        waits.free(wid);
    }
}

// ============================================================================
// Suspension Point
// ============================================================================

/// Future that completes once wait entry `wait` has been woken
///
/// Dropping it before completion abandons the wait.
struct Blocked<'a, S: Scheduler> {
    mgr: &'a MailboxManager<S>,
    wait: WaitId,
    done: bool,
}

impl<S: Scheduler> Future for Blocked<'_, S> {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        let pending = self.mgr.state.lock().pending_reason(self.wait);
        match pending {
            Some(reason) => {
                self.mgr.sched.suspend_current(reason);
                Poll::Pending
            }
            None => {
                self.done = true;
                Poll::Ready(())
            }
        }
    }
}

impl<S: Scheduler> Drop for Blocked<'_, S> {
    fn drop(&mut self) {
        if !self.done {
            self.mgr.abandon(self.wait);
        }
    }
}

// ============================================================================
// Mailbox Manager
// ============================================================================

/// The mailbox subsystem: registry, buffer pool, wait table
///
/// Build one at startup and share it by reference. Blocking operations are
/// `async` and suspend through the scheduler `S`; resuming is the
/// scheduler's job once the manager has called [`Scheduler::resume`].
pub struct MailboxManager<S: Scheduler> {
    config: MailboxConfig,
    state: Mutex<IpcState>,
    sched: S,
}

impl<S: Scheduler> MailboxManager<S> {
    /// Initialize empty tables sized by `config`
    pub fn new(config: MailboxConfig, sched: S) -> Result<Self, ConfigError> {
        config.validate()?;
        log::debug!(
            "mailbox manager: {} mailboxes, {} buffers, {} wait entries",
            config.max_mailboxes,
            config.pool_slots,
            config.max_waiters
        );
        Ok(Self {
            config,
            state: Mutex::new(IpcState::new(&config)),
            sched,
        })
    }

    /// Table sizes
    pub fn config(&self) -> &MailboxConfig {
        &self.config
    }

    /// The scheduler this manager suspends through
    pub fn scheduler(&self) -> &S {
        &self.sched
    }

    /// Run one step under the lock, then resume whoever it woke
    fn with_state<R>(&self, f: impl FnOnce(&mut IpcState, &mut Wakeups) -> R) -> R {
        let mut wakeups = Wakeups::new();
        let result = {
            let mut state = self.state.lock();
            f(&mut state, &mut wakeups)
        };
        for pid in wakeups {
            self.sched.resume(pid);
        }
        result
    }

    /// Like [`with_state`](Self::with_state), but gives up instead of
    /// spinning when the lock is already held
    ///
    /// An interrupt handler that lands inside another step on the same CPU
    /// would otherwise spin on a lock its own CPU holds.
    fn try_with_state<R>(&self, f: impl FnOnce(&mut IpcState, &mut Wakeups) -> R) -> Option<R> {
        let mut wakeups = Wakeups::new();
        let result = {
            let mut state = self.state.try_lock()?;
            f(&mut state, &mut wakeups)
        };
        for pid in wakeups {
            self.sched.resume(pid);
        }
        Some(result)
    }

    fn block_on(&self, wait: WaitId) -> Blocked<'_, S> {
        Blocked {
            mgr: self,
            wait,
            done: false,
        }
    }

    fn abandon(&self, wait: WaitId) {
        self.with_state(|st, wk| st.abandon(wait, wk));
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Create a mailbox buffering up to `capacity` messages of at most
    /// `max_size` bytes; `capacity == 0` makes a rendezvous mailbox
    ///
    /// `InvalidArgument` if `capacity` exceeds the pool or `max_size`
    /// exceeds [`MAX_MESSAGE`]; `ResourceExhausted` if the registry is full.
    pub fn create(&self, capacity: usize, max_size: usize) -> IpcResult<MailboxId> {
        let id = self.with_state(|st, _| st.create(capacity, max_size))?;
        log::debug!("created {} (capacity {}, max size {})", id, capacity, max_size);
        Ok(id)
    }

    /// Release a mailbox
    ///
    /// Every process blocked on it is woken and sees `Interrupted`; buffered
    /// messages are discarded. Does not wait for the woken processes to run.
    pub fn release(&self, id: MailboxId) -> IpcResult<()> {
        let mut woken = 0;
        self.with_state(|st, wk| {
            let r = st.release(id, wk);
            woken = wk.len();
            r
        })?;
        log::debug!("released {}, woke {} waiters", id, woken);
        Ok(())
    }

    /// Release every mailbox; returns how many were in use
    pub fn release_all(&self) -> usize {
        self.with_state(|st, wk| {
            let ids: Vec<MailboxId> = st
                .mailboxes
                .iter()
                .filter(|m| m.is_in_use())
                .map(Mailbox::id)
                .collect();
            ids.iter()
                .filter(|id| st.release(**id, wk).is_ok())
                .count()
        })
    }

    // ========================================================================
    // Blocking Operations
    // ========================================================================

    /// Send `payload` to mailbox `id`, waiting for room (or, on a
    /// rendezvous mailbox, for a receiver)
    ///
    /// Messages from concurrent senders are queued in the order their
    /// `send` calls started.
    pub async fn send(&self, id: MailboxId, payload: &[u8]) -> IpcResult<()> {
        let pid = self.sched.current_pid();
        let mut step = self.with_state(|st, wk| st.send_begin(id, payload, pid, false, wk))?;

        while let Step::Wait(wait) = step {
            self.block_on(wait).await;
            step = self.with_state(|st, wk| st.send_resume(wait, payload, wk))?;
        }
        Ok(())
    }

    /// Receive the oldest message of mailbox `id` into `out`, waiting for
    /// one if necessary; returns the message size
    ///
    /// `InvalidArgument` if the message is longer than `out`; the message
    /// then stays in the mailbox.
    pub async fn receive(&self, id: MailboxId, out: &mut [u8]) -> IpcResult<usize> {
        let pid = self.sched.current_pid();
        let step = self.with_state(|st, wk| st.recv_begin(id, out, pid, false, wk))?;

        match step {
            Step::Done(n) => Ok(n),
            Step::Wait(wait) => {
                self.block_on(wait).await;
                self.with_state(|st, wk| st.recv_resume(wait, out, wk))
            }
        }
    }

    // ========================================================================
    // Conditional Operations
    // ========================================================================

    /// Send without blocking; `WouldBlock` where [`send`](Self::send) would wait
    ///
    /// Never spins on the manager lock: if another step holds it (an
    /// interrupt landed in the middle of an operation), this returns
    /// `WouldBlock` at once. Safe to call from interrupt context.
    pub fn cond_send(&self, id: MailboxId, payload: &[u8]) -> IpcResult<()> {
        let pid = self.sched.current_pid();
        let step = self
            .try_with_state(|st, wk| st.send_begin(id, payload, pid, true, wk))
            .ok_or_else(|| {
                log::trace!("cond_send on {}: manager busy", id);
                IpcError::WouldBlock
            })??;
        match step {
            Step::Done(()) => Ok(()),
            Step::Wait(wait) => {
                self.try_with_state(|st, wk| st.abandon(wait, wk));
                Err(IpcError::WouldBlock)
            }
        }
    }

    /// Receive without blocking; `WouldBlock` where
    /// [`receive`](Self::receive) would wait
    ///
    /// Like [`cond_send`](Self::cond_send), returns `WouldBlock` instead of
    /// spinning when the manager lock is held.
    pub fn cond_recv(&self, id: MailboxId, out: &mut [u8]) -> IpcResult<usize> {
        let pid = self.sched.current_pid();
        let step = self
            .try_with_state(|st, wk| st.recv_begin(id, out, pid, true, wk))
            .ok_or_else(|| {
                log::trace!("cond_recv on {}: manager busy", id);
                IpcError::WouldBlock
            })??;
        match step {
            Step::Done(n) => Ok(n),
            Step::Wait(wait) => {
                self.try_with_state(|st, wk| st.abandon(wait, wk));
                Err(IpcError::WouldBlock)
            }
        }
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    /// Snapshot of mailbox `id`
    pub fn info(&self, id: MailboxId) -> IpcResult<MailboxInfo> {
        self.state.lock().mailbox(id).map(Mailbox::info)
    }

    /// Buffer pool counters
    pub fn pool_stats(&self) -> PoolStats {
        self.state.lock().pool.stats()
    }

    /// Free buffers left in the pool
    pub fn free_buffers(&self) -> usize {
        self.state.lock().pool.available()
    }

    /// Wait entries currently in use
    pub fn waiters(&self) -> usize {
        self.state.lock().waits.in_use()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kern::coop::CoopScheduler;

    fn manager(sched: &CoopScheduler) -> MailboxManager<&CoopScheduler> {
        let config = MailboxConfig::new()
            .with_mailboxes(4)
            .with_pool_slots(4)
            .with_waiters(8);
        MailboxManager::new(config, sched).unwrap()
    }

    #[test]
    fn test_create_validation() {
        let sched = CoopScheduler::new();
        let mgr = manager(&sched);

        assert_eq!(mgr.create(5, 4), Err(IpcError::InvalidArgument));
        assert_eq!(mgr.create(1, MAX_MESSAGE + 1), Err(IpcError::InvalidArgument));
        assert_eq!(mgr.create(4, MAX_MESSAGE), Ok(MailboxId(0)));
        assert_eq!(mgr.create(0, 0), Ok(MailboxId(1)));
    }

    #[test]
    fn test_registry_exhaustion_and_reuse() {
        let sched = CoopScheduler::new();
        let mgr = manager(&sched);

        for i in 0..4 {
            assert_eq!(mgr.create(1, 8), Ok(MailboxId(i)));
        }
        assert_eq!(mgr.create(1, 8), Err(IpcError::ResourceExhausted));

        mgr.release(MailboxId(2)).unwrap();
        assert_eq!(mgr.create(1, 8), Ok(MailboxId(2)));
    }

    #[test]
    fn test_release_invalid() {
        let sched = CoopScheduler::new();
        let mgr = manager(&sched);

        assert_eq!(mgr.release(MailboxId(0)), Err(IpcError::InvalidArgument));
        assert_eq!(mgr.release(MailboxId(99)), Err(IpcError::InvalidArgument));

        let id = mgr.create(1, 8).unwrap();
        assert_eq!(mgr.release(id), Ok(()));
        assert_eq!(mgr.release(id), Err(IpcError::InvalidArgument));
    }

    #[test]
    fn test_cond_round_trip() {
        let sched = CoopScheduler::new();
        let mgr = manager(&sched);
        let id = mgr.create(2, 8).unwrap();

        mgr.cond_send(id, b"one").unwrap();
        mgr.cond_send(id, b"two").unwrap();
        assert_eq!(mgr.cond_send(id, b"three"), Err(IpcError::WouldBlock));
        assert_eq!(mgr.info(id).unwrap().used, 2);

        let mut out = [0u8; 8];
        assert_eq!(mgr.cond_recv(id, &mut out), Ok(3));
        assert_eq!(&out[..3], b"one");
        assert_eq!(mgr.cond_recv(id, &mut out), Ok(3));
        assert_eq!(&out[..3], b"two");
        assert_eq!(mgr.cond_recv(id, &mut out), Err(IpcError::WouldBlock));
        assert_eq!(mgr.free_buffers(), 4);
        assert_eq!(mgr.waiters(), 0);
    }

    #[test]
    fn test_send_validation() {
        let sched = CoopScheduler::new();
        let mgr = manager(&sched);
        let id = mgr.create(1, 2).unwrap();

        assert_eq!(mgr.cond_send(id, b"abc"), Err(IpcError::InvalidArgument));
        assert_eq!(mgr.cond_send(MailboxId(3), b"a"), Err(IpcError::InvalidArgument));
        assert_eq!(mgr.cond_send(MailboxId(40), b"a"), Err(IpcError::InvalidArgument));
        let mut out = [0u8; 2];
        assert_eq!(mgr.cond_recv(MailboxId(3), &mut out), Err(IpcError::InvalidArgument));
    }

    #[test]
    fn test_receive_too_small_keeps_message() {
        let sched = CoopScheduler::new();
        let mgr = manager(&sched);
        let id = mgr.create(1, 8).unwrap();
        mgr.cond_send(id, b"hello").unwrap();

        let mut small = [0u8; 2];
        assert_eq!(mgr.cond_recv(id, &mut small), Err(IpcError::InvalidArgument));
        assert_eq!(mgr.info(id).unwrap().queued, 1);

        let mut out = [0u8; 8];
        assert_eq!(mgr.cond_recv(id, &mut out), Ok(5));
    }

    #[test]
    fn test_pool_shared_between_mailboxes() {
        let sched = CoopScheduler::new();
        let mgr = manager(&sched);
        let a = mgr.create(3, 8).unwrap();
        let b = mgr.create(3, 8).unwrap();

        mgr.cond_send(a, b"1").unwrap();
        mgr.cond_send(a, b"2").unwrap();
        mgr.cond_send(b, b"3").unwrap();
        mgr.cond_send(b, b"4").unwrap();

        // Both mailboxes have room, the pool does not
        assert_eq!(mgr.cond_send(a, b"5"), Err(IpcError::ResourceExhausted));
        assert_eq!(mgr.cond_send(b, b"5"), Err(IpcError::ResourceExhausted));
        assert_eq!(mgr.pool_stats().max_in_use, 4);

        let mut out = [0u8; 8];
        mgr.cond_recv(a, &mut out).unwrap();
        assert_eq!(mgr.cond_send(b, b"5"), Ok(()));
    }

    #[test]
    fn test_release_frees_buffers() {
        let sched = CoopScheduler::new();
        let mgr = manager(&sched);
        let id = mgr.create(3, 8).unwrap();
        mgr.cond_send(id, b"x").unwrap();
        mgr.cond_send(id, b"y").unwrap();
        assert_eq!(mgr.free_buffers(), 2);

        mgr.release(id).unwrap();
        assert_eq!(mgr.free_buffers(), 4);
        assert_eq!(mgr.info(id), Err(IpcError::InvalidArgument));
    }

    #[test]
    fn test_zero_capacity_cond() {
        let sched = CoopScheduler::new();
        let mgr = manager(&sched);
        let id = mgr.create(0, 8).unwrap();

        assert_eq!(mgr.cond_send(id, b"hi"), Err(IpcError::WouldBlock));
        let mut out = [0u8; 8];
        assert_eq!(mgr.cond_recv(id, &mut out), Err(IpcError::WouldBlock));
        assert_eq!(mgr.waiters(), 0);
        assert_eq!(mgr.pool_stats().allocs, 0);
    }

    #[test]
    fn test_release_all() {
        let sched = CoopScheduler::new();
        let mgr = manager(&sched);
        mgr.create(1, 8).unwrap();
        mgr.create(0, 8).unwrap();
        assert_eq!(mgr.release_all(), 2);
        assert_eq!(mgr.release_all(), 0);
    }

    #[test]
    fn test_cond_ops_never_spin_on_held_lock() {
        let sched = CoopScheduler::new();
        let mgr = manager(&sched);
        let id = mgr.create(2, 8).unwrap();
        mgr.cond_send(id, b"queued").unwrap();

        {
            // Another step is in progress on this CPU
            let _held = mgr.state.lock();
            assert_eq!(mgr.cond_send(id, b"irq"), Err(IpcError::WouldBlock));
            let mut out = [0u8; 8];
            assert_eq!(mgr.cond_recv(id, &mut out), Err(IpcError::WouldBlock));
        }

        // Nothing was touched while the lock was held
        let info = mgr.info(id).unwrap();
        assert_eq!(info.queued, 1);
        assert_eq!(info.used, 1);
        assert_eq!(mgr.waiters(), 0);
        assert_eq!(mgr.cond_send(id, b"irq"), Ok(()));
    }

    #[test]
    fn test_bad_config() {
        let sched = CoopScheduler::new();
        let config = MailboxConfig::new().with_mailboxes(0);
        assert!(matches!(
            MailboxManager::new(config, &sched),
            Err(ConfigError::NoMailboxes)
        ));
    }
}
