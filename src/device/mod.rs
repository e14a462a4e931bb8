//! Device Mailboxes - interrupt-to-process status delivery
//!
//! Every device unit gets a mailbox reserved at startup. A process waiting
//! on a device blocks in a receive on that mailbox; the interrupt side posts
//! the device status with a conditional send, so it never blocks.
//!
//! Statuses are 4-byte little-endian `i32`s. A status posted while nobody
//! waits stays buffered (up to the per-mailbox capacity) and is picked up by
//! the next [`DeviceMailboxes::wait_device`].

use alloc::vec::Vec;
use core::fmt;

use crate::ipc::{IpcError, IpcResult, MailboxManager};
use crate::kern::sched_prim::Scheduler;
use crate::types::MailboxId;

/// Size of a posted device status
pub const STATUS_SIZE: usize = core::mem::size_of::<i32>();

// ============================================================================
// Device Kinds
// ============================================================================

/// Class of device
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DeviceKind {
    /// Interval timer
    Clock,
    /// Disk controller
    Disk,
    /// Terminal line
    Terminal,
}

impl DeviceKind {
    /// All kinds, in mailbox reservation order
    pub const ALL: [DeviceKind; 3] = [DeviceKind::Clock, DeviceKind::Disk, DeviceKind::Terminal];
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::Clock => write!(f, "clock"),
            DeviceKind::Disk => write!(f, "disk"),
            DeviceKind::Terminal => write!(f, "terminal"),
        }
    }
}

// ============================================================================
// Layout
// ============================================================================

/// Number of units per device kind, and how many statuses each buffers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceLayout {
    /// Clock units
    pub clocks: usize,
    /// Disk units
    pub disks: usize,
    /// Terminal units
    pub terminals: usize,
    /// Capacity of each device mailbox
    pub capacity: usize,
}

impl DeviceLayout {
    /// One clock, two disks, four terminals, one buffered status each
    pub const fn new() -> Self {
        Self {
            clocks: 1,
            disks: 2,
            terminals: 4,
            capacity: 1,
        }
    }

    /// Units of `kind`
    pub fn units(&self, kind: DeviceKind) -> usize {
        match kind {
            DeviceKind::Clock => self.clocks,
            DeviceKind::Disk => self.disks,
            DeviceKind::Terminal => self.terminals,
        }
    }

    /// Units across all kinds
    pub fn total(&self) -> usize {
        self.clocks + self.disks + self.terminals
    }

    /// Position of (`kind`, `unit`) in reservation order
    fn slot(&self, kind: DeviceKind, unit: usize) -> Option<usize> {
        if unit >= self.units(kind) {
            return None;
        }
        let base: usize = DeviceKind::ALL
            .iter()
            .take_while(|k| **k != kind)
            .map(|k| self.units(*k))
            .sum();
        Some(base + unit)
    }
}

impl Default for DeviceLayout {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Device Mailboxes
// ============================================================================

/// The device mailboxes reserved on one manager
pub struct DeviceMailboxes<'a, S: Scheduler> {
    mgr: &'a MailboxManager<S>,
    layout: DeviceLayout,
    ids: Vec<MailboxId>,
}

impl<'a, S: Scheduler> DeviceMailboxes<'a, S> {
    /// Create one mailbox per device unit
    ///
    /// On a fresh manager these are the lowest mailbox ids, clocks first.
    /// If the registry fills up part way, the mailboxes already created are
    /// released again.
    pub fn reserve(mgr: &'a MailboxManager<S>, layout: DeviceLayout) -> IpcResult<Self> {
        let mut ids = Vec::with_capacity(layout.total());
        for _ in 0..layout.total() {
            match mgr.create(layout.capacity, STATUS_SIZE) {
                Ok(id) => ids.push(id),
                Err(e) => {
                    for id in ids {
                        if let Err(err) = mgr.release(id) {
                            log::warn!("rolling back {}: release failed: {}", id, err);
                        }
                    }
                    return Err(e);
                }
            }
        }

        log::debug!("reserved {} device mailboxes", ids.len());
        Ok(Self { mgr, layout, ids })
    }

    /// Unit layout
    pub fn layout(&self) -> &DeviceLayout {
        &self.layout
    }

    /// Mailbox of (`kind`, `unit`)
    pub fn mailbox(&self, kind: DeviceKind, unit: usize) -> IpcResult<MailboxId> {
        self.layout
            .slot(kind, unit)
            .and_then(|i| self.ids.get(i).copied())
            .ok_or(IpcError::InvalidArgument)
    }

    /// Block until (`kind`, `unit`) posts a status
    pub async fn wait_device(&self, kind: DeviceKind, unit: usize) -> IpcResult<i32> {
        let id = self.mailbox(kind, unit)?;
        let mut raw = [0u8; STATUS_SIZE];
        let n = self.mgr.receive(id, &mut raw).await?;
        if n != STATUS_SIZE {
            return Err(IpcError::InvalidArgument);
        }
        Ok(i32::from_le_bytes(raw))
    }

    /// Post `status` for (`kind`, `unit`) without blocking
    ///
    /// Safe to call from interrupt context: it goes through
    /// [`MailboxManager::cond_send`], which never spins on the manager lock.
    /// A status that cannot be queued (mailbox full, pool exhausted, manager
    /// busy) is dropped and logged.
    pub fn wakeup_by_device(&self, kind: DeviceKind, unit: usize, status: i32) -> IpcResult<()> {
        let id = self.mailbox(kind, unit)?;
        self.mgr
            .cond_send(id, &status.to_le_bytes())
            .inspect_err(|e| log::warn!("{} {}: status {} dropped: {}", kind, unit, status, e))
    }

    /// Is any process blocked waiting on a device?
    pub fn io_pending(&self) -> bool {
        self.ids.iter().any(|id| {
            self.mgr
                .info(*id)
                .is_ok_and(|info| info.blocked_receivers > 0)
        })
    }

    /// Release every device mailbox, interrupting pending waits
    pub fn release(self) {
        for id in self.ids {
            if let Err(err) = self.mgr.release(id) {
                log::warn!("device {}: release failed: {}", id, err);
            }
        }
    }
}
