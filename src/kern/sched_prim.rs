//! Scheduling Primitives - Suspend/Resume interface
//!
//! The mailbox core does not schedule anything itself. It reaches the
//! process scheduler only through [`Scheduler`]: it asks who is running,
//! announces that the running process is about to block, and later names a
//! process that may run again.
//!
//! Blocking operations are futures. A blocked operation calls
//! [`Scheduler::suspend_current`] and returns `Poll::Pending`; the scheduler
//! polls it again after someone called [`Scheduler::resume`] for its process.

use alloc::rc::Rc;
use alloc::sync::Arc;

use crate::types::ProcessId;

// ============================================================================
// Wait Reasons
// ============================================================================

/// Why a process is blocked (tag passed to the scheduler)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum WaitReason {
    /// Waiting for room in a mailbox, or for a rendezvous receiver
    IpcSend = 1,
    /// Waiting for a message
    IpcReceive = 2,
    /// Waiting for an older sender to deliver first
    IpcOrdering = 3,
}

// ============================================================================
// Scheduler Interface
// ============================================================================

/// The process scheduler, as seen by the mailbox core
pub trait Scheduler {
    /// Process currently executing
    ///
    /// Outside any process (boot, interrupt context) this is
    /// [`ProcessId::KERNEL`].
    fn current_pid(&self) -> ProcessId;

    /// The current process is about to return `Pending` and must not be
    /// polled again until [`resume`](Scheduler::resume) names it.
    fn suspend_current(&self, reason: WaitReason);

    /// Make a suspended process runnable again
    fn resume(&self, pid: ProcessId);
}

impl<S: Scheduler + ?Sized> Scheduler for &S {
    fn current_pid(&self) -> ProcessId {
        (**self).current_pid()
    }

    fn suspend_current(&self, reason: WaitReason) {
        (**self).suspend_current(reason)
    }

    fn resume(&self, pid: ProcessId) {
        (**self).resume(pid)
    }
}

impl<S: Scheduler + ?Sized> Scheduler for Rc<S> {
    fn current_pid(&self) -> ProcessId {
        (**self).current_pid()
    }

    fn suspend_current(&self, reason: WaitReason) {
        (**self).suspend_current(reason)
    }

    fn resume(&self, pid: ProcessId) {
        (**self).resume(pid)
    }
}

impl<S: Scheduler + ?Sized> Scheduler for Arc<S> {
    fn current_pid(&self) -> ProcessId {
        (**self).current_pid()
    }

    fn suspend_current(&self, reason: WaitReason) {
        (**self).suspend_current(reason)
    }

    fn resume(&self, pid: ProcessId) {
        (**self).resume(pid)
    }
}
