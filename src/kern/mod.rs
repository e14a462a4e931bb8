//! Kern subsystem - Scheduling glue
//!
//! The mailbox core blocks and wakes processes only through the
//! [`Scheduler`] trait. [`coop`] provides a deterministic cooperative
//! implementation used by hosted builds and the test suite.

pub mod coop;
pub mod sched_prim;

pub use coop::{CoopRunner, CoopScheduler, WakeOrder};
pub use sched_prim::{Scheduler, WaitReason};
