//! Cooperative Process Runner
//!
//! A deterministic, single-threaded stand-in for the kernel dispatcher.
//! Every "process" is a future; the runner polls one process at a time and
//! only polls a process again once it is runnable. [`CoopScheduler`] is the
//! [`Scheduler`] the mailbox core talks to, [`CoopRunner`] owns the process
//! futures and drives them.
//!
//! The order in which runnable processes are picked is configurable through
//! [`WakeOrder`], which lets callers check that mailbox ordering does not
//! depend on dispatch order.

use alloc::boxed::Box;
use alloc::collections::{BTreeMap, BTreeSet, VecDeque};
use core::future::Future;
use core::pin::Pin;
use core::task::{Context, RawWaker, RawWakerVTable, Waker};
use spin::Mutex;

use super::sched_prim::{Scheduler, WaitReason};
use crate::types::ProcessId;

// ============================================================================
// Dispatch Order
// ============================================================================

/// Policy for picking the next runnable process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeOrder {
    /// Oldest runnable first
    Fifo,
    /// Most recently readied first
    Lifo,
    /// Pseudo-random, reproducible from the seed
    Shuffled(u64),
}

// ============================================================================
// Scheduler State
// ============================================================================

#[derive(Debug)]
struct CoopState {
    /// Process being polled, if any
    current: Option<ProcessId>,
    /// Runnable processes
    ready: VecDeque<ProcessId>,
    /// Suspended processes and what they wait for
    blocked: BTreeMap<ProcessId, WaitReason>,
    /// Resumed while still running; skip their next suspension
    early_wakes: BTreeSet<ProcessId>,
    /// Next pid to hand out
    next_pid: u32,
    /// Dispatch policy
    order: WakeOrder,
    /// xorshift state for `WakeOrder::Shuffled`
    rng: u64,
    /// Number of polls performed
    switches: u64,
}

impl CoopState {
    fn pick(&mut self) -> Option<ProcessId> {
        match self.order {
            WakeOrder::Fifo => self.ready.pop_front(),
            WakeOrder::Lifo => self.ready.pop_back(),
            WakeOrder::Shuffled(_) => {
                if self.ready.is_empty() {
                    return None;
                }
                let mut x = self.rng;
                x ^= x << 13;
                x ^= x >> 7;
                x ^= x << 17;
                self.rng = x;
                let at = (x % self.ready.len() as u64) as usize;
                self.ready.remove(at)
            }
        }
    }
}

/// Deterministic cooperative scheduler
#[derive(Debug)]
pub struct CoopScheduler {
    state: Mutex<CoopState>,
}

impl CoopScheduler {
    /// Scheduler with FIFO dispatch
    pub fn new() -> Self {
        Self::with_order(WakeOrder::Fifo)
    }

    /// Scheduler with the given dispatch policy
    pub fn with_order(order: WakeOrder) -> Self {
        let rng = match order {
            WakeOrder::Shuffled(seed) => seed | 1,
            _ => 1,
        };
        Self {
            state: Mutex::new(CoopState {
                current: None,
                ready: VecDeque::new(),
                blocked: BTreeMap::new(),
                early_wakes: BTreeSet::new(),
                next_pid: 1,
                order,
                rng,
                switches: 0,
            }),
        }
    }

    /// Is `pid` suspended?
    pub fn is_blocked(&self, pid: ProcessId) -> bool {
        self.state.lock().blocked.contains_key(&pid)
    }

    /// What `pid` is suspended on, if anything
    pub fn wait_reason(&self, pid: ProcessId) -> Option<WaitReason> {
        self.state.lock().blocked.get(&pid).copied()
    }

    /// Number of suspended processes
    pub fn blocked_count(&self) -> usize {
        self.state.lock().blocked.len()
    }

    /// Number of runnable processes
    pub fn ready_count(&self) -> usize {
        self.state.lock().ready.len()
    }

    /// Number of polls performed so far
    pub fn context_switches(&self) -> u64 {
        self.state.lock().switches
    }

    fn admit(&self) -> ProcessId {
        let mut st = self.state.lock();
        let pid = ProcessId(st.next_pid);
        st.next_pid += 1;
        st.ready.push_back(pid);
        pid
    }

    fn pick(&self) -> Option<ProcessId> {
        self.state.lock().pick()
    }

    fn forget(&self, pid: ProcessId) {
        let mut st = self.state.lock();
        st.blocked.remove(&pid);
        st.ready.retain(|p| *p != pid);
        st.early_wakes.remove(&pid);
    }

    fn enter(&self, pid: ProcessId) {
        let mut st = self.state.lock();
        st.current = Some(pid);
        st.switches += 1;
    }

    /// Leave `pid`; a pending process that never suspended stays runnable
    fn leave(&self, pid: ProcessId, finished: bool) {
        let mut st = self.state.lock();
        st.current = None;
        st.early_wakes.remove(&pid);
        if finished {
            st.blocked.remove(&pid);
        } else if !st.blocked.contains_key(&pid) && !st.ready.contains(&pid) {
            st.ready.push_back(pid);
        }
    }
}

impl Default for CoopScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for CoopScheduler {
    fn current_pid(&self) -> ProcessId {
        self.state.lock().current.unwrap_or(ProcessId::KERNEL)
    }

    fn suspend_current(&self, reason: WaitReason) {
        let mut st = self.state.lock();
        if let Some(pid) = st.current {
            if st.early_wakes.remove(&pid) {
                st.ready.push_back(pid);
            } else {
                st.blocked.insert(pid, reason);
            }
        }
    }

    fn resume(&self, pid: ProcessId) {
        let mut st = self.state.lock();
        if st.blocked.remove(&pid).is_some() {
            st.ready.push_back(pid);
        } else if st.current == Some(pid) {
            st.early_wakes.insert(pid);
        }
    }
}

// ============================================================================
// Runner
// ============================================================================

type Process<'a> = Pin<Box<dyn Future<Output = ()> + 'a>>;

/// Owns process futures and polls them under a [`CoopScheduler`]
pub struct CoopRunner<'a> {
    sched: &'a CoopScheduler,
    tasks: BTreeMap<ProcessId, Process<'a>>,
}

impl<'a> CoopRunner<'a> {
    /// Create a runner dispatching through `sched`
    pub fn new(sched: &'a CoopScheduler) -> Self {
        Self {
            sched,
            tasks: BTreeMap::new(),
        }
    }

    /// Start a new process; it is runnable immediately
    pub fn spawn<F>(&mut self, fut: F) -> ProcessId
    where
        F: Future<Output = ()> + 'a,
    {
        let pid = self.sched.admit();
        self.tasks.insert(pid, Box::pin(fut));
        pid
    }

    /// Poll one runnable process; returns the pid that ran
    pub fn step(&mut self) -> Option<ProcessId> {
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);

        loop {
            let pid = self.sched.pick()?;
            let Some(task) = self.tasks.get_mut(&pid) else {
                continue;
            };

            self.sched.enter(pid);
            let finished = task.as_mut().poll(&mut cx).is_ready();
            self.sched.leave(pid, finished);

            if finished {
                self.tasks.remove(&pid);
            }
            return Some(pid);
        }
    }

    /// Poll until no process is runnable; returns the number of polls
    pub fn run_until_stalled(&mut self) -> usize {
        let mut steps = 0;
        while self.step().is_some() {
            steps += 1;
        }
        steps
    }

    /// Terminate `pid`, dropping its future wherever it is suspended
    pub fn kill(&mut self, pid: ProcessId) -> bool {
        let removed = self.tasks.remove(&pid).is_some();
        self.sched.forget(pid);
        removed
    }

    /// Has `pid` run to completion?
    pub fn is_finished(&self, pid: ProcessId) -> bool {
        !self.tasks.contains_key(&pid)
    }

    /// Number of processes not yet finished
    pub fn live(&self) -> usize {
        self.tasks.len()
    }
}

fn noop_waker() -> Waker {
    fn clone(_: *const ()) -> RawWaker {
        RawWaker::new(core::ptr::null(), &VTABLE)
    }
    fn noop(_: *const ()) {}
    static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, noop, noop, noop);

    // SAFETY: every vtable entry ignores the data pointer
    unsafe { Waker::from_raw(RawWaker::new(core::ptr::null(), &VTABLE)) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::Cell;
    use core::task::Poll;

    /// Future that suspends once, then completes
    struct SuspendOnce<'a> {
        sched: &'a CoopScheduler,
        armed: bool,
    }

    impl Future for SuspendOnce<'_> {
        type Output = ();

        fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
            if self.armed {
                Poll::Ready(())
            } else {
                self.armed = true;
                self.sched.suspend_current(WaitReason::IpcReceive);
                Poll::Pending
            }
        }
    }

    #[test]
    fn test_spawn_and_finish() {
        let sched = CoopScheduler::new();
        let hits = Cell::new(0);
        let mut runner = CoopRunner::new(&sched);

        let a = runner.spawn(async { hits.set(hits.get() + 1) });
        let b = runner.spawn(async { hits.set(hits.get() + 1) });
        assert_eq!(a, ProcessId(1));
        assert_eq!(b, ProcessId(2));

        assert_eq!(runner.run_until_stalled(), 2);
        assert_eq!(hits.get(), 2);
        assert!(runner.is_finished(a));
        assert_eq!(runner.live(), 0);
    }

    #[test]
    fn test_suspend_and_resume() {
        let sched = CoopScheduler::new();
        let mut runner = CoopRunner::new(&sched);

        let pid = runner.spawn(SuspendOnce {
            sched: &sched,
            armed: false,
        });
        runner.run_until_stalled();
        assert!(sched.is_blocked(pid));
        assert_eq!(sched.wait_reason(pid), Some(WaitReason::IpcReceive));
        assert!(!runner.is_finished(pid));

        sched.resume(pid);
        assert!(!sched.is_blocked(pid));
        runner.run_until_stalled();
        assert!(runner.is_finished(pid));
    }

    #[test]
    fn test_kill_blocked_process() {
        let sched = CoopScheduler::new();
        let mut runner = CoopRunner::new(&sched);

        let pid = runner.spawn(SuspendOnce {
            sched: &sched,
            armed: false,
        });
        runner.run_until_stalled();
        assert!(runner.kill(pid));
        assert!(!sched.is_blocked(pid));
        assert!(runner.is_finished(pid));
        assert!(!runner.kill(pid));
    }

    #[test]
    fn test_current_pid_outside_process() {
        let sched = CoopScheduler::new();
        assert_eq!(sched.current_pid(), ProcessId::KERNEL);
    }

    #[test]
    fn test_lifo_order() {
        let sched = CoopScheduler::with_order(WakeOrder::Lifo);
        let order = core::cell::RefCell::new(alloc::vec::Vec::new());
        let mut runner = CoopRunner::new(&sched);

        for i in 0..3u32 {
            let order = &order;
            runner.spawn(async move { order.borrow_mut().push(i) });
        }
        runner.run_until_stalled();
        assert_eq!(*order.borrow(), [2, 1, 0]);
    }

    #[test]
    fn test_shuffled_runs_everything() {
        let sched = CoopScheduler::with_order(WakeOrder::Shuffled(7));
        let hits = Cell::new(0);
        let mut runner = CoopRunner::new(&sched);

        for _ in 0..10 {
            runner.spawn(async { hits.set(hits.get() + 1) });
        }
        runner.run_until_stalled();
        assert_eq!(hits.get(), 10);
        assert_eq!(sched.context_switches(), 10);
    }
}
