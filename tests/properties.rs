//! Property-based tests for the mailbox core
//!
//! Random payloads, capacities and dispatch orders; the invariants must
//! hold for every combination.

use std::cell::RefCell;

use mbox_r::kern::{CoopRunner, CoopScheduler, WakeOrder};
use mbox_r::*;
use proptest::prelude::*;

fn dispatch_order() -> impl Strategy<Value = WakeOrder> {
    prop_oneof![
        Just(WakeOrder::Fifo),
        Just(WakeOrder::Lifo),
        any::<u64>().prop_map(WakeOrder::Shuffled),
    ]
}

// ════════════════════════════════════════════════════════════
// Round Trip
// ════════════════════════════════════════════════════════════

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Whatever is sent comes back byte for byte, buffered or rendezvous
    #[test]
    fn payload_round_trips(
        payload in proptest::collection::vec(any::<u8>(), 0..=MAX_MESSAGE),
        capacity in 0usize..4,
        order in dispatch_order(),
    ) {
        let sched = CoopScheduler::with_order(order);
        let mgr = MailboxManager::new(MailboxConfig::new(), &sched).unwrap();
        let received = RefCell::new(None);
        let mut runner = CoopRunner::new(&sched);
        let id = mgr.create(capacity, MAX_MESSAGE).unwrap();

        let (m, p, rx) = (&mgr, &payload, &received);
        runner.spawn(async move {
            m.send(id, p).await.unwrap();
        });
        runner.spawn(async move {
            let mut out = [0u8; MAX_MESSAGE];
            let n = m.receive(id, &mut out).await.unwrap();
            *rx.borrow_mut() = Some(out[..n].to_vec());
        });
        runner.run_until_stalled();

        prop_assert_eq!(runner.live(), 0);
        let received_ref = received.borrow();
        prop_assert_eq!(received_ref.as_deref(), Some(payload.as_slice()));
        drop(received_ref);
        prop_assert_eq!(mgr.free_buffers(), MAX_SLOTS);
    }
}

// ════════════════════════════════════════════════════════════
// Ordering
// ════════════════════════════════════════════════════════════

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Messages come out in the order the send calls started, whatever
    /// order blocked senders are resumed in
    #[test]
    fn fifo_under_any_dispatch_order(
        order in dispatch_order(),
        capacity in 1usize..4,
        senders in 1u8..10,
    ) {
        let sched = CoopScheduler::with_order(order);
        let mgr = MailboxManager::new(MailboxConfig::new(), &sched).unwrap();
        let started = RefCell::new(Vec::new());
        let received = RefCell::new(Vec::new());
        let mut runner = CoopRunner::new(&sched);
        let id = mgr.create(capacity, 1).unwrap();

        let (m, st, rx) = (&mgr, &started, &received);
        for i in 0..senders {
            runner.spawn(async move {
                st.borrow_mut().push(i);
                m.send(id, &[i]).await.unwrap();
            });
        }
        runner.spawn(async move {
            for _ in 0..senders {
                let mut out = [0u8; 1];
                m.receive(id, &mut out).await.unwrap();
                rx.borrow_mut().push(out[0]);
            }
        });
        runner.run_until_stalled();

        prop_assert_eq!(runner.live(), 0);
        prop_assert_eq!(&*received.borrow(), &*started.borrow());
        prop_assert_eq!(mgr.info(id).unwrap().used, 0);
    }

    /// Every message goes to exactly one of several receivers
    #[test]
    fn each_message_received_once(
        order in dispatch_order(),
        capacity in 0usize..3,
        senders in 1u8..8,
        receivers in 1u8..4,
    ) {
        let sched = CoopScheduler::with_order(order);
        let mgr = MailboxManager::new(MailboxConfig::new(), &sched).unwrap();
        let received = RefCell::new(Vec::new());
        let mut runner = CoopRunner::new(&sched);
        let id = mgr.create(capacity, 1).unwrap();

        let (m, rx) = (&mgr, &received);
        for i in 0..senders {
            runner.spawn(async move {
                m.send(id, &[i]).await.unwrap();
            });
        }
        for _ in 0..receivers {
            runner.spawn(async move {
                loop {
                    let mut out = [0u8; 1];
                    match m.receive(id, &mut out).await {
                        Ok(_) => rx.borrow_mut().push(out[0]),
                        Err(_) => break,
                    }
                }
            });
        }
        runner.run_until_stalled();

        // Senders are done; idle receivers are stuck until the release
        prop_assert_eq!(runner.live(), receivers as usize);
        mgr.release(id).unwrap();
        runner.run_until_stalled();
        prop_assert_eq!(runner.live(), 0);

        let mut got = received.borrow().clone();
        got.sort_unstable();
        prop_assert_eq!(got, (0..senders).collect::<Vec<u8>>());
    }
}

// ════════════════════════════════════════════════════════════
// Release
// ════════════════════════════════════════════════════════════

proptest! {
    #![proptest_config(ProptestConfig::with_cases(50))]

    /// Release wakes every blocked caller with `Interrupted` and returns
    /// every buffer to the pool
    #[test]
    fn release_interrupts_everyone(
        order in dispatch_order(),
        capacity in 0usize..3,
        blocked_senders in 0usize..5,
        blocked_receivers in 0usize..5,
    ) {
        let sched = CoopScheduler::with_order(order);
        let mgr = MailboxManager::new(MailboxConfig::new(), &sched).unwrap();
        let interrupted = RefCell::new(0usize);
        let mut runner = CoopRunner::new(&sched);

        let full = mgr.create(capacity, 4).unwrap();
        let empty = mgr.create(capacity, 4).unwrap();
        for _ in 0..capacity {
            mgr.cond_send(full, b"fill").unwrap();
        }

        let (m, n) = (&mgr, &interrupted);
        for _ in 0..blocked_senders {
            runner.spawn(async move {
                if m.send(full, b"more").await == Err(IpcError::Interrupted) {
                    *n.borrow_mut() += 1;
                }
            });
        }
        for _ in 0..blocked_receivers {
            runner.spawn(async move {
                let mut out = [0u8; 4];
                if m.receive(empty, &mut out).await == Err(IpcError::Interrupted) {
                    *n.borrow_mut() += 1;
                }
            });
        }
        runner.run_until_stalled();
        prop_assert_eq!(sched.blocked_count(), blocked_senders + blocked_receivers);

        mgr.release(full).unwrap();
        mgr.release(empty).unwrap();
        runner.run_until_stalled();

        prop_assert_eq!(*interrupted.borrow(), blocked_senders + blocked_receivers);
        prop_assert_eq!(runner.live(), 0);
        prop_assert_eq!(mgr.waiters(), 0);
        prop_assert_eq!(mgr.free_buffers(), MAX_SLOTS);
    }
}
