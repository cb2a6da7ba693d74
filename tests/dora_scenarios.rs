// End-to-end scenarios for the DORA execution layer.
//
// Each test drives the public surface the way an embedding database would:
// begin a storage transaction, build a rendez-vous point, borrow and
// initialize one action per touched partition, enqueue, and wait on the
// client handle. The in-memory storage engine stands in for the storage
// manager.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use rusty_dora::{
    Action, ActionPtr, ClientHandle, ClosureLogic, DoraConfig, DoraEnv, DoraError, ExecContext,
    Key, LockMode, LockRequest, MemStorage, RoutingHint, Runtime, StorageEngine, TrxOutcome,
};

const WAIT: Duration = Duration::from_secs(10);

fn ikey(fields: impl IntoIterator<Item = i64>) -> Key<i64> {
    Key::from_fields(fields.into_iter().collect())
}

struct Harness {
    env: Arc<DoraEnv<i64>>,
    storage: Arc<MemStorage>,
}

/// Environment with one range table covering [0, 200) split in two
/// partitions: P0 = [0, 100), P1 = [100, 200).
fn harness(group_commit: bool, options: &[(&str, &str)]) -> Harness {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let storage = Arc::new(MemStorage::new());
    let config = DoraConfig::from_pairs(options.iter().copied()).unwrap();
    let runtime = Runtime::new(config, storage.clone());
    let env = DoraEnv::new(runtime, group_commit).unwrap();
    env.add_range_table(
        "accounts",
        vec![(ikey([0]), ikey([100])), (ikey([100]), ikey([200]))],
        0,
        4,
    )
    .unwrap();
    env.start().unwrap();
    Harness { env, storage }
}

type Body = Box<dyn FnMut(&mut ExecContext<'_>) -> Result<(), DoraError> + Send>;

impl Harness {
    /// Submits a single-action transaction on `key` and returns its client
    /// handle.
    fn submit(&self, key: i64, mode: LockMode, body: Body) -> Arc<ClientHandle> {
        let (client, _) = self.submit_action(key, mode, body);
        client
    }

    fn submit_action(
        &self,
        key: i64,
        mode: LockMode,
        mut body: Body,
    ) -> (Arc<ClientHandle>, ActionPtr<i64>) {
        let xct = self.env.begin_xct().unwrap();
        let client = Arc::new(ClientHandle::new());
        let rvp = self.env.terminal_rvp(xct.clone(), 1, Some(client.clone()));
        let table = self.env.table(0).unwrap();
        let index = table.partition_for_key(&ikey([key])).unwrap();
        let action = self.env.borrow_action(0, index).unwrap();
        action.init(
            xct,
            rvp,
            RoutingHint::Point(ikey([key])),
            mode == LockMode::Shared,
            ClosureLogic::new(
                vec![LockRequest::new(ikey([key]), mode)],
                move |ctx: &mut ExecContext<'_>| body(ctx),
            ),
        );
        self.env.enqueue(action.clone(), true, 0, index).unwrap();
        (client, action)
    }

    /// Submits a two-action transaction touching `key0` and `key1` (one
    /// action per owning partition), with per-action bodies.
    fn submit_pair(
        &self,
        keys: [i64; 2],
        modes: [LockMode; 2],
        bodies: [Body; 2],
    ) -> Arc<ClientHandle> {
        let xct = self.env.begin_xct().unwrap();
        let client = Arc::new(ClientHandle::new());
        let rvp = self.env.terminal_rvp(xct.clone(), 2, Some(client.clone()));
        let table = self.env.table(0).unwrap();
        for (key, (mode, mut body)) in keys.into_iter().zip(modes.into_iter().zip(bodies)) {
            let index = table.partition_for_key(&ikey([key])).unwrap();
            let action = self.env.borrow_action(0, index).unwrap();
            action.init(
                xct.clone(),
                rvp.clone(),
                RoutingHint::Point(ikey([key])),
                false,
                ClosureLogic::new(
                    vec![LockRequest::new(ikey([key]), mode)],
                    move |ctx: &mut ExecContext<'_>| body(ctx),
                ),
            );
            self.env.enqueue(action, true, 0, index).unwrap();
        }
        client
    }

    fn assert_locks_clean(&self) {
        let table = self.env.table(0).unwrap();
        for index in 0..table.partition_count() {
            let partition = table.partition(index).unwrap();
            assert!(
                partition.lock_manager().is_clean(),
                "partition {index} still holds locks"
            );
        }
    }
}

fn noop_body() -> Body {
    Box::new(|_| Ok(()))
}

fn recording_body(log: Arc<Mutex<Vec<&'static str>>>, label: &'static str) -> Body {
    Box::new(move |_| {
        log.lock().push(label);
        Ok(())
    })
}

// ============================================================================
// S1 - Shared/exclusive interleave on one key
// ============================================================================

#[test]
fn s1_shared_exclusive_interleave_orders_by_lock_fifo() {
    let h = harness(false, &[]);
    let log = Arc::new(Mutex::new(Vec::new()));

    let clients = vec![
        h.submit(7, LockMode::Shared, recording_body(log.clone(), "a1")),
        h.submit(7, LockMode::Shared, recording_body(log.clone(), "a2")),
        h.submit(7, LockMode::Exclusive, recording_body(log.clone(), "a3")),
        h.submit(7, LockMode::Shared, recording_body(log.clone(), "a4")),
    ];
    for client in &clients {
        assert_eq!(client.wait_for(WAIT), Some(TrxOutcome::Committed));
    }

    let order = log.lock().clone();
    assert_eq!(order.len(), 4);
    let position = |label| order.iter().position(|&l| l == label).unwrap();
    // The writer goes after both earlier readers, the trailing reader after
    // the writer: the waiter queue is FIFO, no bypass.
    assert!(position("a3") > position("a1"));
    assert!(position("a3") > position("a2"));
    assert!(position("a4") > position("a3"));

    h.assert_locks_clean();
    assert_eq!(h.env.stop(), 0);
}

// ============================================================================
// S2 - Cross-partition join
// ============================================================================

#[test]
fn s2_cross_partition_join_commits_exactly_once() {
    let h = harness(false, &[]);
    let ran_p0 = Arc::new(AtomicBool::new(false));
    let ran_p1 = Arc::new(AtomicBool::new(false));

    let client = h.submit_pair(
        [50, 150],
        [LockMode::Exclusive, LockMode::Exclusive],
        [
            {
                let ran = ran_p0.clone();
                Box::new(move |_: &mut ExecContext<'_>| {
                    ran.store(true, Ordering::SeqCst);
                    Ok(())
                })
            },
            {
                let ran = ran_p1.clone();
                Box::new(move |_: &mut ExecContext<'_>| {
                    ran.store(true, Ordering::SeqCst);
                    Ok(())
                })
            },
        ],
    );

    assert_eq!(client.wait_for(WAIT), Some(TrxOutcome::Committed));
    assert!(ran_p0.load(Ordering::SeqCst));
    assert!(ran_p1.load(Ordering::SeqCst));

    // Exactly one commit for the whole transaction.
    let stats = h.env.statistics();
    assert_eq!(stats.committed, 1);
    assert_eq!(stats.aborted, 0);
    // The client is signalled exactly once; a second wait sees the same
    // outcome immediately.
    assert_eq!(client.outcome(), Some(TrxOutcome::Committed));
    h.assert_locks_clean();
    h.env.stop();
}

// ============================================================================
// S3 - Deadlock surfaced by the storage engine
// ============================================================================

#[test]
fn s3_engine_deadlock_aborts_whole_transaction() {
    let h = harness(false, &[]);

    let client = h.submit_pair(
        [10, 110],
        [LockMode::Exclusive, LockMode::Exclusive],
        [
            Box::new(|ctx: &mut ExecContext<'_>| Err(DoraError::deadlock(ctx.tid()))),
            noop_body(),
        ],
    );

    assert_eq!(client.wait_for(WAIT), Some(TrxOutcome::AbortedDeadlock));
    let stats = h.env.statistics();
    assert_eq!(stats.committed, 0);
    assert_eq!(stats.aborted, 1);
    assert_eq!(h.storage.aborted_count(), 1);
    assert_eq!(h.storage.active_count(), 0);
    // Both partitions released every logical lock.
    h.assert_locks_clean();
    h.env.stop();
}

// ============================================================================
// S4 - Group-commit batching
// ============================================================================

#[test]
fn s4_group_commit_batches_flushes() {
    let h = harness(
        true,
        &[
            ("flusher-max-xcts", "8"),
            ("flusher-max-ms", "10"),
            ("flusher-max-bytes", "1048576"),
        ],
    );

    let clients: Vec<_> = (0..20)
        .map(|i| h.submit(i % 100, LockMode::Exclusive, noop_body()))
        .collect();
    for client in clients {
        assert_eq!(client.wait_for(WAIT), Some(TrxOutcome::Committed));
    }

    let stats = h.env.statistics();
    assert_eq!(stats.committed, 20);
    let flusher = stats.flusher.expect("flusher enabled");
    assert_eq!(flusher.flushed_xcts, 20);
    // 20 transactions in groups of up to 8: a handful of log forces, not one
    // per transaction.
    assert!(
        h.storage.flush_calls() <= 6,
        "log forced {} times",
        h.storage.flush_calls()
    );
    h.env.stop();
}

#[test]
fn s4b_acknowledgment_only_after_durability() {
    let h = harness(true, &[("flusher-max-xcts", "1"), ("flusher-max-ms", "500")]);
    let client = h.submit(3, LockMode::Exclusive, noop_body());
    assert_eq!(client.wait_for(WAIT), Some(TrxOutcome::Committed));
    // By the time the client is signalled the watermark covers the commit.
    assert!(h.storage.durable_lsn() > 0);
    h.env.stop();
}

// ============================================================================
// S5 - Shutdown with pending work
// ============================================================================

#[test]
fn s5_stop_aborts_enqueued_and_signals_every_client() {
    let h = harness(false, &[]);

    // A blocker occupies the partition worker so the rest stays enqueued.
    let (gate_tx, gate_rx) = mpsc::channel::<()>();
    let blocker = h.submit(
        1,
        LockMode::Exclusive,
        Box::new(move |_| {
            let _ = gate_rx.recv_timeout(Duration::from_secs(10));
            Ok(())
        }),
    );
    // Give the worker time to pick the blocker up.
    thread::sleep(Duration::from_millis(50));

    let pending: Vec<_> = (0..100)
        .map(|i| h.submit(2 + (i % 90), LockMode::Exclusive, noop_body()))
        .collect();

    // Open the gate while stop() is joining the worker.
    let opener = thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        let _ = gate_tx.send(());
    });
    let aborted = h.env.stop();
    opener.join().unwrap();

    assert_eq!(aborted, 100, "exactly the pending actions are aborted");
    assert_eq!(blocker.wait_for(WAIT), Some(TrxOutcome::Committed));
    for client in pending {
        assert_eq!(client.wait_for(WAIT), Some(TrxOutcome::AbortedSystem));
    }
    assert_eq!(h.storage.active_count(), 0);
}

// ============================================================================
// S6 - Action-cache reuse under load
// ============================================================================

#[test]
fn s6_cache_reuse_no_growth_after_warmup() {
    let h = harness(false, &[]);

    for round in 0..200 {
        let key = round % 100;
        let client = h.submit(key, LockMode::Exclusive, noop_body());
        assert_eq!(client.wait_for(WAIT), Some(TrxOutcome::Committed));
    }
    h.env.stop();

    let table = h.env.table(0).unwrap();
    let cache = table.partition(0).unwrap().cache();
    // Warm pool absorbs the whole load: no fresh allocations, nothing ever
    // refused as double-giveback.
    assert_eq!(cache.allocations(), 0);
    assert_eq!(cache.refused(), 0);
    assert!(cache.borrows() >= 200);
}

// ============================================================================
// Routing and restart behavior
// ============================================================================

#[test]
fn wrong_partition_is_rejected_at_enqueue() {
    let h = harness(false, &[]);
    let xct = h.env.begin_xct().unwrap();
    let rvp = h.env.terminal_rvp(xct.clone(), 1, None);
    let action = Action::new_ptr();
    action.init(
        xct.clone(),
        rvp,
        RoutingHint::Point(ikey([150])),
        false,
        ClosureLogic::new(vec![LockRequest::exclusive(ikey([150]))], |_| Ok(())),
    );
    // Key 150 belongs to partition 1; partition 0 must refuse it.
    let err = h.env.enqueue(action, true, 0, 0).unwrap_err();
    assert!(matches!(err, DoraError::WrongPartition { .. }));
    assert_eq!(err.code(), Some(0x82_0005));
    h.storage.abort_xct(&xct).unwrap();
    h.env.stop();
}

#[test]
fn restarted_partition_behaves_like_fresh() {
    let h = harness(false, &[]);

    let first = h.submit(5, LockMode::Exclusive, noop_body());
    assert_eq!(first.wait_for(WAIT), Some(TrxOutcome::Committed));

    // Full restart of the table's partitions.
    let table = h.env.table(0).unwrap();
    table.stop();
    table.reset().unwrap();

    let second = h.submit(5, LockMode::Exclusive, noop_body());
    assert_eq!(second.wait_for(WAIT), Some(TrxOutcome::Committed));
    h.assert_locks_clean();
    h.env.stop();
}

#[test]
fn multi_key_action_serializes_with_conflicts() {
    let h = harness(false, &[]);
    let log = Arc::new(Mutex::new(Vec::new()));

    // One action locking two keys exclusively, racing two single-key
    // readers on the same keys.
    let xct = h.env.begin_xct().unwrap();
    let client = Arc::new(ClientHandle::new());
    let rvp = h.env.terminal_rvp(xct.clone(), 1, Some(client.clone()));
    let action = h.env.borrow_action(0, 0).unwrap();
    let writer_log = log.clone();
    action.init(
        xct,
        rvp,
        RoutingHint::Range(ikey([20]), ikey([21])),
        false,
        ClosureLogic::new(
            vec![
                LockRequest::exclusive(ikey([20])),
                LockRequest::exclusive(ikey([21])),
            ],
            move |_| {
                writer_log.lock().push("writer");
                Ok(())
            },
        ),
    );
    h.env.enqueue(action, true, 0, 0).unwrap();

    let readers = vec![
        h.submit(20, LockMode::Shared, recording_body(log.clone(), "r20")),
        h.submit(21, LockMode::Shared, recording_body(log.clone(), "r21")),
    ];
    assert_eq!(client.wait_for(WAIT), Some(TrxOutcome::Committed));
    for reader in readers {
        assert_eq!(reader.wait_for(WAIT), Some(TrxOutcome::Committed));
    }
    assert_eq!(log.lock().len(), 3);
    h.assert_locks_clean();
    h.env.stop();
}
