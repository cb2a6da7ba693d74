// Partitions.
//
// A partition is a logical subset of one table bound 1:1 to a worker
// thread. It owns the two single-reader/multi-writer queues (input and
// commit), the logical lock manager, the action cache and the worker
// lifecycle. Producers from any thread push actions at it; only its own
// worker executes them.
//
// Worker-thread accounting follows the partition-active-thread (PAT) state
// machine: UNDEF until reset, SINGLE while only the primary serves,
// MULTIPLE when standbys have been promoted. The standby pool is accounted
// but not spawned; a partition runs one primary until a measured need says
// otherwise.

use std::hash::{Hash, Hasher};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;

use crate::common::{DataField, PartitionId};
use crate::error::{DoraError, DoraResult};

use super::action::{ActionPtr, RoutingHint};
use super::cache::ActionCache;
use super::key::Key;
use super::lockman::PartitionLockManager;
use super::queue::{BlockingQueue, WorkerSignal};
use super::rvp::Decision;
use super::stats::{WorkerStats, WorkerStatsSnapshot};
use super::worker::{ControlWord, Worker};
use super::Runtime;

/// Default number of standby workers in the cold-spare pool.
pub const DEFAULT_STANDBY_POOL: usize = 0;

/// Partitioning policy of the owning table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionPolicy {
    /// Each partition covers a `[down, up)` key range.
    Range,
    /// Each partition covers a hash residue class.
    Hash { modulus: usize },
}

/// Worker-thread state of a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatState {
    /// No worker; the partition does not accept work.
    Undef,
    /// Only the primary worker is active.
    Single,
    /// Standby workers have been promoted alongside the primary.
    Multiple,
}

struct PatCounter {
    state: PatState,
    active: usize,
}

struct WorkerHandle {
    join: JoinHandle<()>,
    control: Arc<ControlWord>,
    stats: Arc<WorkerStats>,
}

/// One table partition and its runtime.
pub struct Partition<D: DataField> {
    /// Self back-reference for handing the partition to workers and
    /// actions.
    me: Weak<Partition<D>>,
    table: String,
    id: PartitionId,
    policy: PartitionPolicy,
    runtime: Arc<Runtime>,

    lock_manager: PartitionLockManager<D>,
    input_queue: BlockingQueue<ActionPtr<D>>,
    commit_queue: BlockingQueue<ActionPtr<D>>,
    cache: ActionCache<D>,

    /// Range bounds; `None` until `resize` for range partitions, always
    /// `None` for hash partitions.
    bounds: Mutex<Option<(Key<D>, Key<D>)>>,

    pat: Mutex<PatCounter>,
    worker: Mutex<Option<WorkerHandle>>,
    cpu_hint: Mutex<Option<usize>>,
    standby_pool: Mutex<usize>,
}

impl<D: DataField> Partition<D> {
    /// Creates a stopped partition (state UNDEF).
    pub fn new(
        table: impl Into<String>,
        id: PartitionId,
        policy: PartitionPolicy,
        runtime: Arc<Runtime>,
        cache_capacity: usize,
    ) -> Arc<Self> {
        let table = table.into();
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            table,
            id,
            policy,
            runtime,
            lock_manager: PartitionLockManager::new(),
            input_queue: BlockingQueue::new(),
            commit_queue: BlockingQueue::new(),
            cache: ActionCache::with_capacity(cache_capacity),
            bounds: Mutex::new(None),
            pat: Mutex::new(PatCounter {
                state: PatState::Undef,
                active: 0,
            }),
            worker: Mutex::new(None),
            cpu_hint: Mutex::new(None),
            standby_pool: Mutex::new(DEFAULT_STANDBY_POOL),
        })
    }

    /// The owning table's name.
    pub fn table(&self) -> &str {
        &self.table
    }

    /// This partition's index within its table.
    pub fn id(&self) -> PartitionId {
        self.id
    }

    /// The partitioning policy.
    pub fn policy(&self) -> PartitionPolicy {
        self.policy
    }

    /// The partition's logical lock manager.
    pub fn lock_manager(&self) -> &PartitionLockManager<D> {
        &self.lock_manager
    }

    pub(crate) fn input_queue(&self) -> &BlockingQueue<ActionPtr<D>> {
        &self.input_queue
    }

    pub(crate) fn commit_queue(&self) -> &BlockingQueue<ActionPtr<D>> {
        &self.commit_queue
    }

    /// The partition's action cache.
    pub fn cache(&self) -> &ActionCache<D> {
        &self.cache
    }

    /// Sets new range bounds. Fails when `up < down`.
    pub fn resize(&self, down: Key<D>, up: Key<D>) -> DoraResult<()> {
        if !down.le_prefix(&up) {
            return Err(DoraError::wrong_partition("upper bound below lower bound"));
        }
        *self.bounds.lock() = Some((down, up));
        Ok(())
    }

    /// The current range bounds.
    pub fn bounds(&self) -> Option<(Key<D>, Key<D>)> {
        self.bounds.lock().clone()
    }

    /// The CPU hint of the last reset.
    pub fn cpu_hint(&self) -> Option<usize> {
        *self.cpu_hint.lock()
    }

    /// Configured size of the cold-spare standby pool.
    pub fn standby_pool(&self) -> usize {
        *self.standby_pool.lock()
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Starts (or restarts) the partition: stops any previous worker, clears
    /// queues and locks, and spawns the primary pinned near `cpu_hint`.
    ///
    /// `standby_pool` sizes the cold-spare accounting; no standby threads
    /// are spawned until promotion.
    pub fn reset(&self, cpu_hint: Option<usize>, standby_pool: usize) -> DoraResult<()> {
        tracing::debug!(
            table = %self.table,
            part = self.id,
            ?cpu_hint,
            standby_pool,
            "partition reset"
        );
        self.stop_worker();
        self.input_queue.clear(false);
        self.commit_queue.clear(false);
        self.input_queue.reopen();
        self.commit_queue.reopen();
        self.lock_manager.reset();

        *self.cpu_hint.lock() = cpu_hint;
        *self.standby_pool.lock() = standby_pool;
        self.spawn_primary(cpu_hint)?;

        let mut pat = self.pat.lock();
        pat.active = 1;
        pat.state = PatState::Single;
        Ok(())
    }

    fn spawn_primary(&self, cpu_hint: Option<usize>) -> DoraResult<()> {
        let me = self.me.upgrade().ok_or(DoraError::GenPrimaryWorker {
            partition: self.id,
            reason: "partition dropped during reset".into(),
        })?;
        let config = self.runtime.config();
        let signal = Arc::new(WorkerSignal::new());
        let spins = config.worker_queue_loops();
        self.input_queue.set_owner(
            signal.clone(),
            spins,
            config.input_queue_threshold(&self.table),
        );
        self.commit_queue.set_owner(
            signal,
            spins,
            config.commit_queue_threshold(&self.table),
        );

        let control = Arc::new(ControlWord::new());
        let stats = Arc::new(WorkerStats::new());
        let name = format!("{}-P-{}-PRI", self.table, self.id);
        let worker = Worker::new(
            me,
            self.runtime.clone(),
            stats.clone(),
            control.clone(),
            cpu_hint,
            config.worker_sli(),
            name.clone(),
        );
        let join = thread::Builder::new()
            .name(name)
            .spawn(move || worker.run())
            .map_err(|e| DoraError::GenPrimaryWorker {
                partition: self.id,
                reason: e.to_string(),
            })?;
        *self.worker.lock() = Some(WorkerHandle {
            join,
            control,
            stats,
        });
        Ok(())
    }

    /// Stops the partition: stops accepting work, joins the worker, aborts
    /// everything still enqueued, clears both queues and resets the lock
    /// manager.
    pub fn stop(&self) -> usize {
        // Refuse new enqueues first so nothing slips past the drain below.
        {
            let mut pat = self.pat.lock();
            pat.active = 0;
            pat.state = PatState::Undef;
        }
        self.stop_worker();
        let aborted = self.abort_all_enqueued();
        self.input_queue.clear(false);
        self.commit_queue.clear(false);
        self.lock_manager.reset();
        aborted
    }

    fn stop_worker(&self) {
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            handle.control.stop();
            self.input_queue.close();
            self.commit_queue.close();
            if handle.join.join().is_err() {
                tracing::error!(table = %self.table, part = self.id, "worker panicked");
            }
        }
    }

    /// Prepares the partition for a new run without restarting the worker:
    /// the lock manager must already be clean; queues are drained.
    pub fn prepare_new_run(&self) -> DoraResult<()> {
        if !self.lock_manager.is_clean() {
            return Err(DoraError::incompatible_locks(
                0,
                "locks still held across runs",
            ));
        }
        self.lock_manager.reset();
        self.input_queue.clear(true);
        self.commit_queue.clear(true);
        Ok(())
    }

    // ========================================================================
    // PAT state
    // ========================================================================

    /// Current worker-thread state.
    pub fn pat_state(&self) -> PatState {
        self.pat.lock().state
    }

    /// Accounts one promoted standby. Returns the new state.
    pub fn inc_active_thr(&self) -> PatState {
        let mut pat = self.pat.lock();
        pat.active += 1;
        if pat.active > 1 {
            pat.state = PatState::Multiple;
        }
        pat.state
    }

    /// Accounts one demoted standby. Returns the new state.
    pub fn dec_active_thr(&self) -> PatState {
        let mut pat = self.pat.lock();
        debug_assert!(pat.active > 1, "dec_active_thr below the primary");
        pat.active = pat.active.saturating_sub(1);
        if pat.active <= 1 {
            pat.state = PatState::Single;
        }
        pat.state
    }

    // ========================================================================
    // Action intake
    // ========================================================================

    /// Enqueues a new action at the input queue.
    ///
    /// # Errors
    ///
    /// - `WrongAction` when the action is missing its transaction or RVP
    /// - `WrongPartition` when the routing hint is not covered here
    /// - `WrongWorker` when the partition has no active worker
    pub fn enqueue(&self, action: ActionPtr<D>, wake: bool) -> DoraResult<()> {
        action.xct()?;
        action.rvp()?;
        if !self.verify(&action) {
            return Err(DoraError::wrong_partition(format!(
                "action {} not covered by {}-{}",
                action.tid(),
                self.table,
                self.id
            )));
        }
        if self.pat_state() == PatState::Undef {
            return Err(DoraError::wrong_worker(format!(
                "partition {}-{} is not active",
                self.table, self.id
            )));
        }
        let me = self.me.upgrade().ok_or_else(|| {
            DoraError::wrong_worker(format!("partition {}-{} dropped", self.table, self.id))
        })?;
        action.set_partition(&me);
        self.input_queue.push(action, wake);
        Ok(())
    }

    /// Enqueues an executed action for post-commit lock release.
    pub(crate) fn enqueue_commit(&self, action: ActionPtr<D>, wake: bool) -> DoraResult<()> {
        let owned_here = action
            .partition()
            .map(|p| std::ptr::eq(Arc::as_ptr(&p), self))
            .unwrap_or(false);
        if !owned_here {
            return Err(DoraError::wrong_worker(format!(
                "commit enqueue of a foreign action at {}-{}",
                self.table, self.id
            )));
        }
        self.commit_queue.push(action, wake);
        Ok(())
    }

    /// True when the action's routing hint is covered by this partition.
    pub fn verify(&self, action: &ActionPtr<D>) -> bool {
        match action.routing() {
            RoutingHint::None => true,
            RoutingHint::Point(key) => self.covers_point(&key),
            RoutingHint::Range(down, up) => self.covers_range(&down, &up),
        }
    }

    fn covers_point(&self, key: &Key<D>) -> bool {
        match self.policy {
            PartitionPolicy::Range => match &*self.bounds.lock() {
                Some((down, up)) => down.le_prefix(key) && key.lt_prefix(up),
                None => false,
            },
            PartitionPolicy::Hash { modulus } => hash_key(key, modulus) == self.id,
        }
    }

    fn covers_range(&self, down: &Key<D>, up: &Key<D>) -> bool {
        match self.policy {
            PartitionPolicy::Range => match &*self.bounds.lock() {
                Some((part_down, part_up)) => {
                    part_down.le_prefix(down) && up.le_prefix(part_up)
                }
                None => false,
            },
            // A hash partition covers no key range wider than a point.
            PartitionPolicy::Hash { modulus } => {
                down == up && hash_key(down, modulus) == self.id
            }
        }
    }

    /// Walks the input queue aborting every pending action's storage
    /// transaction and posting a DIE decision into its RVP so the client is
    /// still signalled. Returns the number of actions aborted.
    pub fn abort_all_enqueued(&self) -> usize {
        let pending = self.input_queue.clear(true);
        let count = pending.len();
        for action in pending {
            if let Ok(xct) = action.xct() {
                if let Err(error) = self.runtime.storage().abort_xct(&xct) {
                    tracing::error!(tid = action.tid(), %error, "abort of enqueued action failed");
                }
            }
            if let Ok(rvp) = action.rvp() {
                rvp.mark_error(Decision::Die);
                if rvp.post(true) {
                    rvp.run();
                    rvp.notify_committed();
                }
            }
            self.cache.giveback(action);
        }
        if count > 0 {
            tracing::debug!(
                table = %self.table,
                part = self.id,
                count,
                "aborted enqueued actions"
            );
        }
        count
    }

    // ========================================================================
    // Diagnostics
    // ========================================================================

    /// Snapshot of the worker's counters.
    pub fn statistics(&self) -> WorkerStatsSnapshot {
        self.worker
            .lock()
            .as_ref()
            .map(|handle| handle.stats.snapshot())
            .unwrap_or_default()
    }

    /// Logs partition state at debug level.
    pub fn dump(&self) {
        tracing::debug!(
            table = %self.table,
            part = self.id,
            policy = ?self.policy,
            pat = ?self.pat_state(),
            input = self.input_queue.len(),
            commit = self.commit_queue.len(),
            "partition"
        );
        self.lock_manager.dump();
    }
}

/// Hash routing: residue class of the key's hash.
pub(crate) fn hash_key<D: DataField>(key: &Key<D>, modulus: usize) -> usize {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % modulus.max(1) as u64) as usize
}
