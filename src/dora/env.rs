// The execution environment.
//
// `DoraEnv` is the container callers talk to: it owns the part-tables, the
// group-commit pipeline, and the single enqueue entrance point. A caller
// builds a transaction by beginning a storage transaction, creating a
// terminal RVP (and interim RVPs for multi-phase transactions), borrowing
// and initializing one action per touched partition, and enqueueing each at
// its table/partition index.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::common::{ClientHandle, DataField, TableId};
use crate::error::{DoraError, DoraResult};
use crate::storage::{StorageEngine, XctHandle};

use super::action::{ActionPtr, RoutingHint};
use super::flusher::GroupCommit;
use super::key::Key;
use super::part_table::PartTable;
use super::rvp::{Continuation, RendezvousPoint};
use super::stats::Stats;
use super::Runtime;

/// Container for all part-tables and the group-commit pipeline.
pub struct DoraEnv<D: DataField> {
    runtime: Arc<Runtime>,
    tables: Mutex<Vec<Arc<PartTable<D>>>>,
    group_commit: Option<Arc<GroupCommit<D>>>,
    stopped: Mutex<bool>,
}

impl<D: DataField> DoraEnv<D> {
    /// Creates an environment. With `group_commit` the flusher/notifier
    /// pipeline is started and terminal RVPs commit lazily through it;
    /// without it commits are eager and clients are notified inline.
    pub fn new(runtime: Arc<Runtime>, group_commit: bool) -> DoraResult<Arc<Self>> {
        let pipeline = if group_commit {
            Some(GroupCommit::start(runtime.clone())?)
        } else {
            None
        };
        Ok(Arc::new(Self {
            runtime,
            tables: Mutex::new(Vec::new()),
            group_commit: pipeline,
            stopped: Mutex::new(false),
        }))
    }

    /// The shared runtime context.
    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    /// Registers a range-partitioned table. Returns its table index.
    pub fn add_range_table(
        &self,
        name: impl Into<String>,
        boundaries: Vec<(Key<D>, Key<D>)>,
        start_cpu: usize,
        cpu_range: usize,
    ) -> DoraResult<TableId> {
        let table = PartTable::range(name, self.runtime.clone(), boundaries, start_cpu, cpu_range)?;
        let mut tables = self.tables.lock();
        tables.push(table);
        Ok(tables.len() - 1)
    }

    /// Registers a hash-partitioned table. Returns its table index.
    pub fn add_hash_table(
        &self,
        name: impl Into<String>,
        partitions: usize,
        start_cpu: usize,
        cpu_range: usize,
    ) -> DoraResult<TableId> {
        let table = PartTable::hash(name, self.runtime.clone(), partitions, start_cpu, cpu_range)?;
        let mut tables = self.tables.lock();
        tables.push(table);
        Ok(tables.len() - 1)
    }

    /// A registered table by index.
    pub fn table(&self, index: TableId) -> DoraResult<Arc<PartTable<D>>> {
        self.tables
            .lock()
            .get(index)
            .cloned()
            .ok_or_else(|| DoraError::wrong_partition(format!("no table {index}")))
    }

    /// Starts every registered table's partitions.
    pub fn start(&self) -> DoraResult<()> {
        for table in self.tables.lock().iter() {
            table.reset()?;
        }
        Ok(())
    }

    /// Begins a storage transaction.
    pub fn begin_xct(&self) -> DoraResult<XctHandle> {
        self.runtime.storage().begin_xct()
    }

    /// Builds the terminal RVP of a transaction with `count` sibling
    /// actions, wired to the group-commit pipeline when enabled.
    pub fn terminal_rvp(
        &self,
        xct: XctHandle,
        count: usize,
        client: Option<Arc<ClientHandle>>,
    ) -> Arc<RendezvousPoint<D>> {
        RendezvousPoint::terminal(
            self.runtime.clone(),
            xct,
            count,
            client,
            self.group_commit.as_ref().map(|pipeline| pipeline.handle()),
        )
    }

    /// Builds an interim RVP gating a later transaction phase.
    pub fn interim_rvp(
        &self,
        xct: XctHandle,
        count: usize,
        continuation: Option<Continuation>,
    ) -> Arc<RendezvousPoint<D>> {
        RendezvousPoint::interim(self.runtime.clone(), xct, count, continuation)
    }

    /// Borrows a reset action envelope from a partition's cache.
    pub fn borrow_action(
        &self,
        table: TableId,
        partition: usize,
    ) -> DoraResult<ActionPtr<D>> {
        Ok(self.table(table)?.partition(partition)?.cache().borrow())
    }

    /// The single entrance point: enqueues `action` at the given table and
    /// partition index.
    ///
    /// Returns `WrongAction` for a malformed action, `WrongPartition` when
    /// the index is out of range or the partition does not cover the
    /// action's keys.
    pub fn enqueue(
        &self,
        action: ActionPtr<D>,
        wake: bool,
        table: TableId,
        partition: usize,
    ) -> DoraResult<()> {
        self.table(table)?.enqueue(action, wake, partition)
    }

    /// Convenience: routes a point action by key, then enqueues it.
    pub fn enqueue_by_key(
        &self,
        action: ActionPtr<D>,
        wake: bool,
        table: TableId,
    ) -> DoraResult<usize> {
        let key = match action.routing() {
            RoutingHint::Point(key) => key,
            _ => {
                return Err(DoraError::wrong_action(
                    "enqueue_by_key needs a point routing hint",
                ))
            }
        };
        let table_ref = self.table(table)?;
        let index = table_ref.partition_for_key(&key)?;
        table_ref.enqueue(action, wake, index)?;
        Ok(index)
    }

    /// Aggregated statistics of workers, flusher and transaction totals.
    pub fn statistics(&self) -> Stats {
        let mut stats = Stats {
            committed: self.runtime.stats().committed(),
            aborted: self.runtime.stats().aborted(),
            ..Stats::default()
        };
        for table in self.tables.lock().iter() {
            stats.workers.merge(&table.statistics());
        }
        stats.flusher = self
            .group_commit
            .as_ref()
            .map(|pipeline| pipeline.stats());
        stats
    }

    /// Stops every table, then the group-commit pipeline. Idempotent.
    /// Returns the number of enqueued actions aborted during shutdown.
    pub fn stop(&self) -> usize {
        let mut stopped = self.stopped.lock();
        if *stopped {
            return 0;
        }
        *stopped = true;
        drop(stopped);

        let mut aborted = 0;
        for table in self.tables.lock().iter() {
            aborted += table.stop();
        }
        if let Some(pipeline) = &self.group_commit {
            pipeline.stop();
        }
        tracing::debug!(aborted, "environment stopped");
        aborted
    }
}

impl<D: DataField> Drop for DoraEnv<D> {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DoraConfig;
    use crate::dora::key::ikey;
    use crate::storage::MemStorage;

    fn env() -> Arc<DoraEnv<i64>> {
        let runtime = Runtime::new(DoraConfig::default(), Arc::new(MemStorage::new()));
        DoraEnv::new(runtime, false).unwrap()
    }

    #[test]
    fn test_add_and_lookup_tables() {
        let env = env();
        let t0 = env
            .add_range_table("a", vec![(ikey([0]), ikey([10]))], 0, 2)
            .unwrap();
        let t1 = env.add_hash_table("b", 2, 0, 2).unwrap();
        assert_eq!(t0, 0);
        assert_eq!(t1, 1);
        assert_eq!(env.table(0).unwrap().name(), "a");
        assert_eq!(env.table(1).unwrap().partition_count(), 2);
        assert!(env.table(2).is_err());
    }

    #[test]
    fn test_stop_is_idempotent() {
        let env = env();
        env.add_range_table("a", vec![(ikey([0]), ikey([10]))], 0, 2)
            .unwrap();
        env.start().unwrap();
        assert_eq!(env.stop(), 0);
        assert_eq!(env.stop(), 0);
    }

    #[test]
    fn test_statistics_shape() {
        let env = env();
        let stats = env.statistics();
        assert_eq!(stats.committed, 0);
        assert!(stats.flusher.is_none());
    }
}
