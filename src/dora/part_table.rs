// Part-tables.
//
// A part-table is the routing structure above one logical table's
// partitions: an ordered partition vector plus a pure routing function from
// key to partition index. Range tables carry `[down, up)` boundary pairs,
// one per partition; hash tables route by residue class. The table also
// owns CPU placement: on reset each partition is re-pinned via a stride
// walk over the active CPUs.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::common::{DataField, PartitionId};
use crate::error::{DoraError, DoraResult};

use super::action::ActionPtr;
use super::key::Key;
use super::partition::{hash_key, Partition, PartitionPolicy, DEFAULT_STANDBY_POOL};
use super::stats::WorkerStatsSnapshot;
use super::Runtime;

/// Default number of cached action envelopes per partition.
const DEFAULT_CACHE_CAPACITY: usize = 64;

enum Routing<D: DataField> {
    Range {
        /// `[down, up)` per partition, in partition order.
        boundaries: Vec<(Key<D>, Key<D>)>,
    },
    Hash {
        partitions: usize,
    },
}

struct Placement {
    start_cpu: usize,
    next_cpu: usize,
    /// Width of the CPU window handed to this table.
    cpu_range: usize,
}

/// One logical table: a vector of partitions plus the routing predicate.
pub struct PartTable<D: DataField> {
    name: String,
    runtime: Arc<Runtime>,
    partitions: Vec<Arc<Partition<D>>>,
    routing: Routing<D>,
    placement: Mutex<Placement>,
}

impl<D: DataField> PartTable<D> {
    /// Creates a range-partitioned table with one partition per boundary
    /// pair. Boundaries must be non-inverted; partition `i` covers
    /// `[boundaries[i].0, boundaries[i].1)`.
    pub fn range(
        name: impl Into<String>,
        runtime: Arc<Runtime>,
        boundaries: Vec<(Key<D>, Key<D>)>,
        start_cpu: usize,
        cpu_range: usize,
    ) -> DoraResult<Arc<Self>> {
        let name = name.into();
        if boundaries.is_empty() {
            return Err(DoraError::config(
                format!("{name}-partitions"),
                "a table needs at least one partition",
            ));
        }
        let mut partitions = Vec::with_capacity(boundaries.len());
        for (index, (down, up)) in boundaries.iter().enumerate() {
            let partition = Partition::new(
                name.clone(),
                index,
                PartitionPolicy::Range,
                runtime.clone(),
                DEFAULT_CACHE_CAPACITY,
            );
            partition.resize(down.clone(), up.clone())?;
            partitions.push(partition);
        }
        tracing::debug!(table = %name, parts = partitions.len(), "range table configured");
        Ok(Arc::new(Self {
            name,
            runtime,
            partitions,
            routing: Routing::Range { boundaries },
            placement: Mutex::new(Placement {
                start_cpu,
                next_cpu: start_cpu,
                cpu_range,
            }),
        }))
    }

    /// Creates a hash-partitioned table with `count` partitions.
    pub fn hash(
        name: impl Into<String>,
        runtime: Arc<Runtime>,
        count: usize,
        start_cpu: usize,
        cpu_range: usize,
    ) -> DoraResult<Arc<Self>> {
        let name = name.into();
        if count == 0 {
            return Err(DoraError::config(
                format!("{name}-partitions"),
                "a table needs at least one partition",
            ));
        }
        let partitions = (0..count)
            .map(|index| {
                Partition::new(
                    name.clone(),
                    index,
                    PartitionPolicy::Hash { modulus: count },
                    runtime.clone(),
                    DEFAULT_CACHE_CAPACITY,
                )
            })
            .collect();
        tracing::debug!(table = %name, parts = count, "hash table configured");
        Ok(Arc::new(Self {
            name,
            runtime,
            partitions,
            routing: Routing::Hash { partitions: count },
            placement: Mutex::new(Placement {
                start_cpu,
                next_cpu: start_cpu,
                cpu_range,
            }),
        }))
    }

    /// The table name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of partitions.
    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    /// A partition by index.
    pub fn partition(&self, index: PartitionId) -> DoraResult<&Arc<Partition<D>>> {
        self.partitions.get(index).ok_or_else(|| {
            DoraError::wrong_partition(format!(
                "{} has no partition {index}",
                self.name
            ))
        })
    }

    // ========================================================================
    // Routing
    // ========================================================================

    /// Routes a single key to its partition index.
    ///
    /// # Errors
    ///
    /// `WrongPartition` when no partition covers the key.
    pub fn partition_for_key(&self, key: &Key<D>) -> DoraResult<PartitionId> {
        match &self.routing {
            Routing::Range { boundaries } => boundaries
                .iter()
                .position(|(down, up)| down.le_prefix(key) && key.lt_prefix(up))
                .ok_or_else(|| {
                    DoraError::wrong_partition(format!(
                        "no partition of {} covers key {key}",
                        self.name
                    ))
                }),
            Routing::Hash { partitions } => Ok(hash_key(key, *partitions)),
        }
    }

    /// Routes a key range to the one partition containing it entirely.
    pub fn partition_for_range(&self, down: &Key<D>, up: &Key<D>) -> DoraResult<PartitionId> {
        match &self.routing {
            Routing::Range { boundaries } => boundaries
                .iter()
                .position(|(part_down, part_up)| {
                    part_down.le_prefix(down) && up.le_prefix(part_up)
                })
                .ok_or_else(|| {
                    DoraError::wrong_partition(format!(
                        "no partition of {} contains [{down}, {up}]",
                        self.name
                    ))
                }),
            Routing::Hash { .. } => Err(DoraError::wrong_partition(
                "hash tables route points, not ranges",
            )),
        }
    }

    /// Enqueues an action at partition `index`. The caller computes the
    /// index through the routing functions; the partition re-verifies.
    pub fn enqueue(
        &self,
        action: ActionPtr<D>,
        wake: bool,
        index: PartitionId,
    ) -> DoraResult<()> {
        self.partition(index)?.enqueue(action, wake)
    }

    // ========================================================================
    // Lifecycle & placement
    // ========================================================================

    /// Starts (or restarts) every partition, walking the CPU stride for
    /// placement hints.
    pub fn reset(&self) -> DoraResult<()> {
        tracing::debug!(table = %self.name, "reset");
        for partition in &self.partitions {
            let cpu = {
                let mut placement = self.placement.lock();
                let cpu = placement.next_cpu;
                let next = self.step_cpu(&placement, cpu);
                placement.next_cpu = next;
                cpu
            };
            partition.reset(Some(cpu), DEFAULT_STANDBY_POOL)?;
        }
        Ok(())
    }

    /// The partition placement function: steps by the configured stride,
    /// wrapping within the table's CPU window (or over all active CPUs when
    /// no window is set).
    pub fn next_cpu(&self, current: usize) -> usize {
        let placement = self.placement.lock();
        self.step_cpu(&placement, current)
    }

    fn step_cpu(&self, placement: &Placement, current: usize) -> usize {
        let config = self.runtime.config();
        let step = config.cpu_binding_step();
        let active = config.active_cpu_count();
        if placement.cpu_range > 1 {
            let offset =
                (current + step).saturating_sub(placement.start_cpu) % placement.cpu_range;
            (placement.start_cpu % active + offset) % active
        } else {
            (current + step) % active
        }
    }

    /// Moves the table to a new CPU window and restarts its partitions.
    pub fn relocate(&self, start_cpu: usize, cpu_range: usize) -> DoraResult<()> {
        {
            let mut placement = self.placement.lock();
            placement.start_cpu = start_cpu;
            placement.next_cpu = start_cpu;
            placement.cpu_range = cpu_range;
        }
        self.reset()
    }

    /// Stops every partition. Returns the number of enqueued actions that
    /// were aborted on the way down.
    pub fn stop(&self) -> usize {
        self.partitions
            .iter()
            .map(|partition| partition.stop())
            .sum()
    }

    /// Prepares all partitions for a new run (lock managers must be clean).
    pub fn prepare_new_run(&self) -> DoraResult<()> {
        for partition in &self.partitions {
            partition.prepare_new_run()?;
        }
        Ok(())
    }

    /// Merged worker counters of all partitions.
    pub fn statistics(&self) -> WorkerStatsSnapshot {
        let mut total = WorkerStatsSnapshot::default();
        for partition in &self.partitions {
            total.merge(&partition.statistics());
        }
        total
    }

    /// Logs every partition at debug level.
    pub fn dump(&self) {
        tracing::debug!(table = %self.name, parts = self.partitions.len(), "table");
        for partition in &self.partitions {
            partition.dump();
        }
    }
}

/// Builds evenly-spaced `[down, up)` boundaries over a closed integer key
/// space, the common setup for integer-keyed range tables.
pub fn split_integer_range(min: i64, max: i64, partitions: usize) -> Vec<(Key<i64>, Key<i64>)> {
    assert!(partitions > 0 && max > min);
    let width = ((max - min) as u64).div_ceil(partitions as u64) as i64;
    (0..partitions)
        .map(|i| {
            let down = min + width * i as i64;
            let up = (down + width).min(max);
            (Key::from_fields(vec![down]), Key::from_fields(vec![up]))
        })
        .collect()
}
