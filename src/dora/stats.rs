// Execution-layer statistics.
//
// Per-worker counters, flusher counters and environment-wide commit/abort
// totals, with serializable snapshots for the `statistics()` surface.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Counters of one partition worker.
#[derive(Debug, Default)]
pub struct WorkerStats {
    /// Input actions dequeued and examined.
    pub checked_input: AtomicU64,
    /// Input actions served directly (all locks granted on first try).
    pub served_input: AtomicU64,
    /// Actions served after waiting (promoted by a lock release).
    pub served_waiting: AtomicU64,
    /// Action executions that failed.
    pub problems: AtomicU64,
    /// Actions fully processed.
    pub processed: AtomicU64,
}

impl WorkerStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the counters.
    pub fn snapshot(&self) -> WorkerStatsSnapshot {
        WorkerStatsSnapshot {
            checked_input: self.checked_input.load(Ordering::Relaxed),
            served_input: self.served_input.load(Ordering::Relaxed),
            served_waiting: self.served_waiting.load(Ordering::Relaxed),
            problems: self.problems.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
        }
    }

    /// Zeroes the counters.
    pub fn reset(&self) {
        self.checked_input.store(0, Ordering::Relaxed);
        self.served_input.store(0, Ordering::Relaxed);
        self.served_waiting.store(0, Ordering::Relaxed);
        self.problems.store(0, Ordering::Relaxed);
        self.processed.store(0, Ordering::Relaxed);
    }
}

/// Point-in-time view of one worker's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStatsSnapshot {
    pub checked_input: u64,
    pub served_input: u64,
    pub served_waiting: u64,
    pub problems: u64,
    pub processed: u64,
}

impl WorkerStatsSnapshot {
    /// Accumulates another snapshot into this one.
    pub fn merge(&mut self, other: &WorkerStatsSnapshot) {
        self.checked_input += other.checked_input;
        self.served_input += other.served_input;
        self.served_waiting += other.served_waiting;
        self.problems += other.problems;
        self.processed += other.processed;
    }
}

/// Counters of the group-commit flusher.
#[derive(Debug, Default)]
pub struct FlusherStats {
    /// `flush_log` calls issued.
    pub flushes: AtomicU64,
    /// Transactions made durable.
    pub flushed_xcts: AtomicU64,
    /// Log bytes covered by issued flushes.
    pub flushed_bytes: AtomicU64,
    /// Times the flusher parked with nothing pending.
    pub waits: AtomicU64,
}

impl FlusherStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> FlusherStatsSnapshot {
        FlusherStatsSnapshot {
            flushes: self.flushes.load(Ordering::Relaxed),
            flushed_xcts: self.flushed_xcts.load(Ordering::Relaxed),
            flushed_bytes: self.flushed_bytes.load(Ordering::Relaxed),
            waits: self.waits.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of the flusher counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlusherStatsSnapshot {
    pub flushes: u64,
    pub flushed_xcts: u64,
    pub flushed_bytes: u64,
    pub waits: u64,
}

/// Environment-wide transaction totals.
#[derive(Debug, Default)]
pub struct EnvStats {
    committed: AtomicU64,
    aborted: AtomicU64,
}

impl EnvStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_committed(&self) {
        self.committed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_aborted(&self) {
        self.aborted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn committed(&self) -> u64 {
        self.committed.load(Ordering::Relaxed)
    }

    pub fn aborted(&self) -> u64 {
        self.aborted.load(Ordering::Relaxed)
    }
}

/// Aggregate statistics surface of the environment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Stats {
    /// Sum of all worker counters.
    pub workers: WorkerStatsSnapshot,
    /// Flusher counters, when group commit is enabled.
    pub flusher: Option<FlusherStatsSnapshot>,
    /// Committed transactions.
    pub committed: u64,
    /// Aborted transactions.
    pub aborted: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_snapshot_and_reset() {
        let stats = WorkerStats::new();
        stats.checked_input.fetch_add(3, Ordering::Relaxed);
        stats.processed.fetch_add(2, Ordering::Relaxed);
        let snap = stats.snapshot();
        assert_eq!(snap.checked_input, 3);
        assert_eq!(snap.processed, 2);
        stats.reset();
        assert_eq!(stats.snapshot(), WorkerStatsSnapshot::default());
    }

    #[test]
    fn test_merge() {
        let mut a = WorkerStatsSnapshot {
            checked_input: 1,
            served_input: 1,
            served_waiting: 0,
            problems: 0,
            processed: 1,
        };
        let b = WorkerStatsSnapshot {
            checked_input: 2,
            served_input: 1,
            served_waiting: 1,
            problems: 1,
            processed: 2,
        };
        a.merge(&b);
        assert_eq!(a.checked_input, 3);
        assert_eq!(a.served_waiting, 1);
        assert_eq!(a.processed, 3);
    }

    #[test]
    fn test_env_stats() {
        let stats = EnvStats::new();
        stats.inc_committed();
        stats.inc_committed();
        stats.inc_aborted();
        assert_eq!(stats.committed(), 2);
        assert_eq!(stats.aborted(), 1);
    }

    #[test]
    fn test_stats_serializes() {
        let stats = Stats::default();
        let json = serde_json::to_string(&stats).unwrap();
        assert!(json.contains("committed"));
    }
}
