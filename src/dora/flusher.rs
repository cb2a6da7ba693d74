// Group-commit pipeline.
//
// Log flushing is a major source of context switches: with one flush and
// one condvar wake-up per committing transaction, worker threads spend
// their time sleeping on the log instead of executing actions. The pipeline
// here decouples that: terminal RVPs commit lazily and hand themselves to
// the flusher; the flusher batches WAL forces behind three thresholds (K
// pending transactions, B pending log bytes, T elapsed time) and passes the
// durable RVPs to the notifier; the notifier signals the clients.
//
// A client therefore sees its commit acknowledgment only after the log is
// durable past its RVP's commit LSN. Acknowledgments may arrive out of
// submission order; never before durability.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use parking_lot::Mutex;

use crate::common::{DataField, Lsn};
use crate::error::{DoraError, DoraResult};
use crate::storage::StorageEngine;

use super::queue::{BlockingQueue, WorkerSignal};
use super::rvp::RendezvousPoint;
use super::stats::{FlusherStats, FlusherStatsSnapshot};
use super::Runtime;

type RvpQueue<D> = BlockingQueue<Arc<RendezvousPoint<D>>>;

/// Producer-side handle to the flusher; held by terminal RVPs.
pub struct FlusherHandle<D: DataField> {
    to_flush: Arc<RvpQueue<D>>,
}

impl<D: DataField> Clone for FlusherHandle<D> {
    fn clone(&self) -> Self {
        Self {
            to_flush: self.to_flush.clone(),
        }
    }
}

impl<D: DataField> FlusherHandle<D> {
    /// Hands a lazily-committed terminal RVP to the flusher.
    pub fn enqueue(&self, rvp: Arc<RendezvousPoint<D>>) {
        self.to_flush.push(rvp, true);
    }
}

/// The two-stage group-commit pipeline: flusher and notifier threads.
pub struct GroupCommit<D: DataField> {
    runtime: Arc<Runtime>,
    to_flush: Arc<RvpQueue<D>>,
    to_notify: Arc<RvpQueue<D>>,
    stats: Arc<FlusherStats>,
    flusher: Mutex<Option<JoinHandle<()>>>,
    notifier: Mutex<Option<JoinHandle<()>>>,
}

impl<D: DataField> GroupCommit<D> {
    /// Starts the flusher and notifier threads.
    pub fn start(runtime: Arc<Runtime>) -> DoraResult<Arc<Self>> {
        let to_flush: Arc<RvpQueue<D>> = Arc::new(BlockingQueue::new());
        let to_notify: Arc<RvpQueue<D>> = Arc::new(BlockingQueue::new());
        let spins = runtime.config().worker_queue_loops();
        to_flush.set_owner(Arc::new(WorkerSignal::new()), spins, usize::MAX >> 1);
        to_notify.set_owner(Arc::new(WorkerSignal::new()), spins, usize::MAX >> 1);

        let pipeline = Arc::new(Self {
            runtime,
            to_flush,
            to_notify,
            stats: Arc::new(FlusherStats::new()),
            flusher: Mutex::new(None),
            notifier: Mutex::new(None),
        });

        let flusher = {
            let pipeline = pipeline.clone();
            thread::Builder::new()
                .name("dora-flusher".into())
                .spawn(move || pipeline.flusher_loop())
                .map_err(|e| DoraError::gen_worker("dora-flusher", e.to_string()))?
        };
        let notifier = {
            let pipeline = pipeline.clone();
            thread::Builder::new()
                .name("dora-notifier".into())
                .spawn(move || pipeline.notifier_loop())
                .map_err(|e| DoraError::gen_worker("dora-notifier", e.to_string()))?
        };
        *pipeline.flusher.lock() = Some(flusher);
        *pipeline.notifier.lock() = Some(notifier);
        Ok(pipeline)
    }

    /// Handle for terminal RVPs.
    pub fn handle(&self) -> FlusherHandle<D> {
        FlusherHandle {
            to_flush: self.to_flush.clone(),
        }
    }

    /// Flusher counters.
    pub fn stats(&self) -> FlusherStatsSnapshot {
        self.stats.snapshot()
    }

    /// Stops both threads, flushing and notifying everything still queued.
    pub fn stop(&self) {
        self.to_flush.close();
        if let Some(handle) = self.flusher.lock().take() {
            if handle.join().is_err() {
                tracing::error!("flusher thread panicked");
            }
        }
        self.to_notify.close();
        if let Some(handle) = self.notifier.lock().take() {
            if handle.join().is_err() {
                tracing::error!("notifier thread panicked");
            }
        }
    }

    fn flusher_loop(&self) {
        use std::sync::atomic::Ordering;

        let config = self.runtime.config();
        let max_xcts = config.flusher_max_xcts();
        let max_bytes = config.flusher_max_bytes();
        let max_age = config.flusher_max_age();

        tracing::debug!(max_xcts, max_bytes, ?max_age, "flusher active");

        let mut flushing: Vec<Arc<RendezvousPoint<D>>> = Vec::new();
        let mut max_lsn: Lsn = 0;
        let mut oldest: Option<Instant> = None;

        loop {
            // 1. Drain arrivals into the private flushing list.
            while let Some(rvp) = self.to_flush.try_pop() {
                if let Some(lsn) = rvp.commit_lsn() {
                    max_lsn = max_lsn.max(lsn);
                }
                oldest.get_or_insert_with(Instant::now);
                flushing.push(rvp);
            }

            if flushing.is_empty() {
                // Nothing pending; park until the next arrival or exit once
                // the queue is closed and drained.
                self.stats.waits.fetch_add(1, Ordering::Relaxed);
                match self.to_flush.pop() {
                    Some(rvp) => {
                        if let Some(lsn) = rvp.commit_lsn() {
                            max_lsn = max_lsn.max(lsn);
                        }
                        oldest = Some(Instant::now());
                        flushing.push(rvp);
                    }
                    None => break,
                }
                continue;
            }

            // 2. Decide whether the group is due.
            let pending_bytes = max_lsn.saturating_sub(self.runtime.storage().durable_lsn());
            let age = oldest.map(|t| t.elapsed()).unwrap_or_default();
            let due = flushing.len() >= max_xcts
                || pending_bytes >= max_bytes
                || age >= max_age
                || self.to_flush.is_closed();

            if due {
                self.flush_group(&mut flushing, max_lsn, pending_bytes);
                oldest = None;
            } else {
                // Wait out the rest of the age budget or the next arrival.
                self.to_flush.wait_for_work(max_age.saturating_sub(age));
            }
        }

        // Shutdown: force whatever is left.
        if !flushing.is_empty() {
            let pending_bytes = max_lsn.saturating_sub(self.runtime.storage().durable_lsn());
            self.flush_group(&mut flushing, max_lsn, pending_bytes);
        }
        tracing::debug!("flusher exiting");
    }

    fn flush_group(
        &self,
        flushing: &mut Vec<Arc<RendezvousPoint<D>>>,
        max_lsn: Lsn,
        pending_bytes: u64,
    ) {
        use std::sync::atomic::Ordering;

        if let Err(error) = self.runtime.storage().flush_log(max_lsn) {
            // The group stays pending; durability must not be faked.
            tracing::error!(%error, up_to = max_lsn, "log flush failed");
            return;
        }
        self.stats.flushes.fetch_add(1, Ordering::Relaxed);
        self.stats
            .flushed_xcts
            .fetch_add(flushing.len() as u64, Ordering::Relaxed);
        self.stats
            .flushed_bytes
            .fetch_add(pending_bytes, Ordering::Relaxed);
        tracing::trace!(
            group = flushing.len(),
            up_to = max_lsn,
            "group flushed"
        );
        for rvp in flushing.drain(..) {
            self.to_notify.push(rvp, true);
        }
    }

    fn notifier_loop(&self) {
        while let Some(rvp) = self.to_notify.pop() {
            debug_assert!(
                rvp.commit_lsn()
                    .map(|lsn| self.runtime.storage().durable_lsn() >= lsn)
                    .unwrap_or(true),
                "notifying a client before durability"
            );
            rvp.notify_client();
        }
        tracing::debug!("notifier exiting");
    }
}
