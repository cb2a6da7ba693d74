// In-memory storage engine.
//
// A minimal `StorageEngine` used by the test suite and by embedders that
// want the execution layer without a durable store underneath. Transactions
// are states in a map; the "log" is a pair of byte counters (tail and
// durable watermark), which is enough to exercise the group-commit pipeline
// faithfully: commit LSNs are real offsets and flushes move the watermark.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::common::{Lsn, TransactionId};
use crate::error::{DoraError, DoraResult};

use super::{StorageEngine, XctHandle};

/// Logical size of a commit record in the in-memory log.
const COMMIT_RECORD_BYTES: u64 = 96;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum XctStatus {
    Active,
    Committed,
    Aborted,
}

#[derive(Debug)]
struct XctState {
    status: XctStatus,
    /// Worker threads currently attached. Sibling actions of one
    /// transaction may execute in parallel on different partitions.
    attached: usize,
}

/// In-memory storage engine.
pub struct MemStorage {
    next_tid: AtomicU64,
    xcts: Mutex<HashMap<TransactionId, XctState>>,
    log_tail: AtomicU64,
    durable: AtomicU64,
    flush_calls: AtomicU64,
    aborted: AtomicU64,
}

impl MemStorage {
    /// Creates an empty engine.
    pub fn new() -> Self {
        Self {
            next_tid: AtomicU64::new(1),
            xcts: Mutex::new(HashMap::new()),
            log_tail: AtomicU64::new(0),
            durable: AtomicU64::new(0),
            flush_calls: AtomicU64::new(0),
            aborted: AtomicU64::new(0),
        }
    }

    /// Number of `flush_log` calls issued so far.
    pub fn flush_calls(&self) -> u64 {
        self.flush_calls.load(Ordering::Relaxed)
    }

    /// Number of transactions that transitioned to aborted.
    pub fn aborted_count(&self) -> u64 {
        self.aborted.load(Ordering::Relaxed)
    }

    /// Number of transactions still active.
    pub fn active_count(&self) -> usize {
        self.xcts
            .lock()
            .values()
            .filter(|x| x.status == XctStatus::Active)
            .count()
    }
}

impl Default for MemStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageEngine for MemStorage {
    fn begin_xct(&self) -> DoraResult<XctHandle> {
        let tid = self.next_tid.fetch_add(1, Ordering::Relaxed);
        self.xcts.lock().insert(
            tid,
            XctState {
                status: XctStatus::Active,
                attached: 0,
            },
        );
        Ok(XctHandle::new(tid))
    }

    fn commit_xct(&self, xct: &XctHandle, lazy: bool) -> DoraResult<Lsn> {
        {
            let mut xcts = self.xcts.lock();
            let state = xcts
                .get_mut(&xct.tid())
                .ok_or_else(|| DoraError::storage(format!("unknown transaction {}", xct.tid())))?;
            if state.status != XctStatus::Active {
                return Err(DoraError::storage(format!(
                    "commit of non-active transaction {} ({:?})",
                    xct.tid(),
                    state.status
                )));
            }
            state.status = XctStatus::Committed;
            state.attached = 0;
        }
        let lsn = self
            .log_tail
            .fetch_add(COMMIT_RECORD_BYTES, Ordering::Relaxed)
            + COMMIT_RECORD_BYTES;
        if !lazy {
            self.flush_log(lsn)?;
        }
        Ok(lsn)
    }

    fn abort_xct(&self, xct: &XctHandle) -> DoraResult<()> {
        let mut xcts = self.xcts.lock();
        if let Some(state) = xcts.get_mut(&xct.tid()) {
            if state.status == XctStatus::Active {
                state.status = XctStatus::Aborted;
                state.attached = 0;
                self.aborted.fetch_add(1, Ordering::Relaxed);
            }
            // Terminal transactions stay as they are; abort is idempotent.
        }
        Ok(())
    }

    fn attach(&self, xct: &XctHandle) {
        let mut xcts = self.xcts.lock();
        if let Some(state) = xcts.get_mut(&xct.tid()) {
            state.attached += 1;
        }
    }

    fn detach(&self, xct: &XctHandle) {
        let mut xcts = self.xcts.lock();
        if let Some(state) = xcts.get_mut(&xct.tid()) {
            state.attached = state.attached.saturating_sub(1);
        }
    }

    fn flush_log(&self, up_to: Lsn) -> DoraResult<()> {
        self.flush_calls.fetch_add(1, Ordering::Relaxed);
        let target = up_to.min(self.log_tail.load(Ordering::Relaxed));
        self.durable.fetch_max(target, Ordering::Relaxed);
        Ok(())
    }

    fn durable_lsn(&self) -> Lsn {
        self.durable.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_begin_commit_eager() {
        let engine = MemStorage::new();
        let xct = engine.begin_xct().unwrap();
        let lsn = engine.commit_xct(&xct, false).unwrap();
        assert!(lsn > 0);
        // Eager commit is durable immediately.
        assert!(engine.durable_lsn() >= lsn);
        assert_eq!(engine.flush_calls(), 1);
    }

    #[test]
    fn test_lazy_commit_needs_flush() {
        let engine = MemStorage::new();
        let xct = engine.begin_xct().unwrap();
        let lsn = engine.commit_xct(&xct, true).unwrap();
        assert!(engine.durable_lsn() < lsn);
        engine.flush_log(lsn).unwrap();
        assert!(engine.durable_lsn() >= lsn);
    }

    #[test]
    fn test_abort_is_idempotent() {
        let engine = MemStorage::new();
        let xct = engine.begin_xct().unwrap();
        engine.abort_xct(&xct).unwrap();
        engine.abort_xct(&xct).unwrap();
        assert_eq!(engine.aborted_count(), 1);
    }

    #[test]
    fn test_commit_after_abort_fails() {
        let engine = MemStorage::new();
        let xct = engine.begin_xct().unwrap();
        engine.abort_xct(&xct).unwrap();
        assert!(engine.commit_xct(&xct, true).is_err());
    }

    #[test]
    fn test_flush_does_not_pass_tail() {
        let engine = MemStorage::new();
        let xct = engine.begin_xct().unwrap();
        let lsn = engine.commit_xct(&xct, true).unwrap();
        engine.flush_log(lsn + 10_000).unwrap();
        assert_eq!(engine.durable_lsn(), lsn);
    }
}
