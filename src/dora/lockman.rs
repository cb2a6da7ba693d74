// Partition lock manager.
//
// Each partition owns one of these. It keeps two structures under a single
// mutex:
//
// - the lock table: key -> logical lock
// - the inventory: transaction -> keys it holds in this partition, consulted
//   at release time
//
// The table grows monotonically within a run; entries are not evicted until
// `reset` (reclaiming cold entries mid-run would have to skip entries with
// owners or waiters and interlock with acquire, and has not been needed).
//
// Only the partition's own worker touches the manager in steady state, so
// the mutex is effectively uncontended; it exists for the reset/diagnostic
// paths and the owner-swap protocol.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::common::{DataField, TransactionId};
use crate::error::DoraResult;

use super::action::{ActionPtr, LockRequest};
use super::key::Key;
use super::lock::LogicalLock;

struct LockManInner<D: DataField> {
    locks: BTreeMap<Key<D>, LogicalLock<D>>,
    inventory: HashMap<TransactionId, Vec<Key<D>>>,
}

/// Lock manager for the logical locks of one partition.
pub struct PartitionLockManager<D: DataField> {
    inner: Mutex<LockManInner<D>>,
}

impl<D: DataField> PartitionLockManager<D> {
    /// Creates an empty manager.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(LockManInner {
                locks: BTreeMap::new(),
                inventory: HashMap::new(),
            }),
        }
    }

    /// Acquires all locks of `requests` on behalf of `action`.
    ///
    /// Every request is processed: immediate grants decrement the action's
    /// keys-needed counter and are recorded in the transaction's inventory;
    /// blocked requests leave the action attached to the lock's waiter queue.
    /// Returns `true` when the action is ready (all locks granted). With any
    /// request blocked the action counts as parked; it resurfaces through
    /// the promotions of some later `release_all`.
    pub fn acquire_all(&self, action: &ActionPtr<D>, requests: &[LockRequest<D>]) -> bool {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let tid = action.tid();
        for request in requests {
            let lock = inner.locks.entry(request.key.clone()).or_default();
            if lock.acquire(action.clone(), request.mode) {
                action.got_key();
                inner
                    .inventory
                    .entry(tid)
                    .or_default()
                    .push(request.key.clone());
            }
        }
        action.is_ready()
    }

    /// Releases every lock `action`'s transaction holds in this partition.
    ///
    /// Promoted waiters are appended to `promoted`; each promotion decrements
    /// the waiter's keys-needed counter and records the key in the waiter's
    /// inventory. Waiters that became ready are appended to `ready` for the
    /// caller to serve. Returns the number of keys released.
    ///
    /// After this call no entry for the transaction remains in either map.
    pub fn release_all(
        &self,
        action: &ActionPtr<D>,
        ready: &mut Vec<ActionPtr<D>>,
        promoted: &mut Vec<ActionPtr<D>>,
    ) -> DoraResult<usize> {
        debug_assert!(action.is_ready(), "release of a non-ready action");
        let mut inner = self.inner.lock();
        let tid = action.tid();
        let keys = inner.inventory.remove(&tid).unwrap_or_default();
        let released = keys.len();

        // Pairs of (promoted action, key it was promoted on).
        let mut promotions: Vec<(ActionPtr<D>, Key<D>)> = Vec::new();
        for key in keys {
            if let Some(lock) = inner.locks.get_mut(&key) {
                for waiter in lock.release(action)? {
                    promotions.push((waiter, key.clone()));
                }
            } else {
                debug_assert!(false, "inventory key without lock entry");
            }
        }

        for (waiter, key) in promotions {
            inner
                .inventory
                .entry(waiter.tid())
                .or_default()
                .push(key);
            if waiter.got_key() {
                ready.push(waiter.clone());
            }
            promoted.push(waiter);
        }
        Ok(released)
    }

    /// Number of distinct keys ever touched in this run.
    pub fn keys_touched(&self) -> usize {
        self.inner.lock().locks.len()
    }

    /// Number of transactions currently holding locks.
    pub fn trxs_locking(&self) -> usize {
        self.inner.lock().inventory.len()
    }

    /// True when every lock is clean and no transaction holds anything.
    pub fn is_clean(&self) -> bool {
        let inner = self.inner.lock();
        inner.inventory.is_empty() && inner.locks.values().all(|lock| lock.is_clean())
    }

    /// Drops the whole table and inventory.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        for lock in inner.locks.values_mut() {
            lock.reset();
        }
        inner.locks.clear();
        inner.inventory.clear();
    }

    /// Logs the table at debug level.
    pub fn dump(&self) {
        let inner = self.inner.lock();
        tracing::debug!(keys = inner.locks.len(), "lock table");
        for (key, lock) in &inner.locks {
            tracing::debug!(key = %key, lock = ?lock, "entry");
        }
        tracing::debug!(trxs = inner.inventory.len(), "inventory");
        for (tid, keys) in &inner.inventory {
            tracing::debug!(tid, held = keys.len(), "trx");
        }
    }
}

impl<D: DataField> Default for PartitionLockManager<D> {
    fn default() -> Self {
        Self::new()
    }
}

// The manager is shared between the partition and its worker.
impl<D: DataField> PartitionLockManager<D> {
    /// Convenience constructor returning a shared manager.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dora::action::test_support::stub_action_needing;
    use crate::dora::key::ikey;
    use crate::dora::lock::LockMode;

    fn requests(pairs: &[(i64, LockMode)]) -> Vec<LockRequest<i64>> {
        pairs
            .iter()
            .map(|(field, mode)| LockRequest::new(ikey([*field]), *mode))
            .collect()
    }

    #[test]
    fn test_acquire_all_grants_and_inventories() {
        let lm = PartitionLockManager::<i64>::new();
        let a = stub_action_needing(1, 2);
        let reqs = requests(&[(10, LockMode::Shared), (11, LockMode::Exclusive)]);

        assert!(lm.acquire_all(&a, &reqs));
        assert!(a.is_ready());
        assert_eq!(lm.keys_touched(), 2);
        assert_eq!(lm.trxs_locking(), 1);
        assert!(!lm.is_clean());
    }

    #[test]
    fn test_blocked_request_parks_action() {
        let lm = PartitionLockManager::<i64>::new();
        let holder = stub_action_needing(1, 1);
        assert!(lm.acquire_all(&holder, &requests(&[(10, LockMode::Exclusive)])));

        let parked = stub_action_needing(2, 1);
        assert!(!lm.acquire_all(&parked, &requests(&[(10, LockMode::Shared)])));
        assert!(!parked.is_ready());
        // Blocked requests are not inventoried.
        assert_eq!(lm.trxs_locking(), 1);
    }

    #[test]
    fn test_release_all_promotes_and_readies() {
        let lm = PartitionLockManager::<i64>::new();
        let holder = stub_action_needing(1, 1);
        assert!(lm.acquire_all(&holder, &requests(&[(10, LockMode::Exclusive)])));

        let waiter = stub_action_needing(2, 1);
        assert!(!lm.acquire_all(&waiter, &requests(&[(10, LockMode::Exclusive)])));

        let mut ready = Vec::new();
        let mut promoted = Vec::new();
        let released = lm.release_all(&holder, &mut ready, &mut promoted).unwrap();
        assert_eq!(released, 1);
        assert_eq!(promoted.len(), 1);
        assert_eq!(ready.len(), 1);
        assert!(Arc::ptr_eq(&ready[0], &waiter));
        assert!(waiter.is_ready());

        // The promotion moved the key into the waiter's inventory.
        assert_eq!(lm.trxs_locking(), 1);

        let mut ready2 = Vec::new();
        let mut promoted2 = Vec::new();
        lm.release_all(&waiter, &mut ready2, &mut promoted2).unwrap();
        assert!(ready2.is_empty());
        assert!(lm.is_clean());
        assert_eq!(lm.trxs_locking(), 0);
    }

    #[test]
    fn test_promotion_on_partial_keys_stays_parked() {
        let lm = PartitionLockManager::<i64>::new();
        let h1 = stub_action_needing(1, 1);
        let h2 = stub_action_needing(2, 1);
        assert!(lm.acquire_all(&h1, &requests(&[(10, LockMode::Exclusive)])));
        assert!(lm.acquire_all(&h2, &requests(&[(11, LockMode::Exclusive)])));

        // Needs both keys; parks on both.
        let w = stub_action_needing(3, 2);
        assert!(!lm.acquire_all(
            &w,
            &requests(&[(10, LockMode::Exclusive), (11, LockMode::Exclusive)])
        ));

        let mut ready = Vec::new();
        let mut promoted = Vec::new();
        lm.release_all(&h1, &mut ready, &mut promoted).unwrap();
        // Promoted on key 10 but still waiting for 11.
        assert_eq!(promoted.len(), 1);
        assert!(ready.is_empty());
        assert!(!w.is_ready());

        ready.clear();
        promoted.clear();
        lm.release_all(&h2, &mut ready, &mut promoted).unwrap();
        assert_eq!(ready.len(), 1);
        assert!(w.is_ready());
    }

    #[test]
    fn test_reset_clears_everything() {
        let lm = PartitionLockManager::<i64>::new();
        let a = stub_action_needing(1, 1);
        assert!(lm.acquire_all(&a, &requests(&[(10, LockMode::Shared)])));
        lm.reset();
        assert_eq!(lm.keys_touched(), 0);
        assert_eq!(lm.trxs_locking(), 0);
        assert!(lm.is_clean());
    }
}
