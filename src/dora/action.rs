// Actions.
//
// An action is the smallest unit of scheduled work: one fragment of a
// transaction, scoped to exactly one partition, executing entirely within
// that partition's worker thread. The envelope here carries everything the
// runtime needs (transaction handle, RVP back-pointer, lock requests, the
// keys-needed countdown); the data-plane work itself comes from the caller
// through the `ActionLogic` extension trait.
//
// Lifecycle:
//
// ```text
// CREATED -> QUEUED -> ACQUIRING -> {READY | PARKED} -> EXECUTED
//         -> COMMITTED_PENDING -> RELEASED -> CACHED
// ```
//
// An action never migrates threads between lock acquisition and execution.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::common::{DataField, TransactionId};
use crate::error::{DoraError, DoraResult};
use crate::storage::{StorageEngine, XctHandle};

use super::key::Key;
use super::lock::LockMode;
use super::partition::Partition;
use super::rvp::RendezvousPoint;

/// Shared pointer to an action.
///
/// Actions are shared between queues, lock waiter lists and the RVP's
/// completed list; identity is pointer identity.
pub type ActionPtr<D> = Arc<Action<D>>;

/// One lock request of an action: a key and the desired mode.
#[derive(Debug, Clone)]
pub struct LockRequest<D: DataField> {
    pub key: Key<D>,
    pub mode: LockMode,
}

impl<D: DataField> LockRequest<D> {
    pub fn new(key: Key<D>, mode: LockMode) -> Self {
        Self { key, mode }
    }

    /// Shared-mode request.
    pub fn shared(key: Key<D>) -> Self {
        Self::new(key, LockMode::Shared)
    }

    /// Exclusive-mode request.
    pub fn exclusive(key: Key<D>) -> Self {
        Self::new(key, LockMode::Exclusive)
    }
}

/// Routing information the enqueue path verifies against partition bounds.
#[derive(Debug, Clone, Default)]
pub enum RoutingHint<D: DataField> {
    /// No hint; enqueue verification is skipped for this action.
    #[default]
    None,
    /// The action touches a single key.
    Point(Key<D>),
    /// The action touches keys in `[down, up]`.
    Range(Key<D>, Key<D>),
}

/// Execution context handed to an action's logic.
pub struct ExecContext<'a> {
    storage: &'a dyn StorageEngine,
    xct: &'a XctHandle,
}

impl<'a> ExecContext<'a> {
    pub(crate) fn new(storage: &'a dyn StorageEngine, xct: &'a XctHandle) -> Self {
        Self { storage, xct }
    }

    /// The storage engine.
    pub fn storage(&self) -> &dyn StorageEngine {
        self.storage
    }

    /// The storage transaction this action runs under.
    pub fn xct(&self) -> &XctHandle {
        self.xct
    }

    /// The transaction id.
    pub fn tid(&self) -> TransactionId {
        self.xct.tid()
    }
}

/// Caller-provided body of an action.
///
/// The runtime drives the envelope; implementors supply what the action
/// locks and what it does. `execute` runs on the owning partition's worker
/// with the storage transaction attached; it may block on storage I/O but
/// must not wait on locks of foreign partitions.
pub trait ActionLogic<D: DataField>: Send {
    /// Resolves the action's lock targets. Called by the owning worker right
    /// before lock acquisition, so targets unknown at enqueue time can be
    /// computed here. Invoked at most once per flight.
    fn update_keys(&mut self) -> DoraResult<Vec<LockRequest<D>>>;

    /// Performs the data-plane work. Errors flip the transaction's decision:
    /// a deadlock error to DEADLOCK, anything else to ABORT.
    fn execute(&mut self, ctx: &mut ExecContext<'_>) -> DoraResult<()>;
}

/// Mutable core of an action, populated at init and cleared on reset.
struct ActionCore<D: DataField> {
    xct: Option<XctHandle>,
    rvp: Option<Arc<RendezvousPoint<D>>>,
    logic: Option<Box<dyn ActionLogic<D>>>,
    requests: Vec<LockRequest<D>>,
    routing: RoutingHint<D>,
    partition: Weak<Partition<D>>,
    read_only: bool,
}

impl<D: DataField> ActionCore<D> {
    fn empty() -> Self {
        Self {
            xct: None,
            rvp: None,
            logic: None,
            requests: Vec::new(),
            routing: RoutingHint::None,
            partition: Weak::new(),
            read_only: false,
        }
    }
}

/// Action envelope.
///
/// Constructed through the per-partition action cache (or
/// [`Action::new_ptr`] for one-off use), initialized with
/// [`init`](Action::init), then immutable
/// from enqueue until release; the runtime only touches the atomic
/// countdown and the core under short critical sections.
pub struct Action<D: DataField> {
    /// Back-reference to the shared pointer; lets the envelope enqueue
    /// itself without threading `Arc`s through every call.
    me: Weak<Action<D>>,
    tid: AtomicU64,
    keys_needed: AtomicUsize,
    keys_set: AtomicBool,
    core: Mutex<ActionCore<D>>,
}

impl<D: DataField> Action<D> {
    /// Creates an uninitialized envelope (cache shell).
    pub fn new_ptr() -> ActionPtr<D> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            tid: AtomicU64::new(0),
            keys_needed: AtomicUsize::new(0),
            keys_set: AtomicBool::new(false),
            core: Mutex::new(ActionCore::empty()),
        })
    }

    /// Initializes the envelope for one flight.
    ///
    /// Requires exclusive ownership (a freshly borrowed or created action).
    pub fn init(
        &self,
        xct: XctHandle,
        rvp: Arc<RendezvousPoint<D>>,
        routing: RoutingHint<D>,
        read_only: bool,
        logic: Box<dyn ActionLogic<D>>,
    ) {
        self.tid.store(xct.tid(), Ordering::Relaxed);
        self.keys_needed.store(0, Ordering::Relaxed);
        self.keys_set.store(false, Ordering::Relaxed);
        let mut core = self.core.lock();
        core.xct = Some(xct);
        core.rvp = Some(rvp);
        core.logic = Some(logic);
        core.routing = routing;
        core.read_only = read_only;
        core.requests.clear();
        core.partition = Weak::new();
    }

    /// The transaction id.
    pub fn tid(&self) -> TransactionId {
        self.tid.load(Ordering::Relaxed)
    }

    /// The storage transaction handle.
    pub fn xct(&self) -> DoraResult<XctHandle> {
        self.core
            .lock()
            .xct
            .clone()
            .ok_or_else(|| DoraError::wrong_action("action has no storage transaction"))
    }

    /// The rendez-vous point this action posts to.
    pub fn rvp(&self) -> DoraResult<Arc<RendezvousPoint<D>>> {
        self.core
            .lock()
            .rvp
            .clone()
            .ok_or_else(|| DoraError::wrong_action("action has no rendez-vous point"))
    }

    /// Whether the action only reads.
    pub fn is_read_only(&self) -> bool {
        self.core.lock().read_only
    }

    /// The routing hint used by enqueue verification.
    pub fn routing(&self) -> RoutingHint<D> {
        self.core.lock().routing.clone()
    }

    /// True when all requested locks have been granted.
    #[inline]
    pub fn is_ready(&self) -> bool {
        self.keys_needed.load(Ordering::Acquire) == 0
    }

    /// Outstanding lock count.
    pub fn keys_needed(&self) -> usize {
        self.keys_needed.load(Ordering::Acquire)
    }

    /// Records one granted lock; returns true when the action became ready.
    ///
    /// Called by the partition lock manager, both for immediate grants and
    /// for waiter promotion.
    pub(crate) fn got_key(&self) -> bool {
        let before = self.keys_needed.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(before > 0, "got_key under-run");
        before == 1
    }

    /// Binds the action to its target partition. Done by the enqueue path.
    pub(crate) fn set_partition(&self, partition: &Arc<Partition<D>>) {
        self.core.lock().partition = Arc::downgrade(partition);
    }

    /// The owning partition, while it is alive.
    pub(crate) fn partition(&self) -> Option<Arc<Partition<D>>> {
        self.core.lock().partition.upgrade()
    }

    /// Resolves lock targets and stores them. First call runs the logic's
    /// `update_keys`; later calls are no-ops (the keys-set latch).
    ///
    /// Returns the number of lock requests.
    pub(crate) fn update_keys(&self) -> DoraResult<usize> {
        if self.keys_set.swap(true, Ordering::AcqRel) {
            return Ok(self.core.lock().requests.len());
        }
        let mut logic = self
            .core
            .lock()
            .logic
            .take()
            .ok_or_else(|| DoraError::wrong_action("action has no logic"))?;
        let result = logic.update_keys();
        let mut core = self.core.lock();
        core.logic = Some(logic);
        let requests = result?;
        if requests.is_empty() {
            return Err(DoraError::wrong_action("action requests no locks"));
        }
        self.keys_needed.store(requests.len(), Ordering::Release);
        core.requests = requests;
        Ok(core.requests.len())
    }

    /// The stored lock requests (valid after `update_keys`).
    pub(crate) fn requests(&self) -> Vec<LockRequest<D>> {
        self.core.lock().requests.clone()
    }

    /// Runs the action body with the storage transaction attached by the
    /// caller. Takes the logic out for the duration so the core lock is not
    /// held across storage I/O.
    pub(crate) fn execute(&self, storage: &dyn StorageEngine) -> DoraResult<()> {
        let (mut logic, xct) = {
            let mut core = self.core.lock();
            let logic = core
                .logic
                .take()
                .ok_or_else(|| DoraError::wrong_action("action has no logic"))?;
            let xct = core
                .xct
                .clone()
                .ok_or_else(|| DoraError::wrong_action("action has no storage transaction"))?;
            (logic, xct)
        };
        let mut ctx = ExecContext::new(storage, &xct);
        let result = logic.execute(&mut ctx);
        self.core.lock().logic = Some(logic);
        result
    }

    /// Resolves the lock targets (via the keys hook) and requests them all
    /// from the owning partition's lock manager. Returns `true` when every
    /// lock was granted; on `false` the action is parked in waiter queues
    /// and resurfaces through a later release's promotions.
    pub(crate) fn acquire_locks(&self) -> DoraResult<bool> {
        self.update_keys()?;
        let me = self
            .me
            .upgrade()
            .ok_or_else(|| DoraError::wrong_worker("action envelope already dropped"))?;
        let partition = self
            .partition()
            .ok_or_else(|| DoraError::wrong_worker("action outlived its partition"))?;
        let requests = self.requests();
        Ok(partition.lock_manager().acquire_all(&me, &requests))
    }

    /// Releases every logical lock this action's transaction holds in its
    /// partition. Called by the worker after the commit queue surfaces the
    /// action; promoted waiters land in `promoted`, the now-runnable ones
    /// in `ready`.
    pub(crate) fn release_locks(
        &self,
        ready: &mut Vec<ActionPtr<D>>,
        promoted: &mut Vec<ActionPtr<D>>,
    ) -> DoraResult<usize> {
        let me = self
            .me
            .upgrade()
            .ok_or_else(|| DoraError::wrong_worker("action envelope already dropped"))?;
        let partition = self
            .partition()
            .ok_or_else(|| DoraError::wrong_worker("action outlived its partition"))?;
        partition.lock_manager().release_all(&me, ready, promoted)
    }

    /// Appends self to the owning partition's commit queue. Called through
    /// the RVP's completed list once the transaction decision is made.
    pub(crate) fn notify(&self) -> DoraResult<()> {
        let me = self
            .me
            .upgrade()
            .ok_or_else(|| DoraError::wrong_worker("action envelope already dropped"))?;
        let partition = self
            .partition()
            .ok_or_else(|| DoraError::wrong_worker("action outlived its partition"))?;
        partition.enqueue_commit(me, true)
    }

    /// Clears the envelope for reuse. Allocation of the request vector is
    /// kept.
    pub(crate) fn reset(&self) {
        self.tid.store(0, Ordering::Relaxed);
        self.keys_needed.store(0, Ordering::Relaxed);
        self.keys_set.store(false, Ordering::Relaxed);
        let mut core = self.core.lock();
        core.xct = None;
        core.rvp = None;
        core.logic = None;
        core.requests.clear();
        core.routing = RoutingHint::None;
        core.partition = Weak::new();
        core.read_only = false;
    }

    /// True if the envelope is cleared (cache-resident state).
    pub(crate) fn is_reset(&self) -> bool {
        let core = self.core.lock();
        core.xct.is_none()
            && core.rvp.is_none()
            && core.logic.is_none()
            && core.requests.is_empty()
            && matches!(core.routing, RoutingHint::None)
            && self.keys_needed.load(Ordering::Relaxed) == 0
            && !self.keys_set.load(Ordering::Relaxed)
    }
}

impl<D: DataField> fmt::Debug for Action<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Action")
            .field("tid", &self.tid())
            .field("keys_needed", &self.keys_needed())
            .finish()
    }
}

/// Ready-made `ActionLogic` built from closures; the common way callers and
/// tests assemble actions without a bespoke type per transaction fragment.
pub struct ClosureLogic<D: DataField> {
    keys: Option<Vec<LockRequest<D>>>,
    body: Box<dyn FnMut(&mut ExecContext<'_>) -> DoraResult<()> + Send>,
}

impl<D: DataField> ClosureLogic<D> {
    /// Logic with a fixed lock-request set and an execute closure.
    pub fn new(
        requests: Vec<LockRequest<D>>,
        body: impl FnMut(&mut ExecContext<'_>) -> DoraResult<()> + Send + 'static,
    ) -> Box<Self> {
        Box::new(Self {
            keys: Some(requests),
            body: Box::new(body),
        })
    }
}

impl<D: DataField> ActionLogic<D> for ClosureLogic<D> {
    fn update_keys(&mut self) -> DoraResult<Vec<LockRequest<D>>> {
        self.keys
            .take()
            .ok_or_else(|| DoraError::wrong_action("lock requests already taken"))
    }

    fn execute(&mut self, ctx: &mut ExecContext<'_>) -> DoraResult<()> {
        (self.body)(ctx)
    }
}

#[cfg(test)]
impl<D: DataField> Action<D> {
    /// Installs a routing hint on a bare action, for verification tests.
    pub(crate) fn set_routing_for_test(&self, routing: RoutingHint<D>) {
        self.core.lock().routing = routing;
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::atomic::Ordering;

    /// Bare action with a transaction id, for lock-table unit tests.
    pub(crate) fn stub_action(tid: TransactionId) -> ActionPtr<i64> {
        let action = Action::<i64>::new_ptr();
        action.tid.store(tid, Ordering::Relaxed);
        action
    }

    /// Bare action with `n` keys outstanding.
    pub(crate) fn stub_action_needing(tid: TransactionId, n: usize) -> ActionPtr<i64> {
        let action = stub_action(tid);
        action.keys_needed.store(n, Ordering::Relaxed);
        action
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn test_got_key_countdown() {
        let action = stub_action_needing(1, 2);
        assert!(!action.is_ready());
        assert!(!action.got_key());
        assert!(action.got_key());
        assert!(action.is_ready());
    }

    #[test]
    fn test_reset_roundtrip() {
        let action = stub_action(7);
        action.reset();
        assert!(action.is_reset());
        assert_eq!(action.tid(), 0);
    }

    #[test]
    fn test_closure_logic_yields_requests_once() {
        let mut logic = *ClosureLogic::<i64>::new(
            vec![LockRequest::shared(crate::dora::key::ikey([1]))],
            |_| Ok(()),
        );
        let requests = logic.update_keys().unwrap();
        assert_eq!(requests.len(), 1);
        assert!(logic.update_keys().is_err());
    }

    #[test]
    fn test_uninitialized_action_is_wrong_action() {
        let action = stub_action(1);
        assert!(action.xct().is_err());
        assert!(action.rvp().is_err());
        let err = action.update_keys().unwrap_err();
        assert!(err.is_routing());
    }
}
