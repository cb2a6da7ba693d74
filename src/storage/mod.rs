// Storage-engine collaborator interface.
//
// The execution layer sits above a storage manager that owns pages, the
// write-ahead log and physical locking. Everything the layer needs from it
// goes through the `StorageEngine` trait: transaction begin/commit/abort,
// thread attachment, and log flushing for group commit.
//
// The crate ships `MemStorage`, an in-memory engine used by the test suite.

mod memory;

pub use memory::MemStorage;

use std::fmt;

use crate::common::{Lsn, TransactionId};
use crate::error::DoraResult;

/// Opaque handle to a storage transaction.
///
/// Handles are cheap to clone and refer to engine-owned state; the execution
/// layer never inspects more than the transaction id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct XctHandle {
    tid: TransactionId,
}

impl XctHandle {
    /// Creates a handle for a transaction id. Called by engines only.
    pub fn new(tid: TransactionId) -> Self {
        Self { tid }
    }

    /// The transaction id this handle refers to.
    #[inline]
    pub fn tid(&self) -> TransactionId {
        self.tid
    }
}

impl fmt::Display for XctHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "xct({})", self.tid)
    }
}

/// Interface the execution layer consumes from the storage manager.
///
/// Physical locks on tuples remain the engine's business; the execution
/// layer's logical locks sit above them and absorb most of the contention.
///
/// # Contract
///
/// - `commit_xct(lazy = true)` appends the commit record and returns its LSN
///   without forcing the log; durability arrives with a later `flush_log`.
/// - `abort_xct` is idempotent: aborting an already-terminal transaction is
///   a no-op, which the shutdown path relies on.
/// - `attach`/`detach` bind a transaction to the calling worker thread for
///   the duration of an action's execution.
pub trait StorageEngine: Send + Sync {
    /// Begins a new transaction.
    fn begin_xct(&self) -> DoraResult<XctHandle>;

    /// Commits a transaction. With `lazy` the commit record is appended but
    /// not forced; the returned LSN is what a later flush must cover.
    fn commit_xct(&self, xct: &XctHandle, lazy: bool) -> DoraResult<Lsn>;

    /// Aborts a transaction, rolling back its effects. Idempotent.
    fn abort_xct(&self, xct: &XctHandle) -> DoraResult<()>;

    /// Attaches the transaction to the calling thread.
    fn attach(&self, xct: &XctHandle);

    /// Detaches the transaction from the calling thread.
    fn detach(&self, xct: &XctHandle);

    /// Forces the log to disk up to (at least) the given LSN.
    fn flush_log(&self, up_to: Lsn) -> DoraResult<()>;

    /// Highest LSN known durable.
    fn durable_lsn(&self) -> Lsn;
}
