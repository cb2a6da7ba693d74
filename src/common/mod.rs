// # Common Types
//
// Shared identifiers and small primitives used across the execution layer:
// transaction/partition identifiers, the key field bound, transaction
// outcomes, and the client-side wait handle the notifier signals.

use std::fmt;
use std::hash::Hash;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

// ============================================================================
// Type Aliases - Shared Identifiers
// ============================================================================

/// Unique identifier for transactions.
pub type TransactionId = u64;

/// Log sequence number. LSNs are logical byte offsets into the write-ahead
/// log, so the distance between two LSNs measures unflushed log volume.
pub type Lsn = u64;

/// Index of a partition within its table.
pub type PartitionId = usize;

/// Index of a table within the environment.
pub type TableId = usize;

/// Bound for the field type of composite keys.
///
/// Everything routed through the execution layer is keyed by an ordered
/// sequence of values of one field type. The blanket impl covers any type
/// with the required capabilities; benchmarks and tests typically use `i64`.
pub trait DataField:
    Clone + Ord + Hash + fmt::Debug + Send + Sync + 'static
{
}

impl<T> DataField for T where T: Clone + Ord + Hash + fmt::Debug + Send + Sync + 'static {}

// ============================================================================
// Transaction Outcomes
// ============================================================================

/// Terminal outcome of a submitted transaction.
///
/// Every transaction handed to the execution layer receives exactly one of
/// these through its client handle; silent loss is forbidden.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrxOutcome {
    /// Durably committed. Signalled only once the log is flushed past the
    /// transaction's commit LSN.
    Committed,
    /// Aborted because the transaction's own logic failed.
    AbortedUser,
    /// Aborted because the storage engine reported a deadlock.
    AbortedDeadlock,
    /// Aborted by the system (shutdown, commit failure).
    AbortedSystem,
}

impl TrxOutcome {
    /// Returns true for any of the abort outcomes.
    #[inline]
    pub fn is_aborted(&self) -> bool {
        !matches!(self, TrxOutcome::Committed)
    }
}

impl fmt::Display for TrxOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrxOutcome::Committed => write!(f, "COMMITTED"),
            TrxOutcome::AbortedUser => write!(f, "ABORTED_USER"),
            TrxOutcome::AbortedDeadlock => write!(f, "ABORTED_DEADLOCK"),
            TrxOutcome::AbortedSystem => write!(f, "ABORTED_SYSTEM"),
        }
    }
}

// ============================================================================
// Client Wait Handle
// ============================================================================

/// Signalable handle a caller may attach to a transaction's terminal
/// rendez-vous point.
///
/// The submitting thread parks in [`wait`](ClientHandle::wait); the notifier
/// (or the terminal RVP itself on the abort/inline paths) signals the
/// outcome. The handle is signalled at most once.
pub struct ClientHandle {
    slot: Mutex<Option<TrxOutcome>>,
    cond: Condvar,
}

impl ClientHandle {
    /// Creates an unsignalled handle.
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            cond: Condvar::new(),
        }
    }

    /// Signals the outcome and wakes all waiters.
    ///
    /// A second signal is ignored; the first outcome wins.
    pub fn signal(&self, outcome: TrxOutcome) {
        let mut slot = self.slot.lock();
        if slot.is_none() {
            *slot = Some(outcome);
            self.cond.notify_all();
        }
    }

    /// Blocks until the outcome is signalled.
    pub fn wait(&self) -> TrxOutcome {
        let mut slot = self.slot.lock();
        while slot.is_none() {
            self.cond.wait(&mut slot);
        }
        slot.unwrap()
    }

    /// Blocks up to `timeout`; returns `None` if nothing was signalled.
    pub fn wait_for(&self, timeout: Duration) -> Option<TrxOutcome> {
        let mut slot = self.slot.lock();
        if slot.is_none() {
            self.cond.wait_for(&mut slot, timeout);
        }
        *slot
    }

    /// Non-blocking peek at the outcome.
    pub fn outcome(&self) -> Option<TrxOutcome> {
        *self.slot.lock()
    }
}

impl Default for ClientHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientHandle")
            .field("outcome", &self.outcome())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_outcome_predicates() {
        assert!(!TrxOutcome::Committed.is_aborted());
        assert!(TrxOutcome::AbortedUser.is_aborted());
        assert!(TrxOutcome::AbortedDeadlock.is_aborted());
        assert_eq!(TrxOutcome::AbortedSystem.to_string(), "ABORTED_SYSTEM");
    }

    #[test]
    fn test_client_handle_signal_wait() {
        let handle = Arc::new(ClientHandle::new());
        let waiter = {
            let handle = handle.clone();
            thread::spawn(move || handle.wait())
        };
        handle.signal(TrxOutcome::Committed);
        assert_eq!(waiter.join().unwrap(), TrxOutcome::Committed);
    }

    #[test]
    fn test_client_handle_first_signal_wins() {
        let handle = ClientHandle::new();
        handle.signal(TrxOutcome::AbortedDeadlock);
        handle.signal(TrxOutcome::Committed);
        assert_eq!(handle.outcome(), Some(TrxOutcome::AbortedDeadlock));
    }

    #[test]
    fn test_client_handle_wait_for_timeout() {
        let handle = ClientHandle::new();
        assert_eq!(handle.wait_for(Duration::from_millis(10)), None);
        handle.signal(TrxOutcome::AbortedUser);
        assert_eq!(
            handle.wait_for(Duration::from_millis(10)),
            Some(TrxOutcome::AbortedUser)
        );
    }
}
