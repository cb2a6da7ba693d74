//! Execution-layer error types.
//!
//! Structured error handling for the DORA execution layer using `thiserror`.
//!
//! # Error Categories
//!
//! - **Generation errors**: worker/standby thread creation failures
//! - **Routing errors**: actions enqueued at the wrong partition or malformed
//! - **Lock errors**: internal lock-table invariant breaches
//! - **Execution errors**: storage-engine failures and deadlocks surfaced
//!   through an action's execution result
//! - **Configuration errors**: unrecognized or malformed options (fatal at
//!   startup)
//!
//! Each variant of the first three categories maps to a stable numeric code
//! via [`DoraError::code`]; the codes are part of the persisted surface and
//! all start with `0x82`.

use thiserror::Error;

use crate::common::TransactionId;

/// Result type alias for execution-layer operations.
pub type DoraResult<T> = std::result::Result<T, DoraError>;

/// Stable error codes of the execution layer.
pub mod codes {
    /// Failed to generate a worker thread.
    pub const GEN_WORKER: u32 = 0x82_0001;
    /// Failed to generate the primary worker of a partition.
    pub const GEN_PRIMARY_WORKER: u32 = 0x82_0002;
    /// Failed to generate the standby worker pool.
    pub const GEN_STANDBY_POOL: u32 = 0x82_0003;
    /// Action is malformed or not initialized for enqueue.
    pub const WRONG_ACTION: u32 = 0x82_0004;
    /// No partition covers the action's keys.
    pub const WRONG_PARTITION: u32 = 0x82_0005;
    /// An operation reached a worker that does not own the action.
    pub const WRONG_WORKER: u32 = 0x82_0006;
    /// Lock-table invariant breach (internal bug).
    pub const INCOMPATIBLE_LOCKS: u32 = 0x82_0007;
}

/// Error type for the execution layer.
#[derive(Debug, Error)]
pub enum DoraError {
    // =========================================================================
    // Worker generation errors
    // =========================================================================
    /// Worker thread creation failed.
    #[error("failed to generate worker '{name}': {reason}")]
    GenWorker { name: String, reason: String },

    /// Primary worker creation failed; the partition cannot accept work.
    #[error("failed to generate primary worker for partition {partition}: {reason}")]
    GenPrimaryWorker { partition: usize, reason: String },

    /// Standby pool creation failed.
    #[error("failed to generate standby pool for partition {partition} ({spawned}/{requested} spawned)")]
    GenStandbyPool {
        partition: usize,
        requested: usize,
        spawned: usize,
    },

    // =========================================================================
    // Routing errors
    // =========================================================================
    /// Action is missing its transaction, RVP or logic, or carries no keys.
    #[error("wrong action: {reason}")]
    WrongAction { reason: String },

    /// The action's keys are not covered by the target partition.
    #[error("wrong partition: {reason}")]
    WrongPartition { reason: String },

    /// The action reached a worker that does not own it.
    #[error("wrong worker: {reason}")]
    WrongWorker { reason: String },

    // =========================================================================
    // Lock errors
    // =========================================================================
    /// Lock-table invariant breach. This indicates an internal bug and is
    /// fatal in debug builds.
    #[error("incompatible locks: transaction {txn_id} {reason}")]
    IncompatibleLocks {
        txn_id: TransactionId,
        reason: String,
    },

    // =========================================================================
    // Execution errors
    // =========================================================================
    /// The storage engine reported a deadlock; the transaction must abort
    /// and the caller is responsible for retry.
    #[error("deadlock reported for transaction {txn_id}")]
    Deadlock { txn_id: TransactionId },

    /// Storage-engine failure during an action or commit.
    #[error("storage failure: {reason}")]
    Storage { reason: String },

    // =========================================================================
    // Configuration errors
    // =========================================================================
    /// Unrecognized or malformed configuration option. Fatal at startup.
    #[error("configuration error: option '{option}': {reason}")]
    Config { option: String, reason: String },
}

impl DoraError {
    /// Creates a worker-generation error.
    pub fn gen_worker(name: impl Into<String>, reason: impl Into<String>) -> Self {
        DoraError::GenWorker {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Creates a wrong-action routing error.
    pub fn wrong_action(reason: impl Into<String>) -> Self {
        DoraError::WrongAction {
            reason: reason.into(),
        }
    }

    /// Creates a wrong-partition routing error.
    pub fn wrong_partition(reason: impl Into<String>) -> Self {
        DoraError::WrongPartition {
            reason: reason.into(),
        }
    }

    /// Creates a wrong-worker error.
    pub fn wrong_worker(reason: impl Into<String>) -> Self {
        DoraError::WrongWorker {
            reason: reason.into(),
        }
    }

    /// Creates an incompatible-locks error.
    pub fn incompatible_locks(txn_id: TransactionId, reason: impl Into<String>) -> Self {
        DoraError::IncompatibleLocks {
            txn_id,
            reason: reason.into(),
        }
    }

    /// Creates a deadlock error.
    pub fn deadlock(txn_id: TransactionId) -> Self {
        DoraError::Deadlock { txn_id }
    }

    /// Creates a storage-failure error.
    pub fn storage(reason: impl Into<String>) -> Self {
        DoraError::Storage {
            reason: reason.into(),
        }
    }

    /// Creates a configuration error.
    pub fn config(option: impl Into<String>, reason: impl Into<String>) -> Self {
        DoraError::Config {
            option: option.into(),
            reason: reason.into(),
        }
    }

    /// Returns the stable numeric code for this error, if it has one.
    ///
    /// Only the generation, routing and lock categories carry codes; the
    /// execution and configuration categories are transient surfaces.
    pub fn code(&self) -> Option<u32> {
        match self {
            DoraError::GenWorker { .. } => Some(codes::GEN_WORKER),
            DoraError::GenPrimaryWorker { .. } => Some(codes::GEN_PRIMARY_WORKER),
            DoraError::GenStandbyPool { .. } => Some(codes::GEN_STANDBY_POOL),
            DoraError::WrongAction { .. } => Some(codes::WRONG_ACTION),
            DoraError::WrongPartition { .. } => Some(codes::WRONG_PARTITION),
            DoraError::WrongWorker { .. } => Some(codes::WRONG_WORKER),
            DoraError::IncompatibleLocks { .. } => Some(codes::INCOMPATIBLE_LOCKS),
            _ => None,
        }
    }

    /// Returns true if this is a deadlock error.
    pub fn is_deadlock(&self) -> bool {
        matches!(self, DoraError::Deadlock { .. })
    }

    /// Returns true if this error is a routing error the caller can act on.
    pub fn is_routing(&self) -> bool {
        matches!(
            self,
            DoraError::WrongAction { .. }
                | DoraError::WrongPartition { .. }
                | DoraError::WrongWorker { .. }
        )
    }

    /// Returns true if this error should be fatal at startup.
    pub fn is_fatal_at_startup(&self) -> bool {
        matches!(
            self,
            DoraError::Config { .. } | DoraError::GenPrimaryWorker { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            DoraError::wrong_partition("k=7 outside [0,4)").code(),
            Some(0x82_0005)
        );
        assert_eq!(
            DoraError::gen_worker("t-P-0-PRI", "spawn failed").code(),
            Some(0x82_0001)
        );
        assert_eq!(
            DoraError::incompatible_locks(9, "release of non-owner").code(),
            Some(0x82_0007)
        );
        assert_eq!(DoraError::deadlock(1).code(), None);
        assert_eq!(DoraError::config("x", "unknown").code(), None);
    }

    #[test]
    fn test_predicates() {
        assert!(DoraError::deadlock(3).is_deadlock());
        assert!(!DoraError::storage("io").is_deadlock());
        assert!(DoraError::wrong_action("no rvp").is_routing());
        assert!(DoraError::config("flusher-max-ms", "not a number").is_fatal_at_startup());
        assert!(!DoraError::wrong_worker("foreign action").is_fatal_at_startup());
    }

    #[test]
    fn test_error_display() {
        let err = DoraError::deadlock(42);
        assert_eq!(err.to_string(), "deadlock reported for transaction 42");
    }
}
