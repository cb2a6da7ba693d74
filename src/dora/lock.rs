// Logical locks.
//
// A logical lock guards one key of one partition. It carries the current
// effective mode, the list of owning actions and a FIFO queue of waiters.
// Logical locks are distinct from the storage engine's physical locks; they
// serialize actions inside a partition and absorb the contention the
// physical lock manager would otherwise see.
//
// All operations run under the owning partition's lock-map critical section;
// the struct itself needs no internal synchronization.

use std::collections::VecDeque;
use std::fmt;

use std::sync::Arc;

use crate::common::DataField;
use crate::error::{DoraError, DoraResult};

use super::action::ActionPtr;

/// Mode of a logical lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LockMode {
    /// Unlocked.
    #[default]
    None,
    /// Shared (read) lock.
    Shared,
    /// Exclusive (write) lock.
    Exclusive,
}

impl LockMode {
    /// Lock compatibility.
    ///
    /// | | None | Shared | Exclusive |
    /// |---|---|---|---|
    /// | **None** | ✓ | ✓ | ✓ |
    /// | **Shared** | ✓ | ✓ | ✗ |
    /// | **Exclusive** | ✓ | ✗ | ✗ |
    #[inline]
    pub fn is_compatible(&self, other: &LockMode) -> bool {
        !matches!(
            (self, other),
            (LockMode::Exclusive, LockMode::Shared)
                | (LockMode::Exclusive, LockMode::Exclusive)
                | (LockMode::Shared, LockMode::Exclusive)
        )
    }

    /// Joint mode of two held modes.
    #[inline]
    pub fn join(&self, other: &LockMode) -> LockMode {
        match (self, other) {
            (LockMode::Exclusive, _) | (_, LockMode::Exclusive) => LockMode::Exclusive,
            (LockMode::Shared, _) | (_, LockMode::Shared) => LockMode::Shared,
            _ => LockMode::None,
        }
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockMode::None => write!(f, "N"),
            LockMode::Shared => write!(f, "S"),
            LockMode::Exclusive => write!(f, "X"),
        }
    }
}

/// One holder or waiter of a logical lock.
struct LockEntry<D: DataField> {
    action: ActionPtr<D>,
    mode: LockMode,
}

impl<D: DataField> LockEntry<D> {
    fn new(action: ActionPtr<D>, mode: LockMode) -> Self {
        Self { action, mode }
    }
}

/// Per-key logical lock: effective mode, owner list and FIFO waiter queue.
///
/// # Invariants
///
/// - mode is `None` iff the owner list is empty (I1)
/// - every waiter's mode is incompatible with the owners' joint mode at the
///   time it was enqueued (I2)
/// - the FIFO order of waiters is preserved under release; an earlier waiter
///   is never bypassed to promote a later one (I3)
pub struct LogicalLock<D: DataField> {
    mode: LockMode,
    owners: Vec<LockEntry<D>>,
    waiters: VecDeque<LockEntry<D>>,
}

impl<D: DataField> LogicalLock<D> {
    /// Creates a clean lock.
    pub fn new() -> Self {
        Self {
            mode: LockMode::None,
            owners: Vec::new(),
            waiters: VecDeque::new(),
        }
    }

    /// The current effective mode.
    pub fn mode(&self) -> LockMode {
        self.mode
    }

    /// True if the lock has owners.
    pub fn has_owners(&self) -> bool {
        !self.owners.is_empty()
    }

    /// True if the lock has waiters.
    pub fn has_waiters(&self) -> bool {
        !self.waiters.is_empty()
    }

    /// Number of waiting requests.
    pub fn waiter_count(&self) -> usize {
        self.waiters.len()
    }

    /// True if the lock is clean: unlocked, no owners, no waiters.
    pub fn is_clean(&self) -> bool {
        self.mode == LockMode::None && self.owners.is_empty() && self.waiters.is_empty()
    }

    /// Tries to acquire the lock in `mode` on behalf of `action`.
    ///
    /// Returns `true` when granted. On `false` the request has been appended
    /// to the FIFO waiter queue and the action stays parked until a release
    /// promotes it.
    ///
    /// A request behind existing waiters is never granted even if its mode
    /// is compatible with the owners; bypassing the queue would starve
    /// writers.
    pub fn acquire(&mut self, action: ActionPtr<D>, mode: LockMode) -> bool {
        if self.owners.is_empty() {
            debug_assert!(self.waiters.is_empty(), "ownerless lock with waiters");
            self.mode = mode;
            self.owners.push(LockEntry::new(action, mode));
            return true;
        }
        if self.waiters.is_empty() && mode.is_compatible(&self.mode) {
            self.mode = self.mode.join(&mode);
            self.owners.push(LockEntry::new(action, mode));
            return true;
        }
        self.waiters.push_back(LockEntry::new(action, mode));
        false
    }

    /// Releases the lock held by `action`.
    ///
    /// Returns the actions promoted from the waiter queue by this release.
    /// Promotion happens only when the owner list empties: the head waiter
    /// becomes an owner unconditionally, and subsequent waiters follow while
    /// their mode stays compatible with everything promoted in this drain.
    /// A partial release (other owners remain) recomputes the joint mode and
    /// promotes nothing.
    ///
    /// # Errors
    ///
    /// `IncompatibleLocks` if `action` is not among the owners; that is an
    /// internal bug and fatal in debug builds.
    pub fn release(&mut self, action: &ActionPtr<D>) -> DoraResult<Vec<ActionPtr<D>>> {
        let position = self
            .owners
            .iter()
            .position(|entry| Arc::ptr_eq(&entry.action, action));
        let position = match position {
            Some(position) => position,
            None => {
                debug_assert!(false, "release of a non-owner action");
                return Err(DoraError::incompatible_locks(
                    action.tid(),
                    "released a lock it does not own",
                ));
            }
        };
        self.owners.swap_remove(position);

        if !self.owners.is_empty() {
            // Partial release: recompute the joint mode, no promotion.
            self.mode = self
                .owners
                .iter()
                .fold(LockMode::None, |mode, entry| mode.join(&entry.mode));
            return Ok(Vec::new());
        }

        // Owner list emptied: drain the longest compatible prefix of waiters.
        self.mode = LockMode::None;
        let mut promoted = Vec::new();
        while let Some(head) = self.waiters.front() {
            if !self.owners.is_empty() && !head.mode.is_compatible(&self.mode) {
                break;
            }
            let entry = self.waiters.pop_front().expect("front checked above");
            self.mode = self.mode.join(&entry.mode);
            promoted.push(entry.action.clone());
            self.owners.push(entry);
        }
        Ok(promoted)
    }

    /// Drops all owners and waiters. Used by partition reset only; in-flight
    /// actions must be gone by then.
    pub fn reset(&mut self) {
        self.owners.clear();
        self.waiters.clear();
        self.mode = LockMode::None;
    }
}

impl<D: DataField> Default for LogicalLock<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: DataField> fmt::Debug for LogicalLock<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogicalLock")
            .field("mode", &self.mode)
            .field("owners", &self.owners.len())
            .field("waiters", &self.waiters.len())
            .finish()
    }
}
