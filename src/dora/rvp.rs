// Rendez-vous points.
//
// An RVP is the join barrier of one transaction's sibling actions: a
// countdown initialized to the number of siblings, a decision that error
// posts flip toward abort, and the list of completed actions waiting for
// their post-commit lock release. The thread that performs the final
// decrement uniquely runs the RVP.
//
// A terminal RVP owns the commit/abort step and client notification; an
// interim RVP only detaches the storage transaction from the finishing
// worker and may fire a continuation that launches the transaction's next
// phase.
//
// State machine:
//
// ```text
// init(n) - post()*n -> DECIDED - run() -> {COMMITTED | ABORTED} - notify() -> DONE
// ```

use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::common::{ClientHandle, DataField, Lsn, TransactionId, TrxOutcome};
use crate::storage::{StorageEngine, XctHandle};

use super::action::ActionPtr;
use super::flusher::FlusherHandle;
use super::Runtime;

/// Decision state of a transaction's RVP.
///
/// `Abort` is chosen when the posting action's own work failed; `Deadlock`
/// when the storage engine reported a deadlock; `Die` when the system is
/// shutting the transaction down. The first error decision wins the CAS
/// race; `Commit` is never stored, it is the meaning of `Undecided` at
/// run time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Decision {
    Undecided = 0,
    Abort = 1,
    Deadlock = 2,
    Commit = 3,
    Die = 4,
}

impl Decision {
    fn from_u8(value: u8) -> Decision {
        match value {
            1 => Decision::Abort,
            2 => Decision::Deadlock,
            3 => Decision::Commit,
            4 => Decision::Die,
            _ => Decision::Undecided,
        }
    }

    /// True for the decisions that end in rollback.
    pub fn is_abort(&self) -> bool {
        matches!(self, Decision::Abort | Decision::Deadlock | Decision::Die)
    }
}

/// Continuation fired by an interim RVP's final poster.
pub type Continuation = Box<dyn FnOnce() + Send>;

enum RvpKind<D: DataField> {
    /// Mid-transaction join; gates the next phase.
    Interim {
        continuation: Mutex<Option<Continuation>>,
    },
    /// Final join; owns commit/abort and client notification.
    Terminal {
        client: Option<Arc<ClientHandle>>,
        flusher: Option<FlusherHandle<D>>,
    },
}

/// Rendez-vous point of one transaction.
pub struct RendezvousPoint<D: DataField> {
    /// Self back-reference so the terminal RVP can hand itself to the
    /// flusher.
    me: Weak<RendezvousPoint<D>>,
    runtime: Arc<Runtime>,
    xct: XctHandle,
    countdown: AtomicUsize,
    decision: AtomicU8,
    /// Actions that finished executing; drained into the partitions' commit
    /// queues by `notify_committed` on every decision path, which also ends
    /// the transient RVP->action reference cycle.
    completed: Mutex<Vec<ActionPtr<D>>>,
    /// Result slot; set by `run`, read by client notification.
    result: Mutex<Option<TrxOutcome>>,
    commit_lsn: Mutex<Option<Lsn>>,
    kind: RvpKind<D>,
}

impl<D: DataField> RendezvousPoint<D> {
    /// Creates a terminal RVP joining `count` sibling actions.
    pub fn terminal(
        runtime: Arc<Runtime>,
        xct: XctHandle,
        count: usize,
        client: Option<Arc<ClientHandle>>,
        flusher: Option<FlusherHandle<D>>,
    ) -> Arc<Self> {
        assert!(count > 0, "an RVP joins at least one action");
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            runtime,
            xct,
            countdown: AtomicUsize::new(count),
            decision: AtomicU8::new(Decision::Undecided as u8),
            completed: Mutex::new(Vec::new()),
            result: Mutex::new(None),
            commit_lsn: Mutex::new(None),
            kind: RvpKind::Terminal { client, flusher },
        })
    }

    /// Creates an interim RVP joining `count` sibling actions; the final
    /// poster fires `continuation` after detaching the storage transaction.
    pub fn interim(
        runtime: Arc<Runtime>,
        xct: XctHandle,
        count: usize,
        continuation: Option<Continuation>,
    ) -> Arc<Self> {
        assert!(count > 0, "an RVP joins at least one action");
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            runtime,
            xct,
            countdown: AtomicUsize::new(count),
            decision: AtomicU8::new(Decision::Undecided as u8),
            completed: Mutex::new(Vec::new()),
            result: Mutex::new(None),
            commit_lsn: Mutex::new(None),
            kind: RvpKind::Interim {
                continuation: Mutex::new(continuation),
            },
        })
    }

    /// The transaction id.
    pub fn tid(&self) -> TransactionId {
        self.xct.tid()
    }

    /// The storage transaction.
    pub fn xct(&self) -> &XctHandle {
        &self.xct
    }

    /// True for the terminal RVP of a transaction.
    pub fn is_terminal(&self) -> bool {
        matches!(self.kind, RvpKind::Terminal { .. })
    }

    /// The current decision.
    pub fn decision(&self) -> Decision {
        Decision::from_u8(self.decision.load(Ordering::Acquire))
    }

    /// Flips the decision toward an abort kind. First error wins; later
    /// flips lose the CAS race and are dropped.
    pub fn mark_error(&self, decision: Decision) {
        debug_assert!(decision.is_abort(), "mark_error takes abort decisions");
        let _ = self.decision.compare_exchange(
            Decision::Undecided as u8,
            decision as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Remaining posts.
    pub fn remaining(&self) -> usize {
        self.countdown.load(Ordering::Acquire)
    }

    /// Records a completed action for post-decision lock release.
    pub fn add_completed(&self, action: ActionPtr<D>) {
        self.completed.lock().push(action);
    }

    /// Decrements the countdown; with `error` the decision flips toward
    /// `Abort` first (unless an earlier error already decided). Returns true
    /// to exactly one caller: the final poster, which must then call
    /// [`run`](Self::run) and [`notify_committed`](Self::notify_committed).
    pub fn post(&self, error: bool) -> bool {
        if error {
            self.mark_error(Decision::Abort);
        }
        let before = self.countdown.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(before > 0, "post after the countdown reached zero");
        before == 1
    }

    /// The commit LSN, once a lazy commit captured it.
    pub fn commit_lsn(&self) -> Option<Lsn> {
        *self.commit_lsn.lock()
    }

    /// The terminal outcome, once decided.
    pub fn outcome(&self) -> Option<TrxOutcome> {
        *self.result.lock()
    }

    /// Runs the decided RVP. Called exactly once, by the final poster.
    ///
    /// Terminal: attaches the storage transaction, aborts or commits
    /// (lazily when the flusher owns durability), records the commit LSN,
    /// and either hands itself to the flusher or notifies the client
    /// inline. Interim: detaches the storage transaction so the worker is
    /// free, then fires the continuation.
    pub fn run(&self) {
        match &self.kind {
            RvpKind::Interim { continuation } => {
                self.runtime.storage().detach(&self.xct);
                if let Some(continuation) = continuation.lock().take() {
                    continuation();
                }
            }
            RvpKind::Terminal { flusher, .. } => self.run_terminal(flusher.clone()),
        }
    }

    fn run_terminal(&self, flusher: Option<FlusherHandle<D>>) {
        let storage = self.runtime.storage();
        storage.attach(&self.xct);

        let decision = self.decision();
        if decision.is_abort() {
            if let Err(error) = storage.abort_xct(&self.xct) {
                tracing::error!(tid = self.tid(), %error, "abort failed");
            } else {
                tracing::debug!(tid = self.tid(), ?decision, "aborted");
            }
            self.runtime.stats().inc_aborted();
            let outcome = match decision {
                Decision::Deadlock => TrxOutcome::AbortedDeadlock,
                Decision::Die => TrxOutcome::AbortedSystem,
                _ => TrxOutcome::AbortedUser,
            };
            *self.result.lock() = Some(outcome);
            // Nothing of an aborted transaction awaits a flush; the client
            // is signalled here even when the flusher is enabled.
            self.notify_client();
            return;
        }

        // Commit. Lazy when the flusher owns durability, eager otherwise.
        let lazy = flusher.is_some();
        match storage.commit_xct(&self.xct, lazy) {
            Ok(lsn) => {
                *self.commit_lsn.lock() = Some(lsn);
                *self.result.lock() = Some(TrxOutcome::Committed);
                self.runtime.stats().inc_committed();
                match (flusher, self.me.upgrade()) {
                    (Some(flusher), Some(me)) => flusher.enqueue(me),
                    _ => self.notify_client(),
                }
            }
            Err(error) => {
                tracing::warn!(tid = self.tid(), %error, "commit failed, falling back to abort");
                if let Err(abort_error) = storage.abort_xct(&self.xct) {
                    tracing::error!(tid = self.tid(), %abort_error, "fallback abort failed");
                }
                self.runtime.stats().inc_aborted();
                *self.result.lock() = Some(TrxOutcome::AbortedSystem);
                self.notify_client();
            }
        }
    }

    /// Enqueues every completed action onto its partition's commit queue
    /// (releasing logical locks promptly, ahead of durability) and clears
    /// the list. Returns the number of actions notified.
    pub fn notify_committed(&self) -> usize {
        let actions: Vec<ActionPtr<D>> = std::mem::take(&mut *self.completed.lock());
        let count = actions.len();
        for action in actions {
            if let Err(error) = action.notify() {
                tracing::warn!(tid = self.tid(), %error, "commit-queue notify failed");
            }
        }
        count
    }

    /// Signals the attached client handle with the recorded outcome.
    ///
    /// Invoked by `run` on the abort and inline-commit paths, and by the
    /// notifier after the flusher made the commit durable.
    pub fn notify_client(&self) {
        if let RvpKind::Terminal {
            client: Some(client),
            ..
        } = &self.kind
        {
            let outcome = self.outcome().unwrap_or(TrxOutcome::AbortedSystem);
            tracing::trace!(tid = self.tid(), %outcome, "notifying client");
            client.signal(outcome);
        }
    }
}

impl<D: DataField> fmt::Debug for RendezvousPoint<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RendezvousPoint")
            .field("tid", &self.tid())
            .field("remaining", &self.remaining())
            .field("decision", &self.decision())
            .field("terminal", &self.is_terminal())
            .finish()
    }
}
