// Partition workers.
//
// One primary worker thread owns each partition. Its loop has exactly two
// duties, in strict order: drain the commit queue (releasing logical locks
// and serving any actions those releases promoted), then take one action
// from the input queue and try to serve it. The commit queue is drained to
// completion first so waiters make progress before new work compounds
// contention.
//
// CPU binding is a hint. A worker that cannot bind logs it and carries on;
// partition startup never fails because of placement.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use crate::common::DataField;
use crate::error::DoraError;
use crate::storage::StorageEngine;

use super::action::ActionPtr;
use super::partition::Partition;
use super::rvp::Decision;
use super::stats::WorkerStats;
use super::Runtime;

/// Control states of a worker thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerControl {
    Active = 0,
    Stopped = 1,
}

/// Shared control word of one worker.
#[derive(Debug, Default)]
pub struct ControlWord(AtomicU8);

impl ControlWord {
    pub fn new() -> Self {
        Self(AtomicU8::new(WorkerControl::Active as u8))
    }

    pub fn get(&self) -> WorkerControl {
        match self.0.load(Ordering::Acquire) {
            0 => WorkerControl::Active,
            _ => WorkerControl::Stopped,
        }
    }

    pub fn stop(&self) {
        self.0.store(WorkerControl::Stopped as u8, Ordering::Release);
    }
}

/// Worker serving one partition's input and commit queues.
pub(crate) struct Worker<D: DataField> {
    partition: Arc<Partition<D>>,
    runtime: Arc<Runtime>,
    stats: Arc<WorkerStats>,
    control: Arc<ControlWord>,
    cpu_hint: Option<usize>,
    /// Speculative lock inheritance request, forwarded to the storage
    /// engine's per-thread tuning when supported.
    use_sli: bool,
    name: String,
}

impl<D: DataField> Worker<D> {
    pub(crate) fn new(
        partition: Arc<Partition<D>>,
        runtime: Arc<Runtime>,
        stats: Arc<WorkerStats>,
        control: Arc<ControlWord>,
        cpu_hint: Option<usize>,
        use_sli: bool,
        name: String,
    ) -> Self {
        Self {
            partition,
            runtime,
            stats,
            control,
            cpu_hint,
            use_sli,
            name,
        }
    }

    /// Thread main.
    pub(crate) fn run(self) {
        if self.use_sli {
            tracing::debug!(worker = %self.name, "speculative lock inheritance requested");
        }
        if let Some(cpu) = self.cpu_hint {
            if bind_current_thread(cpu) {
                tracing::debug!(worker = %self.name, cpu, "bound to processor");
            } else {
                tracing::debug!(worker = %self.name, cpu, "processor binding unavailable");
            }
        }

        let mut ready: Vec<ActionPtr<D>> = Vec::new();
        let mut promoted: Vec<ActionPtr<D>> = Vec::new();

        while self.control.get() == WorkerControl::Active {
            // (1) Drain committed actions first: release their locks and
            // immediately serve whatever those releases made runnable.
            while let Some(action) = self.partition.commit_queue().try_pop() {
                ready.clear();
                promoted.clear();
                if let Err(error) = action.release_locks(&mut ready, &mut promoted) {
                    tracing::error!(worker = %self.name, %error, "lock release failed");
                }
                self.partition.cache().giveback(action);
                for runnable in ready.drain(..) {
                    self.serve(runnable);
                    self.stats.served_waiting.fetch_add(1, Ordering::Relaxed);
                }
            }

            // (2) One input action. The pop parks after a bounded spin; a
            // commit-queue push wakes us through the shared signal, and the
            // interrupt predicate sends us back to step (1).
            if !self.partition.commit_queue().is_empty() {
                continue;
            }
            let Some(action) = self.partition.input_queue().pop_interruptible(|| {
                !self.partition.commit_queue().is_empty()
                    || self.control.get() != WorkerControl::Active
            }) else {
                continue; // woken for commits or stop; loop re-dispatches
            };
            self.stats.checked_input.fetch_add(1, Ordering::Relaxed);
            match action.acquire_locks() {
                Ok(true) => {
                    self.serve(action);
                    self.stats.served_input.fetch_add(1, Ordering::Relaxed);
                }
                Ok(false) => {
                    // Parked in some waiter queue; it resurfaces via step (1).
                }
                Err(error) => {
                    tracing::warn!(worker = %self.name, %error, "discarding unservable action");
                    self.stats.problems.fetch_add(1, Ordering::Relaxed);
                    self.post_failure(&action, &error);
                }
            }
        }
        tracing::debug!(worker = %self.name, "worker exiting");
    }

    /// Executes a ready action and posts to its RVP; the final poster runs
    /// the RVP and hands its completed actions to the commit queues.
    fn serve(&self, action: ActionPtr<D>) {
        debug_assert!(action.is_ready(), "serving an action with missing locks");

        let (xct, rvp) = match (action.xct(), action.rvp()) {
            (Ok(xct), Ok(rvp)) => (xct, rvp),
            (Err(error), _) | (_, Err(error)) => {
                tracing::error!(worker = %self.name, %error, "malformed action reached serve");
                self.stats.problems.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        let storage = self.runtime.storage();
        storage.attach(&xct);
        let result = action.execute(storage);
        storage.detach(&xct);

        let failed = result.is_err();
        if let Err(error) = result {
            self.stats.problems.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(worker = %self.name, tid = action.tid(), %error, "action failed");
            if error.is_deadlock() {
                rvp.mark_error(Decision::Deadlock);
            }
        }

        // The action holds locks whether it succeeded or not; the terminal
        // RVP's notify path routes it back through the commit queue either
        // way.
        rvp.add_completed(action);
        if rvp.post(failed) {
            rvp.run();
            rvp.notify_committed();
        }
        self.stats.processed.fetch_add(1, Ordering::Relaxed);
    }

    /// An action that cannot even request its locks still must not strand
    /// its transaction: post the failure so the RVP decides.
    fn post_failure(&self, action: &ActionPtr<D>, error: &DoraError) {
        if let Ok(rvp) = action.rvp() {
            if error.is_deadlock() {
                rvp.mark_error(Decision::Deadlock);
            }
            rvp.add_completed(action.clone());
            if rvp.post(true) {
                rvp.run();
                rvp.notify_committed();
            }
        }
    }
}

/// Best-effort processor binding for the calling thread.
#[cfg(target_os = "linux")]
pub(crate) fn bind_current_thread(cpu: usize) -> bool {
    // SAFETY: cpu_set_t is plain data; sched_setaffinity only reads the set.
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu % libc::CPU_SETSIZE as usize, &mut set);
        libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) == 0
    }
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn bind_current_thread(_cpu: usize) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_word() {
        let control = ControlWord::new();
        assert_eq!(control.get(), WorkerControl::Active);
        control.stop();
        assert_eq!(control.get(), WorkerControl::Stopped);
    }

    #[test]
    fn test_binding_is_best_effort() {
        // Whatever the platform says, the call must not panic and the
        // result must be a plain bool.
        let _ = bind_current_thread(0);
    }
}
