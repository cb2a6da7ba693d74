// Copyright (c) 2025 RustyDB Contributors
//
// Single-reader / multiple-writer blocking queue
//
// Both partition queues (input and commit) and the flusher/notifier queues
// are instances of this shape: many producer threads push under a mutex,
// exactly one consumer drains. The consumer keeps a private buffer and
// refills it by swapping batches out of the producer side, so it holds no
// lock while draining. An empty pop spins for a configurable bound, then
// parks on the owner's signal; producers wake the owner on push when asked
// to.
//
// The owner signal is shared: one worker parks on one signal while several
// queues (input + commit) wake it, matching the partition worker's shape.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::utils::Backoff;
use parking_lot::{Condvar, Mutex};

/// Wait/wake handle of a queue owner.
///
/// One per consumer thread; every queue the consumer drains is bound to the
/// same signal. A missed-wakeup race is closed by the `pending` flag: a
/// notify between the consumer's last poll and its park leaves the flag set
/// and the park returns immediately.
pub struct WorkerSignal {
    pending: Mutex<bool>,
    cond: Condvar,
}

impl WorkerSignal {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    /// Wakes the owner.
    pub fn notify(&self) {
        let mut pending = self.pending.lock();
        *pending = true;
        self.cond.notify_one();
    }

    /// Parks until notified or `timeout` elapses. Consumes a pending wake.
    pub fn wait(&self, timeout: Duration) {
        let mut pending = self.pending.lock();
        if !*pending {
            self.cond.wait_for(&mut pending, timeout);
        }
        *pending = false;
    }
}

impl Default for WorkerSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Single-reader / multiple-writer blocking queue.
///
/// The consumer-side buffer is behind its own mutex but is only ever locked
/// by the owning consumer; contention on it is zero by protocol.
pub struct BlockingQueue<T> {
    producer: Mutex<VecDeque<T>>,
    consumer: Mutex<VecDeque<T>>,
    signal: Mutex<Option<Arc<WorkerSignal>>>,
    closed: AtomicBool,
    /// Spin bound before an empty pop parks.
    spins: AtomicUsize,
    /// Max items moved from the producer side per refill.
    threshold: AtomicUsize,
    len: AtomicUsize,
}

/// Park slice while waiting for work; the loop re-checks `closed` between
/// slices so shutdown is never missed.
const PARK_SLICE: Duration = Duration::from_millis(50);

impl<T> BlockingQueue<T> {
    /// Creates an unbound queue with default tuning.
    pub fn new() -> Self {
        Self {
            producer: Mutex::new(VecDeque::new()),
            consumer: Mutex::new(VecDeque::new()),
            signal: Mutex::new(None),
            closed: AtomicBool::new(false),
            spins: AtomicUsize::new(crate::config::DEFAULT_WORKER_QUEUE_LOOPS),
            threshold: AtomicUsize::new(crate::config::DEFAULT_QUEUE_THRESHOLD),
            len: AtomicUsize::new(0),
        }
    }

    /// Binds the owner signal and tuning. Called when a worker takes
    /// ownership of the queue; `clear`ing the queue keeps the binding.
    pub fn set_owner(&self, signal: Arc<WorkerSignal>, spins: usize, threshold: usize) {
        *self.signal.lock() = Some(signal);
        self.spins.store(spins.max(1), Ordering::Relaxed);
        self.threshold.store(threshold.max(1), Ordering::Relaxed);
    }

    /// Unbinds the owner signal.
    pub fn drop_owner(&self) {
        *self.signal.lock() = None;
    }

    /// Pushes an item; with `wake`, signals a parked owner.
    pub fn push(&self, item: T, wake: bool) {
        self.producer.lock().push_back(item);
        self.len.fetch_add(1, Ordering::Release);
        if wake {
            if let Some(signal) = self.signal.lock().as_ref() {
                signal.notify();
            }
        }
    }

    /// Non-blocking pop. Consumer only.
    pub fn try_pop(&self) -> Option<T> {
        let mut consumer = self.consumer.lock();
        if consumer.is_empty() {
            self.refill(&mut consumer);
        }
        let item = consumer.pop_front();
        if item.is_some() {
            self.len.fetch_sub(1, Ordering::Release);
        }
        item
    }

    /// Pops, spinning up to the configured bound and then parking on the
    /// owner signal. Returns `None` once the queue is closed and empty.
    /// Consumer only.
    pub fn pop(&self) -> Option<T> {
        self.pop_interruptible(|| false)
    }

    /// Like [`pop`](Self::pop), but also returns `None` whenever
    /// `interrupt()` reports other work for the consumer. A worker draining
    /// two queues parks here on the shared signal; a push to either queue
    /// wakes it, and the interrupt predicate routes it back to the other
    /// queue. Consumer only.
    pub fn pop_interruptible(&self, interrupt: impl Fn() -> bool) -> Option<T> {
        loop {
            let backoff = Backoff::new();
            let spins = self.spins.load(Ordering::Relaxed);
            for _ in 0..spins {
                if let Some(item) = self.try_pop() {
                    return Some(item);
                }
                if self.closed.load(Ordering::Acquire) {
                    // Closed: drain what is left, then report exhaustion.
                    return self.try_pop();
                }
                if interrupt() {
                    return None;
                }
                backoff.snooze();
            }
            let signal = self.signal.lock().clone();
            match signal {
                Some(signal) => signal.wait(PARK_SLICE),
                None => std::thread::yield_now(),
            }
            if let Some(item) = self.try_pop() {
                return Some(item);
            }
            if self.closed.load(Ordering::Acquire) {
                return self.try_pop();
            }
            if interrupt() {
                return None;
            }
        }
    }

    fn refill(&self, consumer: &mut VecDeque<T>) {
        let mut producer = self.producer.lock();
        let threshold = self.threshold.load(Ordering::Relaxed);
        if producer.len() <= threshold {
            std::mem::swap(&mut *producer, consumer);
        } else {
            consumer.extend(producer.drain(..threshold));
        }
    }

    /// Approximate number of queued items.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    /// True when no items are queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True once the queue has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Parks the consumer up to `timeout` waiting for new work. Returns
    /// immediately when items are already queued or the queue is closed.
    /// Consumer only.
    pub fn wait_for_work(&self, timeout: Duration) {
        if !self.is_empty() || self.is_closed() || timeout.is_zero() {
            return;
        }
        let signal = self.signal.lock().clone();
        match signal {
            Some(signal) => signal.wait(timeout),
            None => std::thread::yield_now(),
        }
    }

    /// Marks the queue closed and wakes the owner so it can drain and exit.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        if let Some(signal) = self.signal.lock().as_ref() {
            signal.notify();
        }
    }

    /// Reopens a closed queue (partition reset).
    pub fn reopen(&self) {
        self.closed.store(false, Ordering::Release);
    }

    /// Drains everything from both sides. The owner binding is kept unless
    /// `keep_owner` is false.
    pub fn clear(&self, keep_owner: bool) -> Vec<T> {
        let mut drained: Vec<T> = self.consumer.lock().drain(..).collect();
        drained.extend(self.producer.lock().drain(..));
        self.len.fetch_sub(drained.len(), Ordering::Release);
        if !keep_owner {
            self.drop_owner();
        }
        drained
    }
}

impl<T> Default for BlockingQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
