// Copyright (c) 2025 RustyDB Contributors
//
// Action cache
//
// A lock-free LIFO free-list of reset action envelopes, so the hot path
// allocates nothing. Two Treiber-style stacks thread through one
// append-only slot arena: one holds cached actions, the other holds empty
// slots for recycling. Each stack head is a single word packing a slot
// index with a version counter; the version increments on every successful
// compare-and-swap, which makes the classic ABA hazard of tagged-pointer
// stacks impossible within a 2^32 operation window.
//
// Invariants: an action is never in the cache and in a queue at the same
// time (giveback refuses envelopes that are still referenced elsewhere), and
// a cached envelope is always in its reset state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam::utils::Backoff;
use parking_lot::{Mutex, RwLock};

use crate::common::DataField;

use super::action::{Action, ActionPtr};

/// Sentinel slot index marking an empty stack.
const NIL: u32 = u32::MAX;

#[inline]
fn pack(version: u32, index: u32) -> u64 {
    ((version as u64) << 32) | index as u64
}

#[inline]
fn unpack(word: u64) -> (u32, u32) {
    ((word >> 32) as u32, word as u32)
}

struct CacheSlot<D: DataField> {
    next: AtomicU64,
    item: Mutex<Option<ActionPtr<D>>>,
}

impl<D: DataField> CacheSlot<D> {
    fn empty() -> Self {
        Self {
            next: AtomicU64::new(NIL as u64),
            item: Mutex::new(None),
        }
    }
}

/// Lock-free cache of reusable action envelopes. One per partition.
pub struct ActionCache<D: DataField> {
    arena: RwLock<Vec<CacheSlot<D>>>,
    /// Stack of slots holding cached actions.
    cached: AtomicU64,
    /// Stack of empty slots available for recycling.
    free: AtomicU64,
    borrows: AtomicU64,
    allocations: AtomicU64,
    givebacks: AtomicU64,
    /// Envelopes refused by giveback because something still referenced them.
    refused: AtomicU64,
}

impl<D: DataField> ActionCache<D> {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self {
            arena: RwLock::new(Vec::new()),
            cached: AtomicU64::new(pack(0, NIL)),
            free: AtomicU64::new(pack(0, NIL)),
            borrows: AtomicU64::new(0),
            allocations: AtomicU64::new(0),
            givebacks: AtomicU64::new(0),
            refused: AtomicU64::new(0),
        }
    }

    /// Creates a cache pre-populated with `count` envelopes, so threads do
    /// not race on allocation at the beginning of a run.
    pub fn with_capacity(count: usize) -> Self {
        let cache = Self::new();
        {
            let mut arena = cache.arena.write();
            arena.reserve(count);
        }
        for _ in 0..count {
            cache.giveback(Action::new_ptr());
        }
        // Pre-population is not demand.
        cache.givebacks.store(0, Ordering::Relaxed);
        cache
    }

    /// Returns a reset envelope, reusing a cached one when available.
    pub fn borrow(&self) -> ActionPtr<D> {
        self.borrows.fetch_add(1, Ordering::Relaxed);
        if let Some(index) = self.pop_slot(&self.cached) {
            let taken = {
                let arena = self.arena.read();
                let value = arena[index as usize].item.lock().take();
                value
            };
            self.push_slot(&self.free, index);
            if let Some(action) = taken {
                debug_assert!(action.is_reset(), "cached action was not reset");
                return action;
            }
            debug_assert!(false, "cached slot without an action");
        }
        self.allocations.fetch_add(1, Ordering::Relaxed);
        Action::new_ptr()
    }

    /// Resets an envelope and returns it to the cache.
    ///
    /// An envelope still referenced by a queue, a lock list or an RVP is
    /// refused (and simply dropped from this reference) rather than risked
    /// being handed out twice.
    pub fn giveback(&self, action: ActionPtr<D>) {
        // The envelope's own self-weak does not count; any second strong
        // reference (queue, waiter list, RVP) does.
        if Arc::strong_count(&action) > 1 {
            self.refused.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(tid = action.tid(), "giveback of a still-referenced action");
            return;
        }
        action.reset();
        self.givebacks.fetch_add(1, Ordering::Relaxed);

        let index = match self.pop_slot(&self.free) {
            Some(index) => index,
            None => self.append_slot(),
        };
        {
            let arena = self.arena.read();
            *arena[index as usize].item.lock() = Some(action);
        }
        self.push_slot(&self.cached, index);
    }

    /// Number of slots ever created. Stable after warm-up when the cache is
    /// sized to the workload.
    pub fn arena_size(&self) -> usize {
        self.arena.read().len()
    }

    /// Envelopes allocated because the cache was empty.
    pub fn allocations(&self) -> u64 {
        self.allocations.load(Ordering::Relaxed)
    }

    /// Total borrow calls.
    pub fn borrows(&self) -> u64 {
        self.borrows.load(Ordering::Relaxed)
    }

    /// Givebacks refused because the envelope was still referenced.
    pub fn refused(&self) -> u64 {
        self.refused.load(Ordering::Relaxed)
    }

    fn append_slot(&self) -> u32 {
        let mut arena = self.arena.write();
        arena.push(CacheSlot::empty());
        (arena.len() - 1) as u32
    }

    fn pop_slot(&self, head: &AtomicU64) -> Option<u32> {
        let backoff = Backoff::new();
        let arena = self.arena.read();
        loop {
            let current = head.load(Ordering::Acquire);
            let (version, top) = unpack(current);
            if top == NIL {
                return None;
            }
            let next = arena[top as usize].next.load(Ordering::Acquire) as u32;
            if head
                .compare_exchange_weak(
                    current,
                    pack(version.wrapping_add(1), next),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return Some(top);
            }
            backoff.spin();
        }
    }

    fn push_slot(&self, head: &AtomicU64, index: u32) {
        let backoff = Backoff::new();
        let arena = self.arena.read();
        loop {
            let current = head.load(Ordering::Acquire);
            let (version, top) = unpack(current);
            arena[index as usize].next.store(top as u64, Ordering::Release);
            if head
                .compare_exchange_weak(
                    current,
                    pack(version.wrapping_add(1), index),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return;
            }
            backoff.spin();
        }
    }
}

impl<D: DataField> Default for ActionCache<D> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_borrow_allocates_when_empty() {
        let cache = ActionCache::<i64>::new();
        let action = cache.borrow();
        assert!(action.is_reset());
        assert_eq!(cache.allocations(), 1);
    }

    #[test]
    fn test_giveback_then_borrow_reuses() {
        let cache = ActionCache::<i64>::new();
        let action = cache.borrow();
        let raw = Arc::as_ptr(&action);
        cache.giveback(action);
        let again = cache.borrow();
        // LIFO: the envelope just returned comes back first.
        assert_eq!(Arc::as_ptr(&again), raw);
        assert_eq!(cache.allocations(), 1);
    }

    #[test]
    fn test_giveback_resets_observable_state() {
        let cache = ActionCache::<i64>::new();
        let action = crate::dora::action::test_support::stub_action_needing(42, 3);
        cache.giveback(action);
        let back = cache.borrow();
        assert!(back.is_reset());
        assert_eq!(back.tid(), 0);
        assert_eq!(back.keys_needed(), 0);
    }

    #[test]
    fn test_giveback_refuses_shared_action() {
        let cache = ActionCache::<i64>::new();
        let action = cache.borrow();
        let extra_ref = action.clone();
        cache.giveback(action);
        assert_eq!(cache.refused(), 1);
        assert_eq!(cache.arena_size(), 0);
        drop(extra_ref);
    }

    #[test]
    fn test_with_capacity_prewarms() {
        let cache = ActionCache::<i64>::with_capacity(8);
        assert_eq!(cache.arena_size(), 8);
        let actions: Vec<_> = (0..8).map(|_| cache.borrow()).collect();
        assert_eq!(cache.allocations(), 0);
        for action in actions {
            cache.giveback(action);
        }
        assert_eq!(cache.arena_size(), 8);
    }

    #[test]
    fn test_no_growth_after_warmup_under_load() {
        let cache = Arc::new(ActionCache::<i64>::with_capacity(64));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                thread::spawn(move || {
                    for _ in 0..1_250 {
                        let action = cache.borrow();
                        cache.giveback(action);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        // 10_000 cycles across 8 threads: at most one transient envelope
        // per thread beyond the warm pool, and nothing refused.
        assert!(
            cache.arena_size() <= 64 + 8,
            "arena grew to {}",
            cache.arena_size()
        );
        assert_eq!(cache.refused(), 0);
        assert_eq!(cache.borrows(), 10_000);
    }

    #[test]
    fn test_pack_unpack() {
        let word = pack(7, 123);
        assert_eq!(unpack(word), (7, 123));
        let (version, index) = unpack(pack(u32::MAX, NIL));
        assert_eq!(version, u32::MAX);
        assert_eq!(index, NIL);
    }
}
