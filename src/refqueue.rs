//! Cross-heap deferred reference counting.
//!
//! Every heap in the system owns its own allocations and must be the only heap that ever
//! frees them. When heap B stops using an object owned by heap A, B cannot decrement A's
//! refcount directly (there is no shared allocator lock to make that safe) — so B instead
//! *posts* a signed delta to A's `RefQueue`, and A applies it the next time it *drains*.
//!
//! This mirrors the residual-counter handoff in [`crate::core`] (kept alongside as
//! reference): there, a reader that observes the writer mid-swap defers its decrement into
//! a shared `residual` counter that only the writer ever resolves. Here the same shape is
//! generalized from "one global residual count" to a per-object, per-owner ledger.

use crate::util::lock;
use crate::util::loom::sync::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identifies a heap (the parent "main" heap, or a worker's isolated heap) as the owner
/// of a set of objects for ref-counting purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeapId(u64);

static NEXT_HEAP_ID: AtomicU64 = AtomicU64::new(1);

impl HeapId {
    /// Allocates a fresh, process-unique heap identity.
    pub fn new() -> Self {
        Self(NEXT_HEAP_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn raw(self) -> u64 {
        self.0
    }
}

impl Default for HeapId {
    fn default() -> Self {
        Self::new()
    }
}

struct Entry {
    object: u64,
    delta: i64,
}

/// The deferred-decrement ledger owned by a single heap.
///
/// Foreign heaps [`post`](RefQueue::post) signed deltas into this queue; only the owner
/// calls [`drain`](RefQueue::drain), which is the sole place refcounts are actually
/// mutated. This keeps the accounting race-free without requiring the owner and posters
/// to share a lock on the hot path: `post` only needs the short-lived queue mutex, never
/// the live-count table.
pub struct RefQueue {
    owner: HeapId,
    pending: Mutex<Vec<Entry>>,
    live: Mutex<HashMap<u64, i64>>,
}

impl RefQueue {
    /// Creates an empty ref queue owned by `owner`.
    pub fn new(owner: HeapId) -> Self {
        Self {
            owner,
            pending: Mutex::new(Vec::new()),
            live: Mutex::new(HashMap::new()),
        }
    }

    /// The heap this queue belongs to.
    pub fn owner(&self) -> HeapId {
        self.owner
    }

    /// Records that a foreign heap acquired (`delta > 0`) or released (`delta < 0`) a
    /// reference to `object`. Safe to call from any thread, including the owner's own —
    /// posting is how every heap's increments and decrements enter the ledger, even the
    /// owner's own local ones, so `drain` has one uniform code path.
    pub fn post(&self, object: u64, delta: i64) {
        lock(&self.pending).push(Entry { object, delta });
    }

    /// Applies every pending delta to the live-count table. Must only be called by the
    /// owner; callers elsewhere would race the table without protection, since it is only
    /// locked here and in [`live_count`](RefQueue::live_count).
    ///
    /// Returns the number of entries applied. `on_zero` is invoked once, at most, for each
    /// object whose live count transitions to exactly zero in this drain — the owner's
    /// reclamation hook.
    pub fn drain(&self, mut on_zero: impl FnMut(u64)) -> usize {
        let entries = std::mem::take(&mut *lock(&self.pending));
        let count = entries.len();
        if count == 0 {
            return 0;
        }

        let mut live = lock(&self.live);
        for entry in entries {
            let counter = live.entry(entry.object).or_insert(0);
            let was_positive = *counter > 0;
            *counter += entry.delta;
            debug_assert!(*counter >= 0, "refcount underflow for object {}", entry.object);
            if was_positive && *counter == 0 {
                on_zero(entry.object);
            }
        }
        live.retain(|_, count| *count != 0);
        count
    }

    /// Current live (foreign) reference count for `object`, ignoring anything not yet
    /// drained. Intended for tests and diagnostics, not the hot path.
    pub fn live_count(&self, object: u64) -> i64 {
        *lock(&self.live).get(&object).unwrap_or(&0)
    }

    /// Number of entries waiting to be drained.
    pub fn pending_len(&self) -> usize {
        lock(&self.pending).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn post_then_drain_applies_in_order() {
        let q = RefQueue::new(HeapId::new());
        q.post(1, 3);
        q.post(1, -1);
        let drained = q.drain(|_| panic!("object should not reach zero"));
        assert_eq!(drained, 2);
        assert_eq!(q.live_count(1), 2);
    }

    #[test]
    fn zero_crossing_fires_once() {
        let q = RefQueue::new(HeapId::new());
        q.post(7, 1);
        q.drain(|_| panic!("should not be zero yet"));
        q.post(7, -1);
        let mut fired = 0;
        q.drain(|obj| {
            assert_eq!(obj, 7);
            fired += 1;
        });
        assert_eq!(fired, 1);
        assert_eq!(q.live_count(7), 0);
    }

    #[test]
    fn undrained_foreign_heap_leaves_object_live() {
        // A heap that crashes without posting its final -1 simply never drains to zero;
        // this is the accepted leak path, not a panic or a use-after-free.
        let q = RefQueue::new(HeapId::new());
        q.post(99, 1);
        q.drain(|_| unreachable!());
        assert_eq!(q.live_count(99), 1);
    }

    #[test]
    fn concurrent_posts_from_many_heaps_reconcile() {
        let q = Arc::new(RefQueue::new(HeapId::new()));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let q = Arc::clone(&q);
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    q.post(42, 1);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        q.drain(|_| panic!("should still be live"));
        assert_eq!(q.live_count(42), 800);
    }
}
