//! Loom model of the ref-queue's post/drain handoff, the one synchronization primitive in
//! this crate built from the `util::lock` indirection loom can intercept. Run with
//! `RUSTFLAGS="--cfg loom" cargo test --test loom --release`.
//!
//! The map's root swap (`crossbeam_epoch::Atomic`) and the bounded queue's `Condvar`s are
//! not modeled here: loom can't stand in for `crossbeam_epoch`'s own internals, and a
//! `Condvar`-based wait/notify pair is already covered by `queue.rs`'s concurrent
//! producer/consumer unit test under the real scheduler.

#![cfg(loom)]

use hivemap::{HeapId, RefQueue};
use loom::sync::Arc;
use loom::thread;

#[test]
fn concurrent_post_and_drain_never_lose_a_delta() {
    loom::model(|| {
        let queue = Arc::new(RefQueue::new(HeapId::new()));

        let posters: Vec<_> = (0..2)
            .map(|_| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    queue.post(1, 1);
                    queue.post(1, -1);
                })
            })
            .collect();

        queue.drain(|_| {});

        for poster in posters {
            poster.join().unwrap();
        }
        queue.drain(|_| {});

        assert_eq!(queue.live_count(1), 0);
    });
}
