//! A bounded, blocking, closable FIFO.
//!
//! Used for the work queue, every worker's private inbound queue, and the health queue.
//! Built from a hand-rolled `Mutex` + `Condvar` pair rather than a channel crate, in
//! keeping with the rest of this crate's preference for owning its synchronization
//! primitives outright (see [`crate::core`] for the same style applied to the map swap).

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::error::HiveError;

struct State<T> {
    ring: VecDeque<T>,
    capacity: usize,
    closed: bool,
}

/// A bounded FIFO that blocks `push` while full and `pop` while empty, and that can be
/// [`close`](Queue::close)d to wake every waiter with [`HiveError::ClosedQueue`].
pub struct Queue<T> {
    state: Mutex<State<T>>,
    not_full: Condvar,
    not_empty: Condvar,
}

impl<T> Queue<T> {
    /// Creates a queue that holds at most `capacity` items.
    pub fn bounded(capacity: usize) -> Self {
        assert!(capacity > 0, "a zero-capacity queue can never be pushed to");
        Self {
            state: Mutex::new(State {
                ring: VecDeque::with_capacity(capacity.min(256)),
                capacity,
                closed: false,
            }),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
        }
    }

    /// Blocks until there is room, then pushes `value`. Fails if the queue is, or becomes,
    /// closed while waiting.
    pub fn push(&self, value: T) -> Result<(), HiveError> {
        let mut state = self.state.lock().unwrap();
        loop {
            if state.closed {
                return Err(HiveError::ClosedQueue);
            }
            if state.ring.len() < state.capacity {
                state.ring.push_back(value);
                self.not_empty.notify_one();
                return Ok(());
            }
            state = self.not_full.wait(state).unwrap();
        }
    }

    /// Pushes `value` without blocking, failing with the value handed back if the queue is
    /// full or closed.
    pub fn try_push(&self, value: T) -> Result<(), TryPushError<T>> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(TryPushError::Closed(value));
        }
        if state.ring.len() < state.capacity {
            state.ring.push_back(value);
            self.not_empty.notify_one();
            Ok(())
        } else {
            Err(TryPushError::Full(value))
        }
    }

    /// Blocks until an item is available, then pops it. Fails once the queue is closed
    /// and drained.
    pub fn pop(&self) -> Result<T, HiveError> {
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(value) = state.ring.pop_front() {
                self.not_full.notify_one();
                return Ok(value);
            }
            if state.closed {
                return Err(HiveError::ClosedQueue);
            }
            state = self.not_empty.wait(state).unwrap();
        }
    }

    /// Pops an item if one is immediately available, without blocking.
    pub fn try_pop(&self) -> Option<T> {
        let mut state = self.state.lock().unwrap();
        let value = state.ring.pop_front();
        if value.is_some() {
            self.not_full.notify_one();
        }
        value
    }

    /// Like [`pop`](Queue::pop), but gives up and returns `Ok(None)` after `timeout` with
    /// nothing available. Used by the worker lifecycle controller to bound how long it
    /// waits for a `READY` signal.
    pub fn pop_timeout(&self, timeout: Duration) -> Result<Option<T>, HiveError> {
        let mut state = self.state.lock().unwrap();
        let deadline = std::time::Instant::now() + timeout;
        loop {
            if let Some(value) = state.ring.pop_front() {
                self.not_full.notify_one();
                return Ok(Some(value));
            }
            if state.closed {
                return Err(HiveError::ClosedQueue);
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let (guard, result) = self.not_empty.wait_timeout(state, deadline - now).unwrap();
            state = guard;
            if result.timed_out() && state.ring.is_empty() && !state.closed {
                return Ok(None);
            }
        }
    }

    /// Closes the queue. Idempotent; wakes every blocked `push`/`pop` so they observe
    /// [`HiveError::ClosedQueue`] (or drain whatever remains, for `pop`).
    pub fn close(&self) {
        let mut state = self.state.lock().unwrap();
        if !state.closed {
            state.closed = true;
        }
        drop(state);
        self.not_full.notify_all();
        self.not_empty.notify_all();
    }

    /// True once [`close`](Queue::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    /// Current number of buffered items.
    pub fn len(&self) -> usize {
        self.state.lock().unwrap().ring.len()
    }

    /// True if no items are currently buffered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Failure mode for [`Queue::try_push`].
#[derive(Debug)]
pub enum TryPushError<T> {
    /// The queue is at capacity; no item was taken.
    Full(T),
    /// The queue is closed; no item was taken.
    Closed(T),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn push_then_pop_yields_same_value() {
        let q = Queue::bounded(4);
        q.push(42).unwrap();
        assert_eq!(q.pop().unwrap(), 42);
    }

    #[test]
    fn pop_on_closed_empty_queue_errors() {
        let q: Queue<i32> = Queue::bounded(1);
        q.close();
        assert!(matches!(q.pop(), Err(HiveError::ClosedQueue)));
    }

    #[test]
    fn push_on_closed_queue_errors() {
        let q: Queue<i32> = Queue::bounded(1);
        q.close();
        assert!(matches!(q.push(1), Err(HiveError::ClosedQueue)));
    }

    #[test]
    fn closed_queue_still_drains_buffered_items() {
        let q = Queue::bounded(4);
        q.push(1).unwrap();
        q.push(2).unwrap();
        q.close();
        assert_eq!(q.pop().unwrap(), 1);
        assert_eq!(q.pop().unwrap(), 2);
        assert!(matches!(q.pop(), Err(HiveError::ClosedQueue)));
    }

    #[test]
    fn many_producers_many_consumers_no_loss_or_duplication() {
        const PRODUCERS: usize = 4;
        const PER_PRODUCER: usize = 250;
        let q = Arc::new(Queue::bounded(16));

        let producers: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let q = Arc::clone(&q);
                thread::spawn(move || {
                    for i in 0..PER_PRODUCER {
                        q.push((p, i)).unwrap();
                    }
                })
            })
            .collect();

        let consumer_q = Arc::clone(&q);
        let total = PRODUCERS * PER_PRODUCER;
        let consumer = thread::spawn(move || {
            let mut received = Vec::with_capacity(total);
            while received.len() < total {
                received.push(consumer_q.pop().unwrap());
            }
            received
        });

        for p in producers {
            p.join().unwrap();
        }
        let received = consumer.join().unwrap();
        assert_eq!(received.len(), total);

        let mut seen = std::collections::HashSet::new();
        for item in received {
            assert!(seen.insert(item), "duplicate delivery: {item:?}");
        }
    }

    #[test]
    fn fifo_order_single_producer_single_consumer() {
        let q = Queue::bounded(100);
        for i in 0..100 {
            q.push(i).unwrap();
        }
        for i in 0..100 {
            assert_eq!(q.pop().unwrap(), i);
        }
    }
}
