//! The worker lifecycle controller: launches an isolated worker thread, synchronizes on
//! its readiness, and reduces whatever it fails with into a `(kind, message, cause)`
//! triple the parent can aggregate without needing the worker's original error type.

use crate::error::WorkerFailure;
use std::any::Any;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// A worker's id. Ids start at 42 rather than 0 so they're never mistaken for an
/// uninitialized or default-constructed field during debugging.
pub type WorkerId = u64;

pub(crate) const FIRST_WORKER_ID: WorkerId = 42;

/// A worker's externally observable lifecycle state (see the state machine in
/// the design notes for the full transition diagram).
#[derive(Debug, Clone)]
pub enum WorkerState {
    /// Spawned, not yet past bootstrap.
    Pending,
    /// `report_start` was observed; the worker is running `main`.
    Ready,
    /// The worker's `main` returned normally or observed a closed queue.
    Closed,
    /// The worker's `main` returned an error, or panicked.
    Failed(WorkerFailure),
}

/// A single-shot, wait-once signal: exactly one producer calls [`set`](OnceSignal::set),
/// any number of consumers can [`wait`](OnceSignal::wait) or
/// [`wait_timeout`](OnceSignal::wait_timeout) for it.
pub(crate) struct OnceSignal<T> {
    value: Mutex<Option<T>>,
    condvar: Condvar,
}

impl<T: Clone> OnceSignal<T> {
    pub(crate) fn new() -> Self {
        Self {
            value: Mutex::new(None),
            condvar: Condvar::new(),
        }
    }

    pub(crate) fn set(&self, value: T) {
        let mut guard = self.value.lock().unwrap();
        if guard.is_none() {
            *guard = Some(value);
            self.condvar.notify_all();
        }
    }

    pub(crate) fn wait(&self) -> T {
        let mut guard = self.value.lock().unwrap();
        while guard.is_none() {
            guard = self.condvar.wait(guard).unwrap();
        }
        guard.clone().unwrap()
    }

    pub(crate) fn wait_timeout(&self, timeout: Duration) -> Option<T> {
        let mut guard = self.value.lock().unwrap();
        let deadline = Instant::now() + timeout;
        while guard.is_none() {
            let now = Instant::now();
            if now >= deadline {
                return guard.clone();
            }
            let (next, _) = self.condvar.wait_timeout(guard, deadline - now).unwrap();
            guard = next;
        }
        guard.clone()
    }

    pub(crate) fn get(&self) -> Option<T> {
        self.value.lock().unwrap().clone()
    }
}

/// The health event a worker (or the lifecycle controller wrapping it) emits. Observed,
/// in order per worker id, by the parent's dedicated health-listener thread.
#[derive(Debug, Clone)]
pub(crate) enum HealthEvent {
    Start(WorkerId),
    Close(WorkerId),
    Error(WorkerId, WorkerFailure),
}

/// Reduces a caught panic payload into the `(kind, message)` pair used to report a worker
/// crash, mirroring how the source system serializes an exception's class name and
/// message before it crosses the heap boundary.
pub(crate) fn describe_panic(payload: Box<dyn Any + Send>) -> (String, String) {
    if let Some(s) = payload.downcast_ref::<&str>() {
        ("Panic".to_owned(), (*s).to_owned())
    } else if let Some(s) = payload.downcast_ref::<String>() {
        ("Panic".to_owned(), s.clone())
    } else {
        ("Panic".to_owned(), "worker panicked with a non-string payload".to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn signal_wakes_a_blocked_waiter() {
        let signal = Arc::new(OnceSignal::<u32>::new());
        let waiter = {
            let signal = Arc::clone(&signal);
            thread::spawn(move || signal.wait())
        };
        thread::sleep(Duration::from_millis(20));
        signal.set(7);
        assert_eq!(waiter.join().unwrap(), 7);
    }

    #[test]
    fn wait_timeout_returns_none_when_unset() {
        let signal = OnceSignal::<u32>::new();
        assert_eq!(signal.wait_timeout(Duration::from_millis(10)), None);
    }

    #[test]
    fn describe_panic_handles_str_and_string_payloads() {
        let (kind, msg) = describe_panic(Box::new("boom"));
        assert_eq!(kind, "Panic");
        assert_eq!(msg, "boom");

        let (kind, msg) = describe_panic(Box::new(String::from("division by zero")));
        assert_eq!(kind, "Panic");
        assert_eq!(msg, "division by zero");
    }
}
