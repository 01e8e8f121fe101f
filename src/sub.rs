//! The worker side of a multi-worker runtime.
//!
//! A `Sub` is constructed inside a freshly spawned worker thread from nothing but its
//! parent hive's id and its own worker id; it finds its way back to the shared state
//! exclusively through the process-wide [`registry`](crate::registry), the same way the
//! original system's worker bootstrap re-attaches to its parent's shared memory segment
//! rather than being handed a live reference to it.

use std::sync::Arc;

use crate::error::{HiveError, WorkerFailure};
use crate::hive::HiveShared;
use crate::queue::Queue;
use crate::refqueue::HeapId;
use crate::registry;
use crate::value::Value;
use crate::worker::{HealthEvent, WorkerId};

/// The API available to a worker's `main` closure.
pub struct Sub {
    worker_id: WorkerId,
    heap: HeapId,
    shared: Arc<HiveShared>,
    inbound: Arc<Queue<Value>>,
    closed: bool,
}

impl Sub {
    pub(crate) fn new(hive_id: u64, worker_id: WorkerId, inbound: Arc<Queue<Value>>) -> Self {
        let shared = registry::lookup(hive_id)
            .expect("a worker's hive must still be registered when its thread starts");
        Self {
            worker_id,
            heap: HeapId::new(),
            shared,
            inbound,
            closed: false,
        }
    }

    /// This worker's id, as returned by the `Hive::add_worker` call that spawned it.
    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    /// The isolated heap identity this worker posts deferred ref-count deltas under.
    pub fn heap(&self) -> HeapId {
        self.heap
    }

    /// Looks up `key` in the shared map, as of whatever root is currently published.
    pub fn get(&self, key: &Value) -> Option<Value> {
        self.shared.get(key)
    }

    /// True if `key` is currently bound in the shared map.
    pub fn contains(&self, key: &Value) -> bool {
        self.shared.contains_key(key)
    }

    /// Publishes a new map root with `key` bound to `value`. Races the parent and every
    /// other sub's own `set` calls through the same CAS loop; all of them land.
    pub fn set(&self, key: impl Into<Value>, value: impl Into<Value>) {
        self.shared.set(key.into(), value.into());
    }

    /// Sends `msg` to the parent; observed by the parent's `Hive::listen`.
    pub fn push(&self, msg: impl Into<Value>) -> Result<(), HiveError> {
        self.shared.push_to_parent(msg.into())
    }

    /// Enqueues `arg` on the shared work queue, for any worker (including this one) to
    /// claim with [`claim_work`](Sub::claim_work). Named after the original system's
    /// `request` call, which dispatches a unit of work the same way.
    pub fn request(&self, arg: impl Into<Value>) -> Result<(), HiveError> {
        self.shared.push_work(arg.into())
    }

    /// Claims the next item from the shared work queue, blocking until one is available
    /// or the queue is closed.
    pub fn claim_work(&self) -> Result<Value, HiveError> {
        self.shared.claim_work()
    }

    /// Sends a clone of `msg` to every currently registered worker's inbound queue,
    /// including this one's.
    pub fn broadcast(&self, msg: impl Into<Value>) {
        self.shared.broadcast(&msg.into());
    }

    /// Blocks until a message arrives on this worker's own inbound queue (populated by
    /// `broadcast`).
    pub fn listen(&self) -> Result<Value, HiveError> {
        let item = self.inbound.pop();
        if let Ok(value) = &item {
            self.shared.note_crossing(value, -1);
        }
        item
    }

    pub(crate) fn report_start(&self) {
        self.shared.report(HealthEvent::Start(self.worker_id));
    }

    pub(crate) fn report_close(&self) {
        self.shared.report(HealthEvent::Close(self.worker_id));
    }

    pub(crate) fn report_error(&self, kind: String, message: String, cause: Vec<String>) {
        self.shared.report(HealthEvent::Error(
            self.worker_id,
            WorkerFailure {
                worker_id: self.worker_id,
                kind,
                message,
                cause,
            },
        ));
    }

    /// Closes this worker's own inbound queue, unblocking any concurrent `listen`.
    pub fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.inbound.close();
        }
    }
}

impl Drop for Sub {
    fn drop(&mut self) {
        self.close();
    }
}
