//! The parent side of a multi-worker runtime: owns the shared persistent map, the work
//! queue, the broadcast registry, and the worker lifecycle controller.

use crossbeam_epoch::{self as epoch, Atomic, Owned};
use log::{debug, warn};
use slab::Slab;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::error::{HiveError, MemhiveGroupError, WorkerError, WorkerFailure};
use crate::hamt::PersistentMap;
use crate::queue::Queue;
use crate::refqueue::{HeapId, RefQueue};
use crate::registry;
use crate::sub::Sub;
use crate::value::Value;
use crate::worker::{describe_panic, HealthEvent, OnceSignal, WorkerId, WorkerState, FIRST_WORKER_ID};

const DEFAULT_QUEUE_CAPACITY: usize = 1024;
const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_REF_TICK_INTERVAL: Duration = Duration::from_millis(10);

// crossbeam_epoch tags the low bits of the pointers it manages for its own bookkeeping
// (3 bits on a 64-bit host, 2 on a 32-bit host). `Atomic::new` boxes the value itself, so
// that value's alignment is what has to leave those bits free.
const MIN_ROOT_ALIGN: usize = 8;

static NEXT_HIVE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone)]
pub(crate) enum WorkerOutcome {
    Closed,
    Failed(WorkerFailure),
}

struct WorkerEntry {
    subs_key: usize,
    ready: Arc<OnceSignal<()>>,
    outcome: Arc<OnceSignal<WorkerOutcome>>,
    join: Mutex<Option<JoinHandle<()>>>,
}

/// State shared between a [`Hive`] and every [`Sub`] spawned from it, reached by workers
/// exclusively through the process-wide handle [`registry`](crate::registry).
pub(crate) struct HiveShared {
    pub(crate) id: u64,
    pub(crate) heap: HeapId,
    root: Atomic<PersistentMap<Value, Value>>,
    pub(crate) ref_queue: RefQueue,
    pub(crate) work_queue: Queue<Value>,
    parent_inbound: Queue<Value>,
    health_queue: Queue<HealthEvent>,
    pub(crate) subs: Mutex<Slab<Arc<Queue<Value>>>>,
    next_worker_id: AtomicU64,
    workers: Mutex<HashMap<WorkerId, WorkerEntry>>,
    ready_timeout: Duration,
    closed: AtomicBool,
    health_listener: Mutex<Option<JoinHandle<()>>>,
    ref_tick_stop: Arc<AtomicBool>,
    ref_ticker: Mutex<Option<JoinHandle<()>>>,
}

impl HiveShared {
    pub(crate) fn get(&self, key: &Value) -> Option<Value> {
        let guard = &epoch::pin();
        let current = self.root.load(Ordering::Acquire, guard);
        unsafe { current.deref() }.get(key)
    }

    pub(crate) fn contains_key(&self, key: &Value) -> bool {
        let guard = &epoch::pin();
        let current = self.root.load(Ordering::Acquire, guard);
        unsafe { current.deref() }.contains_key(key)
    }

    pub(crate) fn set(&self, key: Value, value: Value) {
        // Drain before publishing a new root, so a root that's about to become
        // unreachable has already had its foreign references accounted for.
        self.ref_queue.drain(|obj| debug!("object {obj} reclaimed before map publish"));

        let guard = &epoch::pin();
        loop {
            let current = self.root.load(Ordering::Acquire, guard);
            let current_map = unsafe { current.deref() };
            let new_map = current_map.set(key.clone(), value.clone());
            match self.root.compare_exchange(
                current,
                Owned::new(new_map),
                Ordering::AcqRel,
                Ordering::Acquire,
                guard,
            ) {
                Ok(_) => {
                    unsafe { guard.defer_destroy(current) };
                    break;
                }
                Err(_) => continue,
            }
        }
    }

    pub(crate) fn broadcast(&self, msg: &Value) {
        let subs = self.subs.lock().unwrap();
        for (_, inbound) in subs.iter() {
            // A full or closed sub is not a broadcast failure; it simply misses this one.
            if inbound.try_push(msg.clone()).is_ok() {
                self.note_crossing(msg, 1);
            }
        }
    }

    pub(crate) fn push_to_parent(&self, msg: Value) -> Result<(), HiveError> {
        let refs = msg.foreign_refs();
        let result = self.parent_inbound.push(msg);
        self.apply_crossing(&refs, result.is_ok());
        result
    }

    pub(crate) fn push_work(&self, msg: Value) -> Result<(), HiveError> {
        let refs = msg.foreign_refs();
        let result = self.work_queue.push(msg);
        self.apply_crossing(&refs, result.is_ok());
        result
    }

    pub(crate) fn claim_work(&self) -> Result<Value, HiveError> {
        let item = self.work_queue.pop();
        if let Ok(value) = &item {
            self.note_crossing(value, -1);
        }
        self.ref_queue.drain(|obj| debug!("object {obj} reclaimed after dequeue"));
        item
    }

    /// Pops the parent's own inbound queue (populated by a worker's `Sub::push`),
    /// releasing the foreign references the pushing worker posted.
    pub(crate) fn listen(&self) -> Result<Value, HiveError> {
        let item = self.parent_inbound.pop();
        if let Ok(value) = &item {
            self.note_crossing(value, -1);
        }
        item
    }

    pub(crate) fn report(&self, event: HealthEvent) {
        let _ = self.health_queue.push(event);
    }

    /// Posts `delta` to this hive's ref queue for every foreign handle reachable from
    /// `value` — `+1` as it's handed off across a queue boundary, `-1` once the
    /// receiver has popped and is done with it.
    pub(crate) fn note_crossing(&self, value: &Value, delta: i64) {
        for handle in value.foreign_refs() {
            self.ref_queue.post(handle.id(), delta);
        }
    }

    /// Posts `+1` for each of `refs` only if `crossed`, i.e. the value actually made it
    /// into the queue rather than being dropped on a closed-queue error.
    fn apply_crossing(&self, refs: &[crate::value::ForeignHandle], crossed: bool) {
        if crossed {
            for handle in refs {
                self.ref_queue.post(handle.id(), 1);
            }
        }
    }
}

impl Drop for HiveShared {
    fn drop(&mut self) {
        let guard = &epoch::pin();
        let current = self.root.load(Ordering::Acquire, guard);
        if !current.is_null() {
            unsafe { guard.defer_destroy(current) };
        }
    }
}

fn run_health_listener(shared: Arc<HiveShared>) {
    loop {
        match shared.health_queue.pop() {
            Ok(HealthEvent::Start(wid)) => {
                debug!("worker {wid} reported start");
                if let Some(entry) = shared.workers.lock().unwrap().get(&wid) {
                    entry.ready.set(());
                }
            }
            Ok(HealthEvent::Close(wid)) => {
                debug!("worker {wid} reported close");
                if let Some(entry) = shared.workers.lock().unwrap().get(&wid) {
                    entry.outcome.set(WorkerOutcome::Closed);
                }
            }
            Ok(HealthEvent::Error(wid, failure)) => {
                warn!("worker {wid} failed: {failure}");
                if let Some(entry) = shared.workers.lock().unwrap().get(&wid) {
                    entry.outcome.set(WorkerOutcome::Failed(failure));
                }
            }
            Err(_) => break,
        }
    }
}

fn run_ref_ticker(ref_owner_id: u64, stop: Arc<AtomicBool>, interval: Duration) {
    while !stop.load(Ordering::Relaxed) {
        thread::sleep(interval);
        if let Some(shared) = registry::lookup(ref_owner_id) {
            shared
                .ref_queue
                .drain(|obj| debug!("object {obj} reclaimed on tick"));
        } else {
            break;
        }
    }
}

fn run_worker<F>(hive_id: u64, worker_id: WorkerId, inbound: Arc<Queue<Value>>, main: F)
where
    F: FnOnce(&mut Sub) -> Result<(), WorkerError> + Send + 'static,
{
    let mut sub = Sub::new(hive_id, worker_id, inbound);
    sub.report_start();

    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| main(&mut sub)));

    match result {
        Ok(Ok(())) | Ok(Err(WorkerError::Closed)) => sub.report_close(),
        Ok(Err(WorkerError::Other(message))) => {
            sub.report_error("WorkerError".to_owned(), message, Vec::new())
        }
        Err(panic) => {
            let (kind, message) = describe_panic(panic);
            sub.report_error(kind, message, Vec::new())
        }
    }

    sub.close();
}

/// Configures and builds a [`Hive`].
pub struct HiveBuilder {
    ready_timeout: Duration,
    ref_tick_interval: Duration,
    queue_capacity: usize,
}

impl HiveBuilder {
    /// Starts from the defaults: a five second worker-ready timeout, a ten millisecond
    /// ref-processor tick, and queues sized for 1024 buffered items.
    pub fn new() -> Self {
        Self {
            ready_timeout: DEFAULT_READY_TIMEOUT,
            ref_tick_interval: DEFAULT_REF_TICK_INTERVAL,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }

    /// How long [`Hive::add_worker`] waits for the worker to report `START` before
    /// failing with [`HiveError::WorkerStartFailed`].
    pub fn ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    /// How often the ref-processor drains cross-heap deferred decrements in the
    /// background, independent of the drains performed at specific synchronization
    /// points (map publish, work-queue pop, `close`).
    pub fn ref_tick_interval(mut self, interval: Duration) -> Self {
        self.ref_tick_interval = interval;
        self
    }

    /// Capacity shared by the work queue, the parent's inbound queue, and each worker's
    /// private inbound queue.
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Builds the hive, starting its health-listener and ref-processor threads.
    pub fn build(self) -> Result<Hive, HiveError> {
        if std::mem::align_of::<PersistentMap<Value, Value>>() < MIN_ROOT_ALIGN {
            return Err(HiveError::HostIncompatible);
        }

        let id = NEXT_HIVE_ID.fetch_add(1, Ordering::Relaxed);
        let heap = HeapId::new();
        let ref_tick_stop = Arc::new(AtomicBool::new(false));

        let shared = Arc::new(HiveShared {
            id,
            heap,
            root: Atomic::new(PersistentMap::new()),
            ref_queue: RefQueue::new(heap),
            work_queue: Queue::bounded(self.queue_capacity),
            parent_inbound: Queue::bounded(self.queue_capacity),
            health_queue: Queue::bounded(self.queue_capacity),
            subs: Mutex::new(Slab::new()),
            next_worker_id: AtomicU64::new(FIRST_WORKER_ID),
            workers: Mutex::new(HashMap::new()),
            ready_timeout: self.ready_timeout,
            closed: AtomicBool::new(false),
            health_listener: Mutex::new(None),
            ref_tick_stop: Arc::clone(&ref_tick_stop),
            ref_ticker: Mutex::new(None),
        });

        registry::register(id, &shared);

        let listener = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name(format!("hivemap-health-{id}"))
                .spawn(move || run_health_listener(shared))
                .expect("failed to spawn health listener thread")
        };
        *shared.health_listener.lock().unwrap() = Some(listener);

        let ticker = {
            let interval = self.ref_tick_interval;
            let stop = Arc::clone(&ref_tick_stop);
            thread::Builder::new()
                .name(format!("hivemap-refproc-{id}"))
                .spawn(move || run_ref_ticker(id, stop, interval))
                .expect("failed to spawn ref-processor thread")
        };
        *shared.ref_ticker.lock().unwrap() = Some(ticker);

        Ok(Hive { shared, closed: false })
    }
}

impl Default for HiveBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The parent side of a multi-worker runtime.
///
/// Construct with [`Hive::new`] or [`HiveBuilder`], populate the shared map with
/// [`set`](Hive::set), spawn workers with [`add_worker`](Hive::add_worker), and shut down
/// with [`close`](Hive::close) to collect any worker failures.
pub struct Hive {
    shared: Arc<HiveShared>,
    closed: bool,
}

impl Hive {
    /// Builds a hive with default settings. See [`HiveBuilder`] to customize timeouts.
    pub fn new() -> Result<Self, HiveError> {
        HiveBuilder::new().build()
    }

    /// Looks up `key` in the shared map.
    pub fn get(&self, key: &Value) -> Option<Value> {
        self.shared.get(key)
    }

    /// True if `key` is currently bound in the shared map.
    pub fn contains_key(&self, key: &Value) -> bool {
        self.shared.contains_key(key)
    }

    /// Publishes a new map root with `key` bound to `value`.
    pub fn set(&self, key: impl Into<Value>, value: impl Into<Value>) -> Result<(), HiveError> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(HiveError::InvalidState);
        }
        self.shared.set(key.into(), value.into());
        Ok(())
    }

    /// Enqueues `msg` on the shared work queue; any worker may claim it.
    pub fn push(&self, msg: impl Into<Value>) -> Result<(), HiveError> {
        self.shared.push_work(msg.into())
    }

    /// Sends a clone of `msg` to every currently registered worker's inbound queue.
    pub fn broadcast(&self, msg: impl Into<Value>) {
        self.shared.broadcast(&msg.into());
    }

    /// Blocks for the next message a worker sent with `Sub::push`.
    pub fn listen(&self) -> Result<Value, HiveError> {
        self.shared.listen()
    }

    /// Spawns a worker thread running `main`, and blocks until it reports `START` (or
    /// the configured ready timeout elapses).
    pub fn add_worker<F>(&self, main: F) -> Result<WorkerId, HiveError>
    where
        F: FnOnce(&mut Sub) -> Result<(), WorkerError> + Send + 'static,
    {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(HiveError::InvalidState);
        }

        let worker_id = self.shared.next_worker_id.fetch_add(1, Ordering::Relaxed);
        let inbound = Arc::new(Queue::bounded(DEFAULT_QUEUE_CAPACITY));

        let ready = Arc::new(OnceSignal::new());
        let outcome = Arc::new(OnceSignal::new());

        let hive_id = self.shared.id;
        let spawn_inbound = Arc::clone(&inbound);
        let join = thread::Builder::new()
            .name(format!("hivemap-worker-{worker_id}"))
            .spawn(move || run_worker(hive_id, worker_id, spawn_inbound, main))
            .map_err(|_| HiveError::WorkerStartFailed(worker_id))?;

        // Only register the broadcast-registry slot once the thread actually exists, so a
        // failed spawn above doesn't leak a slab entry for a worker that was never created.
        let subs_key = self.shared.subs.lock().unwrap().insert(inbound);

        self.shared.workers.lock().unwrap().insert(
            worker_id,
            WorkerEntry {
                subs_key,
                ready: Arc::clone(&ready),
                outcome,
                join: Mutex::new(Some(join)),
            },
        );

        match ready.wait_timeout(self.shared.ready_timeout) {
            Some(()) => Ok(worker_id),
            None => Err(HiveError::WorkerStartFailed(worker_id)),
        }
    }

    /// The current lifecycle state of `worker_id`, or `None` if it is unknown.
    pub fn worker_state(&self, worker_id: WorkerId) -> Option<WorkerState> {
        let workers = self.shared.workers.lock().unwrap();
        let entry = workers.get(&worker_id)?;
        Some(match entry.outcome.get() {
            Some(WorkerOutcome::Closed) => WorkerState::Closed,
            Some(WorkerOutcome::Failed(failure)) => WorkerState::Failed(failure),
            None if entry.ready.get().is_some() => WorkerState::Ready,
            None => WorkerState::Pending,
        })
    }

    /// Closes the work queue, waits for every worker to finish, tears down the health
    /// listener and ref-processor, and returns the aggregated worker failures, if any.
    ///
    /// Idempotent: calling this twice, or dropping a hive that was already closed, is a
    /// no-op.
    pub fn close(&mut self) -> Result<(), HiveError> {
        self.close_impl()
    }

    fn close_impl(&mut self) -> Result<(), HiveError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.shared.closed.store(true, Ordering::Release);
        self.shared.work_queue.close();

        let entries: Vec<_> = self.shared.workers.lock().unwrap().drain().collect();
        let mut failures = Vec::new();
        for (worker_id, entry) in entries {
            if let Some(join) = entry.join.lock().unwrap().take() {
                if join.join().is_err() {
                    warn!("worker {worker_id} thread panicked outside its main closure");
                }
            }
            // The worker thread exiting only proves `main` returned; the health listener
            // still has to pop and apply its final `Close`/`Error` event on its own
            // thread, so wait on the outcome itself rather than racing that handoff.
            if let WorkerOutcome::Failed(failure) = entry.outcome.wait() {
                failures.push(failure);
            }
            self.shared.subs.lock().unwrap().remove(entry.subs_key);
        }

        self.shared.health_queue.close();
        if let Some(listener) = self.shared.health_listener.lock().unwrap().take() {
            let _ = listener.join();
        }

        self.shared.ref_tick_stop.store(true, Ordering::Relaxed);
        if let Some(ticker) = self.shared.ref_ticker.lock().unwrap().take() {
            let _ = ticker.join();
        }

        let mut leaked = 0usize;
        self.shared.ref_queue.drain(|_| {});
        if self.shared.ref_queue.pending_len() > 0 {
            leaked += self.shared.ref_queue.pending_len();
        }
        if leaked > 0 {
            warn!("hive {} closed with {leaked} undrained ref-queue entries", self.shared.id);
        }

        registry::unregister(self.shared.id);

        if failures.is_empty() {
            Ok(())
        } else {
            Err(HiveError::Workers(MemhiveGroupError { failures }))
        }
    }
}

impl Drop for Hive {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(err) = self.close_impl() {
                warn!("hive dropped without an explicit close(): {err}");
            }
        }
    }
}
