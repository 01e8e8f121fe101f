//! The handle registry: the sole sanctioned mechanism by which a worker thread, running
//! in its own isolated heap, looks up the shared state of the `Hive` that spawned it.
//!
//! Scoped per-`Hive` (keyed by a process-unique hive id), not a true process singleton —
//! multiple hives can coexist, and a `Hive::close` removes its own entry.

use crate::hive::HiveShared;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, Weak};

static REGISTRY: OnceLock<Mutex<HashMap<u64, Weak<HiveShared>>>> = OnceLock::new();

fn registry() -> &'static Mutex<HashMap<u64, Weak<HiveShared>>> {
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

pub(crate) fn register(id: u64, shared: &Arc<HiveShared>) {
    registry().lock().unwrap().insert(id, Arc::downgrade(shared));
}

pub(crate) fn unregister(id: u64) {
    registry().lock().unwrap().remove(&id);
}

pub(crate) fn lookup(id: u64) -> Option<Arc<HiveShared>> {
    registry().lock().unwrap().get(&id).and_then(Weak::upgrade)
}
