pub mod loom;

use self::loom::sync::{Mutex, MutexGuard, PoisonError};

#[inline(always)]
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    if cfg!(debug_assertions) {
        mutex
            .lock()
            .expect("internal mutexes should never be poisoned")
    } else {
        mutex.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
