use std::fmt::{self, Display, Formatter};
use thiserror::Error;

/// Errors surfaced by the parent-side [`Hive`](crate::Hive) API.
#[derive(Debug, Error)]
pub enum HiveError {
    /// A queue operation was attempted after the queue was closed.
    #[error("queue is closed")]
    ClosedQueue,

    /// A worker never reported `START` within the configured ready timeout.
    #[error("worker {0} did not become ready in time")]
    WorkerStartFailed(u64),

    /// An operation was attempted on a [`Hive`](crate::Hive) after [`close`](crate::Hive::close).
    #[error("hive is closed")]
    InvalidState,

    /// The host process reuses pointer tag bits the shared root relies on.
    #[error("host process is incompatible with hivemap's atomic root representation")]
    HostIncompatible,

    /// One or more workers failed; see the attached [`MemhiveGroupError`].
    #[error(transparent)]
    Workers(#[from] MemhiveGroupError),
}

/// The error a worker's `main` closure returns.
///
/// `Closed` is the graceful-shutdown path: it is what a worker naturally produces by
/// propagating a [`HiveError::ClosedQueue`] with `?`. Anything else, including a Rust
/// panic unwinding out of the closure, is treated as a crash and reported the same way.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// The worker observed a closed queue and is exiting cooperatively.
    #[error("queue is closed")]
    Closed,

    /// Any other application error raised by the worker's own logic.
    #[error("{0}")]
    Other(String),
}

impl From<HiveError> for WorkerError {
    fn from(err: HiveError) -> Self {
        match err {
            HiveError::ClosedQueue => WorkerError::Closed,
            other => WorkerError::Other(other.to_string()),
        }
    }
}

/// A single worker's failure, reduced to the `(kind, message, cause)` triple that can
/// cross a heap boundary without transplanting the original error type.
#[derive(Debug, Clone)]
pub struct WorkerFailure {
    /// worker id that failed
    pub worker_id: u64,
    /// a short, stable name for the failure's origin (a panic payload's type name, or
    /// the [`WorkerError`] variant name)
    pub kind: String,
    /// the human-readable failure text
    pub message: String,
    /// an optional chain of causes, outermost first
    pub cause: Vec<String>,
}

impl Display for WorkerFailure {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "worker {} ({}): {}", self.worker_id, self.kind, self.message)?;
        for cause in &self.cause {
            write!(f, "\n  caused by: {cause}")?;
        }
        Ok(())
    }
}

/// Raised by [`Hive::close`](crate::Hive::close) when one or more workers failed.
///
/// Its rendered form always carries the fixed framing text below, so that any worker
/// crash that propagated out of a `main()` closure is unambiguous in logs and test output.
#[derive(Debug)]
pub struct MemhiveGroupError {
    /// the failures collected from every worker that did not close cleanly
    pub failures: Vec<WorkerFailure>,
}

impl std::error::Error for MemhiveGroupError {}

impl Display for MemhiveGroupError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "unhandled exception during the main() worker call ({} worker(s) failed)",
            self.failures.len()
        )?;
        for failure in &self.failures {
            writeln!(f, "  - {failure}")?;
        }
        Ok(())
    }
}
