//! Optimistic-concurrency primitives shared by the data store.
//!
//! Claims and state transitions on jobs and sessions race across worker
//! processes. Rather than holding an in-memory lock (which would be
//! meaningless across processes) every mutating store method returns a
//! [`StoreError`] that distinguishes "someone else changed this first" from
//! "the backend itself failed".

/// Errors from a storage operation that may race with other writers.
///
/// The distinction matters: [`StoreError::Conflict`] is expected under
/// concurrency and the caller should simply move on to the next candidate
/// row. [`StoreError::Backend`] is a system-level failure and should
/// propagate.
#[derive(Debug)]
pub enum StoreError {
    /// Another writer claimed or mutated the row first.
    Conflict,
    /// The storage backend itself failed (connection, timeout, serialization).
    Backend(anyhow::Error),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Conflict => write!(f, "revision conflict: row was modified concurrently"),
            StoreError::Backend(e) => write!(f, "storage backend error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Conflict => None,
            StoreError::Backend(e) => Some(e.as_ref()),
        }
    }
}

impl From<anyhow::Error> for StoreError {
    fn from(err: anyhow::Error) -> Self {
        StoreError::Backend(err)
    }
}
