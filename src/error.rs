//! Error types for mipcache.

use thiserror::Error;

/// Failure modes surfaced by the public cache entry operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// The render was cancelled. Partial work already published stays cached.
    #[error("render aborted")]
    Aborted,

    /// The operation cannot complete; the entry should be dropped and the
    /// render retried with a fresh one.
    #[error("cache operation failed: {0}")]
    Failed(String),

    /// The shared segment backing the entry state is exhausted.
    #[error("shared segment allocation failed")]
    BadAlloc,
}

/// Result type alias for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

impl CacheError {
    pub(crate) fn failed(msg: impl Into<String>) -> Self {
        CacheError::Failed(msg.into())
    }
}
