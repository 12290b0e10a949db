//! Error types for the selector cache.

use thiserror::Error;

/// Convenience result type used throughout the cache.
pub type CacheResult<T, E = CacheError> = std::result::Result<T, E>;

/// Errors surfaced by the cache.
///
/// Row-level problems (malformed token JSON, an unparsable stored key) are
/// never represented here: those rows are skipped and logged. The tiered
/// layer absorbs transient storage errors; callers see construction-time
/// configuration errors, explicit close errors, and the final failure of a
/// wrapped operation once every fallback is exhausted.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Storage read/write/transaction failure. The cache remains usable and
    /// the caller may retry. A database that fails its integrity probe on
    /// open is quarantined and recreated instead of surfacing here.
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),
    /// Filesystem failure while preparing or quarantining the database.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Serialization/deserialization failure for a value the caller handed
    /// in (stored rows that fail to decode are skipped instead).
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// Rejected configuration at construction.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// A wrapped selector operation failed after exhausting every fallback.
    /// Per-attempt timeouts surface here through the last failure message.
    #[error("operation failed after {attempts} selector(s): {message}")]
    OperationFailed {
        /// Number of selector candidates attempted.
        attempts: usize,
        /// The last underlying failure.
        message: String,
    },
    /// The cache was already closed.
    #[error("cache is closed")]
    Closed,
}
