//! Error types for Keystone operations

use crate::entity::EntityKey;
use std::time::Duration;
use thiserror::Error;

/// Backing-store layer errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Entity not found: {key}")]
    NotFound { key: EntityKey },

    #[error("Duplicate key on insert: {key}")]
    DuplicateKey { key: EntityKey },

    #[error("Concurrency conflict on {key}: stored stamp '{stored}' != expected '{expected}'")]
    ConcurrencyConflict {
        key: EntityKey,
        stored: String,
        expected: String,
    },

    #[error("Row {key} is write-locked by an uncommitted transaction")]
    RowBusy { key: EntityKey },

    #[error("Unit of work already completed or rolled back")]
    TransactionClosed,

    #[error("Stamp persistence failed for {key}: {reason}")]
    PersistFailed { key: EntityKey, reason: String },

    #[error("Backend error: {reason}")]
    Backend { reason: String },
}

/// Cache protocol errors surfaced to repository callers.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    /// A reader raced an in-flight write and the reconciliation probe could
    /// not resolve it. Recovered by one bounded caller-side retry, else
    /// surfaced.
    #[error("Entity {key} is changing; the in-flight write has not completed")]
    EntityChanging { key: EntityKey },

    /// A second writer announced a write while one was still outstanding and
    /// the bounded wait expired.
    #[error("A write is already in flight for {key} (waited {waited:?})")]
    WriteInFlight { key: EntityKey, waited: Duration },

    #[error("Distributed lock '{name}' not acquired within {timeout:?}")]
    LockTimeout { name: String, timeout: Duration },

    #[error("Entity not found: {key}")]
    NotFound { key: EntityKey },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Result type alias for backing-store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Result type alias for cache protocol operations.
pub type KeystoneResult<T> = Result<T, CacheError>;

// =============================================================================
// TESTS
// =============================================================================
