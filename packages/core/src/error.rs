//! Caller-facing error kinds for the key/value store.
//!
//! `StoreError` is the single error type returned by every public operation
//! on `Session`, `Store`, and the transaction coordinator. Backend traits
//! themselves return `anyhow::Result<T>` (see `latchkv_engine::backend`);
//! the retry wrappers convert retry-exhaustion into `BackendTransient`.

use thiserror::Error;

/// Errors surfaced to callers of the store's public API.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store has been closed; no further operations are accepted.
    #[error("store is closed")]
    StoreClosed,

    /// `get`/`update`/`save` called for a key with no loaded session.
    #[error("key {0:?} is not loaded")]
    KeyNotLoaded(String),

    /// `load` called for a key that already has a load in progress.
    #[error("load already in progress for key {0:?}")]
    LoadInProgress(String),

    /// An in-flight `load` was cancelled by a concurrent `unload` or `close`.
    #[error("load of key {0:?} was cancelled")]
    LoadCancelled(String),

    /// The lease for a key could not be acquired before the configured deadline.
    #[error("lock unavailable for key {0:?}")]
    LockUnavailable(String),

    /// The session's lease was stolen or expired; the session is now closed.
    #[error("lock lost for key {0:?}")]
    LockLost(String),

    /// A mutation failed schema validation.
    #[error("schema validation failed: {0}")]
    SchemaInvalid(String),

    /// `update`'s transform closure panicked-equivalent: returned something
    /// other than a boolean decision (modeled in Rust as a transform that
    /// itself returned `Err`).
    #[error("transform rejected: {0}")]
    BadTransform(String),

    /// A transaction's participant key set was mutated by a concurrent write
    /// between the snapshot and the commit attempt.
    #[error("transaction keys were modified concurrently")]
    TxKeysModified,

    /// A crash-recovered transaction's prior version could not be restored.
    #[error("transaction recovery failed for key {0:?}: prior version unavailable")]
    TxRecoveryFailed(String),

    /// The record's `appliedMigrations` list is not a valid prefix of the
    /// configured migration chain.
    #[error("migration chain mismatch for key {0:?}: {1}")]
    MigrationMismatch(String, String),

    /// A sharded record is missing one or more of its shards.
    #[error("incomplete shard set for key {0:?}: expected {expected}, found {found}", expected = .1, found = .2)]
    IncompleteShards(String, usize, usize),

    /// The session is no longer `Active` (unloading, closed, or lock-lost).
    #[error("session for key {0:?} is closed")]
    SessionClosed(String),

    /// Retryable backend error exhausted its retry budget.
    #[error("backend call failed after exhausting retries: {0}")]
    BackendTransient(#[source] anyhow::Error),

    /// Non-retryable backend error.
    #[error("backend call failed: {0}")]
    BackendFatal(#[source] anyhow::Error),
}

impl StoreError {
    /// Whether this error closed the session it originated from.
    #[must_use]
    pub fn is_terminal_for_session(&self) -> bool {
        matches!(self, Self::LockLost(_) | Self::SessionClosed(_))
    }
}
