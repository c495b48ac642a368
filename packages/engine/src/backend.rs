//! External service boundaries consumed by the engine.
//!
//! [`DataStore`] and [`CoordinationMap`] are the two backing services this
//! whole system is built atop (see the specification's PURPOSE & SCOPE).
//! Concrete production implementations (a real durable, versioned KV
//! service; a real cluster-wide TTL map) are injected by the embedder and
//! are out of scope for this crate -- it ships only the trait boundary and,
//! behind `#[cfg(test)]`, the in-memory fakes its own test suite runs
//! against (see `test_support`).

use async_trait::async_trait;
use serde_json::Value;

/// What to do with a record's previous value inside a [`DataStore::update`]
/// mutator: keep it (returning `Some`) or delete the key (returning `None`).
pub type Mutator<'a> = dyn Fn(Option<Value>) -> Option<Value> + Send + Sync + 'a;

/// A request-budget category, used by [`DataStore::budget`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BudgetOp {
    /// Reading a single key.
    GetAsync,
    /// Writing a single key unconditionally.
    SetIncrementAsync,
    /// Conditional read-modify-write of a single key.
    UpdateAsync,
    /// Deleting a single key.
    RemoveAsync,
}

/// A single version entry returned by [`DataStore::list_versions`].
#[derive(Debug, Clone)]
pub struct VersionInfo {
    /// Opaque version identifier, passed to [`DataStore::get_version`].
    pub version_id: String,
    /// Milliseconds since epoch this version was written.
    pub created_at_ms: i64,
}

/// Pagination parameters for [`DataStore::list_versions`].
#[derive(Debug, Clone, Default)]
pub struct ListVersionsParams {
    /// Maximum number of versions to return.
    pub limit: Option<u32>,
    /// Opaque continuation cursor from a previous call.
    pub cursor: Option<String>,
}

/// The durable, size-limited, versioned key/value backing service.
///
/// Values are JSON-serializable. Every mutation method below goes through
/// the retry wrappers in [`crate::retry`] at the call site, not internally
/// -- this trait is the raw transport, not the resilience layer.
#[async_trait]
pub trait DataStore: Send + Sync {
    /// Reads the current value for `key`, or `None` if absent.
    async fn get(&self, key: &str) -> anyhow::Result<Option<Value>>;

    /// Unconditionally writes `value` for `key`.
    async fn set(&self, key: &str, value: Value, user_ids: Option<&[i64]>) -> anyhow::Result<()>;

    /// Conditionally updates `key`: `mutator` receives the current value (or
    /// `None`) and returns the next value (or `None` to delete). The update
    /// is atomic from the caller's point of view; implementations serialize
    /// concurrent updates to the same key internally.
    async fn update(
        &self,
        key: &str,
        mutator: &Mutator<'_>,
        user_ids: Option<&[i64]>,
    ) -> anyhow::Result<Option<Value>>;

    /// Deletes `key`. Deleting an absent key succeeds.
    async fn remove(&self, key: &str) -> anyhow::Result<()>;

    /// Lists prior versions of `key`, newest first.
    async fn list_versions(&self, key: &str, params: &ListVersionsParams) -> anyhow::Result<Vec<VersionInfo>>;

    /// Reads a specific prior version of `key`.
    async fn get_version(&self, key: &str, version_id: &str) -> anyhow::Result<Option<Value>>;

    /// Remaining request budget for `op`, used to pace retries/backoff.
    async fn budget(&self, op: BudgetOp) -> anyhow::Result<i64>;
}

/// The volatile, cluster-wide, TTL-expiring coordination map used for
/// lock leases.
#[async_trait]
pub trait CoordinationMap: Send + Sync {
    /// Reads the current value for `key`, or `None` if absent or expired.
    async fn get(&self, key: &str) -> anyhow::Result<Option<Value>>;

    /// Unconditionally sets `key` to `value`, expiring after `ttl_seconds`.
    async fn set(&self, key: &str, value: Value, ttl_seconds: u64) -> anyhow::Result<()>;

    /// Conditionally updates `key` via `mutator`, refreshing its TTL to
    /// `ttl_seconds` on success. `mutator` receives the current value (or
    /// `None` if absent/expired) and returns the next value, or `None` to
    /// leave the entry untouched (used to implement "only if unowned").
    async fn update(
        &self,
        key: &str,
        mutator: &Mutator<'_>,
        ttl_seconds: u64,
    ) -> anyhow::Result<Option<Value>>;

    /// Removes `key`.
    async fn remove(&self, key: &str) -> anyhow::Result<()>;
}
