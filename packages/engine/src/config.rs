//! Per-store configuration, mirroring the shape of the donor `ServerConfig`:
//! a plain `Clone`able struct with a `Default` impl, overridden field-by-field
//! at construction (`StoreConfig { name, template, ..StoreConfig::default() }`).

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use latchkv_core::{AcceptAll, MigrationChain, SchemaCheck};
use serde_json::Value;

/// Fetches a legacy record for a key absent from the store, for one-time
/// backfill on first load. Returning `None` falls back to `StoreConfig::template`.
pub type LegacyImporter =
    Arc<dyn Fn(&str) -> Pin<Box<dyn Future<Output = Option<Value>> + Send>> + Send + Sync>;

/// Configuration for one [`crate::store::Store`] instance.
#[derive(Clone)]
pub struct StoreConfig {
    /// Key-scope name, used as the coordination-map and shard-key prefix.
    pub name: String,
    /// Value used for a key's first `load()` when no record and no
    /// [`import_legacy_data`](Self::import_legacy_data) result exist.
    pub template: Value,
    /// Validator run after every `setData`/`update`/migration.
    pub schema_check: Arc<dyn SchemaCheck>,
    /// Append-only chain of data migrations applied on load.
    pub migrations: MigrationChain,
    /// Optional one-time backfill hook for keys with no existing record.
    pub import_legacy_data: Option<LegacyImporter>,
    /// How long a lock lease is valid without a successful refresh.
    pub lease_ttl: Duration,
    /// How often a held lease is refreshed.
    pub lease_refresh_interval: Duration,
    /// How long lease acquisition waits for contention to clear.
    pub lease_acquire_deadline: Duration,
    /// Interval between automatic `save()` calls on a dirty session.
    pub autosave_interval: Duration,
    /// Wall-clock bound on a single queued session operation.
    pub queue_item_timeout: Duration,
    /// Largest inline record payload, in bytes, before it moves to sharded files.
    pub max_chunk_size: usize,
    /// Reserve subtracted from `max_chunk_size` before sharding kicks in.
    pub shard_reserve_bytes: usize,
    /// Maximum attempts (including the first) for a [`crate::retry`] loop.
    pub retry_max_attempts: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            template: Value::Null,
            schema_check: Arc::new(AcceptAll),
            migrations: MigrationChain::empty(),
            import_legacy_data: None,
            lease_ttl: Duration::from_secs(90),
            lease_refresh_interval: Duration::from_secs(60),
            lease_acquire_deadline: Duration::from_secs(30),
            autosave_interval: Duration::from_secs(5 * 60),
            queue_item_timeout: Duration::from_secs(60),
            max_chunk_size: latchkv_core::MAX_CHUNK_SIZE,
            shard_reserve_bytes: latchkv_core::SHARD_RESERVE_BYTES,
            retry_max_attempts: 5,
        }
    }
}
