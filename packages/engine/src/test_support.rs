//! In-memory fakes for [`crate::backend::DataStore`] and
//! [`crate::backend::CoordinationMap`], used only by this crate's own test
//! suite.
//!
//! Grounded on the tower-sesh `tests-support.rs` fake-store pattern: a
//! `parking_lot::Mutex`-guarded map behind an `async_trait` impl, with no
//! attempt to simulate real backend latency or partial failure. These are
//! not shipped as production mocks -- production embedders bring their own
//! `DataStore`/`CoordinationMap`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::time::Instant;

use crate::backend::{BudgetOp, CoordinationMap, DataStore, ListVersionsParams, Mutator, VersionInfo};

struct CoordinationEntry {
    value: Value,
    expires_at: Option<Instant>,
}

/// An in-memory [`CoordinationMap`] with real TTL expiry against the tokio
/// clock (works under `#[tokio::test(start_paused = true)]`).
#[derive(Default)]
pub struct InMemoryCoordinationMap {
    entries: Mutex<HashMap<String, CoordinationEntry>>,
}

impl InMemoryCoordinationMap {
    /// Creates an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Test-only backdoor: sets `key` to `value` with no expiry, bypassing
    /// the usual CAS `update` path. Used to simulate another process
    /// stealing a lease out from under the current holder.
    pub async fn force_set(&self, key: &str, value: Value) {
        self.entries.lock().insert(key.to_string(), CoordinationEntry { value, expires_at: None });
    }

    fn live(&self, entry: &CoordinationEntry) -> bool {
        match entry.expires_at {
            Some(at) => at > Instant::now(),
            None => true,
        }
    }
}

#[async_trait]
impl CoordinationMap for InMemoryCoordinationMap {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Value>> {
        let entries = self.entries.lock();
        Ok(entries.get(key).filter(|e| self.live(e)).map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: Value, ttl_seconds: u64) -> anyhow::Result<()> {
        let expires_at = Some(Instant::now() + std::time::Duration::from_secs(ttl_seconds));
        self.entries.lock().insert(key.to_string(), CoordinationEntry { value, expires_at });
        Ok(())
    }

    async fn update(&self, key: &str, mutator: &Mutator<'_>, ttl_seconds: u64) -> anyhow::Result<Option<Value>> {
        let mut entries = self.entries.lock();
        let current = entries.get(key).filter(|e| self.live(e)).map(|e| e.value.clone());
        match mutator(current.clone()) {
            Some(next) => {
                let expires_at = Some(Instant::now() + std::time::Duration::from_secs(ttl_seconds));
                entries.insert(key.to_string(), CoordinationEntry { value: next.clone(), expires_at });
                Ok(Some(next))
            }
            None => Ok(current),
        }
    }

    async fn remove(&self, key: &str) -> anyhow::Result<()> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

struct StoredRecord {
    current: Value,
    versions: Vec<(String, Value, i64)>,
}

/// An in-memory [`DataStore`] that keeps every version ever written.
pub struct InMemoryDataStore {
    entries: Mutex<HashMap<String, StoredRecord>>,
    next_version: AtomicU64,
    clock_ms: AtomicU64,
}

impl Default for InMemoryDataStore {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            next_version: AtomicU64::new(1),
            clock_ms: AtomicU64::new(0),
        }
    }
}

impl InMemoryDataStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn record_version(&self, entries: &mut HashMap<String, StoredRecord>, key: &str, value: Value) {
        let created_at_ms = self.clock_ms.fetch_add(1, Ordering::SeqCst) as i64;
        let version_id = format!("v{}", self.next_version.fetch_add(1, Ordering::SeqCst));
        let entry = entries.entry(key.to_string()).or_insert_with(|| StoredRecord {
            current: Value::Null,
            versions: Vec::new(),
        });
        entry.current = value.clone();
        entry.versions.push((version_id, value, created_at_ms));
    }
}

#[async_trait]
impl DataStore for InMemoryDataStore {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Value>> {
        Ok(self.entries.lock().get(key).map(|e| e.current.clone()))
    }

    async fn set(&self, key: &str, value: Value, _user_ids: Option<&[i64]>) -> anyhow::Result<()> {
        let mut entries = self.entries.lock();
        self.record_version(&mut entries, key, value);
        Ok(())
    }

    async fn update(
        &self,
        key: &str,
        mutator: &Mutator<'_>,
        _user_ids: Option<&[i64]>,
    ) -> anyhow::Result<Option<Value>> {
        let mut entries = self.entries.lock();
        let current = entries.get(key).map(|e| e.current.clone());
        match mutator(current) {
            Some(next) => {
                self.record_version(&mut entries, key, next.clone());
                Ok(Some(next))
            }
            None => {
                entries.remove(key);
                Ok(None)
            }
        }
    }

    async fn remove(&self, key: &str) -> anyhow::Result<()> {
        self.entries.lock().remove(key);
        Ok(())
    }

    async fn list_versions(&self, key: &str, params: &ListVersionsParams) -> anyhow::Result<Vec<VersionInfo>> {
        let entries = self.entries.lock();
        let Some(record) = entries.get(key) else {
            return Ok(Vec::new());
        };
        let mut versions: Vec<VersionInfo> = record
            .versions
            .iter()
            .rev()
            .map(|(id, _, created_at_ms)| VersionInfo { version_id: id.clone(), created_at_ms: *created_at_ms })
            .collect();
        if let Some(cursor) = &params.cursor {
            if let Some(pos) = versions.iter().position(|v| &v.version_id == cursor) {
                versions = versions.split_off(pos + 1);
            }
        }
        if let Some(limit) = params.limit {
            versions.truncate(limit as usize);
        }
        Ok(versions)
    }

    async fn get_version(&self, key: &str, version_id: &str) -> anyhow::Result<Option<Value>> {
        let entries = self.entries.lock();
        Ok(entries
            .get(key)
            .and_then(|record| record.versions.iter().find(|(id, _, _)| id == version_id))
            .map(|(_, value, _)| value.clone()))
    }

    async fn budget(&self, _op: BudgetOp) -> anyhow::Result<i64> {
        Ok(i64::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn coordination_map_update_only_if_unowned() {
        let map = InMemoryCoordinationMap::new();
        let first = map
            .update("k", &|current: Option<Value>| if current.is_none() { Some(json!("a")) } else { None }, 90)
            .await
            .unwrap();
        assert_eq!(first, Some(json!("a")));

        let second = map
            .update("k", &|current: Option<Value>| if current.is_none() { Some(json!("b")) } else { None }, 90)
            .await
            .unwrap();
        assert_eq!(second, Some(json!("a")));
    }

    #[tokio::test(start_paused = true)]
    async fn coordination_map_entry_expires_after_ttl() {
        let map = InMemoryCoordinationMap::new();
        map.set("k", json!("v"), 1).await.unwrap();
        assert!(map.get("k").await.unwrap().is_some());
        tokio::time::advance(std::time::Duration::from_secs(2)).await;
        assert!(map.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn data_store_list_versions_newest_first() {
        let store = InMemoryDataStore::new();
        store.set("k", json!(1), None).await.unwrap();
        store.set("k", json!(2), None).await.unwrap();
        store.set("k", json!(3), None).await.unwrap();

        let versions = store.list_versions("k", &ListVersionsParams::default()).await.unwrap();
        assert_eq!(versions.len(), 3);

        let latest = store.get_version("k", &versions[0].version_id).await.unwrap();
        assert_eq!(latest, Some(json!(3)));
    }

    #[tokio::test]
    async fn data_store_update_delete_on_none() {
        let store = InMemoryDataStore::new();
        store.set("k", json!(1), None).await.unwrap();
        let result = store.update("k", &|_current| None, None).await.unwrap();
        assert_eq!(result, None);
        assert_eq!(store.get("k").await.unwrap(), None);
    }
}
