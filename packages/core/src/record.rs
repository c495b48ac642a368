//! Persisted record shapes and the DataStore key-path conventions.
//!
//! Mirrors the wire-stable layout fixed in the specification:
//!
//! - `records/<storeName>/<userKey>` -> [`Record`]
//! - `shards/<storeName>/<fileId>-<index>` -> compressed shard bytes
//! - `tx/<storeName>/<txId>` -> [`TxMarker`]
//! - `locks/<storeName>/<userKey>` -> opaque lease id (see `latchkv_engine::lock`)

use serde::{Deserialize, Serialize};

/// The `data` field of a [`Record`]: either the payload inline, or a
/// reference to a sharded file when the payload exceeded the inline reserve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordData {
    /// Payload small enough to store directly in the record.
    Inline(serde_json::Value),
    /// Payload stored as content-addressed shards.
    File(FileRef),
}

/// Reference to a sharded payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRef {
    /// Content-derived identifier shared by every shard of this file.
    pub id: String,
    /// Shard keys, in order (`"<id>-0"`, `"<id>-1"`, ...).
    pub shards: Vec<String>,
    /// Number of shards. Invariant: `shards.len() == count`.
    pub count: u32,
}

/// The durable, top-level per-key object stored under `records/<storeName>/<userKey>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    /// Inline payload or file reference.
    pub data: RecordData,
    /// Ordered list of migration names already applied to `data`.
    #[serde(default)]
    pub applied_migrations: Vec<String>,
    /// Transaction id this record is mid-commit for, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_tx: Option<String>,
    /// Shard ids superseded by the current `data` and awaiting deletion.
    #[serde(default)]
    pub orphans: Vec<String>,
    /// Integer identifiers associated with this key, passed through to the
    /// backing DataStore for its own tagging purposes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_ids: Option<Vec<i64>>,
}

impl Record {
    /// Builds a fresh record with no applied migrations, no pending
    /// transaction, and no orphans.
    #[must_use]
    pub fn new(data: RecordData, user_ids: Option<Vec<i64>>) -> Self {
        Self {
            data,
            applied_migrations: Vec::new(),
            pending_tx: None,
            orphans: Vec::new(),
            user_ids,
        }
    }

    /// Whether `data` is a file reference whose `count` does not match the
    /// number of listed shard keys. Per the data-model invariants, a record
    /// with a mismatched count must never be trusted by a reader.
    #[must_use]
    pub fn has_malformed_file_ref(&self) -> bool {
        match &self.data {
            RecordData::File(file_ref) => file_ref.shards.len() != file_ref.count as usize,
            RecordData::Inline(_) => false,
        }
    }
}

/// The value stored under `tx/<storeName>/<txId>`.
///
/// Absence of the key (a `None` from `DataStore::get`) means "not committed";
/// presence with this value means "committed". There is no other variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxMarker {
    /// All participants must adopt their pending write.
    #[serde(rename = "committed")]
    Committed,
}

/// Builds the DataStore key for a record.
#[must_use]
pub fn record_key(store_name: &str, user_key: &str) -> String {
    format!("records/{store_name}/{user_key}")
}

/// Builds the DataStore key for a single shard.
#[must_use]
pub fn shard_key(store_name: &str, file_id: &str, index: u32) -> String {
    format!("shards/{store_name}/{file_id}-{index}")
}

/// Builds the DataStore key for a transaction marker.
#[must_use]
pub fn tx_key(store_name: &str, tx_id: &str) -> String {
    format!("tx/{store_name}/{tx_id}")
}

/// Builds the coordination-map key for a lock entry.
#[must_use]
pub fn lock_key(store_name: &str, user_key: &str) -> String {
    format!("locks/{store_name}/{user_key}")
}
