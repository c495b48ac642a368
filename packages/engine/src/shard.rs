//! I/O half of the sharded file codec: writing/fetching shard keys through
//! a [`DataStore`], concurrent shard fetch on decode, and cleanup of
//! partially written shards on failure. The pure byte-level half
//! (partitioning, compression, content-hashing) lives in
//! [`latchkv_core::shard`].

use futures::future::join_all;
use latchkv_core::error::StoreError;
use latchkv_core::record::RecordData;
use serde_json::Value;
use tracing::warn;

use crate::backend::DataStore;
use crate::retry::retry_data_store;

/// Encodes `value` for storage: inline if it fits within
/// `max_chunk_size - shard_reserve_bytes`, otherwise partitioned into
/// content-addressed shards written through `store`.
///
/// On any shard-write failure, already-written shards of this attempt are
/// removed before the error is returned -- no partial file is left behind.
///
/// # Errors
///
/// Returns [`StoreError::BackendTransient`]/[`StoreError::BackendFatal`] if
/// serialization or any shard write fails.
pub async fn encode(
    store: &dyn DataStore,
    store_name: &str,
    key: &str,
    value: &Value,
    max_chunk_size: usize,
    shard_reserve_bytes: usize,
    retry_max_attempts: u32,
) -> Result<RecordData, StoreError> {
    let serialized = serde_json::to_vec(value)
        .map_err(|err| StoreError::BackendFatal(anyhow::Error::new(err)))?;
    let effective_limit = max_chunk_size.saturating_sub(shard_reserve_bytes).max(1);

    if serialized.len() <= effective_limit {
        return Ok(RecordData::Inline(value.clone()));
    }

    let partitioned = latchkv_core::shard::partition(key, &serialized, effective_limit)
        .map_err(StoreError::BackendFatal)?;

    let mut written_keys = Vec::with_capacity(partitioned.shards.len());
    for (index, shard_bytes) in partitioned.shards.iter().enumerate() {
        let shard_key = latchkv_core::record::shard_key(store_name, &partitioned.file_id, index as u32);
        let encoded = serde_json::Value::String(base64_encode(shard_bytes));
        let write = retry_data_store("shard-write", retry_max_attempts, || {
            let shard_key = shard_key.clone();
            let encoded = encoded.clone();
            async move { store.set(&shard_key, encoded, None).await }
        })
        .await;

        match write {
            Ok(()) => written_keys.push(shard_key),
            Err(err) => {
                for key in &written_keys {
                    if let Err(cleanup_err) = store.remove(key).await {
                        warn!(shard_key = %key, error = %cleanup_err, "failed to clean up partially written shard");
                    }
                }
                return Err(err);
            }
        }
    }

    Ok(RecordData::File(latchkv_core::shard::file_ref_for(
        store_name,
        &partitioned.file_id,
        partitioned.shards.len(),
    )))
}

/// Decodes a [`RecordData`] back into its payload, fetching and
/// reassembling shards concurrently for a [`RecordData::File`].
///
/// # Errors
///
/// Returns [`StoreError::IncompleteShards`] if any shard is missing.
pub async fn decode(store: &dyn DataStore, data: &RecordData, retry_max_attempts: u32) -> Result<Value, StoreError> {
    match data {
        RecordData::Inline(value) => Ok(value.clone()),
        RecordData::File(file_ref) => {
            let fetches = file_ref.shards.iter().map(|shard_key| {
                let shard_key = shard_key.clone();
                async move {
                    retry_data_store("shard-read", retry_max_attempts, || {
                        let shard_key = shard_key.clone();
                        async move { store.get(&shard_key).await }
                    })
                    .await
                }
            });

            let results = join_all(fetches).await;
            let mut compressed = Vec::with_capacity(results.len());
            let mut found = 0usize;
            for result in results {
                match result? {
                    Some(Value::String(encoded)) => {
                        compressed.push(base64_decode(&encoded)?);
                        found += 1;
                    }
                    _ => compressed.push(Vec::new()),
                }
            }

            if found != file_ref.shards.len() {
                return Err(StoreError::IncompleteShards(file_ref.id.clone(), file_ref.shards.len(), found));
            }

            let bytes = latchkv_core::shard::reassemble(&compressed).map_err(StoreError::BackendFatal)?;
            serde_json::from_slice(&bytes).map_err(|err| StoreError::BackendFatal(anyhow::Error::new(err)))
        }
    }
}

/// Removes every shard referenced by `file_ref`. Used for orphan cleanup
/// after a save publishes a new `FileRef` and the previous one's shards
/// become unreachable.
pub async fn delete_shards(store: &dyn DataStore, shard_keys: &[String], retry_max_attempts: u32) -> Vec<String> {
    let mut failed = Vec::new();
    for shard_key in shard_keys {
        let result = retry_data_store("shard-delete", retry_max_attempts, || {
            let shard_key = shard_key.clone();
            async move { store.remove(&shard_key).await }
        })
        .await;
        if let Err(err) = result {
            warn!(shard_key = %shard_key, error = %err, "orphan shard deletion failed; will retry later");
            failed.push(shard_key.clone());
        }
    }
    failed
}

fn base64_encode(bytes: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

fn base64_decode(text: &str) -> Result<Vec<u8>, StoreError> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD
        .decode(text)
        .map_err(|err| StoreError::BackendFatal(anyhow::Error::new(err)))
}
