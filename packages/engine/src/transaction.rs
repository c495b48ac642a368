//! Two-phase multi-key transaction coordinator and crash recovery for
//! pending transactions found on load. See SPEC_FULL.md §4.9.
//!
//! A single marker key, `tx/<storeName>/<txId>`, is the linearization point:
//! every participant's record is written with `pendingTx` set *before* the
//! marker exists, and the marker's existence is the only fact that decides
//! whether a crash recovered mid-commit should keep or discard those writes.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use latchkv_core::error::StoreError;
use latchkv_core::record::{Record, RecordData, TxMarker};
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use crate::backend::{DataStore, ListVersionsParams};
use crate::queue::multi_add;
use crate::retry::retry_data_store;
use crate::session::{MetaSnapshot, Session};
use crate::shard;

/// Runs `f` with a simultaneous head-of-queue position on every session in
/// `sessions`, committing all of their records atomically or none at all.
///
/// `f` receives a snapshot of every participant's current data keyed by
/// session key, and returns either `None` (abort, no writes) or `Some` of
/// the replacement values. The returned map's key set must match the
/// snapshot's exactly.
///
/// A single-key call degrades to a plain conditional write with no marker.
///
/// # Errors
///
/// Returns [`StoreError::TxKeysModified`] if `f`'s returned key set differs
/// from the snapshot's, [`StoreError::SchemaInvalid`] if any replacement
/// value fails its session's schema, [`StoreError::LockLost`] if any
/// participant's lease was lost mid-commit, or a backend error from any
/// write.
pub async fn tx<F>(
    store_name: &str,
    datastore: Arc<dyn DataStore>,
    sessions: &[Arc<Session>],
    retry_max_attempts: u32,
    f: F,
) -> Result<bool, StoreError>
where
    F: FnOnce(HashMap<String, Value>) -> Option<HashMap<String, Value>> + Send + 'static,
{
    let store_name = store_name.to_string();
    let session_refs: Vec<Arc<Session>> = sessions.to_vec();
    let queues: Vec<&crate::queue::SerialQueue> = session_refs.iter().map(|s| s.queue()).collect();
    let sessions_for_closure = session_refs.clone();

    multi_add(&queues, move || async move {
        run_tx(&store_name, datastore, &sessions_for_closure, retry_max_attempts, f).await
    })
    .await
}

struct Participant {
    session: Arc<Session>,
    meta: MetaSnapshot,
    new_data: RecordData,
    old_shard_keys: Vec<String>,
    orphans: Vec<String>,
}

async fn run_tx<F>(
    store_name: &str,
    datastore: Arc<dyn DataStore>,
    sessions: &[Arc<Session>],
    retry_max_attempts: u32,
    f: F,
) -> Result<bool, StoreError>
where
    F: FnOnce(HashMap<String, Value>) -> Option<HashMap<String, Value>>,
{
    let mut snapshot = HashMap::with_capacity(sessions.len());
    for session in sessions {
        snapshot.insert(session.key().to_string(), (*session.get()?).clone());
    }
    let original_keys: HashSet<&String> = snapshot.keys().collect();

    let Some(next_state) = f(snapshot) else {
        return Ok(false);
    };

    let next_keys: HashSet<&String> = next_state.keys().collect();
    if next_keys != original_keys {
        return Err(StoreError::TxKeysModified);
    }

    let multi_key = sessions.len() > 1;
    let tx_id = Uuid::new_v4().to_string();
    let mut committed: Vec<Participant> = Vec::with_capacity(sessions.len());

    for session in sessions {
        let new_value = next_state
            .get(session.key())
            .cloned()
            .expect("key set verified equal to snapshot above");
        session.validate(&new_value)?;

        let meta = session.meta_snapshot();
        let new_data = shard::encode(
            datastore.as_ref(),
            store_name,
            session.key(),
            &new_value,
            session.max_chunk_size(),
            session.shard_reserve_bytes(),
            retry_max_attempts,
        )
        .await?;

        let old_shard_keys = match &meta.persisted_data {
            RecordData::File(file_ref) => file_ref.shards.clone(),
            RecordData::Inline(_) => Vec::new(),
        };
        let mut orphans = meta.orphans.clone();
        orphans.extend(old_shard_keys.iter().cloned());

        let record = Record {
            data: new_data.clone(),
            applied_migrations: meta.applied_migrations.clone(),
            pending_tx: if multi_key { Some(tx_id.clone()) } else { None },
            orphans: orphans.clone(),
            user_ids: meta.user_ids.clone(),
        };
        let record_value =
            serde_json::to_value(&record).map_err(|err| StoreError::BackendFatal(anyhow::Error::new(err)))?;
        let record_key = latchkv_core::record::record_key(store_name, session.key());

        let aborted = Arc::new(AtomicBool::new(false));
        let lease_lost = session.lease_lost_handle();
        let write_result = retry_data_store("tx-participant-write", retry_max_attempts, || {
            let datastore = datastore.clone();
            let record_key = record_key.clone();
            let record_value = record_value.clone();
            let aborted = aborted.clone();
            let lease_lost = lease_lost.clone();
            async move {
                datastore
                    .update(
                        &record_key,
                        &move |current: Option<Value>| {
                            if lease_lost.load(Ordering::SeqCst) {
                                aborted.store(true, Ordering::SeqCst);
                                return current;
                            }
                            Some(record_value.clone())
                        },
                        None,
                    )
                    .await
            }
        })
        .await;

        if aborted.load(Ordering::SeqCst) {
            revert(store_name, datastore.as_ref(), &committed, retry_max_attempts).await;
            return Err(StoreError::LockLost(session.key().to_string()));
        }
        if let Err(err) = write_result {
            revert(store_name, datastore.as_ref(), &committed, retry_max_attempts).await;
            return Err(err);
        }

        committed.push(Participant { session: session.clone(), meta, new_data, old_shard_keys, orphans });
    }

    if multi_key {
        let marker_key = latchkv_core::record::tx_key(store_name, &tx_id);
        let marker_value =
            serde_json::to_value(TxMarker::Committed).map_err(|err| StoreError::BackendFatal(anyhow::Error::new(err)))?;
        let marker_result = retry_data_store("tx-marker-write", retry_max_attempts, || {
            let datastore = datastore.clone();
            let marker_key = marker_key.clone();
            let marker_value = marker_value.clone();
            async move { datastore.set(&marker_key, marker_value, None).await }
        })
        .await;
        if let Err(err) = marker_result {
            revert(store_name, datastore.as_ref(), &committed, retry_max_attempts).await;
            return Err(err);
        }
    }

    // Past this point every participant's write is durable and the marker
    // (if any) is committed -- a crash here is recovered on next load via
    // `recover_pending_record`, not by anything below.
    for participant in committed {
        let new_value = next_state
            .get(participant.session.key())
            .cloned()
            .expect("key set verified equal to snapshot above");
        participant.session.commit_tx_result(participant.new_data.clone(), new_value);

        if multi_key {
            clear_pending_tx(store_name, datastore.as_ref(), &participant, retry_max_attempts).await;
        }

        if !participant.old_shard_keys.is_empty() {
            let _ = shard::delete_shards(datastore.as_ref(), &participant.old_shard_keys, retry_max_attempts).await;
        }
    }

    Ok(true)
}

async fn clear_pending_tx(store_name: &str, datastore: &dyn DataStore, participant: &Participant, retry_max_attempts: u32) {
    let record_key = latchkv_core::record::record_key(store_name, participant.session.key());
    let cleared = Record {
        data: participant.new_data.clone(),
        applied_migrations: participant.meta.applied_migrations.clone(),
        pending_tx: None,
        orphans: participant.orphans.clone(),
        user_ids: participant.meta.user_ids.clone(),
    };
    let Ok(cleared_value) = serde_json::to_value(&cleared) else { return };

    let result = retry_data_store("tx-clear-pending", retry_max_attempts, || {
        let record_key = record_key.clone();
        let cleared_value = cleared_value.clone();
        async move { datastore.set(&record_key, cleared_value, None).await }
    })
    .await;
    if let Err(err) = result {
        warn!(
            key = participant.session.key(),
            error = %err,
            "failed to clear pendingTx after commit; will be recovered on next load"
        );
    }
}

/// Reverts every already-written participant: removes this attempt's
/// newly-written shards and restores the pre-transaction record.
async fn revert(store_name: &str, datastore: &dyn DataStore, committed: &[Participant], retry_max_attempts: u32) {
    for participant in committed {
        if let RecordData::File(file_ref) = &participant.new_data {
            let _ = shard::delete_shards(datastore, &file_ref.shards, retry_max_attempts).await;
        }
        let record_key = latchkv_core::record::record_key(store_name, participant.session.key());
        let restored = Record {
            data: participant.meta.persisted_data.clone(),
            applied_migrations: participant.meta.applied_migrations.clone(),
            pending_tx: None,
            orphans: participant.meta.orphans.clone(),
            user_ids: participant.meta.user_ids.clone(),
        };
        let Ok(restored_value) = serde_json::to_value(&restored) else { continue };
        let result = retry_data_store("tx-revert", retry_max_attempts, || {
            let record_key = record_key.clone();
            let restored_value = restored_value.clone();
            async move { datastore.set(&record_key, restored_value, None).await }
        })
        .await;
        if let Err(err) = result {
            warn!(key = participant.session.key(), error = %err, "failed to revert aborted transaction participant");
        }
    }
}

/// Resolves a record found on load with a non-`None` `pendingTx`: consults
/// the transaction marker to decide whether the pending write is authoritative
/// or must be rolled back to the prior version.
///
/// # Errors
///
/// Returns [`StoreError::TxRecoveryFailed`] if the marker is absent and no
/// prior version exists to restore.
pub async fn recover_pending_record(
    datastore: &dyn DataStore,
    store_name: &str,
    key: &str,
    record: Record,
    retry_max_attempts: u32,
) -> Result<Record, StoreError> {
    let tx_id = record.pending_tx.clone().expect("caller checked pending_tx is Some");
    let marker_key = latchkv_core::record::tx_key(store_name, &tx_id);
    let marker = retry_data_store("tx-marker-read", retry_max_attempts, || {
        let marker_key = marker_key.clone();
        async move { datastore.get(&marker_key).await }
    })
    .await?;

    if marker.is_some() {
        // Committed: this record is authoritative as written. Finish the
        // cleanup the crash interrupted -- clear pendingTx durably so a
        // second crash-recovery pass doesn't re-walk this path.
        let record_key = latchkv_core::record::record_key(store_name, key);
        let cleared = Record { pending_tx: None, ..record.clone() };
        if let Ok(cleared_value) = serde_json::to_value(&cleared) {
            let result = retry_data_store("tx-recovery-clear", retry_max_attempts, || {
                let record_key = record_key.clone();
                let cleared_value = cleared_value.clone();
                async move { datastore.set(&record_key, cleared_value, None).await }
            })
            .await;
            if let Err(err) = result {
                warn!(key, error = %err, "failed to clear pendingTx during load recovery; will retry next load");
            }
        }
        return Ok(cleared);
    }

    // Not committed: the marker write never landed, so this record's
    // pending write must be discarded in favor of the version beneath it.
    let record_key = latchkv_core::record::record_key(store_name, key);
    let versions = retry_data_store("tx-recovery-list-versions", retry_max_attempts, || {
        let record_key = record_key.clone();
        async move { datastore.list_versions(&record_key, &ListVersionsParams::default()).await }
    })
    .await?;

    // `versions[0]` is the current (pending) write; the prior committed
    // state is the one beneath it.
    let Some(prior) = versions.get(1) else {
        return Err(StoreError::TxRecoveryFailed(key.to_string()));
    };

    let prior_value = retry_data_store("tx-recovery-read-version", retry_max_attempts, || {
        let record_key = record_key.clone();
        let version_id = prior.version_id.clone();
        async move { datastore.get_version(&record_key, &version_id).await }
    })
    .await?;

    let Some(prior_value) = prior_value else {
        return Err(StoreError::TxRecoveryFailed(key.to_string()));
    };

    let prior_record: Record =
        serde_json::from_value(prior_value).map_err(|err| StoreError::BackendFatal(anyhow::Error::new(err)))?;

    let restored = Record { pending_tx: None, ..prior_record };
    if let Ok(restored_value) = serde_json::to_value(&restored) {
        let result = retry_data_store("tx-recovery-restore", retry_max_attempts, || {
            let record_key = record_key.clone();
            let restored_value = restored_value.clone();
            async move { datastore.set(&record_key, restored_value, None).await }
        })
        .await;
        if let Err(err) = result {
            warn!(key, error = %err, "failed to restore prior version during load recovery");
        }
    }

    Ok(restored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::CoordinationMap;
    use crate::config::StoreConfig;
    use crate::lock::LockManager;
    use crate::test_support::{InMemoryCoordinationMap, InMemoryDataStore};
    use latchkv_core::schema::AcceptAll;
    use serde_json::json;
    use std::time::Duration;

    async fn load_session(
        lock_manager: &LockManager,
        datastore: &Arc<dyn DataStore>,
        key: &str,
        initial: Value,
    ) -> Arc<Session> {
        let lease = lock_manager
            .acquire(key, Duration::from_secs(90), Duration::from_secs(60), Duration::from_secs(5))
            .await
            .unwrap();
        let config = StoreConfig { schema_check: Arc::new(AcceptAll), ..StoreConfig::default() };
        Session::new(
            key.to_string(),
            "players".to_string(),
            initial,
            RecordData::Inline(Value::Null),
            Vec::new(),
            Vec::new(),
            None,
            lease,
            datastore.clone(),
            &config,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn two_key_transfer_commits_atomically() {
        let datastore: Arc<dyn DataStore> = Arc::new(InMemoryDataStore::new());
        let coordination: Arc<dyn CoordinationMap> = Arc::new(InMemoryCoordinationMap::new());
        let lock_manager = LockManager::new("players", coordination);

        let a = load_session(&lock_manager, &datastore, "a", json!({ "coins": 100 })).await;
        let b = load_session(&lock_manager, &datastore, "b", json!({ "coins": 0 })).await;

        let committed = tx(
            "players",
            datastore.clone(),
            &[a.clone(), b.clone()],
            5,
            move |mut state| {
                let a_coins = state.get("a")?["coins"].as_i64()?;
                if a_coins < 50 {
                    return None;
                }
                state.insert("a".to_string(), json!({ "coins": a_coins - 50 }));
                state.insert("b".to_string(), json!({ "coins": 50 }));
                Some(state)
            },
        )
        .await
        .unwrap();

        assert!(committed);
        assert_eq!(a.get().unwrap()["coins"], json!(50));
        assert_eq!(b.get().unwrap()["coins"], json!(50));
    }

    #[tokio::test(start_paused = true)]
    async fn aborting_returns_false_with_no_writes() {
        let datastore: Arc<dyn DataStore> = Arc::new(InMemoryDataStore::new());
        let coordination: Arc<dyn CoordinationMap> = Arc::new(InMemoryCoordinationMap::new());
        let lock_manager = LockManager::new("players", coordination);

        let a = load_session(&lock_manager, &datastore, "a", json!({ "coins": 10 })).await;
        let b = load_session(&lock_manager, &datastore, "b", json!({ "coins": 0 })).await;

        let committed = tx("players", datastore.clone(), &[a.clone(), b.clone()], 5, |_state| None).await.unwrap();

        assert!(!committed);
        assert_eq!(a.get().unwrap()["coins"], json!(10));
        assert_eq!(b.get().unwrap()["coins"], json!(0));
    }

    #[tokio::test(start_paused = true)]
    async fn modifying_key_set_fails_with_tx_keys_modified() {
        let datastore: Arc<dyn DataStore> = Arc::new(InMemoryDataStore::new());
        let coordination: Arc<dyn CoordinationMap> = Arc::new(InMemoryCoordinationMap::new());
        let lock_manager = LockManager::new("players", coordination);

        let a = load_session(&lock_manager, &datastore, "a", json!({})).await;
        let b = load_session(&lock_manager, &datastore, "b", json!({})).await;

        let result = tx("players", datastore.clone(), &[a, b], 5, |mut state| {
            state.remove("b");
            state.insert("c".to_string(), json!({}));
            Some(state)
        })
        .await;

        assert!(matches!(result, Err(StoreError::TxKeysModified)));
    }

    #[tokio::test(start_paused = true)]
    async fn recover_pending_record_adopts_committed_write() {
        let datastore: Arc<dyn DataStore> = Arc::new(InMemoryDataStore::new());
        let record_key = latchkv_core::record::record_key("players", "a");
        let record = Record::new(RecordData::Inline(json!({ "coins": 1 })), None);
        let mut pending = record.clone();
        pending.pending_tx = Some("tx-1".to_string());
        datastore.set(&record_key, serde_json::to_value(&pending).unwrap(), None).await.unwrap();
        let marker_key = latchkv_core::record::tx_key("players", "tx-1");
        datastore.set(&marker_key, serde_json::to_value(TxMarker::Committed).unwrap(), None).await.unwrap();

        let recovered = recover_pending_record(datastore.as_ref(), "players", "a", pending, 5).await.unwrap();
        assert_eq!(recovered.pending_tx, None);
        assert_eq!(recovered.data, RecordData::Inline(json!({ "coins": 1 })));
    }

    #[tokio::test(start_paused = true)]
    async fn recover_pending_record_rolls_back_when_marker_absent() {
        let datastore: Arc<dyn DataStore> = Arc::new(InMemoryDataStore::new());
        let record_key = latchkv_core::record::record_key("players", "a");
        let prior = Record::new(RecordData::Inline(json!({ "coins": 1 })), None);
        datastore.set(&record_key, serde_json::to_value(&prior).unwrap(), None).await.unwrap();

        let mut pending = Record::new(RecordData::Inline(json!({ "coins": 2 })), None);
        pending.pending_tx = Some("tx-2".to_string());
        datastore.set(&record_key, serde_json::to_value(&pending).unwrap(), None).await.unwrap();

        let recovered = recover_pending_record(datastore.as_ref(), "players", "a", pending, 5).await.unwrap();
        assert_eq!(recovered.pending_tx, None);
        assert_eq!(recovered.data, RecordData::Inline(json!({ "coins": 1 })));
    }

    #[tokio::test(start_paused = true)]
    async fn recover_pending_record_fails_with_no_prior_version() {
        let datastore: Arc<dyn DataStore> = Arc::new(InMemoryDataStore::new());
        let record_key = latchkv_core::record::record_key("players", "a");
        let mut pending = Record::new(RecordData::Inline(json!({ "coins": 2 })), None);
        pending.pending_tx = Some("tx-3".to_string());
        datastore.set(&record_key, serde_json::to_value(&pending).unwrap(), None).await.unwrap();

        let result = recover_pending_record(datastore.as_ref(), "players", "a", pending, 5).await;
        assert!(matches!(result, Err(StoreError::TxRecoveryFailed(_))));
    }
}
