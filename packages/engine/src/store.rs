//! Top-level entry point: a named key-scope over one `DataStore` +
//! `CoordinationMap` pair, managing session lifecycle. See SPEC_FULL.md §4.8.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use latchkv_core::error::StoreError;
use latchkv_core::record::{Record, RecordData};
use tracing::{info, warn};

use crate::backend::{BudgetOp, CoordinationMap, DataStore, ListVersionsParams, VersionInfo};
use crate::config::StoreConfig;
use crate::lock::LockManager;
use crate::retry::{retry_data_store, CancelHandle};
use crate::session::{ChangeCallback, Session};
use crate::shard;
use crate::transaction;

/// A named key-scope managing loaded sessions over one backing pair.
pub struct Store {
    name: String,
    config: StoreConfig,
    datastore: Arc<dyn DataStore>,
    lock_manager: LockManager,
    sessions: DashMap<String, Arc<Session>>,
    in_progress_loads: DashMap<String, CancelHandle>,
    closed: AtomicBool,
    on_change: std::sync::Mutex<Vec<Arc<dyn Fn(&str, Arc<serde_json::Value>, Arc<serde_json::Value>) + Send + Sync>>>,
}

impl Store {
    /// Creates a store scoped to `config.name`, backed by `datastore` and
    /// `coordination`.
    #[must_use]
    pub fn new(config: StoreConfig, datastore: Arc<dyn DataStore>, coordination: Arc<dyn CoordinationMap>) -> Arc<Self> {
        let name = config.name.clone();
        Arc::new(Self {
            lock_manager: LockManager::new(name.clone(), coordination),
            name,
            config,
            datastore,
            sessions: DashMap::new(),
            in_progress_loads: DashMap::new(),
            closed: AtomicBool::new(false),
            on_change: std::sync::Mutex::new(Vec::new()),
        })
    }

    /// Registers a callback invoked after every effective `update` on any
    /// session loaded through this store, present and future.
    pub fn on_change(
        &self,
        cb: impl Fn(&str, Arc<serde_json::Value>, Arc<serde_json::Value>) + Send + Sync + 'static,
    ) {
        self.on_change.lock().unwrap().push(Arc::new(cb));
    }

    fn check_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(StoreError::StoreClosed)
        } else {
            Ok(())
        }
    }

    /// Loads `key`: returns the existing session if already loaded,
    /// otherwise acquires a lease and constructs one.
    ///
    /// # Errors
    ///
    /// [`StoreError::StoreClosed`], [`StoreError::LoadInProgress`],
    /// [`StoreError::LoadCancelled`] (if a concurrent `unload` intervenes),
    /// or any error from lease acquisition, migration, or validation.
    pub async fn load(self: &Arc<Self>, key: &str, user_ids: Option<Vec<i64>>) -> Result<Arc<Session>, StoreError> {
        self.check_open()?;

        if let Some(session) = self.sessions.get(key) {
            return Ok(session.clone());
        }

        let cancel = CancelHandle::new();
        match self.in_progress_loads.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => return Err(StoreError::LoadInProgress(key.to_string())),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(cancel.clone());
            }
        }

        let result = self.load_inner(key, user_ids, &cancel).await;
        self.in_progress_loads.remove(key);

        match result {
            Ok(session) => {
                self.sessions.insert(key.to_string(), session.clone());
                session.start_autosave();
                for cb in self.on_change.lock().unwrap().iter() {
                    let cb = cb.clone();
                    session.on_change(Box::new(move |k, new, old| cb(k, new, old)) as ChangeCallback);
                }
                info!(store = %self.name, key, "session loaded");
                Ok(session)
            }
            Err(err) => Err(err),
        }
    }

    async fn load_inner(
        self: &Arc<Self>,
        key: &str,
        user_ids: Option<Vec<i64>>,
        cancel: &CancelHandle,
    ) -> Result<Arc<Session>, StoreError> {
        let lease = self
            .lock_manager
            .acquire(
                key,
                self.config.lease_ttl,
                self.config.lease_refresh_interval,
                self.config.lease_acquire_deadline,
                Some(cancel),
            )
            .await?;

        if cancel.is_cancelled() {
            let mut lease = lease;
            lease.release().await;
            return Err(StoreError::LoadCancelled(key.to_string()));
        }

        let record_key = latchkv_core::record::record_key(&self.name, key);
        let existing = retry_data_store("record-load", self.config.retry_max_attempts, || {
            let datastore = self.datastore.clone();
            let record_key = record_key.clone();
            async move { datastore.get(&record_key).await }
        })
        .await;

        let existing = match existing {
            Ok(value) => value,
            Err(err) => {
                let mut lease = lease;
                lease.release().await;
                return Err(err);
            }
        };

        let record = match existing {
            Some(raw) => match serde_json::from_value::<Record>(raw) {
                Ok(record) => Some(record),
                Err(err) => {
                    let mut lease = lease;
                    lease.release().await;
                    return Err(StoreError::BackendFatal(anyhow::Error::new(err)));
                }
            },
            None => None,
        };

        let record = match record {
            Some(record) if record.pending_tx.is_some() => {
                match transaction::recover_pending_record(self.datastore.as_ref(), &self.name, key, record, self.config.retry_max_attempts).await {
                    Ok(record) => record,
                    Err(err) => {
                        let mut lease = lease;
                        lease.release().await;
                        return Err(err);
                    }
                }
            }
            Some(record) => record,
            None => self.seed_record(key, &user_ids).await,
        };

        if record.has_malformed_file_ref() {
            let mut lease = lease;
            lease.release().await;
            return Err(StoreError::BackendFatal(anyhow::anyhow!("malformed file reference for key {key:?}")));
        }

        let decoded = match shard::decode(self.datastore.as_ref(), &record.data, self.config.retry_max_attempts).await {
            Ok(value) => value,
            Err(err) => {
                let mut lease = lease;
                lease.release().await;
                return Err(err);
            }
        };

        let (migrated, applied_migrations) =
            match self.config.migrations.apply_pending(key, decoded, &record.applied_migrations) {
                Ok(result) => result,
                Err(err) => {
                    let mut lease = lease;
                    lease.release().await;
                    return Err(err);
                }
            };

        if let Err(reason) = self.config.schema_check.check(&migrated) {
            let mut lease = lease;
            lease.release().await;
            return Err(StoreError::SchemaInvalid(reason));
        }

        if cancel.is_cancelled() {
            let mut lease = lease;
            lease.release().await;
            return Err(StoreError::LoadCancelled(key.to_string()));
        }

        Ok(Session::new(
            key.to_string(),
            self.name.clone(),
            migrated,
            record.data,
            applied_migrations,
            record.orphans,
            record.user_ids.or(user_ids),
            lease,
            self.datastore.clone(),
            &self.config,
        ))
    }

    async fn seed_record(&self, key: &str, user_ids: &Option<Vec<i64>>) -> Record {
        let imported = if let Some(importer) = &self.config.import_legacy_data {
            importer(key).await
        } else {
            None
        };
        let data = imported.unwrap_or_else(|| self.config.template.clone());
        Record::new(RecordData::Inline(data), user_ids.clone())
    }

    /// Idempotent: if `key` has no session (loaded or loading), resolves
    /// immediately. Otherwise cancels an in-flight load and/or drains the
    /// loaded session with a final save and lease release.
    pub async fn unload(&self, key: &str) {
        if let Some((_, cancel)) = self.in_progress_loads.remove(key) {
            cancel.cancel();
        }
        if let Some((_, session)) = self.sessions.remove(key) {
            session.unload().await;
        }
    }

    /// Returns the frozen working copy for a loaded `key`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::KeyNotLoaded`] if `key` has no session.
    pub fn get(&self, key: &str) -> Result<Arc<serde_json::Value>, StoreError> {
        self.session_for(key)?.get()
    }

    /// Delegates to [`Session::update`] for a loaded `key`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::KeyNotLoaded`] if `key` has no session.
    pub async fn update(
        &self,
        key: &str,
        transform: impl FnOnce(&mut serde_json::Value) -> bool + Send + 'static,
    ) -> Result<bool, StoreError> {
        self.session_for(key)?.update(transform).await
    }

    /// Delegates to [`Session::update_immutable`] for a loaded `key`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::KeyNotLoaded`] if `key` has no session.
    pub async fn update_immutable(
        &self,
        key: &str,
        transform: impl FnOnce(Arc<serde_json::Value>) -> Option<serde_json::Value> + Send + 'static,
    ) -> Result<bool, StoreError> {
        self.session_for(key)?.update_immutable(transform).await
    }

    /// Delegates to [`Session::save`] for a loaded `key`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::KeyNotLoaded`] if `key` has no session.
    pub async fn save(&self, key: &str) -> Result<(), StoreError> {
        self.session_for(key)?.save().await
    }

    fn session_for(&self, key: &str) -> Result<Arc<Session>, StoreError> {
        self.sessions.get(key).map(|s| s.clone()).ok_or_else(|| StoreError::KeyNotLoaded(key.to_string()))
    }

    /// Atomic multi-key transaction across loaded sessions for `keys`. See
    /// [`transaction::tx`].
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::KeyNotLoaded`] if any key has no session, or
    /// any error from [`transaction::tx`].
    pub async fn tx<F>(&self, keys: &[&str], f: F) -> Result<bool, StoreError>
    where
        F: FnOnce(std::collections::HashMap<String, serde_json::Value>) -> Option<std::collections::HashMap<String, serde_json::Value>>
            + Send
            + 'static,
    {
        let sessions: Vec<Arc<Session>> =
            keys.iter().map(|k| self.session_for(k)).collect::<Result<Vec<_>, StoreError>>()?;
        transaction::tx(&self.name, self.datastore.clone(), &sessions, self.config.retry_max_attempts, f).await
    }

    /// Reads the record for `key` bypassing sessions: fetches, migrates
    /// in-memory only (no write-back), decodes, and returns. Does not
    /// require the lease.
    ///
    /// # Errors
    ///
    /// Propagates migration or decode failures.
    pub async fn peek(&self, key: &str) -> Result<Option<serde_json::Value>, StoreError> {
        let record_key = latchkv_core::record::record_key(&self.name, key);
        let raw = retry_data_store("record-peek", self.config.retry_max_attempts, || {
            let datastore = self.datastore.clone();
            let record_key = record_key.clone();
            async move { datastore.get(&record_key).await }
        })
        .await?;

        let Some(raw) = raw else { return Ok(None) };
        let record: Record = serde_json::from_value(raw).map_err(|err| StoreError::BackendFatal(anyhow::Error::new(err)))?;
        let decoded = shard::decode(self.datastore.as_ref(), &record.data, self.config.retry_max_attempts).await?;
        let (migrated, _applied) = self.config.migrations.apply_pending(key, decoded, &record.applied_migrations)?;
        Ok(Some(migrated))
    }

    /// Reads the entry and reports whether it is present and unexpired,
    /// without acquiring it.
    ///
    /// # Errors
    ///
    /// Propagates coordination-map failures.
    pub async fn probe_lock_active(&self, key: &str) -> Result<bool, StoreError> {
        self.lock_manager.probe_active(key).await
    }

    /// Pass-through to [`crate::backend::DataStore::list_versions`].
    ///
    /// # Errors
    ///
    /// Propagates backend failures.
    pub async fn list_versions(&self, key: &str, params: &ListVersionsParams) -> Result<Vec<VersionInfo>, StoreError> {
        let record_key = latchkv_core::record::record_key(&self.name, key);
        retry_data_store("list-versions", self.config.retry_max_attempts, || {
            let datastore = self.datastore.clone();
            let record_key = record_key.clone();
            let params = params.clone();
            async move { datastore.list_versions(&record_key, &params).await }
        })
        .await
    }

    /// Reads a specific prior version of `key`'s record, decoded the same
    /// way `peek` decodes the current one (no migration, no write-back).
    ///
    /// # Errors
    ///
    /// Propagates backend or decode failures.
    pub async fn read_version(&self, key: &str, version_id: &str) -> Result<Option<serde_json::Value>, StoreError> {
        let record_key = latchkv_core::record::record_key(&self.name, key);
        let raw = retry_data_store("read-version", self.config.retry_max_attempts, || {
            let datastore = self.datastore.clone();
            let record_key = record_key.clone();
            let version_id = version_id.to_string();
            async move { datastore.get_version(&record_key, &version_id).await }
        })
        .await?;

        let Some(raw) = raw else { return Ok(None) };
        let record: Record = serde_json::from_value(raw).map_err(|err| StoreError::BackendFatal(anyhow::Error::new(err)))?;
        let decoded = shard::decode(self.datastore.as_ref(), &record.data, self.config.retry_max_attempts).await?;
        Ok(Some(decoded))
    }

    /// Number of currently loaded sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Pass-through to the backing `DataStore`'s request-budget signal, so
    /// callers can back off proactively rather than waiting for a transient
    /// failure.
    ///
    /// # Errors
    ///
    /// Propagates backend failures.
    pub async fn budget(&self, op: BudgetOp) -> Result<i64, StoreError> {
        self.datastore.budget(op).await.map_err(StoreError::BackendFatal)
    }

    /// Marks the store closed, cancels in-flight loads with
    /// `load-cancelled` (interrupting any retry loop they're backing off
    /// in, rather than waiting it out), and concurrently unloads every
    /// active session.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);

        for entry in self.in_progress_loads.iter() {
            entry.value().cancel();
        }
        self.in_progress_loads.clear();
        self.lock_manager.cancel_all();

        let keys: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        let unloads = keys.into_iter().map(|key| {
            let sessions = &self.sessions;
            async move {
                if let Some((_, session)) = sessions.remove(&key) {
                    session.unload().await;
                }
            }
        });
        futures::future::join_all(unloads).await;
        warn!(store = %self.name, "store closed");
    }
}
