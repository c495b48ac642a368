//! A single loaded key: its lock lease, frozen working copy, and the serial
//! queue every public operation is routed through. See SPEC_FULL.md §4.7.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use latchkv_core::error::StoreError;
use latchkv_core::patch::{apply_patch, create_patch};
use latchkv_core::record::RecordData;
use latchkv_core::schema::SchemaCheck;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::backend::DataStore;
use crate::config::StoreConfig;
use crate::lock::{Lease, LostReason};
use crate::queue::SerialQueue;
use crate::retry::retry_data_store;
use crate::shard;

/// Invoked after a successful `update()` with `(key, new, old)`. Subtrees
/// untouched by the transform compare equal (`==`) between `old` and `new`;
/// an entirely unchanged call reuses the same `Arc` for both (`Arc::ptr_eq`
/// holds at the root), see §4.7 expansion.
pub type ChangeCallback = Box<dyn Fn(&str, Arc<Value>, Arc<Value>) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Active,
    Closed,
}

/// Public view of a session's lifecycle state, for read-only introspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Accepting `get`/`update`/`save`.
    Active,
    /// Unloaded, or closed by a lost lease; every operation now fails.
    Closed,
}

impl From<State> for SessionState {
    fn from(state: State) -> Self {
        match state {
            State::Active => Self::Active,
            State::Closed => Self::Closed,
        }
    }
}

struct RecordMeta {
    applied_migrations: Vec<String>,
    orphans: Vec<String>,
    user_ids: Option<Vec<i64>>,
    persisted_data: RecordData,
}

/// A point-in-time copy of a session's [`RecordMeta`], handed to
/// [`crate::transaction`] for building new records without exposing the
/// lock internally guarding the live copy.
pub(crate) struct MetaSnapshot {
    pub applied_migrations: Vec<String>,
    pub orphans: Vec<String>,
    pub user_ids: Option<Vec<i64>>,
    pub persisted_data: RecordData,
}

/// A loaded, lease-holding session for one key.
pub struct Session {
    key: String,
    store_name: String,
    datastore: Arc<dyn DataStore>,
    schema_check: Arc<dyn SchemaCheck>,
    retry_max_attempts: u32,
    max_chunk_size: usize,
    shard_reserve_bytes: usize,
    autosave_interval: Duration,
    queue_item_timeout: Duration,

    frozen: RwLock<Arc<Value>>,
    dirty: AtomicBool,
    state: Mutex<State>,
    meta: Mutex<RecordMeta>,
    lease: Mutex<Option<Lease>>,
    lease_lost: Arc<AtomicBool>,
    callbacks: Mutex<Vec<ChangeCallback>>,
    autosave_task: Mutex<Option<JoinHandle<()>>>,

    queue: SerialQueue,
}

impl Session {
    /// Constructs a session around an already-acquired lease and an
    /// already-migrated/validated record. Called only by
    /// [`crate::store::Store::load`].
    pub(crate) fn new(
        key: String,
        store_name: String,
        data: Value,
        persisted_data: RecordData,
        applied_migrations: Vec<String>,
        orphans: Vec<String>,
        user_ids: Option<Vec<i64>>,
        lease: Lease,
        datastore: Arc<dyn DataStore>,
        config: &StoreConfig,
    ) -> Arc<Self> {
        let session = Arc::new(Self {
            key,
            store_name,
            datastore,
            schema_check: config.schema_check.clone(),
            retry_max_attempts: config.retry_max_attempts,
            max_chunk_size: config.max_chunk_size,
            shard_reserve_bytes: config.shard_reserve_bytes,
            autosave_interval: config.autosave_interval,
            queue_item_timeout: config.queue_item_timeout,
            frozen: RwLock::new(Arc::new(data)),
            dirty: AtomicBool::new(false),
            state: Mutex::new(State::Active),
            meta: Mutex::new(RecordMeta { applied_migrations, orphans, user_ids, persisted_data }),
            lease: Mutex::new(Some(lease)),
            lease_lost: Arc::new(AtomicBool::new(false)),
            callbacks: Mutex::new(Vec::new()),
            autosave_task: Mutex::new(None),
            queue: SerialQueue::new(),
        });

        let observer_session = session.clone();
        let lease_guard = session.lease.lock();
        if let Some(lease) = lease_guard.as_ref() {
            let _unsub = lease.on_lost(move |_reason: LostReason| {
                observer_session.lease_lost.store(true, Ordering::SeqCst);
                *observer_session.state.lock() = State::Closed;
            });
        }
        drop(lease_guard);

        session
    }

    /// This session's key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Whether this session's lease was lost (as opposed to a clean unload).
    #[must_use]
    pub fn lease_lost(&self) -> bool {
        self.lease_lost.load(Ordering::SeqCst)
    }

    /// Whether this session has unsaved changes.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    /// This session's current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        (*self.state.lock()).into()
    }

    /// This session's store-scope name.
    pub(crate) fn store_name(&self) -> &str {
        &self.store_name
    }

    /// The serial queue every operation on this session is routed through.
    /// Exposed so [`crate::transaction`] can enlist it in a `multi_add`.
    pub(crate) fn queue(&self) -> &SerialQueue {
        &self.queue
    }

    pub(crate) fn max_chunk_size(&self) -> usize {
        self.max_chunk_size
    }

    pub(crate) fn shard_reserve_bytes(&self) -> usize {
        self.shard_reserve_bytes
    }

    pub(crate) fn retry_max_attempts(&self) -> u32 {
        self.retry_max_attempts
    }

    /// A clone of this session's live lease-lost flag, for a mutator closure
    /// that may run (and re-run, across retries) after this call returns to
    /// check at write time rather than against a stale snapshot.
    pub(crate) fn lease_lost_handle(&self) -> Arc<AtomicBool> {
        self.lease_lost.clone()
    }

    /// Validates `value` against this session's configured schema.
    pub(crate) fn validate(&self, value: &Value) -> Result<(), StoreError> {
        self.schema_check.check(value).map_err(StoreError::SchemaInvalid)
    }

    /// A snapshot of this session's persisted-record bookkeeping, for the
    /// transaction coordinator to build a new [`latchkv_core::record::Record`] from.
    pub(crate) fn meta_snapshot(&self) -> MetaSnapshot {
        let meta = self.meta.lock();
        MetaSnapshot {
            applied_migrations: meta.applied_migrations.clone(),
            orphans: meta.orphans.clone(),
            user_ids: meta.user_ids.clone(),
            persisted_data: meta.persisted_data.clone(),
        }
    }

    /// Adopts a transaction's committed result as this session's new working
    /// copy without running the normal save pipeline -- the transaction
    /// coordinator already persisted it.
    pub(crate) fn commit_tx_result(&self, new_data: RecordData, new_value: Value) {
        let old = self.frozen.read().clone();
        let new = Arc::new(new_value);
        *self.frozen.write() = new.clone();
        {
            let mut meta = self.meta.lock();
            meta.persisted_data = new_data;
        }
        self.dirty.store(false, Ordering::SeqCst);
        self.notify_change(new, old);
    }

    fn check_active(&self) -> Result<(), StoreError> {
        if *self.state.lock() == State::Active {
            Ok(())
        } else {
            Err(StoreError::SessionClosed(self.key.clone()))
        }
    }

    /// Registers a change callback, invoked after every effective `update`.
    pub fn on_change(&self, cb: ChangeCallback) {
        self.callbacks.lock().push(cb);
    }

    /// Returns the currently validated, frozen working copy.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::SessionClosed`] if the session is not active.
    pub fn get(&self) -> Result<Arc<Value>, StoreError> {
        self.check_active()?;
        Ok(self.frozen.read().clone())
    }

    /// Replaces the working copy after validation; marks the session dirty.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::SessionClosed`] if inactive, or
    /// [`StoreError::SchemaInvalid`] if `value` fails validation.
    pub async fn set_data(self: &Arc<Self>, value: Value) -> Result<(), StoreError> {
        self.check_active()?;
        self.schema_check.check(&value).map_err(StoreError::SchemaInvalid)?;
        let old = self.frozen.read().clone();
        let new = Arc::new(value);
        *self.frozen.write() = new.clone();
        self.dirty.store(true, Ordering::SeqCst);
        self.notify_change(new, old);
        Ok(())
    }

    /// Mutable-path update: `transform` receives a mutable deep copy of the
    /// current data and returns whether to commit it.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::SessionClosed`], or [`StoreError::SchemaInvalid`]
    /// if the mutated value fails validation.
    pub async fn update(
        self: &Arc<Self>,
        transform: impl FnOnce(&mut Value) -> bool + Send + 'static,
    ) -> Result<bool, StoreError> {
        let session = self.clone();
        self.queue
            .add(self.queue_item_timeout, move || async move { session.apply_update(transform).await })
            .await
    }

    async fn apply_update(
        self: &Arc<Self>,
        transform: impl FnOnce(&mut Value) -> bool,
    ) -> Result<bool, StoreError> {
        self.check_active()?;
        let old = self.frozen.read().clone();
        let mut mutable_copy = (*old).clone();
        if !transform(&mut mutable_copy) {
            return Ok(false);
        }

        self.schema_check.check(&mutable_copy).map_err(StoreError::SchemaInvalid)?;

        // Reconcile through create_patch/apply_patch per §4.7, rather than
        // adopting mutable_copy directly, so unchanged subtrees are produced
        // by the same diff/apply path callbacks would use to compare them.
        let patch = create_patch(&old, &mutable_copy);
        let reconciled = apply_patch(&old, &patch).map_err(|err| StoreError::BackendFatal(anyhow::anyhow!(err)))?;

        if reconciled == *old {
            return Ok(false);
        }

        let new = Arc::new(reconciled);
        *self.frozen.write() = new.clone();
        self.dirty.store(true, Ordering::SeqCst);
        self.notify_change(new, old);
        Ok(true)
    }

    /// Immutable-path update: `transform` receives the frozen working copy
    /// and returns either a new value to commit, or `None` to abort.
    ///
    /// # Errors
    ///
    /// Same as [`Session::update`].
    pub async fn update_immutable(
        self: &Arc<Self>,
        transform: impl FnOnce(Arc<Value>) -> Option<Value> + Send + 'static,
    ) -> Result<bool, StoreError> {
        let session = self.clone();
        self.queue
            .add(self.queue_item_timeout, move || async move { session.apply_update_immutable(transform).await })
            .await
    }

    async fn apply_update_immutable(
        self: &Arc<Self>,
        transform: impl FnOnce(Arc<Value>) -> Option<Value>,
    ) -> Result<bool, StoreError> {
        self.check_active()?;
        let old = self.frozen.read().clone();
        let Some(candidate) = transform(old.clone()) else {
            return Ok(false);
        };

        if candidate == *old {
            return Ok(false);
        }

        self.schema_check.check(&candidate).map_err(StoreError::SchemaInvalid)?;

        let new = Arc::new(candidate);
        *self.frozen.write() = new.clone();
        self.dirty.store(true, Ordering::SeqCst);
        self.notify_change(new, old);
        Ok(true)
    }

    fn notify_change(&self, new: Arc<Value>, old: Arc<Value>) {
        let callbacks = self.callbacks.lock();
        for cb in callbacks.iter() {
            cb(&self.key, new.clone(), old.clone());
        }
    }

    /// Flushes pending changes. No-op if not dirty.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::SessionClosed`] or [`StoreError::LockLost`].
    pub async fn save(self: &Arc<Self>) -> Result<(), StoreError> {
        let session = self.clone();
        self.queue.add(self.queue_item_timeout, move || async move { session.run_save().await }).await
    }

    async fn run_save(self: &Arc<Self>) -> Result<(), StoreError> {
        self.check_active()?;
        if !self.dirty.load(Ordering::SeqCst) {
            return Ok(());
        }

        let payload = self.frozen.read().clone();
        let new_data = shard::encode(
            self.datastore.as_ref(),
            &self.store_name,
            &self.key,
            &payload,
            self.max_chunk_size,
            self.shard_reserve_bytes,
            self.retry_max_attempts,
        )
        .await?;

        let record_key = latchkv_core::record::record_key(&self.store_name, &self.key);
        let (applied_migrations, prior_orphans, old_shard_keys, user_ids) = {
            let meta = self.meta.lock();
            let old_shard_keys = match &meta.persisted_data {
                RecordData::File(file_ref) => file_ref.shards.clone(),
                RecordData::Inline(_) => Vec::new(),
            };
            (meta.applied_migrations.clone(), meta.orphans.clone(), old_shard_keys, meta.user_ids.clone())
        };

        let mut new_orphans = prior_orphans.clone();
        new_orphans.extend(old_shard_keys.iter().cloned());

        let aborted = Arc::new(AtomicBool::new(false));
        let aborted_in_mutator = aborted.clone();
        let lease_lost = self.lease_lost.clone();

        let new_record = latchkv_core::record::Record {
            data: new_data.clone(),
            applied_migrations: applied_migrations.clone(),
            pending_tx: None,
            orphans: new_orphans.clone(),
            user_ids: user_ids.clone(),
        };
        let new_record_value = serde_json::to_value(&new_record).map_err(|err| StoreError::BackendFatal(anyhow::Error::new(err)))?;

        let write_result = retry_data_store("record-save", self.retry_max_attempts, || {
            let datastore = self.datastore.clone();
            let record_key = record_key.clone();
            let new_record_value = new_record_value.clone();
            let aborted = aborted_in_mutator.clone();
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
                            Some(new_record_value.clone())
                        },
                        None,
                    )
                    .await
            }
        })
        .await;

        if aborted.load(Ordering::SeqCst) {
            self.lease_lost.store(true, Ordering::SeqCst);
            *self.state.lock() = State::Closed;
            return Err(StoreError::LockLost(self.key.clone()));
        }
        write_result?;

        {
            let mut meta = self.meta.lock();
            meta.persisted_data = new_data;
            meta.orphans = new_orphans.clone();
        }
        self.dirty.store(false, Ordering::SeqCst);
        debug!(key = %self.key, "session saved");

        if !old_shard_keys.is_empty() {
            let failed = shard::delete_shards(self.datastore.as_ref(), &old_shard_keys, self.retry_max_attempts).await;
            let remaining: Vec<String> =
                prior_orphans.into_iter().chain(failed).collect();
            let follow_up = latchkv_core::record::Record {
                data: new_record.data.clone(),
                applied_migrations,
                pending_tx: None,
                orphans: remaining.clone(),
                user_ids,
            };
            let follow_up_value =
                serde_json::to_value(&follow_up).map_err(|err| StoreError::BackendFatal(anyhow::Error::new(err)))?;
            let follow_up_result = retry_data_store("orphan-clear", self.retry_max_attempts, || {
                let datastore = self.datastore.clone();
                let record_key = record_key.clone();
                let follow_up_value = follow_up_value.clone();
                async move { datastore.set(&record_key, follow_up_value, None).await }
            })
            .await;
            match follow_up_result {
                Ok(()) => self.meta.lock().orphans = remaining,
                Err(err) => warn!(key = %self.key, error = %err, "failed to clear cleared orphans from record"),
            }
        }

        Ok(())
    }

    /// Runs a final save, releases the lease, and closes the session.
    /// Idempotent.
    pub async fn unload(self: &Arc<Self>) {
        if *self.state.lock() != State::Active {
            return;
        }
        if let Some(task) = self.autosave_task.lock().take() {
            task.abort();
        }
        if let Err(err) = self.save().await {
            warn!(key = %self.key, error = %err, "final save on unload failed");
        }
        *self.state.lock() = State::Closed;
        if let Some(mut lease) = self.lease.lock().take() {
            lease.release().await;
        }
        debug!(key = %self.key, "session unloaded");
    }

    /// Starts the autosave timer. Called once by `Store::load` after
    /// construction.
    pub(crate) fn start_autosave(self: &Arc<Self>) {
        let session = self.clone();
        let interval = self.autosave_interval;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if *session.state.lock() != State::Active {
                    return;
                }
                if session.dirty.load(Ordering::SeqCst) {
                    if let Err(err) = session.save().await {
                        warn!(key = %session.key, error = %err, "autosave failed");
                    }
                }
            }
        });
        *self.autosave_task.lock() = Some(task);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(task) = self.autosave_task.lock().take() {
            task.abort();
        }
    }
}
