//! `latchkv` engine -- durable, session-locked, transactional key/value
//! storage atop an embedder-provided `DataStore` + `CoordinationMap` pair.
//!
//! - **Backend** ([`backend`]): the `DataStore`/`CoordinationMap` trait
//!   boundary this whole crate is built against.
//! - **Retry** ([`retry`]): transient-error classification and backoff.
//! - **Lock** ([`lock`]): lease acquisition, refresh, and loss notification.
//! - **Queue** ([`queue`]): per-session FIFO execution and cross-queue
//!   atomic acquisition for transactions.
//! - **Shard** ([`shard`]): the I/O half of the sharded file codec.
//! - **Config** ([`config`]): per-store configuration.
//! - **Session** ([`session`]): a single loaded key's working copy and save
//!   pipeline.
//! - **Store** ([`store`]): session lifecycle management over a key-scope.
//! - **Transaction** ([`transaction`]): the two-phase multi-key commit
//!   protocol and its crash-recovery counterpart.

pub mod backend;
pub mod config;
pub mod lock;
pub mod queue;
pub mod retry;
pub mod session;
pub mod shard;
pub mod store;
pub mod transaction;

#[cfg(test)]
mod test_support;

pub use backend::{BudgetOp, CoordinationMap, DataStore, ListVersionsParams, Mutator, VersionInfo};
pub use config::{LegacyImporter, StoreConfig};
pub use session::{ChangeCallback, Session};
pub use store::Store;


/// End-to-end scenarios exercising the full `Store`/`Session`/transaction
/// stack together, as opposed to each module's own unit tests. See
/// SPEC_FULL.md §8 for the scenarios these are drawn from.
#[cfg(test)]
mod integration_tests {
    use std::sync::Arc;
    use std::time::Duration;

    use latchkv_core::migration::{Migration, MigrationChain};
    use latchkv_core::schema::AcceptAll;
    use serde_json::json;

    use crate::backend::{CoordinationMap, DataStore};
    use crate::config::StoreConfig;
    use crate::lock::LockManager;
    use crate::store::Store;
    use crate::test_support::{InMemoryCoordinationMap, InMemoryDataStore};

    fn new_store(config: StoreConfig) -> (Arc<Store>, Arc<dyn DataStore>) {
        let datastore: Arc<dyn DataStore> = Arc::new(InMemoryDataStore::new());
        let coordination: Arc<dyn CoordinationMap> = Arc::new(InMemoryCoordinationMap::new());
        (Store::new(config, datastore.clone(), coordination), datastore)
    }

    #[tokio::test(start_paused = true)]
    async fn load_update_save_then_reload_survives_a_simulated_crash() {
        let config = StoreConfig {
            name: "players".to_string(),
            template: json!({ "coins": 0, "inventory": [] }),
            schema_check: Arc::new(AcceptAll),
            ..StoreConfig::default()
        };
        let (store, _datastore) = new_store(config);

        let session = store.load("p1", None).await.unwrap();
        session
            .update(|v| {
                v["coins"] = json!(100);
                true
            })
            .await
            .unwrap();
        session.save().await.unwrap();
        store.unload("p1").await;

        let reloaded = store.load("p1", None).await.unwrap();
        assert_eq!(*reloaded.get().unwrap(), json!({ "coins": 100, "inventory": [] }));
    }

    #[tokio::test(start_paused = true)]
    async fn two_key_transfer_survives_reload_after_commit() {
        let config = StoreConfig { name: "players".to_string(), schema_check: Arc::new(AcceptAll), ..StoreConfig::default() };
        let (store, _datastore) = new_store(config);

        let p1 = store.load("p1", None).await.unwrap();
        let p2 = store.load("p2", None).await.unwrap();
        p1.set_data(json!({ "coins": 200 })).await.unwrap();
        p2.set_data(json!({ "coins": 0 })).await.unwrap();
        p1.save().await.unwrap();
        p2.save().await.unwrap();

        let committed = store
            .tx(&["p1", "p2"], |mut state| {
                state.insert("p1".to_string(), json!({ "coins": 100 }));
                state.insert("p2".to_string(), json!({ "coins": 100 }));
                Some(state)
            })
            .await
            .unwrap();
        assert!(committed);

        store.unload("p1").await;
        store.unload("p2").await;

        assert_eq!(store.peek("p1").await.unwrap(), Some(json!({ "coins": 100 })));
        assert_eq!(store.peek("p2").await.unwrap(), Some(json!({ "coins": 100 })));
    }

    #[tokio::test(start_paused = true)]
    async fn lease_theft_closes_the_session_and_further_updates_fail() {
        let config = StoreConfig {
            name: "players".to_string(),
            schema_check: Arc::new(AcceptAll),
            lease_ttl: Duration::from_secs(4),
            lease_refresh_interval: Duration::from_secs(1),
            ..StoreConfig::default()
        };
        let coordination = Arc::new(InMemoryCoordinationMap::new());
        let datastore: Arc<dyn DataStore> = Arc::new(InMemoryDataStore::new());
        let store = Store::new(config, datastore, coordination.clone());

        let session = store.load("p1", None).await.unwrap();
        assert!(!session.lease_lost());

        // Simulate another process stealing the lease out from under us.
        coordination
            .force_set(&latchkv_core::record::lock_key("players", "p1"), json!({ "leaseId": "someone-else" }))
            .await;

        tokio::time::advance(Duration::from_secs(2)).await;
        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_millis(1)).await;
        tokio::task::yield_now().await;
        assert!(session.lease_lost());

        let result = session.update(|_v| true).await;
        assert!(result.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn sequential_updates_apply_in_submission_order_at_scale() {
        let config = StoreConfig { name: "players".to_string(), schema_check: Arc::new(AcceptAll), ..StoreConfig::default() };
        let (store, _datastore) = new_store(config);
        let session = store.load("p1", Some(vec![1])).await.unwrap();
        session.set_data(json!({ "coins": 0 })).await.unwrap();

        for i in 1..=100 {
            session
                .update(move |v| {
                    v["coins"] = json!(i);
                    true
                })
                .await
                .unwrap();
        }

        assert_eq!(session.get().unwrap()["coins"], json!(100));
    }

    #[tokio::test(start_paused = true)]
    async fn migration_chain_is_idempotent_across_reloads() {
        let migrations = MigrationChain::new(vec![
            Migration::new("v1", |mut data| {
                data["x"] = json!(1);
                data
            }),
            Migration::new("v2", |mut data| {
                let x = data["x"].as_i64().unwrap_or(0);
                data["y"] = json!(x + 1);
                data
            }),
        ]);
        let config = StoreConfig {
            name: "players".to_string(),
            schema_check: Arc::new(AcceptAll),
            migrations,
            ..StoreConfig::default()
        };
        let (store, _datastore) = new_store(config);

        let session = store.load("legacy", None).await.unwrap();
        assert_eq!(*session.get().unwrap(), json!({ "x": 1, "y": 2 }));
        session.save().await.unwrap();
        store.unload("legacy").await;

        let reloaded = store.load("legacy", None).await.unwrap();
        assert_eq!(*reloaded.get().unwrap(), json!({ "x": 1, "y": 2 }));
    }
}
