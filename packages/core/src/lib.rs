//! `latchkv` core -- dependency-free data model and pure algorithms shared
//! between the engine and (eventually) alternative backends.
//!
//! - **Error** ([`error`]): `StoreError`, the caller-facing error enum.
//! - **Record** ([`record`]): the persisted `Record`/`FileRef`/`TxMarker`
//!   shapes and the DataStore key-path conventions.
//! - **Shard** ([`shard`]): content-addressed payload partitioning and
//!   reassembly (the pure half of the sharded file codec).
//! - **Migration** ([`migration`]): the append-only migration chain.
//! - **Patch** ([`patch`]): RFC-6902-style JSON patch diff/apply, used for
//!   change-callback old/new reconciliation.
//! - **Schema** ([`schema`]): the `SchemaCheck` validator contract.

pub mod error;
pub mod migration;
pub mod patch;
pub mod record;
pub mod schema;
pub mod shard;

pub use error::StoreError;
pub use migration::{Migration, MigrationChain};
pub use patch::{apply_patch, create_patch, PatchOp};
pub use record::{lock_key, record_key, shard_key, tx_key, FileRef, Record, RecordData, TxMarker};
pub use schema::{AcceptAll, SchemaCheck};
pub use shard::{derive_file_id, file_ref_for, partition, reassemble, PartitionedFile, MAX_CHUNK_SIZE, SHARD_RESERVE_BYTES};
