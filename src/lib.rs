//! Data sync and state reconciliation for the mail-round admin app.
//!
//! ## Architecture
//!
//! ```text
//!   view ─▶ glue::load_view ─▶ CollectionStore<T>::dispatch(Action)
//!                                   │
//!              ┌────────────────────┴────────────────────┐
//!              ▼                                         ▼
//!        SyncManager (registrar)                DocumentAdapter<T>
//!        one replica per name                   create/read/update/delete
//!              │                                         │
//!              ▼                                         ▼
//!        MemoryStore (replica) ◀──── writes ─────────────┘
//!          │  live feed ──▶ Changes / Deletes ──▶ CollectionStore
//!          │
//!          ▼ ReplicationThread (pull + push)
//!        remote DocumentStore (MemoryServer / CouchDB)
//!
//!        WriteOutcome ─▶ OutcomeQueue ─▶ Reconciler (retry with backoff)
//! ```

// Lets `#[derive(Document)]` output (`mailround_sync::Document`) resolve
// inside this crate too.
extern crate self as mailround_sync;

pub mod adapter;
pub mod collection;
mod config;
mod document;
pub mod entities;
mod error;
pub mod geometry;
pub mod glue;
pub mod reconcile;
mod registrar;
pub mod remote;
mod replication;
pub mod store;
mod tracker;
pub mod views;

pub use adapter::{DocumentAdapter, WriteOp, WriteOutcome};
pub use collection::{numeric_id_cmp, Action, CollectionState, CollectionStore, Effect, LoadStatus};
pub use config::{ConfigError, ReplicationConfig, RetryPolicy, SyncConfig};
pub use document::{
    decode_docs, into_doc_map, DocMap, Document, Revision, RevisionParseError, StoredDoc,
    UNASSIGNED,
};
pub use error::{Result, SyncError};
pub use glue::{load_view, still_loading, Caller, CollectionKind, Collections, ViewRequirements};
pub use reconcile::{DrainReport, OutcomeQueue, Reconciler, ReconcilerThread, StoreResolver, WriteRecord};
pub use registrar::{partition_changes, CollectionHandle, FeedDocs, SyncManager};
pub use remote::{collection_url, MemoryServer, RemoteConnector};
pub use replication::{
    ReadyLatch, ReplicationReport, ReplicationStats, ReplicationThread, Replicator, Waker,
};
pub use store::{ChangeRecord, ChangesBatch, DocumentStore, MemoryStore, Since, StoreError};
pub use tracker::is_still_loading;

pub use mailround_sync_macros::Document;

#[cfg(feature = "http")]
pub use remote::CouchConnector;
#[cfg(feature = "http")]
pub use store::CouchStore;
