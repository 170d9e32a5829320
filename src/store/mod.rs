//! Document stores - the local replica and the remote database behind one trait.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────┐   pull: changes -> apply_replicated   ┌──────────────────────┐
//! │ MemoryStore (local)  │ <──────────────────────────────────── │ remote DocumentStore │
//! │  - CRUD for adapters │ ────────────────────────────────────> │  (MemoryServer /     │
//! │  - live listeners    │   push: changes -> apply_replicated   │   CouchStore)        │
//! └──────────────────────┘                                       └──────────────────────┘
//! ```

mod memory;

#[cfg(feature = "http")]
mod couch;

use serde_json::Value;
use thiserror::Error;

use crate::document::{Revision, StoredDoc};

pub use memory::{ListenerId, MemoryStore};

#[cfg(feature = "http")]
pub use couch::CouchStore;

/// Error type for document store operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The write carried a stale (or missing) revision.
    #[error("document update conflict on {id} (expected revision {expected}, current {actual})")]
    Conflict {
        id: String,
        expected: String,
        actual: String,
    },
    /// No live document with this id.
    #[error("document not found: {id}")]
    NotFound { id: String },
    /// Connectivity loss or a server-side failure that may clear up.
    #[error("database unavailable: {0}")]
    Unavailable(String),
    /// The database was never created on the server.
    #[error("database does not exist: {0}")]
    MissingDatabase(String),
    #[error("document serialization error: {0}")]
    Serde(String),
    #[error("invalid change sequence `{0}`")]
    InvalidSequence(String),
    #[error("store lock poisoned during {0}")]
    LockPoisoned(&'static str),
}

impl StoreError {
    /// Whether retrying the same request later could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::Unavailable(_) | StoreError::MissingDatabase(_) | StoreError::LockPoisoned(_)
        )
    }

    pub(crate) fn conflict(id: &str, expected: Option<&Revision>, actual: Option<&Revision>) -> Self {
        let render = |rev: Option<&Revision>| rev.map_or_else(|| "none".to_string(), |r| r.to_string());
        StoreError::Conflict {
            id: id.to_string(),
            expected: render(expected),
            actual: render(actual),
        }
    }
}

/// Where a change feed read starts.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Since {
    /// From the beginning of the database.
    #[default]
    Start,
    /// Only changes after the current update sequence.
    Now,
    /// After an opaque sequence returned by an earlier read.
    After(String),
}

impl Since {
    /// The query-string form CouchDB understands.
    pub fn as_param(&self) -> &str {
        match self {
            Since::Start => "0",
            Since::Now => "now",
            Since::After(seq) => seq,
        }
    }
}

/// One entry of a change feed: the latest revision of a document.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeRecord {
    pub seq: String,
    pub doc: StoredDoc,
}

impl ChangeRecord {
    pub fn id(&self) -> &str {
        &self.doc.id
    }

    pub fn deleted(&self) -> bool {
        self.doc.deleted
    }
}

/// A page of a change feed.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ChangesBatch {
    pub results: Vec<ChangeRecord>,
    /// Resume point for the next read.
    pub last_seq: String,
    /// Changes left after this page.
    pub pending: u64,
}

/// CRUD, change feed and replication writes against one database.
///
/// Implemented by the in-process [`MemoryStore`] replica and by remote
/// endpoints. Every method reports failure through `StoreError`; none panic.
pub trait DocumentStore: Send + Sync {
    /// Database name (local) or URL (remote).
    fn name(&self) -> &str;

    /// Fetch the live document with `id`. Tombstones read as `None`.
    fn get(&self, id: &str) -> Result<Option<StoredDoc>, StoreError>;

    /// Write `body` under `id`. `expected` must be the current revision of a
    /// live document, or `None` when creating.
    fn put(&self, id: &str, body: Value, expected: Option<&Revision>) -> Result<Revision, StoreError>;

    /// Write a tombstone for `id` at revision `rev`.
    fn remove(&self, id: &str, rev: &Revision) -> Result<Revision, StoreError>;

    /// Every live document, ordered by id.
    fn all_docs(&self) -> Result<Vec<StoredDoc>, StoreError>;

    /// Read up to `limit` changes after `since`, ordered by sequence.
    fn changes(&self, since: &Since, limit: usize) -> Result<ChangesBatch, StoreError>;

    /// Store replicated revisions as-is (no new edits). A revision is kept
    /// only if it wins over the current one. Returns how many were kept.
    fn apply_replicated(&self, docs: Vec<StoredDoc>) -> Result<usize, StoreError>;
}
