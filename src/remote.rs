//! Remote databases - opening a replication target by URL.
//!
//! Opening never creates anything server-side: the database is assumed to
//! exist already. When it does not, every call on the returned store fails
//! with `StoreError::MissingDatabase` until it appears.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use serde_json::Value;

use crate::document::{Revision, StoredDoc};
use crate::store::{ChangesBatch, DocumentStore, MemoryStore, Since, StoreError};

/// Opens remote databases for replication.
pub trait RemoteConnector: Send + Sync {
    /// Handle to the database at `url`.
    fn open(&self, url: &str) -> Arc<dyn DocumentStore>;
}

/// Per-collection URL: root and collection name joined with no separator.
pub fn collection_url(root_url: &str, collection: &str) -> String {
    format!("{}{}", root_url, collection)
}

/// In-process stand-in for a document server, keyed by database URL.
///
/// Clone-friendly via Arc. Used by tests and offline tools.
#[derive(Clone, Default)]
pub struct MemoryServer {
    databases: Arc<RwLock<HashMap<String, Arc<MemoryStore>>>>,
    offline: Arc<AtomicBool>,
}

impl MemoryServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create (or return) the database at `url`.
    pub fn create_database(&self, url: &str) -> Arc<MemoryStore> {
        let mut databases = self
            .databases
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            databases
                .entry(url.to_string())
                .or_insert_with(|| Arc::new(MemoryStore::new(url))),
        )
    }

    pub fn database(&self, url: &str) -> Option<Arc<MemoryStore>> {
        self.databases
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(url)
            .cloned()
    }

    /// Simulate losing (or regaining) the network: while offline every
    /// remote call fails with `StoreError::Unavailable`.
    pub fn set_online(&self, online: bool) {
        self.offline.store(!online, Ordering::SeqCst);
    }

    pub fn is_online(&self) -> bool {
        !self.offline.load(Ordering::SeqCst)
    }
}

impl RemoteConnector for MemoryServer {
    fn open(&self, url: &str) -> Arc<dyn DocumentStore> {
        Arc::new(MemoryRemote {
            server: self.clone(),
            url: url.to_string(),
        })
    }
}

/// A database on a [`MemoryServer`], resolved on every call.
struct MemoryRemote {
    server: MemoryServer,
    url: String,
}

impl MemoryRemote {
    fn database(&self) -> Result<Arc<MemoryStore>, StoreError> {
        if !self.server.is_online() {
            return Err(StoreError::Unavailable(self.url.clone()));
        }
        self.server
            .database(&self.url)
            .ok_or_else(|| StoreError::MissingDatabase(self.url.clone()))
    }
}

impl DocumentStore for MemoryRemote {
    fn name(&self) -> &str {
        &self.url
    }

    fn get(&self, id: &str) -> Result<Option<StoredDoc>, StoreError> {
        self.database()?.get(id)
    }

    fn put(&self, id: &str, body: Value, expected: Option<&Revision>) -> Result<Revision, StoreError> {
        self.database()?.put(id, body, expected)
    }

    fn remove(&self, id: &str, rev: &Revision) -> Result<Revision, StoreError> {
        self.database()?.remove(id, rev)
    }

    fn all_docs(&self) -> Result<Vec<StoredDoc>, StoreError> {
        self.database()?.all_docs()
    }

    fn changes(&self, since: &Since, limit: usize) -> Result<ChangesBatch, StoreError> {
        self.database()?.changes(since, limit)
    }

    fn apply_replicated(&self, docs: Vec<StoredDoc>) -> Result<usize, StoreError> {
        self.database()?.apply_replicated(docs)
    }
}

/// Connector for CouchDB-compatible servers over HTTP.
#[cfg(feature = "http")]
#[derive(Clone, Default)]
pub struct CouchConnector {
    client: reqwest::blocking::Client,
}

#[cfg(feature = "http")]
impl CouchConnector {
    pub fn new(client: reqwest::blocking::Client) -> Self {
        Self { client }
    }
}

#[cfg(feature = "http")]
impl RemoteConnector for CouchConnector {
    fn open(&self, url: &str) -> Arc<dyn DocumentStore> {
        Arc::new(crate::store::CouchStore::with_client(url, self.client.clone()))
    }
}
