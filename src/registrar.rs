//! Replication registrar - one local replica and one live replication
//! channel per collection name, owned by a single [`SyncManager`].

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use tracing::{debug, info};

use crate::config::SyncConfig;
use crate::document::StoredDoc;
use crate::error::{Result, SyncError};
use crate::remote::{collection_url, RemoteConnector};
use crate::replication::{
    replicate_pass, ReadyLatch, ReplicationReport, ReplicationThread, Replicator, Waker,
};
use crate::store::{ChangeRecord, DocumentStore, MemoryStore};

/// Documents delivered by a live feed callback, keyed by id.
pub type FeedDocs = BTreeMap<String, StoredDoc>;

/// Split a change-feed batch into live documents and tombstones. A later
/// record for the same id replaces an earlier one.
pub fn partition_changes(records: &[ChangeRecord]) -> (FeedDocs, FeedDocs) {
    let mut changes = FeedDocs::new();
    let mut deletes = FeedDocs::new();
    for record in records {
        let id = record.id().to_string();
        if record.deleted() {
            changes.remove(&id);
            deletes.insert(id, record.doc.clone());
        } else {
            deletes.remove(&id);
            changes.insert(id, record.doc.clone());
        }
    }
    (changes, deletes)
}

struct Channel {
    name: String,
    remote_url: String,
    replica: Arc<MemoryStore>,
    replicator: Arc<Mutex<Replicator>>,
    ready: Arc<ReadyLatch>,
    thread: Mutex<Option<ReplicationThread>>,
}

/// Handle to a registered collection. Cheap to clone; every clone refers to
/// the same replica and replication channel.
#[derive(Clone)]
pub struct CollectionHandle {
    channel: Arc<Channel>,
}

impl CollectionHandle {
    pub fn name(&self) -> &str {
        &self.channel.name
    }

    pub fn remote_url(&self) -> &str {
        &self.channel.remote_url
    }

    /// The local replica.
    pub fn replica(&self) -> Arc<MemoryStore> {
        Arc::clone(&self.channel.replica)
    }

    /// The local replica as a trait object, for adapters.
    pub fn store(&self) -> Arc<dyn DocumentStore> {
        self.replica()
    }

    /// Whether the first pull from the remote has completed.
    pub fn is_ready(&self) -> bool {
        self.channel.ready.is_set()
    }

    /// Run `callback` once the first pull has completed.
    pub fn when_ready(&self, callback: impl FnOnce() + Send + 'static) {
        self.channel.ready.wait_with(callback);
    }

    /// Run one replication pass on the calling thread.
    pub fn sync_now(&self) -> Result<ReplicationReport> {
        Ok(replicate_pass(&self.channel.replicator, &self.channel.ready)?)
    }

    /// Same handle (same underlying channel)?
    pub fn ptr_eq(&self, other: &CollectionHandle) -> bool {
        Arc::ptr_eq(&self.channel, &other.channel)
    }

    fn stop(&self) {
        let thread = self
            .channel
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(thread) = thread {
            let stats = thread.stop();
            debug!(collection = %self.channel.name, passes = stats.passes, "replication stopped");
        }
    }
}

/// Process-wide registry of synced collections.
///
/// ## Example
///
/// ```
/// use mailround_sync::{MemoryServer, SyncConfig, SyncManager};
/// use std::sync::Arc;
///
/// let server = MemoryServer::new();
/// server.create_database("mem://labeldb");
/// let manager = SyncManager::new(SyncConfig::new("mem://").manual(), Arc::new(server));
///
/// let first = manager.register_synced_collection("labeldb", "mem://", |_| {}, |_| {});
/// let again = manager.register_synced_collection("labeldb", "mem://", |_| {}, |_| {});
/// assert!(first.ptr_eq(&again));
/// ```
pub struct SyncManager {
    config: SyncConfig,
    connector: Arc<dyn RemoteConnector>,
    registry: Mutex<HashMap<String, CollectionHandle>>,
}

impl SyncManager {
    pub fn new(config: SyncConfig, connector: Arc<dyn RemoteConnector>) -> Self {
        Self {
            config,
            connector,
            registry: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn root_url(&self) -> &str {
        &self.config.root_url
    }

    /// Stand up replication for `local_name` against
    /// `remote_base_url + local_name`, delivering live tombstones to
    /// `on_deletes` and live documents to `on_changes`.
    ///
    /// Registering a name that is already registered returns the existing
    /// handle and attaches nothing: a second pair of listeners would apply
    /// every change twice.
    pub fn register_synced_collection<C, D>(
        &self,
        local_name: &str,
        remote_base_url: &str,
        on_changes: C,
        on_deletes: D,
    ) -> CollectionHandle
    where
        C: Fn(FeedDocs) + Send + Sync + 'static,
        D: Fn(FeedDocs) + Send + Sync + 'static,
    {
        let mut registry = self
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = registry.get(local_name) {
            debug!(collection = local_name, "collection already registered");
            return existing.clone();
        }

        let remote_url = collection_url(remote_base_url, local_name);
        let replica = Arc::new(MemoryStore::new(local_name));
        let remote = self.connector.open(&remote_url);
        let replicator = Arc::new(Mutex::new(Replicator::new(
            Arc::clone(&replica),
            remote,
            self.config.replication.batch_size,
        )));
        let ready = Arc::new(ReadyLatch::new());

        // Subscribed before the first replication write can land, so the
        // feed starts at "now" from the caller's point of view.
        let waker: Arc<OnceLock<Waker>> = Arc::new(OnceLock::new());
        let feed_waker = Arc::clone(&waker);
        replica.subscribe(move |records| {
            let (changes, deletes) = partition_changes(records);
            if !deletes.is_empty() {
                on_deletes(deletes);
            }
            if !changes.is_empty() {
                on_changes(changes);
            }
            if let Some(waker) = feed_waker.get() {
                waker.wake();
            }
        });

        let thread = self.config.replication.continuous.then(|| {
            ReplicationThread::spawn(
                local_name,
                Arc::clone(&replicator),
                Arc::clone(&ready),
                self.config.replication.interval(),
            )
        });
        if let Some(thread) = &thread {
            let _ = waker.set(thread.waker());
        }

        let handle = CollectionHandle {
            channel: Arc::new(Channel {
                name: local_name.to_string(),
                remote_url,
                replica,
                replicator,
                ready,
                thread: Mutex::new(thread),
            }),
        };
        info!(collection = local_name, remote = %handle.remote_url(), "registered synced collection");
        registry.insert(local_name.to_string(), handle.clone());
        handle
    }

    /// Look up a registered collection.
    pub fn handle(&self, name: &str) -> Option<CollectionHandle> {
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.handle(name).is_some()
    }

    /// Registered collection names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Run one replication pass for `name` on the calling thread.
    pub fn sync_now(&self, name: &str) -> Result<ReplicationReport> {
        self.handle(name)
            .ok_or_else(|| SyncError::UnknownCollection(name.to_string()))?
            .sync_now()
    }

    /// Run one pass for every registered collection, in name order.
    pub fn sync_all(&self) -> Vec<(String, Result<ReplicationReport>)> {
        self.names()
            .into_iter()
            .map(|name| {
                let result = self.sync_now(&name);
                (name, result)
            })
            .collect()
    }

    /// Stop every background replication thread. Registrations stay in place
    /// and can still be driven with `sync_now`.
    pub fn shutdown(&self) {
        let handles: Vec<CollectionHandle> = self
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        for handle in handles {
            handle.stop();
        }
    }
}

impl Drop for SyncManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
