//! MemoryStore - HashMap-backed document database used as the local replica.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use serde_json::Value;

use super::{ChangeRecord, ChangesBatch, DocumentStore, Since, StoreError};
use crate::document::{Revision, StoredDoc};

/// Identifies a change listener registered with [`MemoryStore::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(&[ChangeRecord]) + Send + Sync>;

/// Internal stored representation: latest revision plus the sequence it was
/// written at.
struct Entry {
    doc: StoredDoc,
    seq: u64,
}

#[derive(Default)]
struct Inner {
    docs: HashMap<String, Entry>,
    update_seq: u64,
}

/// In-memory document database with a live change feed.
///
/// Listeners see every committed batch exactly once, in sequence order, and
/// are called with no store lock held, so a listener may write back into the
/// same store (its batch is delivered after the current one).
///
/// ## Example
///
/// ```
/// use mailround_sync::store::{DocumentStore, MemoryStore};
/// use serde_json::json;
///
/// let store = MemoryStore::new("sortboxdb_g1");
/// let rev = store.put("5", json!({"name": "Red"}), None).unwrap();
/// assert_eq!(rev.generation(), 1);
///
/// let doc = store.get("5").unwrap().unwrap();
/// assert_eq!(doc.body["name"], "Red");
/// ```
pub struct MemoryStore {
    name: String,
    inner: RwLock<Inner>,
    listeners: RwLock<Vec<(ListenerId, Listener)>>,
    next_listener: AtomicU64,
    pending: Mutex<VecDeque<Vec<ChangeRecord>>>,
    delivering: AtomicBool,
    available: AtomicBool,
}

impl MemoryStore {
    /// Create a new empty database.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inner: RwLock::new(Inner::default()),
            listeners: RwLock::new(Vec::new()),
            next_listener: AtomicU64::new(1),
            pending: Mutex::new(VecDeque::new()),
            delivering: AtomicBool::new(false),
            available: AtomicBool::new(true),
        }
    }

    /// Subscribe to changes committed after this call.
    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&[ChangeRecord]) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(listener)));
        id
    }

    /// Remove a listener. Returns true if it was registered.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write().unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Current update sequence (0 for an empty database).
    pub fn update_seq(&self) -> u64 {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .update_seq
    }

    /// Number of live documents.
    pub fn doc_count(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .docs
            .values()
            .filter(|entry| !entry.doc.deleted)
            .count()
    }

    /// Simulate connectivity loss: while unavailable every operation fails
    /// with `StoreError::Unavailable`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.is_available() {
            Ok(())
        } else {
            Err(StoreError::Unavailable(self.name.clone()))
        }
    }

    fn resolve(inner: &Inner, since: &Since) -> Result<u64, StoreError> {
        match since {
            Since::Start => Ok(0),
            Since::Now => Ok(inner.update_seq),
            Since::After(seq) => seq
                .parse::<u64>()
                .map_err(|_| StoreError::InvalidSequence(seq.clone())),
        }
    }

    /// Record `doc` at the next sequence.
    fn commit(inner: &mut Inner, doc: StoredDoc) -> ChangeRecord {
        inner.update_seq += 1;
        let seq = inner.update_seq;
        inner.docs.insert(
            doc.id.clone(),
            Entry {
                doc: doc.clone(),
                seq,
            },
        );
        ChangeRecord {
            seq: seq.to_string(),
            doc,
        }
    }

    /// Run `f` under the write lock. A non-empty batch is queued before the
    /// lock is released, so queue order always matches sequence order.
    fn write<R>(
        &self,
        operation: &'static str,
        f: impl FnOnce(&mut Inner) -> Result<(R, Vec<ChangeRecord>), StoreError>,
    ) -> Result<R, StoreError> {
        self.check_available()?;
        let (result, queued) = {
            let mut inner = self
                .inner
                .write()
                .map_err(|_| StoreError::LockPoisoned(operation))?;
            let (result, batch) = f(&mut inner)?;
            let queued = !batch.is_empty();
            if queued {
                self.pending
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push_back(batch);
            }
            (result, queued)
        };
        if queued {
            self.deliver();
        }
        Ok(result)
    }

    /// Hand queued batches to listeners unless another caller is already
    /// doing so; that caller then picks up our batch too.
    fn deliver(&self) {
        loop {
            if self
                .delivering
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }

            loop {
                let next = self
                    .pending
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .pop_front();
                let Some(batch) = next else { break };

                let listeners: Vec<Listener> = self
                    .listeners
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .iter()
                    .map(|(_, listener)| Arc::clone(listener))
                    .collect();
                for listener in listeners {
                    listener(&batch);
                }
            }

            self.delivering.store(false, Ordering::Release);

            let drained = self
                .pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .is_empty();
            if drained {
                return;
            }
        }
    }
}

impl DocumentStore for MemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&self, id: &str) -> Result<Option<StoredDoc>, StoreError> {
        self.check_available()?;
        let inner = self
            .inner
            .read()
            .map_err(|_| StoreError::LockPoisoned("get"))?;
        Ok(inner
            .docs
            .get(id)
            .filter(|entry| !entry.doc.deleted)
            .map(|entry| entry.doc.clone()))
    }

    fn put(&self, id: &str, body: Value, expected: Option<&Revision>) -> Result<Revision, StoreError> {
        let body = StoredDoc::clean_body(id, body);
        self.write("put", |inner| {
            let current = inner.docs.get(id).map(|entry| &entry.doc);
            let (previous, ancestry) = match (current, expected) {
                (Some(doc), Some(rev)) if &doc.rev == rev => (Some(doc.rev.clone()), doc.lineage()),
                (Some(doc), None) if doc.deleted => (Some(doc.rev.clone()), doc.lineage()),
                (None, None) => (None, Vec::new()),
                (current, expected) => {
                    return Err(StoreError::conflict(id, expected, current.map(|doc| &doc.rev)));
                }
            };

            let rev = Revision::derive(previous.as_ref(), &body, false);
            let record = Self::commit(
                inner,
                StoredDoc {
                    id: id.to_string(),
                    rev: rev.clone(),
                    deleted: false,
                    body,
                    ancestry,
                },
            );
            Ok((rev, vec![record]))
        })
    }

    fn remove(&self, id: &str, rev: &Revision) -> Result<Revision, StoreError> {
        self.write("remove", |inner| {
            let current = match inner.docs.get(id) {
                Some(entry) if !entry.doc.deleted => &entry.doc,
                _ => return Err(StoreError::NotFound { id: id.to_string() }),
            };
            if &current.rev != rev {
                return Err(StoreError::conflict(id, Some(rev), Some(&current.rev)));
            }
            let ancestry = current.lineage();

            let body = StoredDoc::tombstone_body(id);
            let tombstone = Revision::derive(Some(rev), &body, true);
            let record = Self::commit(
                inner,
                StoredDoc {
                    id: id.to_string(),
                    rev: tombstone.clone(),
                    deleted: true,
                    body,
                    ancestry,
                },
            );
            Ok((tombstone, vec![record]))
        })
    }

    fn all_docs(&self) -> Result<Vec<StoredDoc>, StoreError> {
        self.check_available()?;
        let inner = self
            .inner
            .read()
            .map_err(|_| StoreError::LockPoisoned("all_docs"))?;
        let mut docs: Vec<StoredDoc> = inner
            .docs
            .values()
            .filter(|entry| !entry.doc.deleted)
            .map(|entry| entry.doc.clone())
            .collect();
        docs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(docs)
    }

    fn changes(&self, since: &Since, limit: usize) -> Result<ChangesBatch, StoreError> {
        self.check_available()?;
        let inner = self
            .inner
            .read()
            .map_err(|_| StoreError::LockPoisoned("changes"))?;
        let since = Self::resolve(&inner, since)?;

        let mut entries: Vec<&Entry> = inner.docs.values().filter(|e| e.seq > since).collect();
        entries.sort_by_key(|entry| entry.seq);

        let total = entries.len();
        let limit = limit.max(1);
        let results: Vec<ChangeRecord> = entries
            .into_iter()
            .take(limit)
            .map(|entry| ChangeRecord {
                seq: entry.seq.to_string(),
                doc: entry.doc.clone(),
            })
            .collect();
        let last_seq = results
            .last()
            .map_or_else(|| since.to_string(), |record| record.seq.clone());

        Ok(ChangesBatch {
            pending: (total - results.len()) as u64,
            results,
            last_seq,
        })
    }

    fn apply_replicated(&self, docs: Vec<StoredDoc>) -> Result<usize, StoreError> {
        self.write("apply_replicated", |inner| {
            let mut batch = Vec::new();
            for incoming in docs {
                let wins = inner
                    .docs
                    .get(&incoming.id)
                    .map_or(true, |entry| incoming.rev.wins_over(&entry.doc.rev));
                if !wins {
                    continue;
                }
                let doc = StoredDoc {
                    body: if incoming.deleted {
                        StoredDoc::tombstone_body(&incoming.id)
                    } else {
                        StoredDoc::clean_body(&incoming.id, incoming.body)
                    },
                    ..incoming
                };
                batch.push(Self::commit(inner, doc));
            }
            Ok((batch.len(), batch))
        })
    }
}
