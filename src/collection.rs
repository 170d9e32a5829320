//! Synced collection - one generic reducer, instantiated once per entity kind.
//!
//! ```text
//!   view ──Action──▶ CollectionStore::dispatch
//!                         │  (state lock)
//!                         ▼
//!                 CollectionState::reduce ──▶ Option<Effect>
//!                         │  (lock released)
//!                         ▼
//!        Register ──▶ SyncManager ──feed──▶ Changes / Deletes / Loaded
//!        Create / Update / Delete ──▶ DocumentAdapter ──▶ replica
//! ```
//!
//! `reduce` is pure. Feed actions never produce effects, so a feed callback
//! fired from inside an adapter write only ever takes the state lock.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::adapter::DocumentAdapter;
use crate::document::{decode_docs, DocMap, Document};
use crate::reconcile::OutcomeQueue;
use crate::registrar::{CollectionHandle, FeedDocs, SyncManager};
use crate::store::DocumentStore;

/// How far a collection has got with its first snapshot.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum LoadStatus {
    /// Never requested.
    #[default]
    Unknown,
    /// Registered; first snapshot not yet applied.
    Loading,
    /// First snapshot applied.
    Loaded,
}

impl LoadStatus {
    /// Move forward to `next`; never moves back.
    pub fn advance(self, next: LoadStatus) -> LoadStatus {
        self.max(next)
    }

    pub fn is_loaded(self) -> bool {
        self == LoadStatus::Loaded
    }
}

/// Everything a collection can be asked to do.
#[derive(Debug, Clone, PartialEq)]
pub enum Action<T> {
    /// Register the collection (for `group` when group-scoped) and request
    /// its snapshot.
    Load { group: Option<String> },
    /// Replace the snapshot wholesale.
    Loaded(DocMap<T>),
    /// Merge live documents into the snapshot.
    Changes(DocMap<T>),
    /// Drop these ids from the snapshot.
    Deletes(BTreeSet<String>),
    Add(T),
    Update(T),
    Delete(T),
    Select(Option<T>),
}

impl<T> Action<T> {
    pub fn name(&self) -> &'static str {
        match self {
            Action::Load { .. } => "load",
            Action::Loaded(_) => "loaded",
            Action::Changes(_) => "changes",
            Action::Deletes(_) => "deletes",
            Action::Add(_) => "add",
            Action::Update(_) => "update",
            Action::Delete(_) => "delete",
            Action::Select(_) => "select",
        }
    }
}

/// Work a reduction asks the store to carry out.
///
/// `collection` is `None` for writes to a group-scoped collection that was
/// never loaded: there is no replica to persist them to.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect<T> {
    Register { collection: String },
    Create { collection: Option<String>, doc: T },
    Update { collection: Option<String>, doc: T },
    Delete { collection: Option<String>, id: String },
}

/// State of one synced collection.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionState<T> {
    pub status: LoadStatus,
    pub snapshot: DocMap<T>,
    pub selected: Option<T>,
    /// Concrete collection name this state is bound to.
    pub scope: Option<String>,
}

impl<T> Default for CollectionState<T> {
    fn default() -> Self {
        Self {
            status: LoadStatus::Unknown,
            snapshot: DocMap::new(),
            selected: None,
            scope: None,
        }
    }
}

impl<T: Document> CollectionState<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply `action`, returning the effect it calls for.
    pub fn reduce(&mut self, action: Action<T>) -> Option<Effect<T>> {
        match action {
            Action::Load { group } => {
                let collection = T::collection_name(group.as_deref());
                match &self.scope {
                    Some(current) if *current != collection => {
                        debug!(from = %current, to = %collection, "collection scope changed");
                        self.snapshot.clear();
                        self.selected = None;
                        self.status = LoadStatus::Loading;
                    }
                    _ => self.status = self.status.advance(LoadStatus::Loading),
                }
                self.scope = Some(collection.clone());
                Some(Effect::Register { collection })
            }
            Action::Loaded(docs) => {
                self.snapshot = rekey(docs);
                self.refresh_selection();
                self.status = LoadStatus::Loaded;
                None
            }
            Action::Changes(docs) => {
                self.snapshot.extend(rekey(docs));
                self.refresh_selection();
                None
            }
            Action::Deletes(ids) => {
                for id in &ids {
                    self.snapshot.remove(id);
                }
                if self
                    .selected
                    .as_ref()
                    .is_some_and(|selected| ids.contains(selected.id()))
                {
                    self.selected = None;
                }
                None
            }
            Action::Add(doc) => {
                if self.rejects(&doc, "add") {
                    return None;
                }
                self.snapshot.insert(doc.id().to_string(), doc.clone());
                Some(Effect::Create {
                    collection: self.write_target(),
                    doc,
                })
            }
            Action::Update(doc) => {
                if self.rejects(&doc, "update") {
                    return None;
                }
                if let Some(existing) = self.snapshot.get_mut(doc.id()) {
                    *existing = doc.clone();
                }
                if self
                    .selected
                    .as_ref()
                    .is_some_and(|selected| selected.id() == doc.id())
                {
                    self.selected = Some(doc.clone());
                }
                Some(Effect::Update {
                    collection: self.write_target(),
                    doc,
                })
            }
            Action::Delete(doc) => {
                if self.rejects(&doc, "delete") {
                    return None;
                }
                self.snapshot.remove(doc.id());
                if self
                    .selected
                    .as_ref()
                    .is_some_and(|selected| selected.id() == doc.id())
                {
                    self.selected = None;
                }
                Some(Effect::Delete {
                    collection: self.write_target(),
                    id: doc.id().to_string(),
                })
            }
            Action::Select(doc) => {
                if doc.as_ref().is_some_and(|doc| self.rejects(doc, "select")) {
                    return None;
                }
                self.selected = doc;
                None
            }
        }
    }

    /// Snapshot values ordered by [`numeric_id_cmp`].
    pub fn sorted(&self) -> Vec<T> {
        let mut docs: Vec<T> = self.snapshot.values().cloned().collect();
        docs.sort_by(|a, b| numeric_id_cmp(a.id(), b.id()));
        docs
    }

    fn rejects(&self, doc: &T, op: &str) -> bool {
        if doc.is_unassigned() {
            warn!(collection = T::COLLECTION, op, "refusing to edit the unassigned id");
            return true;
        }
        false
    }

    fn write_target(&self) -> Option<String> {
        self.scope
            .clone()
            .or_else(|| (!T::GROUP_SCOPED).then(|| T::collection_name(None)))
    }

    fn refresh_selection(&mut self) {
        if let Some(selected) = &self.selected {
            if let Some(current) = self.snapshot.get(selected.id()) {
                self.selected = Some(current.clone());
            }
        }
    }
}

/// Key every document by its own id, whatever key it arrived under.
fn rekey<T: Document>(docs: DocMap<T>) -> DocMap<T> {
    docs.into_values()
        .map(|doc| (doc.id().to_string(), doc))
        .collect()
}

/// Display order for string ids: ids that read as numbers come first, in
/// numeric order, so `"2"` sorts before `"10"`. Everything else follows in
/// lexicographic order.
pub fn numeric_id_cmp(a: &str, b: &str) -> Ordering {
    fn number(id: &str) -> Option<f64> {
        id.trim().parse::<f64>().ok().filter(|n| n.is_finite())
    }

    match (number(a), number(b)) {
        (Some(x), Some(y)) => x.total_cmp(&y).then_with(|| a.cmp(b)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.cmp(b),
    }
}

struct Shared<T> {
    state: RwLock<CollectionState<T>>,
    manager: Arc<SyncManager>,
    outcomes: Option<OutcomeQueue>,
}

/// A synced collection: reducer state plus the wiring that carries out its
/// effects. Clones share the same state.
///
/// ## Example
///
/// ```
/// use mailround_sync::entities::SortBoxItem;
/// use mailround_sync::{CollectionStore, LoadStatus, MemoryServer, SyncConfig, SyncManager};
/// use std::sync::Arc;
///
/// let server = MemoryServer::new();
/// server.create_database("mem://sortboxdb_g1");
/// let manager = Arc::new(SyncManager::new(SyncConfig::new("mem://").manual(), Arc::new(server)));
///
/// let boxes: CollectionStore<SortBoxItem> = CollectionStore::new(manager.clone());
/// boxes.load(Some("g1"));
/// assert_eq!(boxes.status(), LoadStatus::Loading);
///
/// boxes.add(SortBoxItem::new("5", "Red"));
/// assert!(boxes.get("5").is_some());
///
/// manager.sync_now("sortboxdb_g1").unwrap();
/// assert_eq!(boxes.status(), LoadStatus::Loaded);
/// ```
pub struct CollectionStore<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for CollectionStore<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Document> CollectionStore<T> {
    pub fn new(manager: Arc<SyncManager>) -> Self {
        Self::build(manager, None)
    }

    /// Like [`new`](Self::new), reporting every write outcome to `queue`.
    pub fn with_outcomes(manager: Arc<SyncManager>, queue: OutcomeQueue) -> Self {
        Self::build(manager, Some(queue))
    }

    fn build(manager: Arc<SyncManager>, outcomes: Option<OutcomeQueue>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: RwLock::new(CollectionState::new()),
                manager,
                outcomes,
            }),
        }
    }

    fn from_shared(shared: Arc<Shared<T>>) -> Self {
        Self { shared }
    }

    fn read(&self) -> RwLockReadGuard<'_, CollectionState<T>> {
        self.shared
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, CollectionState<T>> {
        self.shared
            .state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Reduce `action`, then carry out whatever effect it produced.
    pub fn dispatch(&self, action: Action<T>) {
        let effect = self.write().reduce(action);
        if let Some(effect) = effect {
            self.run(effect);
        }
    }

    pub fn load(&self, group: Option<&str>) {
        self.dispatch(Action::Load {
            group: group.map(str::to_string),
        });
    }

    pub fn loaded(&self, docs: DocMap<T>) {
        self.dispatch(Action::Loaded(docs));
    }

    pub fn changes(&self, docs: DocMap<T>) {
        self.dispatch(Action::Changes(docs));
    }

    pub fn deletes(&self, ids: BTreeSet<String>) {
        self.dispatch(Action::Deletes(ids));
    }

    pub fn add(&self, doc: T) {
        self.dispatch(Action::Add(doc));
    }

    pub fn update(&self, doc: T) {
        self.dispatch(Action::Update(doc));
    }

    pub fn delete(&self, doc: T) {
        self.dispatch(Action::Delete(doc));
    }

    pub fn select(&self, doc: Option<T>) {
        self.dispatch(Action::Select(doc));
    }

    pub fn status(&self) -> LoadStatus {
        self.read().status
    }

    pub fn snapshot(&self) -> DocMap<T> {
        self.read().snapshot.clone()
    }

    pub fn get(&self, id: &str) -> Option<T> {
        self.read().snapshot.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.read().snapshot.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().snapshot.is_empty()
    }

    pub fn selected(&self) -> Option<T> {
        self.read().selected.clone()
    }

    /// Snapshot values in display order.
    pub fn sorted(&self) -> Vec<T> {
        self.read().sorted()
    }

    /// Concrete collection name, once loaded.
    pub fn collection_name(&self) -> Option<String> {
        self.read().scope.clone()
    }

    /// Copy of the whole state.
    pub fn state(&self) -> CollectionState<T> {
        self.read().clone()
    }

    fn run(&self, effect: Effect<T>) {
        match effect {
            Effect::Register { collection } => {
                self.register(&collection);
            }
            Effect::Create { collection, doc } => {
                if let Some(adapter) = self.adapter(collection.as_deref(), "create") {
                    adapter.create(&doc);
                }
            }
            Effect::Update { collection, doc } => {
                if let Some(adapter) = self.adapter(collection.as_deref(), "update") {
                    adapter.update(doc.id(), &doc);
                }
            }
            Effect::Delete { collection, id } => {
                if let Some(adapter) = self.adapter(collection.as_deref(), "delete") {
                    adapter.delete(&id);
                }
            }
        }
    }

    fn adapter(&self, collection: Option<&str>, op: &str) -> Option<DocumentAdapter<T>> {
        let Some(collection) = collection else {
            warn!(collection = T::COLLECTION, op, "no group loaded; write kept in memory only");
            return None;
        };
        let handle = self.ensure_registered(collection);
        let adapter = DocumentAdapter::new(handle.store());
        Some(match &self.shared.outcomes {
            Some(queue) => adapter.with_outcomes(queue.clone()),
            None => adapter,
        })
    }

    fn ensure_registered(&self, collection: &str) -> CollectionHandle {
        match self.shared.manager.handle(collection) {
            Some(handle) => handle,
            None => self.register(collection),
        }
    }

    fn register(&self, collection: &str) -> CollectionHandle {
        let manager = &self.shared.manager;

        let weak = Arc::downgrade(&self.shared);
        let scope = collection.to_string();
        let on_changes = move |docs: FeedDocs| {
            feed(&weak, &scope, || Action::Changes(decode_docs(docs.values())));
        };

        let weak = Arc::downgrade(&self.shared);
        let scope = collection.to_string();
        let on_deletes = move |docs: FeedDocs| {
            feed(&weak, &scope, || Action::Deletes(docs.into_keys().collect()));
        };

        let handle =
            manager.register_synced_collection(collection, manager.root_url(), on_changes, on_deletes);

        let weak = Arc::downgrade(&self.shared);
        let scope = collection.to_string();
        let replica = handle.replica();
        handle.when_ready(move || match replica.all_docs() {
            Ok(docs) => feed(&weak, &scope, || Action::Loaded(decode_docs(docs.iter()))),
            Err(err) => warn!(collection = %scope, error = %err, "initial snapshot unreadable"),
        });

        handle
    }
}

/// Deliver a feed action unless the store is gone or is not bound to `scope`.
///
/// A store that was written to but never loaded is unbound: its replica may
/// already be wired, but nothing reaches the state until `Load` binds it.
fn feed<T: Document>(shared: &Weak<Shared<T>>, scope: &str, action: impl FnOnce() -> Action<T>) {
    let Some(shared) = shared.upgrade() else {
        return;
    };
    let store = CollectionStore::from_shared(shared);
    let mut state = store.write();
    if state.scope.as_deref() != Some(scope) {
        debug!(collection = scope, "dropping feed event for unbound scope");
        return;
    }
    let action = action();
    debug!(collection = scope, action = action.name(), "applying feed event");
    let effect = state.reduce(action);
    debug_assert!(effect.is_none(), "feed actions carry no effects");
}
