//! Load/dispatch glue - turns a view's data requirements into `Load`
//! dispatches, and answers whether that view is still waiting on data.
//!
//! Stateless beyond the stores it holds: deduplication lives in the
//! registrar and retries live in the reconciler.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::warn;

use crate::collection::{CollectionStore, LoadStatus};
use crate::document::Document;
use crate::entities::{
    AssignedDataItem, GroupDataItem, LabelData, PolygonDataItem, PostboxItem, RoundDataItem,
    SortBoxItem, SortDataItem, StreetInfoItem, UserRecord,
};
use crate::reconcile::{OutcomeQueue, Reconciler};
use crate::registrar::SyncManager;
use crate::tracker::is_still_loading;

/// The nine synced collection kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CollectionKind {
    Assigned,
    Groups,
    Rounds,
    SortBoxes,
    SortData,
    Streets,
    Labels,
    Polygons,
    Postboxes,
}

impl CollectionKind {
    pub const ALL: [CollectionKind; 9] = [
        CollectionKind::Assigned,
        CollectionKind::Groups,
        CollectionKind::Rounds,
        CollectionKind::SortBoxes,
        CollectionKind::SortData,
        CollectionKind::Streets,
        CollectionKind::Labels,
        CollectionKind::Polygons,
        CollectionKind::Postboxes,
    ];

    pub fn base_name(self) -> &'static str {
        match self {
            CollectionKind::Assigned => AssignedDataItem::COLLECTION,
            CollectionKind::Groups => GroupDataItem::COLLECTION,
            CollectionKind::Rounds => RoundDataItem::COLLECTION,
            CollectionKind::SortBoxes => SortBoxItem::COLLECTION,
            CollectionKind::SortData => SortDataItem::COLLECTION,
            CollectionKind::Streets => StreetInfoItem::COLLECTION,
            CollectionKind::Labels => LabelData::COLLECTION,
            CollectionKind::Polygons => PolygonDataItem::COLLECTION,
            CollectionKind::Postboxes => PostboxItem::COLLECTION,
        }
    }

    pub fn is_group_scoped(self) -> bool {
        match self {
            CollectionKind::Assigned => AssignedDataItem::GROUP_SCOPED,
            CollectionKind::Groups => GroupDataItem::GROUP_SCOPED,
            CollectionKind::Rounds => RoundDataItem::GROUP_SCOPED,
            CollectionKind::SortBoxes => SortBoxItem::GROUP_SCOPED,
            CollectionKind::SortData => SortDataItem::GROUP_SCOPED,
            CollectionKind::Streets => StreetInfoItem::GROUP_SCOPED,
            CollectionKind::Labels => LabelData::GROUP_SCOPED,
            CollectionKind::Polygons => PolygonDataItem::GROUP_SCOPED,
            CollectionKind::Postboxes => PostboxItem::GROUP_SCOPED,
        }
    }

    /// Concrete collection name for `group`.
    pub fn collection_name(self, group: Option<&str>) -> String {
        match group {
            Some(group) if self.is_group_scoped() => format!("{}{}", self.base_name(), group),
            _ => self.base_name().to_string(),
        }
    }
}

impl fmt::Display for CollectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.base_name())
    }
}

/// Who is looking at the data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Caller {
    /// Sees every group; picks one for group-scoped views.
    Admin,
    /// Sees only their own group.
    GroupMember { group_id: String },
}

impl Caller {
    /// `None` for a non-admin account with no group.
    pub fn from_user(user: &UserRecord) -> Option<Caller> {
        if user.is_admin() {
            return Some(Caller::Admin);
        }
        user.group_id
            .as_ref()
            .map(|group_id| Caller::GroupMember {
                group_id: group_id.clone(),
            })
    }

    /// The caller's own group, if bound to one.
    pub fn group(&self) -> Option<&str> {
        match self {
            Caller::Admin => None,
            Caller::GroupMember { group_id } => Some(group_id),
        }
    }

    /// Group whose scoped collections a view should use. Admins choose;
    /// members always get their own group.
    pub fn scope<'a>(&'a self, requested: Option<&'a str>) -> Option<&'a str> {
        match self {
            Caller::Admin => requested,
            Caller::GroupMember { group_id } => Some(group_id),
        }
    }
}

/// The collections a view needs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ViewRequirements {
    /// Shared by everyone.
    pub public: Vec<CollectionKind>,
    /// One per group.
    pub user: Vec<CollectionKind>,
}

impl ViewRequirements {
    /// Split `kinds` into public and group-scoped requirements.
    pub fn of(kinds: &[CollectionKind]) -> Self {
        let (user, public): (Vec<CollectionKind>, Vec<CollectionKind>) =
            kinds.iter().partition(|kind| kind.is_group_scoped());
        Self { public, user }
    }

    fn public_names(&self) -> Vec<&'static str> {
        self.public.iter().map(|kind| kind.base_name()).collect()
    }

    fn user_names(&self) -> Vec<&'static str> {
        self.user.iter().map(|kind| kind.base_name()).collect()
    }
}

/// One synced collection store per kind, sharing a single [`SyncManager`].
#[derive(Clone)]
pub struct Collections {
    manager: Arc<SyncManager>,
    outcomes: Option<OutcomeQueue>,
    pub assigned: CollectionStore<AssignedDataItem>,
    pub groups: CollectionStore<GroupDataItem>,
    pub rounds: CollectionStore<RoundDataItem>,
    pub sortboxes: CollectionStore<SortBoxItem>,
    pub sort_data: CollectionStore<SortDataItem>,
    pub streets: CollectionStore<StreetInfoItem>,
    pub labels: CollectionStore<LabelData>,
    pub polygons: CollectionStore<PolygonDataItem>,
    pub postboxes: CollectionStore<PostboxItem>,
}

impl Collections {
    pub fn new(manager: Arc<SyncManager>) -> Self {
        Self::build(manager, None)
    }

    /// Stores that report every write outcome to `queue`.
    pub fn with_outcomes(manager: Arc<SyncManager>, queue: OutcomeQueue) -> Self {
        Self::build(manager, Some(queue))
    }

    fn build(manager: Arc<SyncManager>, outcomes: Option<OutcomeQueue>) -> Self {
        fn store<T: Document>(
            manager: &Arc<SyncManager>,
            outcomes: &Option<OutcomeQueue>,
        ) -> CollectionStore<T> {
            match outcomes {
                Some(queue) => CollectionStore::with_outcomes(Arc::clone(manager), queue.clone()),
                None => CollectionStore::new(Arc::clone(manager)),
            }
        }

        Self {
            assigned: store(&manager, &outcomes),
            groups: store(&manager, &outcomes),
            rounds: store(&manager, &outcomes),
            sortboxes: store(&manager, &outcomes),
            sort_data: store(&manager, &outcomes),
            streets: store(&manager, &outcomes),
            labels: store(&manager, &outcomes),
            polygons: store(&manager, &outcomes),
            postboxes: store(&manager, &outcomes),
            manager,
            outcomes,
        }
    }

    pub fn manager(&self) -> &Arc<SyncManager> {
        &self.manager
    }

    pub fn outcomes(&self) -> Option<&OutcomeQueue> {
        self.outcomes.as_ref()
    }

    /// A reconciler over this set's outcome queue, using the manager's
    /// retry policy.
    pub fn reconciler(&self) -> Option<Reconciler<Arc<SyncManager>>> {
        let queue = self.outcomes.clone()?;
        Some(Reconciler::new(
            queue,
            Arc::clone(&self.manager),
            self.manager.config().retry.clone(),
        ))
    }

    /// Dispatch `Load` to the store for `kind`.
    pub fn load(&self, kind: CollectionKind, group: Option<&str>) {
        match kind {
            CollectionKind::Assigned => self.assigned.load(group),
            CollectionKind::Groups => self.groups.load(group),
            CollectionKind::Rounds => self.rounds.load(group),
            CollectionKind::SortBoxes => self.sortboxes.load(group),
            CollectionKind::SortData => self.sort_data.load(group),
            CollectionKind::Streets => self.streets.load(group),
            CollectionKind::Labels => self.labels.load(group),
            CollectionKind::Polygons => self.polygons.load(group),
            CollectionKind::Postboxes => self.postboxes.load(group),
        }
    }

    pub fn status(&self, kind: CollectionKind) -> LoadStatus {
        match kind {
            CollectionKind::Assigned => self.assigned.status(),
            CollectionKind::Groups => self.groups.status(),
            CollectionKind::Rounds => self.rounds.status(),
            CollectionKind::SortBoxes => self.sortboxes.status(),
            CollectionKind::SortData => self.sort_data.status(),
            CollectionKind::Streets => self.streets.status(),
            CollectionKind::Labels => self.labels.status(),
            CollectionKind::Polygons => self.polygons.status(),
            CollectionKind::Postboxes => self.postboxes.status(),
        }
    }

    fn scope(&self, kind: CollectionKind) -> Option<String> {
        match kind {
            CollectionKind::Assigned => self.assigned.collection_name(),
            CollectionKind::Groups => self.groups.collection_name(),
            CollectionKind::Rounds => self.rounds.collection_name(),
            CollectionKind::SortBoxes => self.sortboxes.collection_name(),
            CollectionKind::SortData => self.sort_data.collection_name(),
            CollectionKind::Streets => self.streets.collection_name(),
            CollectionKind::Labels => self.labels.collection_name(),
            CollectionKind::Polygons => self.polygons.collection_name(),
            CollectionKind::Postboxes => self.postboxes.collection_name(),
        }
    }

    /// Load status keyed by concrete collection name. Collections that were
    /// never loaded appear under their base name.
    pub fn statuses(&self) -> HashMap<String, LoadStatus> {
        CollectionKind::ALL
            .iter()
            .map(|&kind| {
                let name = self
                    .scope(kind)
                    .unwrap_or_else(|| kind.base_name().to_string());
                (name, self.status(kind))
            })
            .collect()
    }
}

/// Dispatch one `Load` per collection the view needs. Group-scoped
/// collections are skipped when the caller has no group to scope them to.
pub fn load_view(
    collections: &Collections,
    caller: &Caller,
    requested_group: Option<&str>,
    requirements: &ViewRequirements,
) {
    for &kind in &requirements.public {
        collections.load(kind, None);
    }

    let group = caller.scope(requested_group);
    for &kind in &requirements.user {
        match group {
            Some(group) => collections.load(kind, Some(group)),
            None => warn!(collection = %kind, "no group selected; not loading"),
        }
    }
}

/// Whether the view is still waiting on any of its collections.
pub fn still_loading(
    collections: &Collections,
    caller: &Caller,
    requested_group: Option<&str>,
    requirements: &ViewRequirements,
) -> bool {
    let group = caller.scope(requested_group);
    if group.is_none() && !requirements.user.is_empty() {
        return true;
    }
    is_still_loading(
        &requirements.public_names(),
        &requirements.user_names(),
        group.unwrap_or_default(),
        &collections.statuses(),
    )
}
