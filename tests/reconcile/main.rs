//! Integration tests for write outcomes and the reconciler.

#[path = "../support/mod.rs"]
mod support;

use std::sync::Arc;
use std::time::Duration;

use mailround_sync::entities::{GroupDataItem, PostboxItem, SortBoxItem};
use mailround_sync::entities::LatLng;
use mailround_sync::{
    CollectionStore, Collections, DocumentAdapter, DocumentStore, OutcomeQueue, Reconciler,
    ReconcilerThread, RetryPolicy, WriteOp, WriteOutcome,
};
use serde_json::json;
use support::{manual, url};

fn postbox(id: &str) -> PostboxItem {
    PostboxItem {
        id: id.into(),
        name: "Church St".into(),
        pos: LatLng::new(51.5, -0.1),
        collection_time: Some("17:30".into()),
    }
}

#[test]
fn store_writes_report_outcomes() {
    let (_server, manager) = manual(&["postboxdb"]);
    let queue = OutcomeQueue::new();
    let postboxes: CollectionStore<PostboxItem> =
        CollectionStore::with_outcomes(manager.clone(), queue.clone());
    postboxes.load(None);

    postboxes.add(postbox("p1"));
    postboxes.add(postbox("p1"));

    let outcomes: Vec<WriteOutcome> = queue.records().into_iter().map(|r| r.outcome).collect();
    assert_eq!(outcomes.len(), 2);
    assert!(outcomes[0].is_written());
    assert!(matches!(outcomes[1], WriteOutcome::Conflict { .. }));
}

#[test]
fn failed_write_is_retried_when_the_replica_recovers() {
    let (server, manager) = manual(&["sortboxdb_g1"]);
    let collections = Collections::with_outcomes(Arc::clone(&manager), OutcomeQueue::new());
    collections.sortboxes.load(Some("g1"));
    manager.sync_now("sortboxdb_g1").unwrap();

    let replica = manager.handle("sortboxdb_g1").unwrap().replica();
    replica.set_available(false);
    collections.sortboxes.add(SortBoxItem::new("5", "Red"));

    // Optimistic state holds even though the write failed.
    assert!(collections.sortboxes.get("5").is_some());
    assert!(replica.all_docs().is_err());

    replica.set_available(true);
    let mut reconciler = collections.reconciler().unwrap();
    let report = reconciler.drain();
    assert_eq!(report.processed, 1);
    assert_eq!(report.retried, 1);
    assert_eq!(report.settled, 1);

    manager.sync_now("sortboxdb_g1").unwrap();
    let remote = server.database(&url("sortboxdb_g1")).unwrap();
    assert_eq!(remote.get("5").unwrap().unwrap().body["name"], "Red");
}

#[test]
fn stale_retry_never_overwrites_a_newer_edit() {
    let (_server, manager) = manual(&["groupdatadb"]);
    let collections = Collections::with_outcomes(Arc::clone(&manager), OutcomeQueue::new());
    collections.groups.load(None);
    manager.sync_now("groupdatadb").unwrap();
    collections.groups.add(GroupDataItem::new("3", "North"));

    let replica = manager.handle("groupdatadb").unwrap().replica();
    replica.set_available(false);
    collections.groups.update(GroupDataItem::new("3", "Stale"));
    replica.set_available(true);
    collections.groups.update(GroupDataItem::new("3", "Newest"));

    let mut reconciler = collections.reconciler().unwrap();
    let report = reconciler.drain();
    assert_eq!(report.superseded, 1);
    assert_eq!(report.retried, 0);

    assert_eq!(replica.get("3").unwrap().unwrap().body["name"], "Newest");
    assert_eq!(collections.groups.get("3").unwrap().name, "Newest");
}

#[test]
fn conflicting_update_is_surfaced_not_overwritten() {
    let (_server, manager) = manual(&["postboxdb"]);
    let handle = manager.register_synced_collection("postboxdb", support::ROOT, |_| {}, |_| {});
    let replica = handle.replica();
    let base = replica
        .put("p1", json!({"name": "Church St", "pos": {"lat": 1.0, "lng": 2.0}}), None)
        .unwrap();
    replica
        .put("p1", json!({"name": "Church Street", "pos": {"lat": 1.0, "lng": 2.0}}), Some(&base))
        .unwrap();

    // A write issued against the stale revision, as a racing update would.
    let queue = OutcomeQueue::new();
    let stale = replica.put("p1", json!({"name": "Chapel St"}), Some(&base));
    let outcome = match stale {
        Err(err) => WriteOutcome::Conflict {
            id: "p1".into(),
            error: err.to_string(),
        },
        Ok(rev) => panic!("stale write accepted at {rev}"),
    };
    queue.publish(
        "postboxdb",
        WriteOp::Update {
            id: "p1".into(),
            body: json!({"name": "Chapel St"}),
        },
        outcome,
    );

    let mut reconciler = Reconciler::new(queue, Arc::clone(&manager), RetryPolicy::immediate(3));
    let report = reconciler.drain();

    assert_eq!(report.conflicts, 1);
    assert_eq!(reconciler.conflicts()[0].op.id(), "p1");
    assert_eq!(replica.get("p1").unwrap().unwrap().body["name"], "Church Street");
}

#[test]
fn adapter_on_a_registered_replica() {
    let (_server, manager) = manual(&["postboxdb"]);
    let handle = manager.register_synced_collection("postboxdb", support::ROOT, |_| {}, |_| {});
    let adapter: DocumentAdapter<PostboxItem> = DocumentAdapter::new(handle.store());

    assert!(adapter.create(&postbox("p1")).is_written());
    assert_eq!(adapter.read("p1"), Some(postbox("p1")));
    assert_eq!(adapter.read("p2"), None);
    assert!(adapter.delete("p1").is_written());
    assert!(matches!(adapter.delete("p1"), WriteOutcome::Missing { .. }));
}

#[test]
fn background_reconciler_gives_up_after_max_attempts() {
    let (_server, manager) = manual(&["postboxdb"]);
    let queue = OutcomeQueue::new();
    let postboxes: CollectionStore<PostboxItem> =
        CollectionStore::with_outcomes(manager.clone(), queue.clone());
    postboxes.load(None);
    let replica = manager.handle("postboxdb").unwrap().replica();
    replica.set_available(false);

    let reconciler = Reconciler::new(queue.clone(), Arc::clone(&manager), RetryPolicy::immediate(2));
    let thread = ReconcilerThread::spawn(reconciler, Duration::from_millis(5));
    postboxes.add(postbox("p9"));

    let (reconciler, report) = thread.stop().unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(reconciler.failed()[0].attempts, 2);
    assert!(queue.is_empty());
    assert!(postboxes.get("p9").is_some());
}
