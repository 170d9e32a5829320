//! Integration tests for the replication registrar (SyncManager).

#[path = "../support/mod.rs"]
mod support;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use mailround_sync::{DocumentStore, FeedDocs, StoreError, SyncError};
use serde_json::json;
use support::{continuous, manual, url, wait_until};

fn counter() -> (Arc<AtomicUsize>, impl Fn(FeedDocs) + Send + Sync + 'static) {
    let count = Arc::new(AtomicUsize::new(0));
    let hits = Arc::clone(&count);
    (count, move |docs: FeedDocs| {
        hits.fetch_add(docs.len(), Ordering::SeqCst);
    })
}

#[test]
fn double_registration_keeps_one_replica_and_one_listener() {
    let (server, manager) = manual(&["labeldb"]);
    let (first_changes, on_first) = counter();
    let (second_changes, on_second) = counter();

    let first = manager.register_synced_collection("labeldb", support::ROOT, on_first, |_| {});
    let second = manager.register_synced_collection("labeldb", support::ROOT, on_second, |_| {});

    assert!(first.ptr_eq(&second));
    assert!(Arc::ptr_eq(&first.replica(), &second.replica()));
    assert_eq!(first.replica().listener_count(), 1);
    assert_eq!(manager.names(), vec!["labeldb".to_string()]);

    let remote = server.database(&url("labeldb")).unwrap();
    remote.put("AB1", json!({"labels": []}), None).unwrap();
    manager.sync_now("labeldb").unwrap();

    assert_eq!(first_changes.load(Ordering::SeqCst), 1);
    assert_eq!(second_changes.load(Ordering::SeqCst), 0);
}

#[test]
fn remote_url_appends_name_without_separator() {
    let (_server, manager) = manual(&[]);
    let handle = manager.register_synced_collection("rounddb_g1", support::ROOT, |_| {}, |_| {});
    assert_eq!(handle.remote_url(), "mem://couch/rounddb_g1");
    assert_eq!(handle.name(), "rounddb_g1");
}

#[test]
fn feed_splits_live_documents_from_tombstones() {
    let (server, manager) = manual(&["postboxdb"]);
    let seen_changes: Arc<Mutex<Vec<String>>> = Arc::default();
    let seen_deletes: Arc<Mutex<Vec<String>>> = Arc::default();

    let changes = Arc::clone(&seen_changes);
    let deletes = Arc::clone(&seen_deletes);
    manager.register_synced_collection(
        "postboxdb",
        support::ROOT,
        move |docs| changes.lock().unwrap().extend(docs.into_keys()),
        move |docs| deletes.lock().unwrap().extend(docs.into_keys()),
    );

    let remote = server.database(&url("postboxdb")).unwrap();
    let rev = remote.put("p1", json!({"name": "Church St"}), None).unwrap();
    remote.put("p2", json!({"name": "Station"}), None).unwrap();
    manager.sync_now("postboxdb").unwrap();

    remote.remove("p1", &rev).unwrap();
    manager.sync_now("postboxdb").unwrap();

    assert_eq!(*seen_changes.lock().unwrap(), vec!["p1", "p2"]);
    assert_eq!(*seen_deletes.lock().unwrap(), vec!["p1"]);
}

#[test]
fn feed_only_reports_changes_after_registration() {
    let (_server, manager) = manual(&["labeldb"]);
    let (changes, on_changes) = counter();

    let handle = manager.register_synced_collection("labeldb", support::ROOT, on_changes, |_| {});
    handle.replica().put("AB1", json!({}), None).unwrap();

    assert_eq!(changes.load(Ordering::SeqCst), 1);
}

#[test]
fn missing_database_waits_until_it_exists() {
    let (server, manager) = manual(&[]);
    let handle = manager.register_synced_collection("streetinfodb", support::ROOT, |_| {}, |_| {});

    let err = manager.sync_now("streetinfodb").unwrap_err();
    assert!(matches!(
        err,
        SyncError::Store(StoreError::MissingDatabase(_))
    ));
    assert!(!handle.is_ready());

    server.create_database(&url("streetinfodb"));
    manager.sync_now("streetinfodb").unwrap();
    assert!(handle.is_ready());
}

#[test]
fn ready_callbacks_run_once_after_first_pull() {
    let (_server, manager) = manual(&["labeldb"]);
    let handle = manager.register_synced_collection("labeldb", support::ROOT, |_| {}, |_| {});
    let calls = Arc::new(AtomicUsize::new(0));

    let early = Arc::clone(&calls);
    handle.when_ready(move || {
        early.fetch_add(1, Ordering::SeqCst);
    });
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    manager.sync_now("labeldb").unwrap();
    manager.sync_now("labeldb").unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let late = Arc::clone(&calls);
    handle.when_ready(move || {
        late.fetch_add(1, Ordering::SeqCst);
    });
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn unknown_collection_cannot_be_synced() {
    let (_server, manager) = manual(&[]);
    assert!(matches!(
        manager.sync_now("nope"),
        Err(SyncError::UnknownCollection(name)) if name == "nope"
    ));
}

#[test]
fn offline_writes_reach_the_remote_after_reconnect() {
    let (server, manager) = manual(&["groupdatadb"]);
    let handle = manager.register_synced_collection("groupdatadb", support::ROOT, |_| {}, |_| {});
    manager.sync_now("groupdatadb").unwrap();

    server.set_online(false);
    handle.replica().put("3", json!({"name": "North"}), None).unwrap();
    assert!(manager.sync_now("groupdatadb").is_err());

    server.set_online(true);
    let report = manager.sync_now("groupdatadb").unwrap();
    assert_eq!(report.pushed, 1);
    let remote = server.database(&url("groupdatadb")).unwrap();
    assert_eq!(remote.get("3").unwrap().unwrap().body["name"], "North");
}

#[test]
fn concurrent_edits_converge_on_the_winning_revision() {
    let (server, manager) = manual(&["rounddb_g1"]);
    let remote = server.database(&url("rounddb_g1")).unwrap();
    let base = remote.put("1", json!({"name": "East"}), None).unwrap();

    let handle = manager.register_synced_collection("rounddb_g1", support::ROOT, |_| {}, |_| {});
    manager.sync_now("rounddb_g1").unwrap();

    let local_rev = handle
        .replica()
        .put("1", json!({"name": "East (local)"}), Some(&base))
        .unwrap();
    let remote_rev = remote
        .put("1", json!({"name": "East (remote)"}), Some(&base))
        .unwrap();
    manager.sync_now("rounddb_g1").unwrap();
    manager.sync_now("rounddb_g1").unwrap();

    let winner = if local_rev.wins_over(&remote_rev) {
        local_rev
    } else {
        remote_rev
    };
    assert_eq!(handle.replica().get("1").unwrap().unwrap().rev, winner);
    assert_eq!(remote.get("1").unwrap().unwrap().rev, winner);
}

#[test]
fn continuous_replication_runs_in_the_background() {
    let (server, manager) = continuous(&["labeldb"]);
    let (changes, on_changes) = counter();
    let handle = manager.register_synced_collection("labeldb", support::ROOT, on_changes, |_| {});

    assert!(wait_until(|| handle.is_ready()));

    let remote = server.database(&url("labeldb")).unwrap();
    remote.put("AB1", json!({"labels": []}), None).unwrap();
    assert!(wait_until(|| changes.load(Ordering::SeqCst) == 1));

    handle.replica().put("AB2", json!({"labels": []}), None).unwrap();
    assert!(wait_until(|| remote.get("AB2").ok().flatten().is_some()));

    manager.shutdown();
}
