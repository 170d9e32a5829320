//! Integration tests for synced collection stores and the load/dispatch glue.

#[path = "../support/mod.rs"]
mod support;

use std::sync::Arc;

use mailround_sync::entities::{
    GroupDataItem, LabelData, RoundDataItem, SortBoxItem, StreetInfoItem,
};
use mailround_sync::{
    into_doc_map, load_view, still_loading, Caller, CollectionKind, CollectionStore, Collections,
    DocumentStore, LoadStatus, ViewRequirements,
};
use serde_json::json;
use support::{continuous, manual, url, wait_until};

#[test]
fn added_item_survives_its_own_echo() {
    let (server, manager) = manual(&["sortboxdb_g1"]);
    let boxes: CollectionStore<SortBoxItem> = CollectionStore::new(manager.clone());
    boxes.load(Some("g1"));
    manager.sync_now("sortboxdb_g1").unwrap();
    assert_eq!(boxes.status(), LoadStatus::Loaded);

    boxes.add(SortBoxItem::new("5", "Red"));
    assert_eq!(boxes.get("5"), Some(SortBoxItem::new("5", "Red")));

    // The echo of the write comes back through the replica's feed.
    boxes.changes(into_doc_map([SortBoxItem::new("5", "Red")]));
    assert_eq!(boxes.snapshot(), into_doc_map([SortBoxItem::new("5", "Red")]));

    manager.sync_now("sortboxdb_g1").unwrap();
    let remote = server.database(&url("sortboxdb_g1")).unwrap();
    assert_eq!(remote.get("5").unwrap().unwrap().body["name"], "Red");
    assert_eq!(boxes.len(), 1);
}

#[test]
fn double_load_applies_each_change_once() {
    let (server, manager) = manual(&["streetinfodb"]);
    let streets: CollectionStore<StreetInfoItem> = CollectionStore::new(manager.clone());
    streets.load(None);
    streets.load(None);
    manager.sync_now("streetinfodb").unwrap();

    let handle = manager.handle("streetinfodb").unwrap();
    assert_eq!(handle.replica().listener_count(), 1);

    let remote = server.database(&url("streetinfodb")).unwrap();
    remote
        .put("AB1", json!({"street": "High St", "properties": 12}), None)
        .unwrap();
    manager.sync_now("streetinfodb").unwrap();

    assert_eq!(streets.len(), 1);
    assert_eq!(streets.get("AB1").unwrap().properties, 12);
    assert_eq!(streets.status(), LoadStatus::Loaded);
}

#[test]
fn initial_snapshot_loads_existing_documents() {
    let (server, manager) = manual(&["groupdatadb"]);
    let remote = server.database(&url("groupdatadb")).unwrap();
    remote.put("0", json!({"name": "Unassigned"}), None).unwrap();
    remote.put("2", json!({"name": "South"}), None).unwrap();
    remote.put("10", json!({"name": "North"}), None).unwrap();

    let groups: CollectionStore<GroupDataItem> = CollectionStore::new(manager.clone());
    groups.load(None);
    assert_eq!(groups.status(), LoadStatus::Loading);

    manager.sync_now("groupdatadb").unwrap();
    assert_eq!(groups.status(), LoadStatus::Loaded);

    let ids: Vec<String> = groups.sorted().into_iter().map(|group| group.id).collect();
    assert_eq!(ids, vec!["0", "2", "10"]);
}

#[test]
fn remote_deletes_reach_the_snapshot() {
    let (server, manager) = manual(&["rounddb_g1"]);
    let remote = server.database(&url("rounddb_g1")).unwrap();
    let rev = remote.put("1", json!({"name": "East"}), None).unwrap();
    remote.put("2", json!({"name": "West"}), None).unwrap();

    let rounds: CollectionStore<RoundDataItem> = CollectionStore::new(manager.clone());
    rounds.load(Some("g1"));
    manager.sync_now("rounddb_g1").unwrap();
    rounds.select(rounds.get("1"));

    remote.remove("1", &rev).unwrap();
    manager.sync_now("rounddb_g1").unwrap();

    assert_eq!(rounds.get("1"), None);
    assert!(rounds.get("2").is_some());
    assert_eq!(rounds.selected(), None);
    assert_eq!(rounds.status(), LoadStatus::Loaded);
}

#[test]
fn local_update_and_delete_are_persisted() {
    let (server, manager) = manual(&["groupdatadb"]);
    let groups: CollectionStore<GroupDataItem> = CollectionStore::new(manager.clone());
    groups.load(None);
    manager.sync_now("groupdatadb").unwrap();

    groups.add(GroupDataItem::new("3", "North"));
    groups.update(GroupDataItem::new("3", "North").with_colour("#00ff00"));
    groups.add(GroupDataItem::new("4", "South"));
    groups.delete(GroupDataItem::new("4", "South"));
    manager.sync_now("groupdatadb").unwrap();

    let remote = server.database(&url("groupdatadb")).unwrap();
    assert_eq!(remote.get("3").unwrap().unwrap().body["colour"], "#00ff00");
    assert!(remote.get("4").unwrap().is_none());
    assert_eq!(groups.get("3").unwrap().colour, "#00ff00");
    assert!(groups.get("4").is_none());
}

#[test]
fn unassigned_group_is_never_touched() {
    let (server, manager) = manual(&["groupdatadb"]);
    let remote = server.database(&url("groupdatadb")).unwrap();
    remote.put("0", json!({"name": "Unassigned"}), None).unwrap();

    let groups: CollectionStore<GroupDataItem> = CollectionStore::new(manager.clone());
    groups.load(None);
    manager.sync_now("groupdatadb").unwrap();

    groups.update(GroupDataItem::new("0", "Mine now"));
    groups.delete(GroupDataItem::new("0", "Unassigned"));
    manager.sync_now("groupdatadb").unwrap();

    assert_eq!(groups.get("0").unwrap().name, "Unassigned");
    assert_eq!(remote.get("0").unwrap().unwrap().body["name"], "Unassigned");
}

#[test]
fn switching_group_rebinds_the_store() {
    let (server, manager) = manual(&["rounddb_g1", "rounddb_g2"]);
    server
        .database(&url("rounddb_g1"))
        .unwrap()
        .put("1", json!({"name": "G1 round"}), None)
        .unwrap();
    let g2 = server.database(&url("rounddb_g2")).unwrap();
    g2.put("7", json!({"name": "G2 round"}), None).unwrap();

    let rounds: CollectionStore<RoundDataItem> = CollectionStore::new(manager.clone());
    rounds.load(Some("g1"));
    manager.sync_now("rounddb_g1").unwrap();
    assert!(rounds.get("1").is_some());

    rounds.load(Some("g2"));
    assert_eq!(rounds.status(), LoadStatus::Loading);
    assert!(rounds.is_empty());
    manager.sync_now("rounddb_g2").unwrap();
    assert_eq!(rounds.collection_name().as_deref(), Some("rounddb_g2"));
    assert_eq!(rounds.get("7").unwrap().name, "G2 round");

    // Feed events for the old group no longer land here.
    server
        .database(&url("rounddb_g1"))
        .unwrap()
        .put("2", json!({"name": "late"}), None)
        .unwrap();
    manager.sync_now("rounddb_g1").unwrap();
    assert!(rounds.get("2").is_none());
}

#[test]
fn dropped_store_leaves_a_harmless_listener() {
    let (server, manager) = manual(&["labeldb"]);
    {
        let labels: CollectionStore<LabelData> = CollectionStore::new(manager.clone());
        labels.load(None);
    }
    server
        .database(&url("labeldb"))
        .unwrap()
        .put("AB1", json!({"labels": []}), None)
        .unwrap();
    manager.sync_now("labeldb").unwrap();

    let replica = manager.handle("labeldb").unwrap().replica();
    assert_eq!(replica.listener_count(), 1);
    assert_eq!(replica.doc_count(), 1);

    // A store created later still picks up the replica's contents.
    let labels: CollectionStore<LabelData> = CollectionStore::new(manager.clone());
    labels.load(None);
    assert_eq!(labels.status(), LoadStatus::Loaded);
    assert!(labels.get("AB1").is_some());
}

#[test]
fn write_before_load_leaves_status_alone_until_loaded() {
    let (server, manager) = manual(&["streetinfodb"]);
    let streets: CollectionStore<StreetInfoItem> = CollectionStore::new(manager.clone());

    streets.add(StreetInfoItem::new("AB1", "High St"));
    assert_eq!(streets.status(), LoadStatus::Unknown);
    assert!(manager.is_registered("streetinfodb"));

    manager.sync_now("streetinfodb").unwrap();
    assert_eq!(streets.status(), LoadStatus::Unknown);
    assert_eq!(streets.collection_name(), None);
    let remote = server.database(&url("streetinfodb")).unwrap();
    assert_eq!(remote.get("AB1").unwrap().unwrap().body["street"], "High St");

    streets.load(None);
    assert_eq!(streets.status(), LoadStatus::Loaded);
    assert_eq!(streets.collection_name().as_deref(), Some("streetinfodb"));
    assert_eq!(streets.get("AB1").unwrap().street, "High St");
}

#[test]
fn view_spinner_clears_once_everything_loads() {
    let (_server, manager) = continuous(&["assigneddb", "streetinfodb", "rounddb_g1", "groupdb_g1"]);
    let collections = Collections::new(Arc::clone(&manager));
    let caller = Caller::GroupMember {
        group_id: "g1".into(),
    };
    let view = ViewRequirements::of(&[
        CollectionKind::Assigned,
        CollectionKind::Streets,
        CollectionKind::Rounds,
        CollectionKind::SortData,
    ]);

    assert!(still_loading(&collections, &caller, None, &view));
    load_view(&collections, &caller, None, &view);

    assert!(wait_until(|| !still_loading(&collections, &caller, None, &view)));
    let statuses = collections.statuses();
    assert_eq!(statuses["groupdb_g1"], LoadStatus::Loaded);
    assert_eq!(statuses["labeldb"], LoadStatus::Unknown);

    manager.shutdown();
}

#[test]
fn view_stays_loading_while_a_database_is_missing() {
    let (server, manager) = manual(&["streetinfodb"]);
    let collections = Collections::new(Arc::clone(&manager));
    let view = ViewRequirements::of(&[CollectionKind::Streets, CollectionKind::SortBoxes]);

    load_view(&collections, &Caller::Admin, Some("g9"), &view);
    manager.sync_all();
    assert!(still_loading(&collections, &Caller::Admin, Some("g9"), &view));

    server.create_database(&url("sortboxdb_g9"));
    manager.sync_all();
    assert!(!still_loading(&collections, &Caller::Admin, Some("g9"), &view));
}
