//! CouchDB HTTP store integration tests.
//!
//! Starts a small axum stand-in for a CouchDB server and drives `CouchStore`
//! against it with the blocking client.

#![cfg(feature = "http")]

use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use mailround_sync::{
    CouchStore, DocumentStore, MemoryStore, Replicator, Revision, StoreError, StoredDoc,
};
use serde_json::{json, Value};

/// What the fake server saw and what it serves back.
#[derive(Clone, Default)]
struct FakeCouch {
    bulk_posts: Arc<Mutex<Vec<Value>>>,
    queries: Arc<Mutex<Vec<HashMap<String, String>>>>,
    docs: Arc<Mutex<HashMap<String, Value>>>,
}

async fn read(
    State(couch): State<FakeCouch>,
    Path((db, doc)): Path<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    couch.queries.lock().unwrap().push(query);
    if db == "missing" {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "not_found", "reason": "Database does not exist."})),
        )
            .into_response();
    }
    match couch.docs.lock().unwrap().get(&doc) {
        Some(body) => (StatusCode::OK, Json(body.clone())).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "not_found", "reason": "missing"})),
        )
            .into_response(),
    }
}

async fn bulk(
    State(couch): State<FakeCouch>,
    Path((_db, doc)): Path<(String, String)>,
    Json(body): Json<Value>,
) -> Response {
    if doc != "_bulk_docs" {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }
    let results: Vec<Value> = body["docs"]
        .as_array()
        .into_iter()
        .flatten()
        .map(|doc| match doc["_id"].as_str() {
            Some(id) if id.starts_with("forbidden") => {
                json!({"id": id, "error": "forbidden", "reason": "read only"})
            }
            id => json!({"ok": true, "id": id}),
        })
        .collect();
    couch.bulk_posts.lock().unwrap().push(body);
    (StatusCode::CREATED, Json(Value::Array(results))).into_response()
}

/// Serve `couch` on a background runtime; returns its base URL.
fn start_server(couch: FakeCouch) -> String {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async move {
            let app = Router::new()
                .route("/:db/:doc", get(read).post(bulk))
                .with_state(couch);
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            tx.send(listener.local_addr().unwrap()).unwrap();
            axum::serve(listener, app).await.unwrap();
        });
    });
    let addr = rx.recv().unwrap();
    format!("http://{addr}")
}

#[test]
fn pushed_edits_carry_their_revision_history() {
    let couch = FakeCouch::default();
    let base = start_server(couch.clone());

    let local = Arc::new(MemoryStore::new("labeldb"));
    let first = local.put("AB1", json!({"labels": []}), None).unwrap();
    let second = local
        .put("AB1", json!({"labels": [{"text": "High St"}]}), Some(&first))
        .unwrap();

    let remote = Arc::new(CouchStore::new(format!("{base}/labeldb")));
    let mut replicator = Replicator::new(local, remote, 10);
    assert_eq!(replicator.push().unwrap(), 1);

    let posts = couch.bulk_posts.lock().unwrap();
    assert_eq!(posts.len(), 1);
    assert_eq!(posts[0]["new_edits"], json!(false));
    let sent = &posts[0]["docs"][0];
    assert_eq!(sent["_rev"], json!(second.to_string()));
    assert_eq!(
        sent["_revisions"],
        json!({"start": 2, "ids": [second.digest(), first.digest()]})
    );
}

#[test]
fn rejected_replicated_writes_are_not_counted() {
    let base = start_server(FakeCouch::default());
    let store = CouchStore::new(format!("{base}/labeldb"));

    let doc = |id: &str| {
        let body = json!({"_id": id});
        StoredDoc {
            id: id.into(),
            rev: Revision::derive(None, &body, false),
            deleted: false,
            body,
            ancestry: Vec::new(),
        }
    };

    let applied = store
        .apply_replicated(vec![doc("AB1"), doc("forbidden-1")])
        .unwrap();
    assert_eq!(applied, 1);
}

#[test]
fn get_reads_revision_history() {
    let couch = FakeCouch::default();
    let first = Revision::derive(None, &json!({"_id": "AB1"}), false);
    let second = Revision::derive(Some(&first), &json!({"_id": "AB1", "n": 2}), false);
    couch.docs.lock().unwrap().insert(
        "AB1".into(),
        json!({
            "_id": "AB1",
            "_rev": second.to_string(),
            "_revisions": {"start": 2, "ids": [second.digest(), first.digest()]},
            "n": 2,
        }),
    );
    let base = start_server(couch.clone());
    let store = CouchStore::new(format!("{base}/labeldb"));

    let doc = store.get("AB1").unwrap().unwrap();
    assert_eq!(doc.rev, second);
    assert_eq!(doc.ancestry, vec![first.digest().to_string()]);
    assert_eq!(doc.body, json!({"_id": "AB1", "n": 2}));
    assert_eq!(
        couch.queries.lock().unwrap()[0].get("revs").map(String::as_str),
        Some("true")
    );

    assert_eq!(store.get("ZZ9").unwrap(), None);
}

#[test]
fn missing_database_is_reported_as_such() {
    let base = start_server(FakeCouch::default());
    let url = format!("{base}/missing");
    let store = CouchStore::new(url.clone());

    let err = store.all_docs().unwrap_err();
    assert_eq!(err, StoreError::MissingDatabase(url));
    assert!(err.is_transient());
}
