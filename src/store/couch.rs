//! CouchStore - a CouchDB-compatible database reached over HTTP.

use reqwest::blocking::{Client, Response};
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use serde_json::{json, Value};

use super::{ChangeRecord, ChangesBatch, DocumentStore, Since, StoreError};
use crate::document::{Revision, StoredDoc};

#[derive(Deserialize)]
struct WriteResponse {
    rev: String,
}

#[derive(Deserialize, Default)]
struct ErrorResponse {
    #[serde(default)]
    error: String,
    #[serde(default)]
    reason: String,
}

#[derive(Deserialize)]
struct AllDocsResponse {
    rows: Vec<AllDocsRow>,
}

#[derive(Deserialize)]
struct AllDocsRow {
    id: String,
    #[serde(default)]
    doc: Option<Value>,
}

#[derive(Deserialize)]
struct ChangesResponse {
    results: Vec<ChangeRow>,
    last_seq: Value,
    #[serde(default)]
    pending: u64,
}

#[derive(Deserialize)]
struct ChangeRow {
    seq: Value,
    #[serde(default)]
    doc: Option<Value>,
}

#[derive(Deserialize)]
struct BulkResult {
    #[serde(default)]
    error: Option<String>,
}

/// `_bulk_docs` body for replicated writes. Each document carries its
/// `_revisions`, so the server grafts it onto the branch it already holds
/// instead of starting a new one.
fn bulk_payload(docs: &[StoredDoc]) -> Value {
    json!({
        "docs": docs.iter().map(StoredDoc::to_json).collect::<Vec<_>>(),
        "new_edits": false,
    })
}

/// Opaque CouchDB sequences are strings on 2.x+ and integers on 1.x.
fn seq_string(seq: &Value) -> String {
    match seq {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// A remote database speaking the CouchDB HTTP API.
///
/// The database must already exist; nothing here creates it.
pub struct CouchStore {
    url: String,
    client: Client,
}

impl CouchStore {
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_client(url, Client::new())
    }

    pub fn with_client(url: impl Into<String>, client: Client) -> Self {
        let url = url.into().trim_end_matches('/').to_string();
        Self { url, client }
    }

    fn endpoint(&self, segment: &str) -> Result<Url, StoreError> {
        let mut url = Url::parse(&self.url)
            .map_err(|e| StoreError::Unavailable(format!("invalid database url {}: {}", self.url, e)))?;
        url.path_segments_mut()
            .map_err(|_| StoreError::Unavailable(format!("invalid database url {}", self.url)))?
            .push(segment);
        Ok(url)
    }

    fn transport(err: reqwest::Error) -> StoreError {
        StoreError::Unavailable(err.to_string())
    }

    /// Map a non-success response onto the store error taxonomy.
    fn failure(&self, id: &str, expected: Option<&Revision>, response: Response) -> StoreError {
        let status = response.status();
        let body: ErrorResponse = response.json().unwrap_or_default();
        match status {
            StatusCode::CONFLICT => StoreError::Conflict {
                id: id.to_string(),
                expected: expected.map_or_else(|| "none".to_string(), |r| r.to_string()),
                actual: "unknown".to_string(),
            },
            StatusCode::NOT_FOUND if body.reason.contains("Database does not exist") => {
                StoreError::MissingDatabase(self.url.clone())
            }
            StatusCode::NOT_FOUND => StoreError::NotFound { id: id.to_string() },
            StatusCode::BAD_REQUEST => StoreError::Serde(format!("{}: {}", body.error, body.reason)),
            status => StoreError::Unavailable(format!("{} returned {}: {}", self.url, status, body.reason)),
        }
    }

    fn read_json<T: serde::de::DeserializeOwned>(response: Response) -> Result<T, StoreError> {
        response
            .json::<T>()
            .map_err(|e| StoreError::Serde(e.to_string()))
    }
}

impl DocumentStore for CouchStore {
    fn name(&self) -> &str {
        &self.url
    }

    fn get(&self, id: &str) -> Result<Option<StoredDoc>, StoreError> {
        let response = self
            .client
            .get(self.endpoint(id)?)
            .query(&[("revs", "true")])
            .send()
            .map_err(Self::transport)?;
        if response.status().is_success() {
            let value: Value = Self::read_json(response)?;
            return StoredDoc::from_json(value).map(Some);
        }
        match self.failure(id, None, response) {
            StoreError::NotFound { .. } => Ok(None),
            err => Err(err),
        }
    }

    fn put(&self, id: &str, body: Value, expected: Option<&Revision>) -> Result<Revision, StoreError> {
        let mut body = StoredDoc::clean_body(id, body);
        if let (Some(rev), Value::Object(map)) = (expected, &mut body) {
            map.insert("_rev".into(), Value::String(rev.to_string()));
        }

        let response = self
            .client
            .put(self.endpoint(id)?)
            .json(&body)
            .send()
            .map_err(Self::transport)?;
        if !response.status().is_success() {
            return Err(self.failure(id, expected, response));
        }
        let written: WriteResponse = Self::read_json(response)?;
        written
            .rev
            .parse()
            .map_err(|e: crate::document::RevisionParseError| StoreError::Serde(e.to_string()))
    }

    fn remove(&self, id: &str, rev: &Revision) -> Result<Revision, StoreError> {
        let response = self
            .client
            .delete(self.endpoint(id)?)
            .query(&[("rev", rev.to_string())])
            .send()
            .map_err(Self::transport)?;
        if !response.status().is_success() {
            return Err(self.failure(id, Some(rev), response));
        }
        let written: WriteResponse = Self::read_json(response)?;
        written
            .rev
            .parse()
            .map_err(|e: crate::document::RevisionParseError| StoreError::Serde(e.to_string()))
    }

    fn all_docs(&self) -> Result<Vec<StoredDoc>, StoreError> {
        let response = self
            .client
            .get(self.endpoint("_all_docs")?)
            .query(&[("include_docs", "true")])
            .send()
            .map_err(Self::transport)?;
        if !response.status().is_success() {
            return Err(self.failure("_all_docs", None, response));
        }
        let page: AllDocsResponse = Self::read_json(response)?;
        page.rows
            .into_iter()
            .filter(|row| !row.id.starts_with("_design/"))
            .filter_map(|row| row.doc)
            .map(StoredDoc::from_json)
            .collect()
    }

    fn changes(&self, since: &Since, limit: usize) -> Result<ChangesBatch, StoreError> {
        let response = self
            .client
            .get(self.endpoint("_changes")?)
            .query(&[
                ("since", since.as_param().to_string()),
                ("include_docs", "true".to_string()),
                ("limit", limit.max(1).to_string()),
            ])
            .send()
            .map_err(Self::transport)?;
        if !response.status().is_success() {
            return Err(self.failure("_changes", None, response));
        }

        let page: ChangesResponse = Self::read_json(response)?;
        let mut results = Vec::with_capacity(page.results.len());
        for row in page.results {
            let Some(doc) = row.doc else { continue };
            let doc = StoredDoc::from_json(doc)?;
            if doc.id.starts_with("_design/") {
                continue;
            }
            results.push(ChangeRecord {
                seq: seq_string(&row.seq),
                doc,
            });
        }

        Ok(ChangesBatch {
            results,
            last_seq: seq_string(&page.last_seq),
            pending: page.pending,
        })
    }

    fn apply_replicated(&self, docs: Vec<StoredDoc>) -> Result<usize, StoreError> {
        if docs.is_empty() {
            return Ok(0);
        }
        let payload = bulk_payload(&docs);

        let response = self
            .client
            .post(self.endpoint("_bulk_docs")?)
            .json(&payload)
            .send()
            .map_err(Self::transport)?;
        if !response.status().is_success() {
            return Err(self.failure("_bulk_docs", None, response));
        }
        let results: Vec<BulkResult> = Self::read_json(response)?;
        let rejected = results.iter().filter(|r| r.error.is_some()).count();
        Ok(docs.len().saturating_sub(rejected))
    }
}
