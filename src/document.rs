//! Documents - typed entities stored in a synced collection.
//!
//! Every collection holds JSON documents keyed by a string `_id`. On disk and
//! on the wire a document also carries a CouchDB-style `_rev` and, once
//! deleted, `_deleted: true`. The typed entity never sees either field: the
//! store owns revisions and the reducers only deal in entity values.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::store::StoreError;

/// Reserved id meaning "unassigned" in the group, round and sort-box id spaces.
pub const UNASSIGNED: &str = "0";

/// Trait for entity types that live in a synced collection.
///
/// Usually derived:
///
/// ```ignore
/// #[derive(Clone, PartialEq, Serialize, Deserialize, Document)]
/// #[document(collection = "rounddb_", group_scoped, guards_unassigned)]
/// struct RoundDataItem {
///     #[serde(rename = "_id")]
///     #[document(id)]
///     pub id: String,
///     pub name: String,
/// }
/// ```
pub trait Document: Serialize + DeserializeOwned + Clone + PartialEq + Send + Sync + 'static {
    /// Base name of the remote database holding this entity kind.
    const COLLECTION: &'static str;

    /// Whether the collection exists once per group (`COLLECTION` + group id).
    const GROUP_SCOPED: bool = false;

    /// Whether id `"0"` is the unassigned sentinel and must never be edited.
    const GUARDS_UNASSIGNED: bool = false;

    /// The document identifier (`_id`).
    fn id(&self) -> &str;

    /// Concrete collection name for the given group scope.
    ///
    /// Group-scoped names append the raw group id with no separator.
    fn collection_name(group: Option<&str>) -> String {
        match group {
            Some(group) if Self::GROUP_SCOPED => format!("{}{}", Self::COLLECTION, group),
            _ => Self::COLLECTION.to_string(),
        }
    }

    /// True when this document targets the reserved unassigned id.
    fn is_unassigned(&self) -> bool {
        Self::GUARDS_UNASSIGNED && self.id() == UNASSIGNED
    }
}

/// In-memory snapshot of a collection, keyed by document id.
pub type DocMap<T> = BTreeMap<String, T>;

/// Build a snapshot keyed by each document's own id.
pub fn into_doc_map<T: Document>(docs: impl IntoIterator<Item = T>) -> DocMap<T> {
    docs.into_iter()
        .map(|doc| (doc.id().to_string(), doc))
        .collect()
}

/// Decode stored documents into a typed snapshot, skipping anything that
/// does not match the entity shape.
pub fn decode_docs<'a, T: Document>(docs: impl IntoIterator<Item = &'a StoredDoc>) -> DocMap<T> {
    let mut map = DocMap::new();
    for stored in docs {
        match stored.decode::<T>() {
            Ok(doc) => {
                map.insert(doc.id().to_string(), doc);
            }
            Err(err) => {
                tracing::warn!(
                    collection = T::COLLECTION,
                    id = %stored.id,
                    error = %err,
                    "skipping undecodable document"
                );
            }
        }
    }
    map
}

/// Optimistic-concurrency tag, rendered `"{generation}-{digest}"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Revision {
    generation: u64,
    digest: String,
}

impl Revision {
    /// Derive the revision that follows `previous` for the given content.
    pub fn derive(previous: Option<&Revision>, body: &Value, deleted: bool) -> Self {
        let mut hasher = blake3::Hasher::new();
        if let Some(previous) = previous {
            hasher.update(previous.to_string().as_bytes());
        }
        hasher.update(if deleted { b"d" } else { b"l" });
        hasher.update(body.to_string().as_bytes());
        let hex = hasher.finalize().to_hex();

        Self {
            generation: previous.map_or(1, |p| p.generation + 1),
            digest: hex.as_str()[..32].to_string(),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// Deterministic winner between two revisions of the same document:
    /// the longer edit history wins, ties go to the greater digest.
    pub fn wins_over(&self, other: &Revision) -> bool {
        (self.generation, &self.digest) > (other.generation, &other.digest)
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.generation, self.digest)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed revision `{0}`")]
pub struct RevisionParseError(pub String);

impl FromStr for Revision {
    type Err = RevisionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (generation, digest) = s
            .split_once('-')
            .ok_or_else(|| RevisionParseError(s.to_string()))?;
        let generation = generation
            .parse::<u64>()
            .map_err(|_| RevisionParseError(s.to_string()))?;
        if generation == 0 || digest.is_empty() {
            return Err(RevisionParseError(s.to_string()));
        }
        Ok(Self {
            generation,
            digest: digest.to_string(),
        })
    }
}

impl Serialize for Revision {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Revision {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// How many ancestor digests a document carries.
pub const REVS_LIMIT: usize = 100;

/// A document as held by a store: id, winning revision, tombstone flag and body.
///
/// `body` always contains `_id` and never contains `_rev`, `_deleted` or
/// `_revisions`.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredDoc {
    pub id: String,
    pub rev: Revision,
    pub deleted: bool,
    pub body: Value,
    /// Digests of the revisions before `rev`, newest first. A server that
    /// accepts replicated writes uses them to extend the existing branch.
    pub ancestry: Vec<String>,
}

impl StoredDoc {
    /// Normalize a body for storage under `id`.
    pub(crate) fn clean_body(id: &str, body: Value) -> Value {
        let mut map = match body {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        map.remove("_rev");
        map.remove("_deleted");
        map.remove("_revisions");
        map.insert("_id".into(), Value::String(id.to_string()));
        Value::Object(map)
    }

    /// Body of a tombstone for `id`.
    pub(crate) fn tombstone_body(id: &str) -> Value {
        Self::clean_body(id, Value::Null)
    }

    /// Ancestry for a revision written on top of this one.
    pub(crate) fn lineage(&self) -> Vec<String> {
        std::iter::once(self.rev.digest().to_string())
            .chain(self.ancestry.iter().cloned())
            .take(REVS_LIMIT)
            .collect()
    }

    /// `_revisions` object: the current generation plus every known digest,
    /// newest first.
    pub fn revisions(&self) -> Value {
        let ids: Vec<Value> = std::iter::once(self.rev.digest())
            .chain(self.ancestry.iter().map(String::as_str))
            .map(|digest| Value::String(digest.to_string()))
            .collect();
        let mut revisions = Map::new();
        revisions.insert("start".into(), Value::from(self.rev.generation()));
        revisions.insert("ids".into(), Value::Array(ids));
        Value::Object(revisions)
    }

    /// Decode the body as a typed entity.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, StoreError> {
        serde_json::from_value(self.body.clone()).map_err(|e| StoreError::Serde(e.to_string()))
    }

    /// Wire form: body plus `_rev`, `_revisions` and, for tombstones,
    /// `_deleted`.
    pub fn to_json(&self) -> Value {
        let mut value = self.body.clone();
        if let Value::Object(map) = &mut value {
            map.insert("_rev".into(), Value::String(self.rev.to_string()));
            map.insert("_revisions".into(), self.revisions());
            if self.deleted {
                map.insert("_deleted".into(), Value::Bool(true));
            }
        }
        value
    }

    /// Parse the wire form produced by `to_json` (or by a CouchDB server).
    pub fn from_json(value: Value) -> Result<Self, StoreError> {
        let Value::Object(map) = &value else {
            return Err(StoreError::Serde("document is not a JSON object".into()));
        };
        let id = map
            .get("_id")
            .and_then(Value::as_str)
            .ok_or_else(|| StoreError::Serde("document has no `_id`".into()))?
            .to_string();
        let rev = map
            .get("_rev")
            .and_then(Value::as_str)
            .ok_or_else(|| StoreError::Serde(format!("document {} has no `_rev`", id)))?
            .parse::<Revision>()
            .map_err(|e| StoreError::Serde(e.to_string()))?;
        let deleted = map.get("_deleted").and_then(Value::as_bool).unwrap_or(false);
        let ancestry = ancestry(map.get("_revisions"), &rev);
        let body = if deleted {
            Self::tombstone_body(&id)
        } else {
            Self::clean_body(&id, value)
        };

        Ok(Self {
            id,
            rev,
            deleted,
            body,
            ancestry,
        })
    }
}

/// Ancestor digests from a `_revisions` object, if it describes `rev`.
fn ancestry(revisions: Option<&Value>, rev: &Revision) -> Vec<String> {
    let Some(revisions) = revisions else {
        return Vec::new();
    };
    let start = revisions.get("start").and_then(Value::as_u64);
    let ids = revisions.get("ids").and_then(Value::as_array);
    match (start, ids) {
        (Some(start), Some(ids))
            if start == rev.generation()
                && ids.first().and_then(Value::as_str) == Some(rev.digest()) =>
        {
            ids.iter()
                .skip(1)
                .filter_map(Value::as_str)
                .take(REVS_LIMIT)
                .map(str::to_string)
                .collect()
        }
        _ => Vec::new(),
    }
}
