//! Document Store Adapter - typed create/read/update/delete against one replica.
//!
//! Writes never raise. Each returns a [`WriteOutcome`]; anything other than
//! `Written` is logged and, when an [`OutcomeQueue`] is attached, handed to
//! the reconciler. Callers that ignore the outcome proceed optimistically and
//! learn the true result from the replica's change feed.

use std::marker::PhantomData;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::document::{Document, Revision};
use crate::reconcile::OutcomeQueue;
use crate::store::{DocumentStore, StoreError};

/// A write, in store terms.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Create { id: String, body: Value },
    Update { id: String, body: Value },
    Delete { id: String },
}

impl WriteOp {
    pub fn id(&self) -> &str {
        match self {
            WriteOp::Create { id, .. } | WriteOp::Update { id, .. } | WriteOp::Delete { id } => id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            WriteOp::Create { .. } => "create",
            WriteOp::Update { .. } => "update",
            WriteOp::Delete { .. } => "delete",
        }
    }
}

/// What happened to a write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Stored at `rev`.
    Written { id: String, rev: Revision },
    /// A concurrent write got there first.
    Conflict { id: String, error: String },
    /// The store could not be reached; retrying may succeed.
    Transient { id: String, error: String },
    /// Nothing to delete.
    Missing { id: String },
    /// The store refused the write for good.
    Rejected { id: String, error: String },
}

impl WriteOutcome {
    pub fn id(&self) -> &str {
        match self {
            WriteOutcome::Written { id, .. }
            | WriteOutcome::Conflict { id, .. }
            | WriteOutcome::Transient { id, .. }
            | WriteOutcome::Missing { id }
            | WriteOutcome::Rejected { id, .. } => id,
        }
    }

    pub fn is_written(&self) -> bool {
        matches!(self, WriteOutcome::Written { .. })
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, WriteOutcome::Transient { .. })
    }

    /// Whether the write reached a final state (success or nothing to do).
    pub fn is_settled(&self) -> bool {
        matches!(self, WriteOutcome::Written { .. } | WriteOutcome::Missing { .. })
    }

    fn from_result(id: &str, result: Result<Revision, StoreError>) -> Self {
        let id = id.to_string();
        match result {
            Ok(rev) => WriteOutcome::Written { id, rev },
            Err(err @ StoreError::Conflict { .. }) => WriteOutcome::Conflict {
                id,
                error: err.to_string(),
            },
            Err(StoreError::NotFound { .. }) => WriteOutcome::Missing { id },
            Err(err) if err.is_transient() => WriteOutcome::Transient {
                id,
                error: err.to_string(),
            },
            Err(err) => WriteOutcome::Rejected {
                id,
                error: err.to_string(),
            },
        }
    }
}

/// Perform `op` against `store`.
///
/// Update and delete read the current revision, then write with it. The two
/// steps are not atomic; a write landing in between turns into a `Conflict`.
/// Updating an id that does not exist creates it.
pub fn execute(store: &dyn DocumentStore, op: &WriteOp) -> WriteOutcome {
    let result = match op {
        WriteOp::Create { id, body } => store.put(id, body.clone(), None),
        WriteOp::Update { id, body } => store
            .get(id)
            .and_then(|current| store.put(id, body.clone(), current.as_ref().map(|doc| &doc.rev))),
        WriteOp::Delete { id } => match store.get(id) {
            Ok(Some(current)) => store.remove(id, &current.rev),
            Ok(None) => return WriteOutcome::Missing { id: id.clone() },
            Err(err) => Err(err),
        },
    };
    WriteOutcome::from_result(op.id(), result)
}

/// Typed CRUD for one collection's replica.
pub struct DocumentAdapter<T> {
    collection: String,
    store: Arc<dyn DocumentStore>,
    outcomes: Option<OutcomeQueue>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Document> DocumentAdapter<T> {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            collection: store.name().to_string(),
            store,
            outcomes: None,
            _marker: PhantomData,
        }
    }

    /// Report every write outcome to `queue`.
    pub fn with_outcomes(mut self, queue: OutcomeQueue) -> Self {
        self.outcomes = Some(queue);
        self
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Insert a new document.
    pub fn create(&self, doc: &T) -> WriteOutcome {
        match self.encode(doc) {
            Ok(body) => self.submit(WriteOp::Create {
                id: doc.id().to_string(),
                body,
            }),
            Err(outcome) => outcome,
        }
    }

    /// Fetch a document. Missing, unreadable and undecodable documents all
    /// read as `None`.
    pub fn read(&self, id: &str) -> Option<T> {
        match self.store.get(id) {
            Ok(Some(stored)) => match stored.decode::<T>() {
                Ok(doc) => Some(doc),
                Err(err) => {
                    warn!(collection = %self.collection, id, error = %err, "undecodable document");
                    None
                }
            },
            Ok(None) => None,
            Err(err) => {
                warn!(collection = %self.collection, id, error = %err, "read failed");
                None
            }
        }
    }

    /// Replace the document stored under `id` with `doc`.
    pub fn update(&self, id: &str, doc: &T) -> WriteOutcome {
        match self.encode(doc) {
            Ok(body) => self.submit(WriteOp::Update {
                id: id.to_string(),
                body,
            }),
            Err(outcome) => outcome,
        }
    }

    /// Tombstone the document stored under `id`.
    pub fn delete(&self, id: &str) -> WriteOutcome {
        self.submit(WriteOp::Delete { id: id.to_string() })
    }

    fn encode(&self, doc: &T) -> Result<Value, WriteOutcome> {
        serde_json::to_value(doc).map_err(|err| {
            warn!(collection = %self.collection, id = doc.id(), error = %err, "unserializable document");
            WriteOutcome::Rejected {
                id: doc.id().to_string(),
                error: err.to_string(),
            }
        })
    }

    fn submit(&self, op: WriteOp) -> WriteOutcome {
        let outcome = execute(self.store.as_ref(), &op);
        match &outcome {
            WriteOutcome::Written { rev, .. } => {
                debug!(collection = %self.collection, id = op.id(), op = op.kind(), rev = %rev, "write stored");
            }
            other => {
                warn!(collection = %self.collection, id = op.id(), op = op.kind(), outcome = ?other, "write not applied");
            }
        }
        if let Some(queue) = &self.outcomes {
            queue.publish(&self.collection, op, outcome.clone());
        }
        outcome
    }
}

impl<T> Clone for DocumentAdapter<T> {
    fn clone(&self) -> Self {
        Self {
            collection: self.collection.clone(),
            store: Arc::clone(&self.store),
            outcomes: self.outcomes.clone(),
            _marker: PhantomData,
        }
    }
}
