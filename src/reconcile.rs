//! Write-outcome channel and the reconciler that consumes it.
//!
//! ```text
//!   DocumentAdapter ──publish──▶ OutcomeQueue ──poll──▶ Reconciler
//!                                                        │
//!                        Transient ── retry w/ backoff ──┤
//!                        Superseded ── dropped ──────────┤
//!                        Conflict  ── conflicts()  ──────┤
//!                        Rejected / exhausted ── failed()┘
//! ```
//!
//! The UI never waits on any of this. Optimistic state stays as it is; the
//! reconciler only decides whether a failed write is worth issuing again.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{channel, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::adapter::{execute, WriteOp, WriteOutcome};
use crate::config::RetryPolicy;
use crate::registrar::SyncManager;
use crate::store::DocumentStore;

/// One write and what became of it.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteRecord {
    pub seq: u64,
    pub collection: String,
    pub op: WriteOp,
    pub outcome: WriteOutcome,
    /// How many times the write has been issued.
    pub attempts: u32,
}

/// In-memory queue of write outcomes.
///
/// Clones share the same log. Records are appended, read in order from a
/// shared position, acknowledged by sequence number, and dropped by
/// [`compact`](Self::compact) once consumed.
///
/// ## Example
///
/// ```
/// use mailround_sync::adapter::{WriteOp, WriteOutcome};
/// use mailround_sync::reconcile::OutcomeQueue;
///
/// let queue = OutcomeQueue::new();
/// queue.publish("labeldb", WriteOp::Delete { id: "AB1 2CD:0".into() }, WriteOutcome::Missing { id: "AB1 2CD:0".into() });
///
/// let record = queue.poll().unwrap();
/// assert_eq!(record.collection, "labeldb");
/// queue.ack(record.seq);
/// assert_eq!(queue.pending(), 0);
/// ```
#[derive(Clone, Default)]
pub struct OutcomeQueue {
    log: Arc<RwLock<Vec<WriteRecord>>>,
    position: Arc<Mutex<usize>>,
    acked: Arc<Mutex<Vec<u64>>>,
    next_seq: Arc<AtomicU64>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl OutcomeQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record for a write that was issued once.
    pub fn publish(&self, collection: &str, op: WriteOp, outcome: WriteOutcome) -> u64 {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let record = WriteRecord {
            seq,
            collection: collection.to_string(),
            op,
            outcome,
            attempts: 1,
        };
        self.log
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
        seq
    }

    /// Next unread record, if any.
    pub fn poll(&self) -> Option<WriteRecord> {
        let log = self.log.read().unwrap_or_else(PoisonError::into_inner);
        let mut position = lock(&self.position);
        let record = log.get(*position).cloned()?;
        *position += 1;
        Some(record)
    }

    pub fn ack(&self, seq: u64) {
        lock(&self.acked).push(seq);
    }

    /// Sequence numbers acknowledged so far.
    pub fn acknowledged(&self) -> Vec<u64> {
        lock(&self.acked).clone()
    }

    /// Every record still held, read or not.
    pub fn records(&self) -> Vec<WriteRecord> {
        self.log
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Records not yet polled.
    pub fn pending(&self) -> usize {
        let log = self.log.read().unwrap_or_else(PoisonError::into_inner);
        log.len().saturating_sub(*lock(&self.position))
    }

    pub fn len(&self) -> usize {
        self.log
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a later write to the same document has been published since
    /// `record`. Retrying `record` would then undo that write.
    pub fn superseded(&self, record: &WriteRecord) -> bool {
        self.log
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|later| {
                later.seq > record.seq
                    && later.collection == record.collection
                    && later.op.id() == record.op.id()
            })
    }

    /// Drop records that have already been polled, and the acknowledgements
    /// for them.
    pub fn compact(&self) {
        let mut log = self.log.write().unwrap_or_else(PoisonError::into_inner);
        let mut position = lock(&self.position);
        if let Some(last) = log[..*position].last() {
            let last = last.seq;
            lock(&self.acked).retain(|seq| *seq > last);
        }
        log.drain(..*position);
        *position = 0;
    }
}

/// Finds the store a queued write should be re-issued against.
pub trait StoreResolver: Send + Sync {
    fn resolve(&self, collection: &str) -> Option<Arc<dyn DocumentStore>>;
}

impl StoreResolver for SyncManager {
    fn resolve(&self, collection: &str) -> Option<Arc<dyn DocumentStore>> {
        self.handle(collection).map(|handle| handle.store())
    }
}

impl StoreResolver for HashMap<String, Arc<dyn DocumentStore>> {
    fn resolve(&self, collection: &str) -> Option<Arc<dyn DocumentStore>> {
        self.get(collection).cloned()
    }
}

impl<R: StoreResolver + ?Sized> StoreResolver for Arc<R> {
    fn resolve(&self, collection: &str) -> Option<Arc<dyn DocumentStore>> {
        (**self).resolve(collection)
    }
}

/// Counts from one [`Reconciler::drain`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    pub processed: usize,
    pub settled: usize,
    pub retried: usize,
    /// Transient failures dropped because a later write replaced them.
    pub superseded: usize,
    pub conflicts: usize,
    pub failed: usize,
}

impl DrainReport {
    fn merge(&mut self, other: DrainReport) {
        self.processed += other.processed;
        self.settled += other.settled;
        self.retried += other.retried;
        self.superseded += other.superseded;
        self.conflicts += other.conflicts;
        self.failed += other.failed;
    }
}

/// How many conflicted and failed records a [`Reconciler`] keeps by default.
pub const DEFAULT_HISTORY: usize = 256;

/// Consumes an [`OutcomeQueue`], re-issuing transient failures.
///
/// Conflicts are kept for inspection and never retried: re-issuing a write
/// whose revision went stale would overwrite the concurrent edit. A transient
/// failure is also dropped once a later write to the same document has been
/// published, so a retry never lands on top of a newer edit.
///
/// Only the most recent `history` conflicts and failures are kept.
pub struct Reconciler<R> {
    queue: OutcomeQueue,
    resolver: R,
    policy: RetryPolicy,
    history: usize,
    conflicts: Vec<WriteRecord>,
    failed: Vec<WriteRecord>,
}

fn keep_last(records: &mut Vec<WriteRecord>, record: WriteRecord, limit: usize) {
    records.push(record);
    if records.len() > limit {
        let excess = records.len() - limit;
        records.drain(..excess);
    }
}

impl<R: StoreResolver> Reconciler<R> {
    pub fn new(queue: OutcomeQueue, resolver: R, policy: RetryPolicy) -> Self {
        Self {
            queue,
            resolver,
            policy,
            history: DEFAULT_HISTORY,
            conflicts: Vec::new(),
            failed: Vec::new(),
        }
    }

    /// Keep at most `limit` conflicted and `limit` failed records.
    pub fn with_history(mut self, limit: usize) -> Self {
        self.history = limit.max(1);
        self
    }

    pub fn queue(&self) -> &OutcomeQueue {
        &self.queue
    }

    /// Writes that lost to a concurrent edit.
    pub fn conflicts(&self) -> &[WriteRecord] {
        &self.conflicts
    }

    /// Writes that were rejected or ran out of attempts.
    pub fn failed(&self) -> &[WriteRecord] {
        &self.failed
    }

    /// Hand over the kept conflicts, leaving none behind.
    pub fn take_conflicts(&mut self) -> Vec<WriteRecord> {
        std::mem::take(&mut self.conflicts)
    }

    /// Hand over the kept failures, leaving none behind.
    pub fn take_failed(&mut self) -> Vec<WriteRecord> {
        std::mem::take(&mut self.failed)
    }

    fn record_conflict(&mut self, record: WriteRecord) {
        keep_last(&mut self.conflicts, record, self.history);
    }

    fn record_failure(&mut self, record: WriteRecord) {
        keep_last(&mut self.failed, record, self.history);
    }

    /// Handle every record published so far.
    pub fn drain(&mut self) -> DrainReport {
        let mut report = DrainReport::default();
        while let Some(record) = self.queue.poll() {
            let seq = record.seq;
            report.processed += 1;
            self.process(record, &mut report);
            self.queue.ack(seq);
        }
        self.queue.compact();
        report
    }

    fn process(&mut self, record: WriteRecord, report: &mut DrainReport) {
        if record.outcome.is_transient() {
            self.retry(record, report);
        } else {
            self.settle(record, report);
        }
    }

    fn retry(&mut self, mut record: WriteRecord, report: &mut DrainReport) {
        let Some(store) = self.resolver.resolve(&record.collection) else {
            warn!(collection = %record.collection, id = record.op.id(), "no store to retry against");
            report.failed += 1;
            self.record_failure(record);
            return;
        };

        while record.outcome.is_transient() && record.attempts < self.policy.max_attempts {
            if self.queue.superseded(&record) {
                debug!(collection = %record.collection, id = record.op.id(), "dropping retry of a superseded write");
                report.superseded += 1;
                return;
            }
            let delay = self.policy.backoff(record.attempts);
            if !delay.is_zero() {
                thread::sleep(delay);
            }
            record.attempts += 1;
            report.retried += 1;
            record.outcome = execute(store.as_ref(), &record.op);
            debug!(
                collection = %record.collection,
                id = record.op.id(),
                attempt = record.attempts,
                outcome = ?record.outcome,
                "retried write"
            );
        }

        if record.outcome.is_transient() {
            warn!(
                collection = %record.collection,
                id = record.op.id(),
                attempts = record.attempts,
                "giving up on write"
            );
            report.failed += 1;
            self.record_failure(record);
        } else {
            self.settle(record, report);
        }
    }

    fn settle(&mut self, record: WriteRecord, report: &mut DrainReport) {
        match &record.outcome {
            WriteOutcome::Written { .. } | WriteOutcome::Missing { .. } => {
                if record.attempts > 1 {
                    info!(collection = %record.collection, id = record.op.id(), attempts = record.attempts, "write recovered");
                }
                report.settled += 1;
            }
            WriteOutcome::Conflict { error, .. } => {
                warn!(collection = %record.collection, id = record.op.id(), error = %error, "write conflicted");
                report.conflicts += 1;
                self.record_conflict(record);
            }
            WriteOutcome::Rejected { error, .. } => {
                warn!(collection = %record.collection, id = record.op.id(), error = %error, "write rejected");
                report.failed += 1;
                self.record_failure(record);
            }
            WriteOutcome::Transient { .. } => {
                report.failed += 1;
                self.record_failure(record);
            }
        }
    }
}

/// Runs [`Reconciler::drain`] on an interval in the background.
///
/// ## Example
///
/// ```ignore
/// let thread = ReconcilerThread::spawn(reconciler, Duration::from_millis(500));
/// // ... later
/// let (reconciler, report) = thread.stop();
/// ```
pub struct ReconcilerThread<R> {
    stop_tx: Sender<()>,
    handle: Option<JoinHandle<(Reconciler<R>, DrainReport)>>,
}

impl<R: StoreResolver + 'static> ReconcilerThread<R> {
    pub fn spawn(mut reconciler: Reconciler<R>, interval: Duration) -> Self {
        let (stop_tx, stop_rx) = channel();

        let handle = thread::spawn(move || {
            let mut total = DrainReport::default();
            loop {
                total.merge(reconciler.drain());
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {}
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            // Records published while stopping still get handled.
            total.merge(reconciler.drain());
            (reconciler, total)
        });

        Self {
            stop_tx,
            handle: Some(handle),
        }
    }

    /// Stop the thread and hand back the reconciler with the running totals.
    ///
    /// Returns `None` if the thread panicked.
    pub fn stop(mut self) -> Option<(Reconciler<R>, DrainReport)> {
        let _ = self.stop_tx.send(());
        self.handle.take().and_then(|handle| handle.join().ok())
    }
}

impl<R> Drop for ReconcilerThread<R> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = self.stop_tx.send(());
            let _ = handle.join();
        }
    }
}
