//! Replication - moving changes between a local replica and its remote.
//!
//! One [`Replicator`] pass pulls the remote change feed into the local
//! replica, then pushes the local change feed to the remote. Checkpoints only
//! advance past pages that were written successfully, so a failed pass is
//! simply repeated by the next one.
//!
//! [`ReplicationThread`] runs passes continuously in the background, waking
//! early when the local replica changes.

use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, warn};

use crate::store::{DocumentStore, MemoryStore, Since, StoreError};

/// Outcome of one replication pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReplicationReport {
    /// Remote revisions that won locally.
    pub pulled: usize,
    /// Local revisions that won remotely.
    pub pushed: usize,
}

/// Pull/push replication between one local replica and one remote database.
pub struct Replicator {
    local: Arc<MemoryStore>,
    remote: Arc<dyn DocumentStore>,
    batch_size: usize,
    pull_since: Since,
    push_since: Since,
}

impl Replicator {
    pub fn new(local: Arc<MemoryStore>, remote: Arc<dyn DocumentStore>, batch_size: usize) -> Self {
        Self {
            local,
            remote,
            batch_size: batch_size.max(1),
            pull_since: Since::Start,
            push_since: Since::Start,
        }
    }

    pub fn local(&self) -> &Arc<MemoryStore> {
        &self.local
    }

    pub fn remote(&self) -> &Arc<dyn DocumentStore> {
        &self.remote
    }

    /// Copy every remote change since the last checkpoint into the replica.
    /// Returns once the remote feed is exhausted.
    pub fn pull(&mut self) -> Result<usize, StoreError> {
        let (applied, since) = transfer(
            self.remote.as_ref(),
            self.local.as_ref(),
            &self.pull_since,
            self.batch_size,
        )?;
        self.pull_since = since;
        Ok(applied)
    }

    /// Copy every local change since the last checkpoint to the remote.
    pub fn push(&mut self) -> Result<usize, StoreError> {
        let (applied, since) = transfer(
            self.local.as_ref(),
            self.remote.as_ref(),
            &self.push_since,
            self.batch_size,
        )?;
        self.push_since = since;
        Ok(applied)
    }

    /// Pull, then push.
    pub fn run_once(&mut self) -> Result<ReplicationReport, StoreError> {
        let pulled = self.pull()?;
        let pushed = self.push()?;
        Ok(ReplicationReport { pulled, pushed })
    }
}

/// Page through `source` changes after `since` into `target`. On error, the
/// pages already written stay written but the returned checkpoint is lost,
/// so they are re-sent (and ignored as non-winning) next time.
fn transfer(
    source: &dyn DocumentStore,
    target: &dyn DocumentStore,
    since: &Since,
    batch_size: usize,
) -> Result<(usize, Since), StoreError> {
    let mut since = since.clone();
    let mut applied = 0;

    loop {
        let batch = source.changes(&since, batch_size)?;
        let docs: Vec<_> = batch.results.into_iter().map(|record| record.doc).collect();
        if !docs.is_empty() {
            applied += target.apply_replicated(docs)?;
        }
        since = Since::After(batch.last_seq);
        if batch.pending == 0 {
            return Ok((applied, since));
        }
    }
}

/// One-shot flag that runs queued callbacks when it is first set.
#[derive(Default)]
pub struct ReadyLatch {
    state: Mutex<LatchState>,
}

#[derive(Default)]
struct LatchState {
    ready: bool,
    waiters: Vec<Box<dyn FnOnce() + Send>>,
}

impl ReadyLatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_set(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .ready
    }

    /// Set the latch and run every queued callback. Later calls do nothing.
    pub fn set(&self) {
        let waiters = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.ready {
                return;
            }
            state.ready = true;
            std::mem::take(&mut state.waiters)
        };
        for waiter in waiters {
            waiter();
        }
    }

    /// Run `callback` once the latch is set (immediately if it already is).
    pub fn wait_with(&self, callback: impl FnOnce() + Send + 'static) {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if !state.ready {
                state.waiters.push(Box::new(callback));
                return;
            }
        }
        callback();
    }
}

/// One pass for a shared replicator: pull, set `ready` if the pull finished,
/// then push.
pub fn replicate_pass(
    replicator: &Mutex<Replicator>,
    ready: &ReadyLatch,
) -> Result<ReplicationReport, StoreError> {
    let mut replicator = replicator
        .lock()
        .map_err(|_| StoreError::LockPoisoned("replication"))?;
    let pulled = replicator.pull()?;
    let pushed = replicator.push();
    drop(replicator);

    ready.set();
    Ok(ReplicationReport {
        pulled,
        pushed: pushed?,
    })
}

/// Statistics from a replication thread.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReplicationStats {
    pub passes: usize,
    pub pulled: usize,
    pub pushed: usize,
    pub failures: usize,
}

enum Signal {
    Wake,
    Stop,
}

/// Cloneable handle that asks a replication thread to run a pass now.
#[derive(Clone)]
pub struct Waker {
    tx: SyncSender<Signal>,
}

impl Waker {
    pub fn wake(&self) {
        // A full channel already holds a pending wake-up.
        match self.tx.try_send(Signal::Wake) {
            Ok(()) | Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {}
        }
    }
}

/// A background thread that keeps one collection replicating.
///
/// Failures are logged and retried on the next pass; the thread never gives
/// up on its own.
///
/// ## Example
///
/// ```ignore
/// let thread = ReplicationThread::spawn("labeldb", replicator, ready, Duration::from_secs(1));
/// // ... later
/// let stats = thread.stop();
/// ```
pub struct ReplicationThread {
    tx: SyncSender<Signal>,
    handle: Option<JoinHandle<ReplicationStats>>,
}

impl ReplicationThread {
    pub fn spawn(
        name: &str,
        replicator: Arc<Mutex<Replicator>>,
        ready: Arc<ReadyLatch>,
        interval: Duration,
    ) -> Self {
        let (tx, rx) = sync_channel(1);
        let name = name.to_string();
        let handle = thread::spawn(move || run(&name, &replicator, &ready, interval, &rx));

        Self {
            tx,
            handle: Some(handle),
        }
    }

    pub fn waker(&self) -> Waker {
        Waker {
            tx: self.tx.clone(),
        }
    }

    /// Stop the thread and return its statistics.
    pub fn stop(mut self) -> ReplicationStats {
        self.shutdown()
    }

    fn shutdown(&mut self) -> ReplicationStats {
        let _ = self.tx.send(Signal::Stop);
        self.handle
            .take()
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default()
    }
}

impl Drop for ReplicationThread {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.shutdown();
        }
    }
}

fn run(
    name: &str,
    replicator: &Mutex<Replicator>,
    ready: &ReadyLatch,
    interval: Duration,
    rx: &Receiver<Signal>,
) -> ReplicationStats {
    let mut stats = ReplicationStats::default();

    loop {
        stats.passes += 1;
        match replicate_pass(replicator, ready) {
            Ok(report) => {
                stats.pulled += report.pulled;
                stats.pushed += report.pushed;
                if report.pulled > 0 || report.pushed > 0 {
                    debug!(collection = name, pulled = report.pulled, pushed = report.pushed, "replicated");
                }
            }
            Err(err) => {
                stats.failures += 1;
                warn!(collection = name, error = %err, "replication pass failed; will retry");
            }
        }

        match rx.recv_timeout(interval) {
            Ok(Signal::Wake) | Err(RecvTimeoutError::Timeout) => {}
            Ok(Signal::Stop) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    stats
}
