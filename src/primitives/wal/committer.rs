use std::sync::mpsc::{self, Receiver, Sender, SyncSender, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use super::{Wal, WalOp, WalRecord};
use crate::storage::metrics::{default_metrics, StorageMetrics};
use crate::types::{clone_error, Lsn, Result, SealError};

/// Controls whether a commit waits for the physical flush.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Durability {
    /// The caller blocks until the batch containing its record is synced.
    #[default]
    FullSync,
    /// The caller returns once the record is queued.
    Async,
}

/// Configuration for batch commit behavior in [`GroupCommitter`].
#[derive(Clone, Copy, Debug)]
pub struct CommitConfig {
    /// Maximum number of commit requests flushed together.
    pub max_batch_size: usize,
    /// Upper bound on how long the worker keeps draining a busy queue into
    /// one batch. A batch is always flushed once the queue runs empty; zero
    /// removes the bound.
    pub max_batch_delay: Duration,
    /// Durability applied to every commit.
    pub durability: Durability,
}

impl Default for CommitConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 64,
            max_batch_delay: Duration::from_millis(2),
            durability: Durability::FullSync,
        }
    }
}

impl CommitConfig {
    fn normalize(mut self) -> Self {
        if self.max_batch_size == 0 {
            self.max_batch_size = 1;
        }
        self
    }
}

/// One payload submitted for commit.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WalEntry {
    /// Operation recorded in the log.
    pub op: WalOp,
    /// Opaque payload.
    pub payload: Vec<u8>,
}

impl WalEntry {
    /// Creates an entry.
    pub fn new(op: WalOp, payload: Vec<u8>) -> Self {
        Self { op, payload }
    }
}

/// Outcome of an accepted commit.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CommitReceipt {
    /// Sequence number of the last record written for this commit.
    pub seq: Lsn,
    /// True when the record was synced before the call returned.
    pub durable: bool,
}

/// Counters describing committer activity.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CommitterStats {
    /// Batches written.
    pub batches: u64,
    /// Commit requests completed.
    pub commits: u64,
    /// Largest number of requests in one batch.
    pub largest_batch: usize,
    /// Async records dropped because their flush failed.
    pub lost_records: u64,
}

type Signal = SyncSender<Result<()>>;

enum Request {
    Append {
        records: Vec<WalRecord>,
        done: Option<Signal>,
    },
    Barrier {
        done: Signal,
    },
}

impl Request {
    fn is_barrier(&self) -> bool {
        matches!(self, Request::Barrier { .. })
    }
}

struct Submitter {
    next_seq: Lsn,
    tx: Option<Sender<Request>>,
}

#[derive(Default)]
struct Shared {
    failure: Mutex<Option<String>>,
    stats: Mutex<CommitterStats>,
}

impl Shared {
    fn check(&self) -> Result<()> {
        match self.failure.lock().as_ref() {
            Some(msg) => Err(SealError::FlushFailure(msg.clone())),
            None => Ok(()),
        }
    }

    fn poison(&self, msg: String) {
        let mut failure = self.failure.lock();
        if failure.is_none() {
            *failure = Some(msg);
        }
    }
}

/// Group-commit front end for a [`Wal`].
///
/// Callers enqueue records on a channel; a dedicated worker thread drains it,
/// writes each batch with one append and one sync, then signals every waiter
/// in the batch in submission order. After a failed flush the committer stays
/// failed and rejects further commits.
pub struct GroupCommitter {
    wal: Arc<Wal>,
    config: CommitConfig,
    submit: Mutex<Submitter>,
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl GroupCommitter {
    /// Starts the commit worker. Sequence numbers continue after `wal.last_seq()`.
    pub fn new(wal: Arc<Wal>, config: CommitConfig) -> Result<Self> {
        Self::with_metrics(wal, config, default_metrics())
    }

    /// Like [`GroupCommitter::new`], reporting every written batch to `metrics`.
    pub fn with_metrics(
        wal: Arc<Wal>,
        config: CommitConfig,
        metrics: Arc<dyn StorageMetrics>,
    ) -> Result<Self> {
        let config = config.normalize();
        let (tx, rx) = mpsc::channel();
        let shared = Arc::new(Shared::default());
        let worker = {
            let wal = Arc::clone(&wal);
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("sealdb-wal-commit".into())
                .spawn(move || worker_loop(wal, rx, config, shared, metrics))?
        };
        let next_seq = wal.last_seq().next();
        Ok(Self {
            wal,
            config,
            submit: Mutex::new(Submitter {
                next_seq,
                tx: Some(tx),
            }),
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Commits a single record.
    pub fn commit(&self, entry: WalEntry) -> Result<CommitReceipt> {
        self.submit(vec![entry], false)
    }

    /// Commits several records atomically: replay applies all of them or none.
    pub fn commit_group(&self, entries: Vec<WalEntry>) -> Result<CommitReceipt> {
        if entries.is_empty() {
            return Err(SealError::Invalid("commit group must not be empty"));
        }
        if entries.len() == 1 {
            return self.submit(entries, false);
        }
        self.submit(entries, true)
    }

    fn submit(&self, entries: Vec<WalEntry>, grouped: bool) -> Result<CommitReceipt> {
        self.shared.check()?;
        let wait = self.config.durability == Durability::FullSync;
        let (done, signal) = if wait {
            let (tx, rx) = mpsc::sync_channel(1);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        let last_seq = {
            let mut submit = self.submit.lock();
            let Some(tx) = submit.tx.as_ref() else {
                return Err(SealError::Closed);
            };
            let count = entries.len();
            let mut seq = submit.next_seq;
            let mut records = Vec::with_capacity(count + usize::from(grouped));
            for entry in entries {
                records.push(WalRecord {
                    seq,
                    op: entry.op,
                    grouped,
                    payload: entry.payload,
                });
                seq = seq.next();
            }
            if grouped {
                records.push(WalRecord::new(
                    seq,
                    WalOp::Commit,
                    (count as u32).to_be_bytes().to_vec(),
                ));
                seq = seq.next();
            }
            let last = Lsn(seq.0 - 1);
            debug!(records = records.len(), last_seq = last.0, wait, "wal.committer.enqueue");
            tx.send(Request::Append { records, done })
                .map_err(|_| SealError::Closed)?;
            submit.next_seq = seq;
            last
        };
        if let Some(signal) = signal {
            await_signal(&signal)?;
        }
        Ok(CommitReceipt {
            seq: last_seq,
            durable: wait,
        })
    }

    /// Blocks until every commit queued before this call has been written and synced.
    pub fn flush(&self) -> Result<()> {
        self.shared.check()?;
        let (tx, rx) = mpsc::sync_channel(1);
        {
            let submit = self.submit.lock();
            let sender = submit.tx.as_ref().ok_or(SealError::Closed)?;
            sender
                .send(Request::Barrier { done: tx })
                .map_err(|_| SealError::Closed)?;
        }
        await_signal(&rx)
    }

    /// Drains the queue, flushes the last batch and stops the worker.
    ///
    /// Later commits fail with [`SealError::Closed`]. Calling this twice is a no-op.
    pub fn shutdown(&self) -> Result<()> {
        let sender = self.submit.lock().tx.take();
        let Some(sender) = sender else {
            return Ok(());
        };
        drop(sender);
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                return Err(SealError::FlushFailure(
                    "wal commit worker panicked".to_string(),
                ));
            }
        }
        info!(stats = ?self.stats(), "wal.committer.shutdown");
        self.shared.check()
    }

    /// The failure message recorded by the last failed flush, if any.
    pub fn failure(&self) -> Option<String> {
        self.shared.failure.lock().clone()
    }

    /// True once [`GroupCommitter::shutdown`] has run.
    pub fn is_closed(&self) -> bool {
        self.submit.lock().tx.is_none()
    }

    /// Returns committer statistics.
    pub fn stats(&self) -> CommitterStats {
        self.shared.stats.lock().clone()
    }

    /// The log this committer writes to.
    pub fn wal(&self) -> &Arc<Wal> {
        &self.wal
    }

    /// Active configuration.
    pub fn config(&self) -> CommitConfig {
        self.config
    }
}

impl Drop for GroupCommitter {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            error!(error = %err, "wal.committer.drop_failed");
        }
    }
}

fn await_signal(signal: &Receiver<Result<()>>) -> Result<()> {
    match signal.recv() {
        Ok(outcome) => outcome,
        Err(_) => Err(SealError::FlushFailure(
            "wal commit worker stopped before completing the batch".to_string(),
        )),
    }
}

fn worker_loop(
    wal: Arc<Wal>,
    rx: Receiver<Request>,
    config: CommitConfig,
    shared: Arc<Shared>,
    metrics: Arc<dyn StorageMetrics>,
) {
    let mut batch = Vec::with_capacity(config.max_batch_size);
    loop {
        let Ok(first) = rx.recv() else {
            debug!("wal.committer.worker_exit");
            break;
        };
        batch.push(first);
        let disconnected = coalesce_batch(&rx, &mut batch, config);
        apply_batch(&wal, &shared, metrics.as_ref(), &mut batch);
        if disconnected {
            debug!("wal.committer.worker_exit");
            break;
        }
    }
}

/// Pulls more requests into `batch`. Returns true when every sender is gone.
///
/// The batch closes when it is full, when the queue is drained, or when
/// `max_batch_delay` has passed since the first request while producers keep
/// the queue non-empty.
fn coalesce_batch(rx: &Receiver<Request>, batch: &mut Vec<Request>, config: CommitConfig) -> bool {
    let start = Instant::now();
    while batch.len() < config.max_batch_size {
        if batch.last().is_some_and(Request::is_barrier) {
            break;
        }
        if !config.max_batch_delay.is_zero() && start.elapsed() >= config.max_batch_delay {
            break;
        }
        match rx.try_recv() {
            Ok(req) => batch.push(req),
            Err(TryRecvError::Empty) => break,
            Err(TryRecvError::Disconnected) => return true,
        }
    }
    false
}

fn apply_batch(wal: &Wal, shared: &Shared, metrics: &dyn StorageMetrics, batch: &mut Vec<Request>) {
    let records: Vec<&WalRecord> = batch
        .iter()
        .filter_map(|req| match req {
            Request::Append { records, .. } => Some(records.iter()),
            Request::Barrier { .. } => None,
        })
        .flatten()
        .collect();
    debug!(
        batch_commits = batch.len(),
        records = records.len(),
        "wal.committer.apply_batch.start"
    );
    let outcome = shared.check().and_then(|()| {
        wal.append_batch(&records)?;
        wal.sync()
    });
    let lost: u64 = match &outcome {
        Ok(()) => {
            metrics.wal_batch(records.len());
            0
        }
        Err(_) => batch
            .iter()
            .map(|req| match req {
                Request::Append { records, done: None } => records.len() as u64,
                _ => 0,
            })
            .sum(),
    };
    drop(records);
    {
        let mut stats = shared.stats.lock();
        stats.batches += 1;
        stats.largest_batch = stats.largest_batch.max(batch.len());
        stats.lost_records += lost;
    }
    let failure = outcome.err().map(|err| match err {
        SealError::FlushFailure(msg) => msg,
        other => other.to_string(),
    });
    if let Some(msg) = &failure {
        error!(error = %msg, lost_async_records = lost, "wal.committer.flush_failed");
        shared.poison(msg.clone());
    }
    let failure = failure.map(SealError::FlushFailure);
    let mut completed = 0u64;
    for req in batch.drain(..) {
        let done = match req {
            Request::Append { done, .. } => {
                completed += 1;
                done
            }
            Request::Barrier { done } => Some(done),
        };
        if let Some(done) = done {
            let result = match &failure {
                None => Ok(()),
                Some(err) => Err(clone_error(err)),
            };
            let _ = done.send(result);
        }
    }
    shared.stats.lock().commits += completed;
}
