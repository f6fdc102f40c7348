#![forbid(unsafe_code)]

mod batch;
mod predicate;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex, RwLock};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, error, info};

use super::{ScanControl, StorageEngine};
use crate::types::{Result, RowRef, SealError, TableId};

pub use batch::IndexBatch;
pub use predicate::{parse_equality, EqualityPredicate};

/// Raw key bytes produced by a column extractor.
pub type IndexKey = Vec<u8>;

/// Pulls a column's key out of serialized row bytes; `None` leaves the row unindexed.
pub type KeyExtractor = Arc<dyn Fn(&[u8]) -> Option<IndexKey> + Send + Sync>;

/// Sorted snapshot of one column index.
pub type IndexSnapshot = BTreeMap<IndexKey, BTreeSet<RowRef>>;

/// A change to apply to every loaded column index.
#[derive(Clone, Debug)]
pub enum IndexMutation {
    /// A row was stored.
    Insert {
        /// Row reference.
        row: RowRef,
        /// Row bytes.
        data: Arc<[u8]>,
    },
    /// A row was replaced.
    Update {
        /// Row reference.
        row: RowRef,
        /// New row bytes.
        data: Arc<[u8]>,
    },
    /// A row was removed.
    Delete {
        /// Row reference.
        row: RowRef,
    },
}

struct ColumnIndex {
    extractor: KeyExtractor,
    loaded: bool,
    entries: FxHashMap<IndexKey, FxHashSet<RowRef>>,
    keys: FxHashMap<RowRef, IndexKey>,
}

impl ColumnIndex {
    fn new(extractor: KeyExtractor) -> Self {
        Self {
            extractor,
            loaded: false,
            entries: FxHashMap::default(),
            keys: FxHashMap::default(),
        }
    }

    fn clear(&mut self) {
        self.loaded = false;
        self.entries.clear();
        self.keys.clear();
    }

    fn unlink(&mut self, row: RowRef) {
        let Some(old) = self.keys.remove(&row) else {
            return;
        };
        if let Some(rows) = self.entries.get_mut(&old) {
            rows.remove(&row);
            if rows.is_empty() {
                self.entries.remove(&old);
            }
        }
    }

    fn put(&mut self, row: RowRef, key: Option<IndexKey>) {
        self.unlink(row);
        if let Some(key) = key {
            self.entries.entry(key.clone()).or_default().insert(row);
            self.keys.insert(row, key);
        }
    }

    fn apply(&mut self, mutation: &IndexMutation) {
        if !self.loaded {
            return;
        }
        match mutation {
            IndexMutation::Insert { row, data } | IndexMutation::Update { row, data } => {
                let key = (self.extractor)(&data[..]);
                self.put(*row, key);
            }
            IndexMutation::Delete { row } => self.unlink(*row),
        }
    }
}

#[derive(Default)]
struct Progress {
    enqueued: u64,
    applied: u64,
}

struct IndexShared {
    engine: Arc<dyn StorageEngine>,
    table: TableId,
    columns: RwLock<FxHashMap<String, ColumnIndex>>,
    progress: Mutex<Progress>,
    applied: Condvar,
    /// Serializes bulk applies of batched mutations.
    bulk: Mutex<()>,
}

impl IndexShared {
    fn apply_one(&self, mutation: &IndexMutation) {
        let mut columns = self.columns.write();
        for column in columns.values_mut() {
            column.apply(mutation);
        }
    }

    fn mark_applied(&self, count: u64) {
        let mut progress = self.progress.lock();
        progress.applied += count;
        self.applied.notify_all();
    }
}

/// Hash indexes over the rows one table keeps in its storage engine.
///
/// A column index is built lazily by scanning the engine the first time it is
/// looked up. Afterwards, mutations reported through the `record_*` hooks are
/// applied by a background consumer (immediate mode), or collected in an
/// [`IndexBatch`] and applied in one pass when the batch finishes.
pub struct IndexManager {
    shared: Arc<IndexShared>,
    tx: Mutex<Option<Sender<IndexMutation>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl IndexManager {
    /// Creates the manager and starts its consumer thread.
    pub fn new(engine: Arc<dyn StorageEngine>, table: TableId) -> Result<Self> {
        let shared = Arc::new(IndexShared {
            engine,
            table,
            columns: RwLock::new(FxHashMap::default()),
            progress: Mutex::new(Progress::default()),
            applied: Condvar::new(),
            bulk: Mutex::new(()),
        });
        let (tx, rx) = mpsc::channel::<IndexMutation>();
        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name("sealdb-index-consumer".into())
            .spawn(move || {
                while let Ok(mutation) = rx.recv() {
                    worker_shared.apply_one(&mutation);
                    worker_shared.mark_applied(1);
                }
                debug!(table = %worker_shared.table, "index.consumer.stopped");
            })?;
        Ok(Self {
            shared,
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Table whose rows are indexed.
    pub fn table(&self) -> TableId {
        self.shared.table
    }

    /// Declares an index over `name`. Re-registering replaces the extractor and unloads it.
    pub fn register_column<F>(&self, name: &str, extractor: F)
    where
        F: Fn(&[u8]) -> Option<IndexKey> + Send + Sync + 'static,
    {
        let mut columns = self.shared.columns.write();
        columns.insert(name.to_owned(), ColumnIndex::new(Arc::new(extractor)));
    }

    /// Forgets the index over `name`. Returns whether it existed.
    pub fn drop_column(&self, name: &str) -> bool {
        self.shared.columns.write().remove(name).is_some()
    }

    /// Registered column names, sorted.
    pub fn columns(&self) -> Vec<String> {
        let mut names: Vec<String> = self.shared.columns.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Whether the index over `name` is materialized.
    pub fn is_loaded(&self, name: &str) -> bool {
        self.shared
            .columns
            .read()
            .get(name)
            .is_some_and(|column| column.loaded)
    }

    /// Builds the index over `name` from the engine if it is not in memory yet.
    pub fn ensure_loaded(&self, name: &str) -> Result<()> {
        if self.is_loaded(name) {
            return Ok(());
        }
        self.sync();
        let mut columns = self.shared.columns.write();
        let column = columns
            .get_mut(name)
            .ok_or_else(|| SealError::InvalidOwned(format!("no index on column {name}")))?;
        if column.loaded {
            return Ok(());
        }
        column.clear();
        let extractor = Arc::clone(&column.extractor);
        let mut rows = 0u64;
        self.shared.engine.scan(self.shared.table, &mut |row, data| {
            column.put(row, extractor(data));
            rows += 1;
            Ok(ScanControl::Continue)
        })?;
        column.loaded = true;
        info!(
            table = %self.shared.table,
            column = name,
            rows,
            keys = column.entries.len(),
            "index.load"
        );
        Ok(())
    }

    /// Discards and rebuilds the index over `name`.
    pub fn rebuild(&self, name: &str) -> Result<()> {
        {
            let mut columns = self.shared.columns.write();
            let column = columns
                .get_mut(name)
                .ok_or_else(|| SealError::InvalidOwned(format!("no index on column {name}")))?;
            column.clear();
        }
        self.ensure_loaded(name)
    }

    /// Unloads every column so the next lookup rebuilds it from the engine.
    ///
    /// Used when a hook could not be delivered and the in-memory indexes may
    /// have missed a write.
    pub fn invalidate(&self) {
        let mut columns = self.shared.columns.write();
        for column in columns.values_mut() {
            column.clear();
        }
    }

    /// Rows whose `name` column equals `key`, loading the index on first use.
    pub fn lookup(&self, name: &str, key: &[u8]) -> Result<BTreeSet<RowRef>> {
        self.ensure_loaded(name)?;
        self.sync();
        let columns = self.shared.columns.read();
        let rows = columns
            .get(name)
            .and_then(|column| column.entries.get(key))
            .map(|rows| rows.iter().copied().collect())
            .unwrap_or_default();
        Ok(rows)
    }

    /// Answers a `column = value` clause from the index.
    ///
    /// Returns `Ok(None)` when the clause is not a single equality on an
    /// indexed column; the caller must then scan.
    pub fn lookup_where(&self, clause: &str) -> Result<Option<BTreeSet<RowRef>>> {
        let Some(predicate) = parse_equality(clause) else {
            return Ok(None);
        };
        if !self.shared.columns.read().contains_key(&predicate.column) {
            return Ok(None);
        }
        self.lookup(&predicate.column, predicate.value.as_bytes())
            .map(Some)
    }

    /// Sorted copy of a loaded index, or `None` if `name` is not loaded.
    pub fn export(&self, name: &str) -> Option<IndexSnapshot> {
        self.sync();
        let columns = self.shared.columns.read();
        let column = columns.get(name).filter(|column| column.loaded)?;
        Some(
            column
                .entries
                .iter()
                .map(|(key, rows)| (key.clone(), rows.iter().copied().collect()))
                .collect(),
        )
    }

    /// Reports a stored row.
    pub fn record_insert(&self, row: RowRef, data: &[u8]) -> Result<()> {
        self.enqueue(IndexMutation::Insert {
            row,
            data: Arc::from(data),
        })
    }

    /// Reports a replaced row.
    pub fn record_update(&self, row: RowRef, data: &[u8]) -> Result<()> {
        self.enqueue(IndexMutation::Update {
            row,
            data: Arc::from(data),
        })
    }

    /// Reports a removed row.
    pub fn record_delete(&self, row: RowRef) -> Result<()> {
        self.enqueue(IndexMutation::Delete { row })
    }

    /// Starts collecting mutations without touching the index until the batch finishes.
    pub fn begin_batch(&self) -> IndexBatch<'_> {
        IndexBatch::new(self)
    }

    /// Blocks until the consumer has applied every mutation enqueued so far.
    pub fn sync(&self) {
        let mut progress = self.shared.progress.lock();
        let target = progress.enqueued;
        while progress.applied < target {
            self.shared.applied.wait(&mut progress);
        }
    }

    /// Mutations enqueued and not yet applied.
    pub fn pending(&self) -> u64 {
        let progress = self.shared.progress.lock();
        progress.enqueued.saturating_sub(progress.applied)
    }

    /// Stops the consumer after it drains the queue.
    pub fn shutdown(&self) {
        self.tx.lock().take();
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                error!(table = %self.shared.table, "index.consumer.panicked");
            }
        }
    }

    fn enqueue(&self, mutation: IndexMutation) -> Result<()> {
        let tx = self.tx.lock();
        let sender = tx.as_ref().ok_or(SealError::Closed)?;
        // Counted before sending so the consumer never overtakes the counter.
        self.shared.progress.lock().enqueued += 1;
        if sender.send(mutation).is_err() {
            self.shared.progress.lock().enqueued -= 1;
            return Err(SealError::Closed);
        }
        Ok(())
    }

    /// Applies collected mutations in order under the bulk lock.
    fn apply_bulk(&self, mutations: Vec<IndexMutation>) -> usize {
        if mutations.is_empty() {
            return 0;
        }
        let _bulk = self.shared.bulk.lock();
        self.sync();
        // Keys are extracted before the write lock so readers only wait for the merge.
        let extractors: Vec<(String, KeyExtractor)> = self
            .shared
            .columns
            .read()
            .iter()
            .filter(|(_, column)| column.loaded)
            .map(|(name, column)| (name.clone(), Arc::clone(&column.extractor)))
            .collect();
        let plans: Vec<(String, Vec<(RowRef, Option<Option<IndexKey>>)>)> = extractors
            .into_iter()
            .map(|(name, extractor)| {
                let steps = mutations
                    .iter()
                    .map(|mutation| match mutation {
                        IndexMutation::Insert { row, data } | IndexMutation::Update { row, data } => {
                            (*row, Some(extractor(&data[..])))
                        }
                        IndexMutation::Delete { row } => (*row, None),
                    })
                    .collect();
                (name, steps)
            })
            .collect();
        let mut columns = self.shared.columns.write();
        for (name, steps) in plans {
            let Some(column) = columns.get_mut(&name).filter(|column| column.loaded) else {
                continue;
            };
            for (row, step) in steps {
                match step {
                    Some(key) => column.put(row, key),
                    None => column.unlink(row),
                }
            }
        }
        debug!(table = %self.shared.table, mutations = mutations.len(), "index.batch.apply");
        mutations.len()
    }
}

impl Drop for IndexManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for IndexManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexManager")
            .field("table", &self.shared.table)
            .field("columns", &self.columns())
            .field("pending", &self.pending())
            .finish()
    }
}
