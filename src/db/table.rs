use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::storage::index::{IndexBatch, IndexKey, IndexManager};
use crate::storage::{EngineKind, EngineStats, ScanVisitor, StorageEngine, VacuumReport};
use crate::types::{Result, RowRef, SealError, TableId};

/// A table: one storage engine plus the hash indexes kept in step with it.
///
/// Every write goes to the engine first and is then reported to the index
/// manager, so lookups never return a row the engine has not stored. Once the
/// engine accepted a write the call succeeds; if the index hook fails the
/// indexes are unloaded and rebuilt from the engine on the next lookup.
pub struct Table {
    id: TableId,
    name: String,
    engine: Arc<dyn StorageEngine>,
    index: Option<IndexManager>,
}

impl Table {
    /// Wraps `engine`; `indexed` controls whether an index manager is attached.
    pub fn new(
        id: TableId,
        name: &str,
        engine: Arc<dyn StorageEngine>,
        indexed: bool,
    ) -> Result<Self> {
        let index = if indexed {
            Some(IndexManager::new(Arc::clone(&engine), id)?)
        } else {
            None
        };
        Ok(Self {
            id,
            name: name.to_owned(),
            engine,
            index,
        })
    }

    /// Table identifier.
    pub fn id(&self) -> TableId {
        self.id
    }

    /// Table name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Engine flavor backing the table.
    pub fn kind(&self) -> EngineKind {
        self.engine.kind()
    }

    /// Underlying engine.
    pub fn engine(&self) -> &Arc<dyn StorageEngine> {
        &self.engine
    }

    /// Index manager, if hash indexes are enabled.
    pub fn index(&self) -> Option<&IndexManager> {
        self.index.as_ref()
    }

    /// Stores a row.
    pub fn insert(&self, data: &[u8]) -> Result<RowRef> {
        let row = self.engine.insert(self.id, data)?;
        if let Some(index) = &self.index {
            self.after_write(index, "insert", index.record_insert(row, data));
        }
        Ok(row)
    }

    /// Reads a row.
    pub fn read(&self, row: RowRef) -> Result<Option<Vec<u8>>> {
        self.engine.read(self.id, row)
    }

    /// Replaces a row.
    pub fn update(&self, row: RowRef, data: &[u8]) -> Result<()> {
        self.engine.update(self.id, row, data)?;
        if let Some(index) = &self.index {
            self.after_write(index, "update", index.record_update(row, data));
        }
        Ok(())
    }

    /// Removes a row.
    pub fn delete(&self, row: RowRef) -> Result<()> {
        self.engine.delete(self.id, row)?;
        if let Some(index) = &self.index {
            self.after_write(index, "delete", index.record_delete(row));
        }
        Ok(())
    }

    /// Visits every live row.
    pub fn scan(&self, visit: &mut ScanVisitor<'_>) -> Result<()> {
        self.engine.scan(self.id, visit)
    }

    /// Declares a hash index over `column`.
    pub fn create_index<F>(&self, column: &str, extractor: F) -> Result<()>
    where
        F: Fn(&[u8]) -> Option<IndexKey> + Send + Sync + 'static,
    {
        self.indexes()?.register_column(column, extractor);
        Ok(())
    }

    /// Rows whose `column` equals `key`.
    pub fn lookup(&self, column: &str, key: &[u8]) -> Result<BTreeSet<RowRef>> {
        self.indexes()?.lookup(column, key)
    }

    /// Index answer for a `column = value` clause, or `None` when the caller must scan.
    pub fn lookup_where(&self, clause: &str) -> Result<Option<BTreeSet<RowRef>>> {
        match &self.index {
            Some(index) => index.lookup_where(clause),
            None => Ok(None),
        }
    }

    /// Starts a bulk load whose index updates are deferred to [`TableBatch::finish`].
    pub fn begin_batch(&self) -> TableBatch<'_> {
        TableBatch {
            table: self,
            index: self.index.as_ref().map(IndexManager::begin_batch),
        }
    }

    /// Makes acknowledged writes durable in the engine's primary file.
    pub fn checkpoint(&self) -> Result<()> {
        self.engine.checkpoint()
    }

    /// Compacts the engine and rebuilds loaded indexes if references moved.
    pub fn vacuum(&self) -> Result<VacuumReport> {
        let report = self.engine.vacuum()?;
        if report.refs_invalidated > 0 {
            if let Some(index) = &self.index {
                for column in index.columns() {
                    if index.is_loaded(&column) {
                        index.rebuild(&column)?;
                    }
                }
            }
        }
        debug!(table = %self.name, ?report, "table.vacuum");
        Ok(report)
    }

    /// Engine statistics.
    pub fn stats(&self) -> EngineStats {
        self.engine.stats()
    }

    fn after_write(&self, index: &IndexManager, op: &'static str, hook: Result<()>) {
        if let Err(err) = hook {
            warn!(table = %self.id, op, error = %err, "table.index.hook_failed");
            index.invalidate();
        }
    }

    fn indexes(&self) -> Result<&IndexManager> {
        self.index
            .as_ref()
            .ok_or(SealError::Invalid("hash indexes are disabled"))
    }
}

/// Bulk-load scope returned by [`Table::begin_batch`].
///
/// Rows are written to the engine immediately; their index mutations are
/// applied together, in order, when the batch finishes or is dropped.
pub struct TableBatch<'a> {
    table: &'a Table,
    index: Option<IndexBatch<'a>>,
}

impl TableBatch<'_> {
    /// Stores a row and defers its index update.
    pub fn insert(&mut self, data: &[u8]) -> Result<RowRef> {
        let row = self.table.engine.insert(self.table.id, data)?;
        if let Some(batch) = &mut self.index {
            batch.record_insert(row, data);
        }
        Ok(row)
    }

    /// Replaces a row and defers its index update.
    pub fn update(&mut self, row: RowRef, data: &[u8]) -> Result<()> {
        self.table.engine.update(self.table.id, row, data)?;
        if let Some(batch) = &mut self.index {
            batch.record_update(row, data);
        }
        Ok(())
    }

    /// Removes a row and defers its index update.
    pub fn delete(&mut self, row: RowRef) -> Result<()> {
        self.table.engine.delete(self.table.id, row)?;
        if let Some(batch) = &mut self.index {
            batch.record_delete(row);
        }
        Ok(())
    }

    /// Applies the deferred index updates and returns how many were applied.
    pub fn finish(self) -> usize {
        self.index.map_or(0, IndexBatch::finish)
    }
}
