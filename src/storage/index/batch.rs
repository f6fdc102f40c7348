use std::sync::Arc;

use tracing::warn;

use super::{IndexManager, IndexMutation};
use crate::types::RowRef;

/// Collects index mutations during a bulk load and applies them in one pass.
///
/// Nothing reaches the index until [`IndexBatch::finish`]. Mutations are
/// applied exactly once, in the order they were recorded. Dropping an
/// unfinished batch still applies it and logs a warning.
#[must_use = "a batch applies its mutations when finished"]
pub struct IndexBatch<'a> {
    manager: &'a IndexManager,
    pending: Vec<IndexMutation>,
}

impl<'a> IndexBatch<'a> {
    pub(super) fn new(manager: &'a IndexManager) -> Self {
        Self {
            manager,
            pending: Vec::new(),
        }
    }

    /// Records a stored row.
    pub fn record_insert(&mut self, row: RowRef, data: &[u8]) {
        self.pending.push(IndexMutation::Insert {
            row,
            data: Arc::from(data),
        });
    }

    /// Records a replaced row.
    pub fn record_update(&mut self, row: RowRef, data: &[u8]) {
        self.pending.push(IndexMutation::Update {
            row,
            data: Arc::from(data),
        });
    }

    /// Records a removed row.
    pub fn record_delete(&mut self, row: RowRef) {
        self.pending.push(IndexMutation::Delete { row });
    }

    /// Mutations waiting for [`IndexBatch::finish`].
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Applies every recorded mutation and returns how many there were.
    pub fn finish(mut self) -> usize {
        let pending = std::mem::take(&mut self.pending);
        self.manager.apply_bulk(pending)
    }
}

impl Drop for IndexBatch<'_> {
    fn drop(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        warn!(
            table = %self.manager.table(),
            pending = self.pending.len(),
            "index.batch.dropped_unfinished"
        );
        let pending = std::mem::take(&mut self.pending);
        self.manager.apply_bulk(pending);
    }
}
