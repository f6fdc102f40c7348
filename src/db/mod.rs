//! Store-level wiring: configuration, shared resources, tables and health.

mod config;
mod health;
mod table;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};

use crate::primitives::crypto::{BufferPool, CipherKey, PageCipher};
use crate::storage::{
    open_engine, CounterMetrics, EngineKind, EngineOptions, StorageEngine, StorageMetrics,
};
use crate::types::{Result, SealError, TableId};

pub use config::StoreConfig;
pub use health::{Check, HealthCheck, HealthStatus};
pub use table::{Table, TableBatch};

/// Resources shared by every table of a store.
///
/// The buffer pool, cipher and metrics are owned here and handed to each
/// engine explicitly; nothing is process-global.
pub struct StorageContext {
    root: PathBuf,
    config: StoreConfig,
    cipher: Arc<PageCipher>,
    pool: Arc<BufferPool>,
    metrics: Arc<CounterMetrics>,
}

impl StorageContext {
    /// Validates `config` and prepares `root` to hold table files.
    pub fn new(root: impl Into<PathBuf>, key: &CipherKey, config: StoreConfig) -> Result<Self> {
        config.validate()?;
        let root = root.into();
        fs::create_dir_all(&root)?;
        info!(root = %root.display(), engine = ?config.engine, "context.open");
        Ok(Self {
            root,
            config,
            cipher: Arc::new(PageCipher::new(key)),
            pool: Arc::new(BufferPool::new()),
            metrics: Arc::new(CounterMetrics::default()),
        })
    }

    /// Active configuration.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Shared crypto scratch pool.
    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    /// Counters fed by every engine opened through this context.
    pub fn metrics(&self) -> &Arc<CounterMetrics> {
        &self.metrics
    }

    /// Directory holding the table files.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Options handed to engines.
    pub fn engine_options(&self) -> EngineOptions {
        let metrics: Arc<dyn StorageMetrics> = self.metrics.clone();
        self.config
            .engine_options(Arc::clone(&self.cipher), Arc::clone(&self.pool), metrics)
    }

    /// Opens `name` with the configured default engine.
    pub fn open_table(&self, id: TableId, name: &str) -> Result<Table> {
        self.open_table_with(id, name, self.config.engine)
    }

    /// Opens `name` with an explicit engine.
    ///
    /// The engine of a table is fixed when it is created; reopening it with a
    /// different kind fails.
    pub fn open_table_with(&self, id: TableId, name: &str, kind: EngineKind) -> Result<Table> {
        validate_name(name)?;
        for other in [EngineKind::AppendOnly, EngineKind::Paged, EngineKind::Hybrid] {
            if other != kind && self.table_path(name, other).exists() {
                return Err(SealError::InvalidOwned(format!(
                    "table {name} already uses the {} engine",
                    extension(other)
                )));
            }
        }
        let path = self.table_path(name, kind);
        let engine: Arc<dyn StorageEngine> = open_engine(kind, &path, &self.engine_options())?;
        Table::new(id, name, engine, self.config.hash_indexes_enabled)
    }

    /// Runs the health checks over `tables`.
    pub fn health(&self, tables: &[&Table]) -> HealthCheck {
        let mut health = HealthCheck::new();
        let corruption = self.metrics.corruption_events();
        health.add_check(Check::CorruptionErrors {
            count: corruption,
            healthy: corruption == 0,
        });
        let outstanding = self.pool.outstanding();
        health.add_check(Check::OutstandingBuffers {
            count: outstanding,
            healthy: outstanding == 0,
        });
        for table in tables {
            let stats = table.stats();
            if stats.kind != EngineKind::Hybrid {
                continue;
            }
            health.add_check(Check::WalFailure {
                table: table.name().to_owned(),
                healthy: stats.wal_failure.is_none(),
                message: stats.wal_failure,
            });
            let threshold = self.config.vacuum_threshold_entries;
            health.add_check(Check::OverlayBacklog {
                table: table.name().to_owned(),
                entries: stats.overlay_entries,
                threshold,
                healthy: stats.overlay_entries <= threshold,
            });
        }
        if !health.is_healthy() {
            match health.to_json() {
                Ok(report) => warn!(status = ?health.status, %report, "db.health.degraded"),
                Err(err) => warn!(status = ?health.status, error = %err, "db.health.degraded"),
            }
        }
        health
    }

    fn table_path(&self, name: &str, kind: EngineKind) -> PathBuf {
        self.root.join(format!("{name}.{}", extension(kind)))
    }
}

fn extension(kind: EngineKind) -> &'static str {
    match kind {
        EngineKind::AppendOnly => "log",
        EngineKind::Paged => "pages",
        EngineKind::Hybrid => "hybrid",
    }
}

fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(SealError::InvalidOwned(format!("invalid table name {name:?}")))
    }
}
