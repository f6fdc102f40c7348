use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::primitives::crypto::{BufferPool, PageCipher};
use crate::primitives::pager::PagerOptions;
use crate::primitives::storage::DEFAULT_MMAP_THRESHOLD;
use crate::primitives::wal::{CommitConfig, Durability};
use crate::storage::{EngineKind, EngineOptions, StorageMetrics};
use crate::types::{Result, SealError};

/// Store-wide tuning. Every field has a default, so a TOML file only needs the
/// keys it changes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    /// Engine used by tables that do not pick one explicitly.
    pub engine: EngineKind,
    /// Whether commits wait for the physical flush.
    pub durability: Durability,
    /// Maximum commit requests per WAL flush.
    pub wal_max_batch_size: usize,
    /// Maximum wait for more requests once one is pending. 0 flushes as soon
    /// as the queue drains.
    pub wal_max_batch_delay_ms: u64,
    /// Page size in bytes.
    pub page_size: usize,
    /// Decrypted pages kept in memory per table.
    pub page_cache_capacity: usize,
    /// Whether tables get a hash index manager.
    pub hash_indexes_enabled: bool,
    /// Period of hybrid background compaction; `None` disables it.
    pub vacuum_interval_ms: Option<u64>,
    /// Overlay entries that make the next compaction tick run.
    pub vacuum_threshold_entries: usize,
    /// Append-only files at least this large are scanned through a memory map.
    pub mmap_scan_threshold: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        let commit = CommitConfig::default();
        let pager = PagerOptions::default();
        Self {
            engine: EngineKind::default(),
            durability: commit.durability,
            wal_max_batch_size: commit.max_batch_size,
            wal_max_batch_delay_ms: commit.max_batch_delay.as_millis() as u64,
            page_size: pager.page_size,
            page_cache_capacity: pager.cache_capacity,
            hash_indexes_enabled: true,
            vacuum_interval_ms: None,
            vacuum_threshold_entries: 4096,
            mmap_scan_threshold: DEFAULT_MMAP_THRESHOLD,
        }
    }
}

impl StoreConfig {
    /// Hybrid engine with full durability and periodic compaction.
    pub fn production() -> Self {
        Self {
            engine: EngineKind::Hybrid,
            vacuum_interval_ms: Some(1_000),
            ..Self::default()
        }
    }

    /// Large batches and asynchronous commits for initial loads.
    pub fn bulk_load() -> Self {
        Self {
            durability: Durability::Async,
            wal_max_batch_size: 1024,
            wal_max_batch_delay_ms: 10,
            page_cache_capacity: 8192,
            vacuum_threshold_entries: 65_536,
            ..Self::default()
        }
    }

    /// Every commit is flushed on its own.
    pub fn fully_durable() -> Self {
        Self {
            durability: Durability::FullSync,
            wal_max_batch_size: 1,
            wal_max_batch_delay_ms: 0,
            ..Self::default()
        }
    }

    /// Parses and validates a TOML document.
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let config: StoreConfig = toml::from_str(input)
            .map_err(|err| SealError::InvalidOwned(format!("config: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Renders the configuration as TOML.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string(self).map_err(|err| SealError::InvalidOwned(format!("config: {err}")))
    }

    /// Rejects values the engines cannot run with.
    pub fn validate(&self) -> Result<()> {
        self.pager_options().validate()?;
        if self.wal_max_batch_size == 0 {
            return Err(SealError::Invalid("wal_max_batch_size must be at least 1"));
        }
        if self.vacuum_interval_ms == Some(0) {
            return Err(SealError::Invalid("vacuum_interval_ms must be positive"));
        }
        if self.vacuum_threshold_entries == 0 {
            return Err(SealError::Invalid("vacuum_threshold_entries must be at least 1"));
        }
        Ok(())
    }

    /// Group commit settings.
    pub fn commit_config(&self) -> CommitConfig {
        CommitConfig {
            max_batch_size: self.wal_max_batch_size,
            max_batch_delay: Duration::from_millis(self.wal_max_batch_delay_ms),
            durability: self.durability,
        }
    }

    /// Page cache settings.
    pub fn pager_options(&self) -> PagerOptions {
        PagerOptions {
            page_size: self.page_size,
            cache_capacity: self.page_cache_capacity,
        }
    }

    /// Engine options sharing the given resources.
    pub fn engine_options(
        &self,
        cipher: Arc<PageCipher>,
        pool: Arc<BufferPool>,
        metrics: Arc<dyn StorageMetrics>,
    ) -> EngineOptions {
        let mut options = EngineOptions::new(cipher, pool);
        options.metrics = metrics;
        options.pager = self.pager_options();
        options.commit = self.commit_config();
        options.mmap_scan_threshold = self.mmap_scan_threshold;
        options.vacuum_interval = self.vacuum_interval_ms.map(Duration::from_millis);
        options.vacuum_threshold_entries = self.vacuum_threshold_entries;
        options
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_keeps_defaults() -> Result<()> {
        let config = StoreConfig::from_toml_str(
            r#"
            engine = "hybrid"
            durability = "async"
            page_size = 8192
            vacuum_interval_ms = 250
            "#,
        )?;
        assert_eq!(config.engine, EngineKind::Hybrid);
        assert_eq!(config.durability, Durability::Async);
        assert_eq!(config.page_size, 8192);
        assert_eq!(config.wal_max_batch_size, 64);
        assert_eq!(config.page_cache_capacity, 1024);
        assert!(config.hash_indexes_enabled);
        assert_eq!(
            config.commit_config().max_batch_delay,
            Duration::from_millis(2)
        );
        Ok(())
    }

    #[test]
    fn rejects_invalid_values() {
        for input in [
            "page_size = 1000",
            "page_size = 256",
            "page_cache_capacity = 0",
            "wal_max_batch_size = 0",
            "vacuum_interval_ms = 0",
            "engine = \"btree\"",
            "unknown_key = 1",
        ] {
            assert!(StoreConfig::from_toml_str(input).is_err(), "{input}");
        }
    }

    #[test]
    fn presets_are_valid_and_round_trip() -> Result<()> {
        for preset in [
            StoreConfig::default(),
            StoreConfig::production(),
            StoreConfig::bulk_load(),
            StoreConfig::fully_durable(),
        ] {
            preset.validate()?;
            let text = preset.to_toml_string()?;
            assert_eq!(StoreConfig::from_toml_str(&text)?, preset);
        }
        Ok(())
    }
}
