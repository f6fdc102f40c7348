#![allow(missing_docs)]

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Once};
use std::time::{Duration, Instant};

use sealdb::primitives::crypto::{BufferPool, CipherKey, PageCipher};
use sealdb::primitives::pager::PagerOptions;
use sealdb::primitives::wal::{Durability, FILE_HEADER_LEN};
use sealdb::storage::{EngineOptions, HybridEngine, ScanControl, StorageEngine};
use sealdb::types::{Result, RowRef, TableId};
use tempfile::tempdir;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("sealdb::storage=debug,sealdb::primitives::wal=debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .try_init();
    });
}

fn options() -> Result<EngineOptions> {
    let cipher = Arc::new(PageCipher::new(&CipherKey::from_bytes(&[7u8; 32])?));
    let mut options = EngineOptions::new(cipher, Arc::new(BufferPool::new()));
    options.pager = PagerOptions {
        page_size: 2048,
        cache_capacity: 32,
    };
    Ok(options)
}

fn wal_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".wal");
    PathBuf::from(name)
}

fn rows(engine: &HybridEngine, table: TableId) -> Result<Vec<(RowRef, Vec<u8>)>> {
    let mut out = Vec::new();
    engine.scan(table, &mut |row, data| {
        out.push((row, data.to_vec()));
        Ok(ScanControl::Continue)
    })?;
    out.sort();
    Ok(out)
}

#[test]
fn vacuum_folds_overlay_and_empties_wal() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let path = dir.path().join("data.hybrid");
    let engine = HybridEngine::open(&path, &options()?)?;
    let (users, events) = (TableId(1), TableId(2));

    let user_rows = (0..100u32)
        .map(|i| engine.insert(users, format!("user-{i}").as_bytes()))
        .collect::<Result<Vec<_>>>()?;
    let event_rows = engine.insert_many(events, &[b"boot".to_vec(), b"login".to_vec()])?;
    for row in &user_rows[..10] {
        engine.update(users, *row, b"renamed")?;
    }
    for row in &user_rows[90..] {
        engine.delete(users, *row)?;
    }
    let before = rows(&engine, users)?;
    assert_eq!(before.len(), 90);
    assert!(std::fs::metadata(wal_path(&path))?.len() > FILE_HEADER_LEN as u64);

    let report = engine.vacuum()?;
    assert_eq!(report.tables_compacted, 2);
    assert_eq!(report.entries_folded, 102);
    assert_eq!(report.refs_invalidated, 0);
    assert!(report.bytes_reclaimed > 0);
    assert_eq!(engine.overlay_len(), 0);
    assert_eq!(std::fs::metadata(wal_path(&path))?.len(), FILE_HEADER_LEN as u64);

    // Same rows under the same references after folding.
    assert_eq!(rows(&engine, users)?, before);
    assert_eq!(engine.read(events, event_rows[1])?, Some(b"login".to_vec()));
    assert_eq!(engine.read(users, user_rows[95])?, None);
    Ok(())
}

#[test]
fn writes_after_vacuum_replay_over_pages() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("data.hybrid");
    let t = TableId(1);
    let (a, b, c) = {
        let engine = HybridEngine::open(&path, &options()?)?;
        let a = engine.insert(t, b"a0")?;
        let b = engine.insert(t, b"b0")?;
        engine.vacuum()?;
        engine.update(t, a, b"a1 grows past its original slot size")?;
        engine.delete(t, b)?;
        let c = engine.insert(t, b"c0")?;
        (a, b, c)
    };
    let engine = HybridEngine::open(&path, &options()?)?;
    assert_eq!(engine.overlay_len(), 3);
    assert_eq!(
        engine.read(t, a)?,
        Some(b"a1 grows past its original slot size".to_vec())
    );
    assert_eq!(engine.read(t, b)?, None);
    assert_eq!(engine.read(t, c)?, Some(b"c0".to_vec()));

    engine.vacuum()?;
    drop(engine);
    let engine = HybridEngine::open(&path, &options()?)?;
    assert_eq!(engine.overlay_len(), 0);
    assert_eq!(rows(&engine, t)?.len(), 2);
    assert_eq!(engine.stats().live_rows, Some(2));
    Ok(())
}

#[test]
fn torn_wal_tail_loses_only_the_last_write() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("data.hybrid");
    let t = TableId(1);
    let refs = {
        let engine = HybridEngine::open(&path, &options()?)?;
        (0..5u8)
            .map(|i| engine.insert(t, &[i; 64]))
            .collect::<Result<Vec<_>>>()?
    };
    let wal = wal_path(&path);
    let len = std::fs::metadata(&wal)?.len();
    OpenOptions::new().write(true).open(&wal)?.set_len(len - 3)?;

    let engine = HybridEngine::open(&path, &options()?)?;
    for row in &refs[..4] {
        assert!(engine.read(t, *row)?.is_some());
    }
    assert_eq!(engine.read(t, refs[4])?, None);
    let next = engine.insert(t, b"after")?;
    assert_eq!(engine.read(t, next)?, Some(b"after".to_vec()));
    Ok(())
}

#[test]
fn async_commits_become_visible_and_durable_after_flush() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("data.hybrid");
    let mut opts = options()?;
    opts.commit.durability = Durability::Async;
    let t = TableId(4);
    let refs = {
        let engine = HybridEngine::open(&path, &opts)?;
        let refs = (0..20u8)
            .map(|i| engine.insert(t, &[i]))
            .collect::<Result<Vec<_>>>()?;
        engine.flush()?;
        refs
    };
    let engine = HybridEngine::open(&path, &opts)?;
    for (i, row) in refs.iter().enumerate() {
        assert_eq!(engine.read(t, *row)?, Some(vec![i as u8]));
    }
    Ok(())
}

#[test]
fn background_compaction_runs_on_interval() -> Result<()> {
    let dir = tempdir()?;
    let mut opts = options()?;
    opts.vacuum_interval = Some(Duration::from_millis(20));
    opts.vacuum_threshold_entries = 10;
    let engine = HybridEngine::open(&dir.path().join("data.hybrid"), &opts)?;
    for i in 0..5u8 {
        engine.insert(TableId(1), &[i])?;
    }
    std::thread::sleep(Duration::from_millis(100));
    // Below the threshold nothing is folded.
    assert_eq!(engine.overlay_len(), 5);
    let more: Vec<Vec<u8>> = (5..30u8).map(|i| vec![i]).collect();
    engine.insert_many(TableId(1), &more)?;
    let deadline = Instant::now() + Duration::from_secs(5);
    while engine.overlay_len() > 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(engine.overlay_len(), 0);
    assert_eq!(rows(&engine, TableId(1))?.len(), 30);
    Ok(())
}
