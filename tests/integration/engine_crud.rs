#![allow(missing_docs)]

use std::path::Path;
use std::sync::Arc;

use sealdb::primitives::crypto::{BufferPool, CipherKey, PageCipher};
use sealdb::primitives::pager::PagerOptions;
use sealdb::storage::{open_engine, EngineKind, EngineOptions, ScanControl, StorageEngine};
use sealdb::types::{Result, RowRef, SealError, TableId};
use tempfile::tempdir;

const KINDS: [EngineKind; 3] = [EngineKind::AppendOnly, EngineKind::Paged, EngineKind::Hybrid];

fn options(pool: &Arc<BufferPool>) -> Result<EngineOptions> {
    let cipher = Arc::new(PageCipher::new(&CipherKey::from_bytes(&[8u8; 32])?));
    let mut options = EngineOptions::new(cipher, Arc::clone(pool));
    options.pager = PagerOptions {
        page_size: 1024,
        cache_capacity: 8,
    };
    Ok(options)
}

fn open(kind: EngineKind, path: &Path, pool: &Arc<BufferPool>) -> Result<Arc<dyn StorageEngine>> {
    open_engine(kind, path, &options(pool)?)
}

fn collect(engine: &dyn StorageEngine, table: TableId) -> Result<Vec<(RowRef, Vec<u8>)>> {
    let mut rows = Vec::new();
    engine.scan(table, &mut |row, data| {
        rows.push((row, data.to_vec()));
        Ok(ScanControl::Continue)
    })?;
    rows.sort();
    Ok(rows)
}

#[test]
fn crud_round_trip_on_every_engine() -> Result<()> {
    for kind in KINDS {
        let dir = tempdir()?;
        let pool = Arc::new(BufferPool::new());
        let engine = open(kind, &dir.path().join("data"), &pool)?;
        assert_eq!(engine.kind(), kind);
        let users = TableId(1);
        let orders = TableId(2);

        let alice = engine.insert(users, b"alice")?;
        let bob = engine.insert(users, b"bob")?;
        let order = engine.insert(orders, b"order-1")?;

        assert_eq!(engine.read(users, alice)?.as_deref(), Some(&b"alice"[..]));
        // References are scoped to their table.
        assert_eq!(engine.read(orders, alice)?, None);

        engine.update(users, bob, b"robert, now with a much longer row body")?;
        assert_eq!(
            engine.read(users, bob)?.as_deref(),
            Some(&b"robert, now with a much longer row body"[..])
        );
        engine.delete(users, alice)?;
        assert_eq!(engine.read(users, alice)?, None);
        assert!(matches!(engine.delete(users, alice), Err(SealError::NotFound)));
        assert!(matches!(
            engine.update(users, alice, b"ghost"),
            Err(SealError::NotFound)
        ));

        let users_rows = collect(&*engine, users)?;
        assert_eq!(users_rows.len(), 1, "{kind:?}");
        assert_eq!(users_rows[0].1, b"robert, now with a much longer row body".to_vec());
        assert_eq!(collect(&*engine, orders)?, vec![(order, b"order-1".to_vec())]);
        assert_eq!(pool.outstanding(), 0, "{kind:?} leaked scratch buffers");
    }
    Ok(())
}

#[test]
fn rows_survive_reopen() -> Result<()> {
    for kind in KINDS {
        let dir = tempdir()?;
        let path = dir.path().join("data");
        let pool = Arc::new(BufferPool::new());
        let t = TableId(3);
        let refs = {
            let engine = open(kind, &path, &pool)?;
            let refs = (0..50u8)
                .map(|i| engine.insert(t, &[i; 40]))
                .collect::<Result<Vec<_>>>()?;
            engine.update(t, refs[10], &[0xAA; 60])?;
            engine.delete(t, refs[20])?;
            engine.checkpoint()?;
            refs
        };
        let engine = open(kind, &path, &pool)?;
        assert_eq!(engine.read(t, refs[0])?, Some(vec![0u8; 40]), "{kind:?}");
        assert_eq!(engine.read(t, refs[10])?, Some(vec![0xAA; 60]), "{kind:?}");
        assert_eq!(engine.read(t, refs[20])?, None, "{kind:?}");
        assert_eq!(collect(&*engine, t)?.len(), 49, "{kind:?}");
    }
    Ok(())
}

#[test]
fn scan_stops_when_asked() -> Result<()> {
    for kind in KINDS {
        let dir = tempdir()?;
        let pool = Arc::new(BufferPool::new());
        let engine = open(kind, &dir.path().join("data"), &pool)?;
        for i in 0..10u8 {
            engine.insert(TableId(1), &[i])?;
        }
        let mut seen = 0;
        engine.scan(TableId(1), &mut |_, _| {
            seen += 1;
            Ok(if seen == 3 {
                ScanControl::Stop
            } else {
                ScanControl::Continue
            })
        })?;
        assert_eq!(seen, 3, "{kind:?}");
    }
    Ok(())
}

#[test]
fn oversized_rows_are_rejected_by_page_engines() -> Result<()> {
    for kind in [EngineKind::Paged, EngineKind::Hybrid] {
        let dir = tempdir()?;
        let pool = Arc::new(BufferPool::new());
        let engine = open(kind, &dir.path().join("data"), &pool)?;
        assert!(matches!(
            engine.insert(TableId(1), &[0u8; 2048]),
            Err(SealError::CapacityExceeded(_))
        ));
    }
    Ok(())
}

#[test]
fn wrong_key_is_detected() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("data");
    let pool = Arc::new(BufferPool::new());
    let row = {
        let engine = open(EngineKind::Paged, &path, &pool)?;
        let row = engine.insert(TableId(1), b"secret")?;
        engine.checkpoint()?;
        row
    };
    let cipher = Arc::new(PageCipher::new(&CipherKey::from_bytes(&[9u8; 32])?));
    let mut other = EngineOptions::new(cipher, Arc::clone(&pool));
    other.pager = options(&pool)?.pager;
    let outcome = open_engine(EngineKind::Paged, &path, &other)
        .and_then(|engine| engine.read(TableId(1), row));
    assert!(matches!(outcome, Err(err) if err.is_corruption()));
    Ok(())
}
