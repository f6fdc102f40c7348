#![allow(missing_docs)]

use std::collections::BTreeSet;
use std::sync::Arc;

use sealdb::primitives::crypto::{BufferPool, CipherKey, PageCipher};
use sealdb::primitives::pager::PagerOptions;
use sealdb::storage::{EngineOptions, PagedEngine, StorageEngine};
use sealdb::types::{PageId, Result, RowRef, TableId};
use tempfile::tempdir;

fn options() -> Result<EngineOptions> {
    let cipher = Arc::new(PageCipher::new(&CipherKey::from_bytes(&[1u8; 32])?));
    let mut options = EngineOptions::new(cipher, Arc::new(BufferPool::new()));
    options.pager = PagerOptions {
        page_size: 1024,
        cache_capacity: 16,
    };
    Ok(options)
}

fn pages_of(refs: &[RowRef]) -> BTreeSet<PageId> {
    refs.iter()
        .filter_map(|row| match row {
            RowRef::Slot { page, .. } => Some(*page),
            _ => None,
        })
        .collect()
}

#[test]
fn delete_and_reinsert_reuses_pages() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("rows.pages");
    let engine = PagedEngine::open(&path, &options()?)?;
    let t = TableId(1);
    const N: usize = 300;

    let first = (0..N)
        .map(|i| engine.insert(t, &[(i % 251) as u8; 100]))
        .collect::<Result<Vec<_>>>()?;
    engine.checkpoint()?;
    let size_after_insert = std::fs::metadata(&path)?.len();
    let pages_first = pages_of(&first);
    assert!(pages_first.len() > 16, "rows should spill past the cache");

    for row in &first {
        engine.delete(t, *row)?;
    }
    engine.checkpoint()?;
    let stats = engine.pager_stats();
    assert_eq!(stats.free_pages as usize, pages_first.len());
    assert_eq!(std::fs::metadata(&path)?.len(), size_after_insert);

    let second = (0..N)
        .map(|i| engine.insert(t, &[(i % 251) as u8; 100]))
        .collect::<Result<Vec<_>>>()?;
    engine.checkpoint()?;
    assert_eq!(std::fs::metadata(&path)?.len(), size_after_insert);
    assert_eq!(pages_of(&second), pages_first);
    assert_eq!(engine.pager_stats().free_pages, 0);
    Ok(())
}

#[test]
fn free_list_survives_reopen() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("rows.pages");
    let t = TableId(1);
    let freed = {
        let engine = PagedEngine::open(&path, &options()?)?;
        let rows = (0..40u8)
            .map(|i| engine.insert(t, &[i; 200]))
            .collect::<Result<Vec<_>>>()?;
        for row in &rows[..20] {
            engine.delete(t, *row)?;
        }
        engine.checkpoint()?;
        engine.pager_stats().free_pages
    };
    assert!(freed > 0);
    let size = std::fs::metadata(&path)?.len();

    let engine = PagedEngine::open(&path, &options()?)?;
    assert_eq!(engine.pager_stats().free_pages, freed);
    for i in 0..20u8 {
        engine.insert(t, &[i; 200])?;
    }
    engine.checkpoint()?;
    assert_eq!(std::fs::metadata(&path)?.len(), size);
    Ok(())
}

#[test]
fn cache_stays_within_capacity() -> Result<()> {
    let dir = tempdir()?;
    let engine = PagedEngine::open(&dir.path().join("rows.pages"), &options()?)?;
    for i in 0..500u32 {
        engine.insert(TableId(1), &i.to_be_bytes().repeat(25))?;
        assert!(engine.pager_stats().resident_pages <= 16);
    }
    let stats = engine.pager_stats();
    assert!(stats.evictions > 0);
    assert!(stats.dirty_writebacks > 0);
    Ok(())
}
