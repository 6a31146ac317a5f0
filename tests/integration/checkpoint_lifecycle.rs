#![allow(missing_docs)]

use tempfile::tempdir;
use umbra::storage::{
    ArrayStore, BlobCatalog, Checkpointer, PageAllocator, StorageManager, StorageOptions, TxnKind,
};
use umbra::types::{PageRange, Result, UmbraError};

#[test]
fn committed_view_changes_only_at_checkpoint() -> Result<()> {
    let dir = tempdir()?;
    let storage = StorageManager::open(dir.path().join("iso.db"), StorageOptions::default())?;
    let catalog = BlobCatalog::default();
    let store = ArrayStore::new(true);
    let checkpointer = Checkpointer::new(&storage, &catalog, &store);

    let (_, array) = store.create_array::<u64>(&storage)?;
    let previous = array.resize(storage.allocator(), TxnKind::Write, 10_000, 0)?;
    assert_eq!(previous, 0);
    assert_eq!(array.num_elements(TxnKind::ReadOnly), 0);
    assert!(matches!(
        array.get(0, TxnKind::ReadOnly),
        Err(UmbraError::OutOfBounds { idx: 0, len: 0 })
    ));
    checkpointer.write_checkpoint()?;
    assert_eq!(array.num_elements(TxnKind::ReadOnly), 10_000);

    array.update(TxnKind::Write, 9999, 42)?;
    assert_eq!(array.get(9999, TxnKind::Write)?, 42);
    assert_eq!(array.get(9999, TxnKind::ReadOnly)?, 0);

    let report = checkpointer.write_checkpoint()?;
    assert!(report.storage_changed);
    assert!(report.shadow_pages_applied >= 2);
    assert_eq!(array.get(9999, TxnKind::ReadOnly)?, 42);
    assert_eq!(storage.pool().pinned_pages(), 0);
    Ok(())
}

#[test]
fn rollback_restores_committed_values() -> Result<()> {
    let dir = tempdir()?;
    let storage = StorageManager::open(dir.path().join("rb.db"), StorageOptions::default())?;
    let catalog = BlobCatalog::default();
    let store = ArrayStore::new(true);
    let checkpointer = Checkpointer::new(&storage, &catalog, &store);
    let (_, array) = store.create_array::<u32>(&storage)?;
    array.resize(storage.allocator(), TxnKind::Write, 1500, 7)?;
    checkpointer.write_checkpoint()?;

    for idx in (0..1500).step_by(37) {
        array.update(TxnKind::Write, idx, idx as u32 * 3)?;
    }
    for _ in 0..2000 {
        array.push_back(storage.allocator(), TxnKind::Write, 1)?;
    }
    assert_eq!(array.num_elements(TxnKind::Write), 3500);
    checkpointer.rollback()?;

    assert_eq!(array.num_elements(TxnKind::ReadOnly), 1500);
    assert_eq!(array.num_elements(TxnKind::Write), 1500);
    for idx in 0..1500 {
        assert_eq!(array.get(idx, TxnKind::ReadOnly)?, 7);
        assert_eq!(array.get(idx, TxnKind::Write)?, 7);
    }

    array.update(TxnKind::Write, 3, 11)?;
    checkpointer.write_checkpoint()?;
    assert_eq!(array.get(3, TxnKind::ReadOnly)?, 11);
    assert_eq!(array.get(37, TxnKind::ReadOnly)?, 7);
    Ok(())
}

#[test]
fn catalog_and_arrays_persist_across_reopen() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("persist.db");
    {
        let storage = StorageManager::open(&path, StorageOptions::default())?;
        let catalog = BlobCatalog::default();
        let store = ArrayStore::new(true);
        catalog.set(b"tables: person".to_vec());
        let (_, ranges) = store.create_array::<PageRange>(&storage)?;
        let mut iter = ranges.iter_mut(storage.allocator())?;
        for i in 0..600u64 {
            iter.push_back(PageRange::new(umbra::types::PageId(i), i + 1))?;
        }
        drop(iter);
        Checkpointer::new(&storage, &catalog, &store).write_checkpoint()?;
    }

    let storage = StorageManager::open(&path, StorageOptions::default())?;
    let catalog = BlobCatalog::default();
    let store = ArrayStore::new(true);
    Checkpointer::new(&storage, &catalog, &store).read_checkpoint()?;
    assert_eq!(catalog.get(), b"tables: person".to_vec());
    let ranges = store.array::<PageRange>(&storage, 0)?;
    assert_eq!(ranges.num_elements(TxnKind::ReadOnly), 600);
    assert_eq!(
        ranges.get(599, TxnKind::ReadOnly)?,
        PageRange::new(umbra::types::PageId(599), 600)
    );
    Ok(())
}

#[test]
fn freed_pages_become_reusable_after_checkpoint() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("free.db");
    let storage = StorageManager::open(&path, StorageOptions::default())?;
    let catalog = BlobCatalog::default();
    let store = ArrayStore::new(true);
    let checkpointer = Checkpointer::new(&storage, &catalog, &store);

    let freed = storage.allocator().allocate_page_range(4)?;
    checkpointer.write_checkpoint()?;
    storage.allocator().free_page_range(freed);

    let during = storage.allocator().allocate_page_range(4)?;
    assert!(during.start.0 >= freed.end());
    let report = checkpointer.write_checkpoint()?;
    assert_eq!(report.pages_freed, 4 + 1);

    let after = storage.allocator().allocate_page_range(4)?;
    assert_eq!(after, freed);
    storage.allocator().free_page_range(after);
    checkpointer.write_checkpoint()?;
    drop(storage);

    let storage = StorageManager::open(&path, StorageOptions::default())?;
    assert!(storage.page_manager().free_entries().contains(&freed));
    Ok(())
}

#[test]
fn in_memory_and_read_only_checkpoints() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("modes.db");
    let catalog = BlobCatalog::default();
    let store = ArrayStore::new(true);

    let mem = StorageManager::open(
        &path,
        StorageOptions {
            in_memory: true,
            ..StorageOptions::default()
        },
    )?;
    let report = Checkpointer::new(&mem, &catalog, &store).write_checkpoint()?;
    assert!(!report.storage_changed && !report.catalog_written);
    assert!(!path.exists());
    drop(mem);

    drop(StorageManager::open(&path, StorageOptions::default())?);
    let ro = StorageManager::open(
        &path,
        StorageOptions {
            read_only: true,
            ..StorageOptions::default()
        },
    )?;
    let err = Checkpointer::new(&ro, &catalog, &store)
        .write_checkpoint()
        .unwrap_err();
    assert!(matches!(err, UmbraError::ReadOnly(_)));
    Ok(())
}
