#![allow(missing_docs)]

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{abort, Command};

use tempfile::tempdir;
use umbra::primitives::wal::wal_path_for;
use umbra::storage::shadow::shadow_path_for;
use umbra::storage::{
    ArrayStore, BlobCatalog, Checkpointer, StorageManager, StorageOptions, TxnKind,
};
use umbra::types::{Result, UmbraError};

const CRASH_ENV: &str = "UMBRA_CRASH_DB_PATH";

/// Creates a database holding one array of 3000 elements set to 1.
fn seed(path: &Path) -> Result<()> {
    let storage = StorageManager::open(path, StorageOptions::default())?;
    let catalog = BlobCatalog::default();
    let store = ArrayStore::new(true);
    let (_, array) = store.create_array::<u64>(&storage)?;
    array.resize(storage.allocator(), TxnKind::Write, 3000, 1)?;
    Checkpointer::new(&storage, &catalog, &store).write_checkpoint()?;
    Ok(())
}

/// Runs a checkpoint that sets element 5 to 99 up to, and optionally
/// including, the CHECKPOINT record, then returns without applying.
fn checkpoint_until_marker(path: &Path, log_marker: bool) -> Result<()> {
    let storage = StorageManager::open(path, StorageOptions::default())?;
    let catalog = BlobCatalog::default();
    let store = ArrayStore::new(true);
    let checkpointer = Checkpointer::new(&storage, &catalog, &store);
    checkpointer.read_checkpoint()?;
    store.array::<u64>(&storage, 0)?.update(TxnKind::Write, 5, 99)?;

    let changed = checkpointer.checkpoint_storage()?;
    let mut header = storage.database_header();
    checkpointer.serialize_catalog_and_metadata(&mut header, changed)?;
    checkpointer.write_database_header(&header)?;
    storage.data_fh().flush_dirty_pages()?;
    storage.shadow().flush_all(header.database_id)?;
    if log_marker {
        storage.wal().log_and_flush_checkpoint()?;
    }
    Ok(())
}

fn element_five(path: &Path) -> Result<u64> {
    let storage = StorageManager::open(path, StorageOptions::default())?;
    let catalog = BlobCatalog::default();
    let store = ArrayStore::new(true);
    Checkpointer::new(&storage, &catalog, &store).read_checkpoint()?;
    let value = store.array::<u64>(&storage, 0)?.get(5, TxnKind::ReadOnly)?;
    Ok(value)
}

#[test]
fn kill_after_checkpoint_record_replays_shadow_pages() -> Result<()> {
    let dir = tempdir()?;
    let db_path = dir.path().join("crash-harness.db");
    seed(&db_path)?;

    // The child stops the process right after the CHECKPOINT record is durable.
    let child_status = Command::new(std::env::current_exe()?)
        .env(CRASH_ENV, &db_path)
        .arg("--nocapture")
        .arg("--ignored")
        .arg("--exact")
        .arg("crash_child_abort_after_marker")
        .status()
        .expect("spawn child");
    assert!(!child_status.success(), "child should abort");
    assert!(shadow_path_for(&db_path).exists());
    assert!(wal_path_for(&db_path).exists());

    let storage = StorageManager::open(&db_path, StorageOptions::default())?;
    let recovery = storage.recovery();
    assert!(recovery.replayed_pages > 0);
    assert!(recovery.wal_removed);
    assert!(!shadow_path_for(&db_path).exists());
    assert!(!wal_path_for(&db_path).exists());
    drop(storage);
    assert_eq!(element_five(&db_path)?, 99);
    Ok(())
}

#[test]
#[ignore]
fn crash_child_abort_after_marker() -> Result<()> {
    let path = std::env::var(CRASH_ENV).expect("missing UMBRA_CRASH_DB_PATH");
    checkpoint_until_marker(&PathBuf::from(path), true)?;
    abort();
}

#[test]
fn crash_before_checkpoint_record_discards_shadow_file() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("torn.db");
    seed(&path)?;
    let before = fs::read(&path)?;
    checkpoint_until_marker(&path, false)?;
    assert!(shadow_path_for(&path).exists());
    assert_eq!(fs::read(&path)?.len(), before.len());

    let storage = StorageManager::open(&path, StorageOptions::default())?;
    assert!(storage.recovery().discarded_shadow);
    assert_eq!(storage.recovery().replayed_pages, 0);
    drop(storage);
    assert_eq!(fs::read(&path)?[..before.len()], before[..]);
    assert_eq!(element_five(&path)?, 1);
    Ok(())
}

#[test]
fn wal_without_checkpoint_record_is_left_in_place() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("opaque.db");
    seed(&path)?;
    {
        let storage = StorageManager::open(&path, StorageOptions::default())?;
        storage.wal().log_record(b"insert 1")?;
        storage.wal().sync()?;
    }
    let storage = StorageManager::open(&path, StorageOptions::default())?;
    assert!(!storage.recovery().wal_removed);
    assert!(wal_path_for(&path).exists());
    assert_eq!(storage.wal().records()?.len(), 1);
    Ok(())
}

#[test]
fn replay_is_idempotent() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("twice.db");
    seed(&path)?;
    checkpoint_until_marker(&path, true)?;
    let vfs = umbra::primitives::io::StdVfs;
    umbra::storage::shadow::ShadowFile::replay_shadow_page_records(&vfs, &path, false)?;
    let once = fs::read(&path)?;
    umbra::storage::shadow::ShadowFile::replay_shadow_page_records(&vfs, &path, false)?;
    assert_eq!(fs::read(&path)?, once);
    Ok(())
}

#[test]
fn torn_header_is_restored_from_its_shadow_copy() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("torn.db");
    seed(&path)?;
    checkpoint_until_marker(&path, true)?;

    let mut bytes = fs::read(&path)?;
    for b in &mut bytes[64..128] {
        *b ^= 0xff;
    }
    fs::write(&path, &bytes)?;

    let storage = StorageManager::open(&path, StorageOptions::default())?;
    assert!(storage.recovery().replayed_pages > 0);
    assert!(!shadow_path_for(&path).exists());
    drop(storage);
    assert_eq!(element_five(&path)?, 99);
    Ok(())
}

#[test]
fn foreign_shadow_file_is_rejected() -> Result<()> {
    let dir = tempdir()?;
    let ours = dir.path().join("ours.db");
    let theirs = dir.path().join("theirs.db");
    seed(&ours)?;
    seed(&theirs)?;
    checkpoint_until_marker(&theirs, true)?;
    fs::copy(shadow_path_for(&theirs), shadow_path_for(&ours))?;
    fs::copy(wal_path_for(&theirs), wal_path_for(&ours))?;

    match StorageManager::open(&ours, StorageOptions::default()) {
        Err(UmbraError::DatabaseIdMismatch { .. }) => {}
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("foreign shadow file was accepted"),
    }

    let lenient = StorageOptions {
        throw_on_wal_replay_failure: false,
        ..StorageOptions::default()
    };
    let storage = StorageManager::open(&ours, lenient)?;
    assert!(storage.recovery().discarded_shadow);
    assert!(!shadow_path_for(&ours).exists());
    drop(storage);
    assert_eq!(element_five(&ours)?, 1);
    Ok(())
}

#[test]
fn read_only_open_refuses_pending_replay() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("ro.db");
    seed(&path)?;
    checkpoint_until_marker(&path, true)?;
    let options = StorageOptions {
        read_only: true,
        ..StorageOptions::default()
    };
    assert!(matches!(
        StorageManager::open(&path, options),
        Err(UmbraError::ReadOnly(_))
    ));
    assert!(shadow_path_for(&path).exists());
    Ok(())
}
