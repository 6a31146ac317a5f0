#![allow(missing_docs)]

use std::fs::{self, OpenOptions};
use std::io::Write;

use tempfile::tempdir;
use umbra::storage::{StorageManager, StorageOptions};
use umbra::types::{Result, UmbraError, PAGE_SIZE};

fn overwrite(path: &std::path::Path, offset: usize, bytes: &[u8]) -> Result<()> {
    let mut data = fs::read(path)?;
    data[offset..offset + bytes.len()].copy_from_slice(bytes);
    fs::write(path, data)?;
    Ok(())
}

#[test]
fn empty_file_becomes_a_new_database() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("empty.db");
    fs::File::create(&path)?;
    let storage = StorageManager::open(&path, StorageOptions::default())?;
    assert!(storage.database_header().metadata_range.is_none());
    assert_eq!(fs::metadata(&path)?.len(), PAGE_SIZE as u64);
    Ok(())
}

#[test]
fn foreign_file_is_wrong_file() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("foreign.db");
    drop(StorageManager::open(&path, StorageOptions::default())?);
    overwrite(&path, 0, &[0xff; 16])?;
    assert!(matches!(
        StorageManager::open(&path, StorageOptions::default()),
        Err(UmbraError::WrongFile(_))
    ));
    Ok(())
}

#[test]
fn flipped_checksum_is_corruption() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("crc.db");
    drop(StorageManager::open(&path, StorageOptions::default())?);
    let data = fs::read(&path)?;
    let last = data[PAGE_SIZE - 1];
    overwrite(&path, PAGE_SIZE - 1, &[last ^ 0x01])?;
    assert!(matches!(
        StorageManager::open(&path, StorageOptions::default()),
        Err(UmbraError::Corruption(_))
    ));
    Ok(())
}

#[test]
fn truncated_header_page_is_corruption() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("short.db");
    let mut file = OpenOptions::new().create(true).truncate(true).write(true).open(&path)?;
    file.write_all(&[7u8; 100])?;
    drop(file);
    assert!(matches!(
        StorageManager::open(&path, StorageOptions::default()),
        Err(UmbraError::Corruption(_))
    ));
    Ok(())
}
