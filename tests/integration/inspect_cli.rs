#![allow(missing_docs)]

use assert_cmd::cargo::cargo_bin_cmd;
use serde_json::Value;
use tempfile::TempDir;
use umbra::storage::{ArrayStore, BlobCatalog, Checkpointer, StorageManager, StorageOptions, TxnKind};

fn seed_db() -> (TempDir, std::path::PathBuf) {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("inspect.db");
    let storage = StorageManager::open(&path, StorageOptions::default()).expect("open");
    let catalog = BlobCatalog::default();
    let store = ArrayStore::new(true);
    let (_, array) = store.create_array::<u32>(&storage).expect("array");
    array
        .resize(storage.allocator(), TxnKind::Write, 5000, 9)
        .expect("resize");
    catalog.set(b"demo".to_vec());
    Checkpointer::new(&storage, &catalog, &store)
        .write_checkpoint()
        .expect("checkpoint");
    (dir, path)
}

#[test]
fn inspect_json_reports_header_and_files() {
    let (_dir, db_path) = seed_db();
    let output = cargo_bin_cmd!("umbra-inspect")
        .arg(&db_path)
        .arg("--json")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let report: Value = serde_json::from_slice(&output).expect("json output");
    assert_eq!(report["header"]["storage_version"], 1);
    assert!(report["header"]["catalog_range"]["num_pages"].as_u64().unwrap() >= 1);
    assert_eq!(report["shadow"]["file"]["exists"], false);
    assert_eq!(report["wal"]["num_records"], 0);
    assert!(report["data"]["num_pages"].as_u64().unwrap() > 1);
}

#[test]
fn inspect_text_lists_sections() {
    let (_dir, db_path) = seed_db();
    let output = cargo_bin_cmd!("umbra-inspect")
        .arg(&db_path)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8(output).expect("utf8");
    assert!(text.contains("Header"));
    assert!(text.contains("Free Space"));
}

#[test]
fn inspect_missing_database_fails() {
    let dir = TempDir::new().expect("tempdir");
    cargo_bin_cmd!("umbra-inspect")
        .arg(dir.path().join("missing.db"))
        .assert()
        .failure();
}
