//! Integration tests for the content-addressed artifact store

use super::test_utils::png_header;
use atelier::error::StorageError;
use atelier::{ArtifactRef, ArtifactStore, ImageFormat, MediaDescriptor, TaskId};
use std::sync::Arc;
use tempfile::TempDir;

fn open_store(dir: &TempDir) -> (sled::Db, ArtifactStore) {
    let db = sled::open(dir.path().join("db")).unwrap();
    let store = ArtifactStore::open(dir.path().join("artifacts"), &db).unwrap();
    (db, store)
}

fn object_files(store: &ArtifactStore) -> usize {
    let objects = store.root().join("objects");
    std::fs::read_dir(objects)
        .unwrap()
        .map(|shard| std::fs::read_dir(shard.unwrap().path()).unwrap().count())
        .sum()
}

#[test]
fn test_put_is_idempotent_on_identical_bytes() {
    let dir = TempDir::new().unwrap();
    let (_db, store) = open_store(&dir);
    let bytes = png_header(64, 32, b"pixels");
    let first_task = TaskId::new();

    let a = store
        .put(&bytes, MediaDescriptor::default(), Some(first_task))
        .unwrap();
    let b = store
        .put(&bytes, MediaDescriptor::default(), Some(TaskId::new()))
        .unwrap();

    assert_eq!(a, b);
    assert_eq!(a, ArtifactRef::for_bytes(&bytes));
    assert_eq!(store.len(), 1);
    assert_eq!(object_files(&store), 1);

    let record = store.describe(&a).unwrap().unwrap();
    assert_eq!(record.origin_task, Some(first_task));
    assert_eq!(record.descriptor.format, ImageFormat::Png);
    assert_eq!(record.descriptor.dimensions(), Some((64, 32)));
    assert_eq!(store.get(&a).unwrap(), bytes);
}

#[test]
fn test_concurrent_identical_puts_leave_one_file() {
    let dir = TempDir::new().unwrap();
    let (_db, store) = open_store(&dir);
    let store = Arc::new(store);
    let bytes = Arc::new(b"the same bytes from many writers".to_vec());

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let store = Arc::clone(&store);
            let bytes = Arc::clone(&bytes);
            std::thread::spawn(move || {
                store
                    .put(&bytes, MediaDescriptor::default(), None)
                    .unwrap()
            })
        })
        .collect();
    let refs: Vec<ArtifactRef> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert!(refs.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(object_files(&store), 1);
    let staging = std::fs::read_dir(store.root().join("staging")).unwrap().count();
    assert_eq!(staging, 0);
}

#[test]
fn test_purged_artifact_reports_not_found() {
    let dir = TempDir::new().unwrap();
    let (_db, store) = open_store(&dir);
    let artifact = store
        .put(b"short lived", MediaDescriptor::default(), None)
        .unwrap();

    assert!(store.purge(&artifact).unwrap());
    assert!(!store.purge(&artifact).unwrap());
    assert!(!store.exists(&artifact));
    assert!(matches!(
        store.get(&artifact),
        Err(StorageError::ArtifactNotFound(missing)) if missing == artifact
    ));
}

#[test]
fn test_corrupted_object_fails_verification() {
    let dir = TempDir::new().unwrap();
    let (_db, store) = open_store(&dir);
    let artifact = store
        .put(b"original bytes", MediaDescriptor::default(), None)
        .unwrap();

    std::fs::write(store.object_path(&artifact), b"tampered").unwrap();
    assert!(matches!(
        store.get(&artifact),
        Err(StorageError::HashMismatch { .. })
    ));
}

#[test]
fn test_artifacts_survive_reopen() {
    let dir = TempDir::new().unwrap();
    let artifact = {
        let (_db, store) = open_store(&dir);
        store
            .put(b"persistent", MediaDescriptor::default(), None)
            .unwrap()
    };

    let (_db, store) = open_store(&dir);
    assert_eq!(store.get(&artifact).unwrap(), b"persistent");
    assert!(store.describe(&artifact).unwrap().is_some());
}
