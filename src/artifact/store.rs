//! Filesystem-backed artifact storage with a sled index.

use crate::artifact::media::MediaDescriptor;
use crate::error::StorageError;
use crate::types::{ArtifactRef, TaskId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

const TREE_ARTIFACT_INDEX: &str = "artifact_index";

/// Index entry describing a stored artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub artifact: ArtifactRef,
    pub size: u64,
    pub descriptor: MediaDescriptor,
    /// Task whose result first produced these bytes. `None` for imported images.
    pub origin_task: Option<TaskId>,
    pub stored_at: DateTime<Utc>,
}

/// Content-addressed artifact storage
///
/// Layout under the root directory:
/// - `objects/{hex[0..2]}/{hex}` holds the artifact bytes
/// - `staging/{hex}.{uuid}.tmp` holds in-progress writes
///
/// Writes go to a uniquely named staging file which is then renamed into place,
/// so concurrent writers of the same bytes cannot observe a partial file. The
/// index keeps the record from the first writer.
#[derive(Clone)]
pub struct ArtifactStore {
    root: PathBuf,
    index: Tree,
}

impl ArtifactStore {
    /// Open the store at `root`, indexing into the shared database.
    pub fn open<P: AsRef<Path>>(root: P, db: &Db) -> Result<Self, StorageError> {
        let root = root.as_ref().to_path_buf();
        for dir in [root.join("objects"), root.join("staging")] {
            fs::create_dir_all(&dir).map_err(|e| {
                io::Error::new(
                    e.kind(),
                    format!("Failed to create artifact directory at {:?}: {}", dir, e),
                )
            })?;
        }
        let index = db.open_tree(TREE_ARTIFACT_INDEX)?;
        Ok(Self { root, index })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Store bytes and return their reference.
    ///
    /// Idempotent: storing bytes that are already present returns the same
    /// reference without writing a second file or touching the index entry.
    /// An existing object that no longer matches its hash is rewritten.
    pub fn put(
        &self,
        bytes: &[u8],
        descriptor: MediaDescriptor,
        origin_task: Option<TaskId>,
    ) -> Result<ArtifactRef, StorageError> {
        let artifact = ArtifactRef::for_bytes(bytes);
        let object_path = self.object_path(&artifact);

        match self.stored_hash(&object_path)? {
            None => {
                self.write_object(&artifact, &object_path, bytes)?;
                debug!(artifact = %artifact.short(), size = bytes.len(), "Stored artifact");
            }
            Some(actual) if actual == artifact => {
                debug!(artifact = %artifact.short(), "Artifact already present");
            }
            Some(actual) => {
                warn!(
                    expected = %artifact,
                    actual = %actual,
                    path = %object_path.display(),
                    "Rewriting corrupted artifact"
                );
                self.write_object(&artifact, &object_path, bytes)?;
            }
        }

        let record = ArtifactRecord {
            artifact,
            size: bytes.len() as u64,
            descriptor: descriptor.completed_from(bytes),
            origin_task,
            stored_at: Utc::now(),
        };
        let value = serde_json::to_vec(&record)?;
        // First writer wins; a concurrent put of the same bytes leaves the
        // existing record untouched.
        let _ = self
            .index
            .compare_and_swap(artifact.hash(), None as Option<&[u8]>, Some(value))?;
        self.index.flush()?;

        Ok(artifact)
    }

    /// Read an artifact, verifying its content against the hash.
    pub fn get(&self, artifact: &ArtifactRef) -> Result<Vec<u8>, StorageError> {
        let object_path = self.object_path(artifact);
        let bytes = match fs::read(&object_path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StorageError::ArtifactNotFound(*artifact));
            }
            Err(e) => return Err(e.into()),
        };

        let actual = ArtifactRef::for_bytes(&bytes);
        if actual != *artifact {
            warn!(
                expected = %artifact,
                actual = %actual,
                path = %object_path.display(),
                "Artifact content does not match its hash"
            );
            return Err(StorageError::HashMismatch {
                expected: *artifact,
                actual,
            });
        }

        Ok(bytes)
    }

    /// Index record for an artifact, if indexed.
    pub fn describe(&self, artifact: &ArtifactRef) -> Result<Option<ArtifactRecord>, StorageError> {
        let Some(raw) = self.index.get(artifact.hash())? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_slice(&raw)?))
    }

    pub fn exists(&self, artifact: &ArtifactRef) -> bool {
        self.object_path(artifact).exists()
    }

    /// Remove the backing file and index entry. Returns whether anything was removed.
    pub fn purge(&self, artifact: &ArtifactRef) -> Result<bool, StorageError> {
        let object_path = self.object_path(artifact);
        let file_removed = match fs::remove_file(&object_path) {
            Ok(()) => true,
            Err(e) if e.kind() == io::ErrorKind::NotFound => false,
            Err(e) => return Err(e.into()),
        };
        let index_removed = self.index.remove(artifact.hash())?.is_some();
        self.index.flush()?;

        if file_removed || index_removed {
            debug!(artifact = %artifact.short(), "Purged artifact");
        }
        Ok(file_removed || index_removed)
    }

    /// Number of indexed artifacts.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Path of the object file for an artifact: `objects/{hex[0..2]}/{hex}`.
    pub fn object_path(&self, artifact: &ArtifactRef) -> PathBuf {
        let hex = artifact.to_hex();
        self.root.join("objects").join(&hex[0..2]).join(hex)
    }

    /// Hash of the bytes currently at `object_path`, if the file exists.
    fn stored_hash(&self, object_path: &Path) -> Result<Option<ArtifactRef>, StorageError> {
        match fs::read(object_path) {
            Ok(existing) => Ok(Some(ArtifactRef::for_bytes(&existing))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write_object(
        &self,
        artifact: &ArtifactRef,
        object_path: &Path,
        bytes: &[u8],
    ) -> Result<(), StorageError> {
        if let Some(parent) = object_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let staging_path = self
            .root
            .join("staging")
            .join(format!("{}.{}.tmp", artifact.to_hex(), Uuid::new_v4()));

        let write = || -> io::Result<()> {
            let mut file = fs::File::create(&staging_path)?;
            file.write_all(bytes)?;
            file.sync_all()?;
            fs::rename(&staging_path, object_path)
        };

        write().map_err(|e| {
            let _ = fs::remove_file(&staging_path);
            StorageError::Io(io::Error::new(
                e.kind(),
                format!("Failed to write artifact to {:?}: {}", object_path, e),
            ))
        })
    }
}
