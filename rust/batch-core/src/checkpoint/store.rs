// rust/batch-core/src/checkpoint/store.rs

//! Checkpoint stores.
//!
//! A store persists [`CheckpointRecord`]s under opaque handles and can name
//! the newest one. [`FileCheckpointStore`] works on any storage backend:
//! over [`LocalStorage`](crate::storage::LocalStorage) it is the shared-fs
//! store, over [`MemoryStorage`](crate::storage::MemoryStorage) the
//! in-memory one.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use super::format::{decode_record, encode_record, CheckpointRecord, Compression};
use crate::config::{CheckpointConfig, StorageConfig};
use crate::error::{BatchError, Result};
use crate::storage::{self, StorageBackend};

const FILE_PREFIX: &str = "ckpt-";
const FILE_SUFFIX: &str = ".ckpt";
const TEMP_SUFFIX: &str = ".tmp";

/// Opaque name of a stored record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CheckpointHandle(String);

impl CheckpointHandle {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CheckpointHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub trait CheckpointStore: Send {
    /// Persists `record` under a fresh handle.
    fn save(&self, record: &CheckpointRecord) -> Result<CheckpointHandle>;

    fn load(&self, handle: &CheckpointHandle) -> Result<CheckpointRecord>;

    /// Handle of the most recently saved record, if any.
    fn latest(&self) -> Result<Option<CheckpointHandle>>;
}

pub struct FileCheckpointStore {
    storage: Arc<dyn StorageBackend>,
    dir: PathBuf,
    compression: Compression,
    keep_last_n: usize,
    atomic_writes: bool,
    next_seq: AtomicU64,
}

impl FileCheckpointStore {
    pub fn new(storage: Arc<dyn StorageBackend>, config: &CheckpointConfig) -> Result<Self> {
        let compression = Compression::from_config(&config.compression, config.compression_level)?;
        let dir = config.checkpoint_dir.clone();
        sweep_temp_files(&*storage, &dir)?;

        // Continue numbering after records left by earlier attempts
        let next_seq = list_records(&*storage, &dir)?
            .last()
            .and_then(|name| parse_seq(name))
            .map_or(0, |seq| seq + 1);

        Ok(Self {
            storage,
            dir,
            compression,
            keep_last_n: config.keep_last_n.max(1),
            atomic_writes: config.atomic_writes,
            next_seq: AtomicU64::new(next_seq),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_name(seq: u64) -> String {
        format!(
            "{FILE_PREFIX}{seq:010}-{}{FILE_SUFFIX}",
            chrono::Utc::now().timestamp_millis()
        )
    }

    fn cleanup(&self) -> Result<()> {
        let records = list_records(&*self.storage, &self.dir)?;
        let excess = records.len().saturating_sub(self.keep_last_n);
        for name in &records[..excess] {
            debug!(record = %name, "removing old progress record");
            if let Err(e) = self.storage.delete(&self.dir.join(name)) {
                warn!(record = %name, error = %e, "failed to remove old progress record");
            }
        }
        Ok(())
    }
}

fn list_records(storage: &dyn StorageBackend, dir: &Path) -> Result<Vec<String>> {
    let mut names: Vec<String> = storage
        .list(dir)?
        .into_iter()
        .filter(|n| n.starts_with(FILE_PREFIX) && n.ends_with(FILE_SUFFIX))
        .collect();
    names.sort();
    Ok(names)
}

/// Removes temp files from writes that never reached their rename.
///
/// Runs before the first save, while no other writer is active.
fn sweep_temp_files(storage: &dyn StorageBackend, dir: &Path) -> Result<()> {
    let stale = storage.list(dir)?.into_iter().filter(|n| {
        n.strip_prefix('.')
            .is_some_and(|rest| rest.starts_with(FILE_PREFIX) && rest.ends_with(TEMP_SUFFIX))
    });
    for name in stale {
        warn!(file = %name, "removing incomplete progress record");
        storage.delete(&dir.join(name))?;
    }
    Ok(())
}

fn parse_seq(name: &str) -> Option<u64> {
    name.strip_prefix(FILE_PREFIX)?.split('-').next()?.parse().ok()
}

impl CheckpointStore for FileCheckpointStore {
    fn save(&self, record: &CheckpointRecord) -> Result<CheckpointHandle> {
        self.storage.create_dir_all(&self.dir)?;
        let bytes = encode_record(record, self.compression)?;

        let name = Self::file_name(self.next_seq.fetch_add(1, Ordering::SeqCst));
        let path = self.dir.join(&name);
        if self.atomic_writes {
            let temp = self.dir.join(format!(".{name}{TEMP_SUFFIX}"));
            storage::write_all(&*self.storage, &temp, &bytes)?;
            self.storage.rename(&temp, &path)?;
        } else {
            storage::write_all(&*self.storage, &path, &bytes)?;
        }

        self.cleanup()?;
        Ok(CheckpointHandle(name))
    }

    fn load(&self, handle: &CheckpointHandle) -> Result<CheckpointRecord> {
        let name = handle.as_str();
        if name.is_empty() || name.contains(['/', '\\']) {
            return Err(BatchError::checkpoint(format!(
                "invalid checkpoint handle '{name}'"
            )));
        }
        let path = self.dir.join(name);
        if !self.storage.exists(&path)? {
            return Err(BatchError::checkpoint(format!(
                "checkpoint '{name}' not found in {}",
                self.dir.display()
            )));
        }
        let bytes = storage::read_all(&*self.storage, &path)?;
        decode_record(&bytes)
    }

    fn latest(&self) -> Result<Option<CheckpointHandle>> {
        Ok(list_records(&*self.storage, &self.dir)?
            .pop()
            .map(CheckpointHandle))
    }
}

/// Resolves the store for the configured backend.
///
/// # Errors
///
/// Returns `UnsupportedBackend` for object-store backends.
pub fn open_store(
    storage: &StorageConfig,
    checkpoint: &CheckpointConfig,
) -> Result<FileCheckpointStore> {
    FileCheckpointStore::new(storage::open_storage(storage)?, checkpoint)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageBackendType;
    use crate::storage::{LocalStorage, MemoryStorage};
    use tempfile::TempDir;
    use uuid::Uuid;

    fn memory_store(keep_last_n: usize) -> (FileCheckpointStore, MemoryStorage) {
        let storage = MemoryStorage::new();
        let config = CheckpointConfig {
            keep_last_n,
            ..Default::default()
        };
        (
            FileCheckpointStore::new(Arc::new(storage.clone()), &config).unwrap(),
            storage,
        )
    }

    #[test]
    fn test_save_load_latest() {
        let (store, _) = memory_store(3);
        let uuid = Uuid::new_v4();
        assert!(store.latest().unwrap().is_none());

        let first = store.save(&CheckpointRecord::new(2, uuid)).unwrap();
        let second = store.save(&CheckpointRecord::new(4, uuid)).unwrap();

        assert!(first < second);
        assert_eq!(store.latest().unwrap(), Some(second.clone()));
        assert_eq!(store.load(&first).unwrap().steps_completed, 2);
        assert_eq!(store.load(&second).unwrap().run_uuid, uuid);
    }

    #[test]
    fn test_keep_last_n() {
        let (store, storage) = memory_store(2);
        let uuid = Uuid::new_v4();
        let handles: Vec<_> = (0..5)
            .map(|i| store.save(&CheckpointRecord::new(i, uuid)).unwrap())
            .collect();

        let remaining = storage.list(Path::new("checkpoints")).unwrap();
        assert_eq!(remaining.len(), 2);
        assert!(store.load(&handles[0]).is_err());
        assert_eq!(store.load(&handles[4]).unwrap().steps_completed, 4);
    }

    #[test]
    fn test_sequence_continues_after_reopen() {
        let (store, storage) = memory_store(5);
        let uuid = Uuid::new_v4();
        let old = store.save(&CheckpointRecord::new(1, uuid)).unwrap();

        let reopened =
            FileCheckpointStore::new(Arc::new(storage), &CheckpointConfig::default()).unwrap();
        let new = reopened.save(&CheckpointRecord::new(2, uuid)).unwrap();

        assert!(new > old);
        assert_eq!(reopened.latest().unwrap(), Some(new));
    }

    #[test]
    fn test_reopen_removes_interrupted_writes() {
        let (store, storage) = memory_store(5);
        let handle = store.save(&CheckpointRecord::new(3, Uuid::new_v4())).unwrap();
        let dir = Path::new("checkpoints");
        storage::write_all(&storage, &dir.join(".ckpt-0000000001-1.ckpt.tmp"), b"partial").unwrap();
        storage::write_all(&storage, &dir.join("notes.txt"), b"keep").unwrap();

        let reopened =
            FileCheckpointStore::new(Arc::new(storage.clone()), &CheckpointConfig::default())
                .unwrap();

        let mut names = storage.list(dir).unwrap();
        names.sort();
        assert_eq!(names, vec![handle.to_string(), "notes.txt".to_string()]);
        assert_eq!(reopened.latest().unwrap(), Some(handle));
    }

    #[test]
    fn test_load_rejects_bad_handles() {
        let (store, _) = memory_store(1);
        assert!(store.load(&CheckpointHandle::new("missing.ckpt")).is_err());
        assert!(store.load(&CheckpointHandle::new("../escape")).is_err());
        assert!(store.load(&CheckpointHandle::new("")).is_err());
    }

    #[test]
    fn test_shared_fs_store_atomic_and_compressed() {
        let temp = TempDir::new().unwrap();
        let storage_config = StorageConfig {
            base_path: temp.path().to_path_buf(),
            ..Default::default()
        };
        let config = CheckpointConfig {
            compression: "zstd".to_string(),
            ..Default::default()
        };
        let store =
            FileCheckpointStore::new(Arc::new(LocalStorage::new(&storage_config).unwrap()), &config)
                .unwrap();

        let handle = store.save(&CheckpointRecord::new(9, Uuid::new_v4())).unwrap();

        let files: Vec<_> = std::fs::read_dir(temp.path().join("checkpoints"))
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(files, vec![handle.to_string()]);
        assert_eq!(store.load(&handle).unwrap().steps_completed, 9);
    }

    #[test]
    fn test_open_store_unsupported_backend() {
        let storage = StorageConfig {
            backend: StorageBackendType::Gcs,
            ..Default::default()
        };
        let err = open_store(&storage, &CheckpointConfig::default()).err().unwrap();
        assert!(matches!(err, BatchError::UnsupportedBackend { .. }));
    }

    #[test]
    fn test_invalid_compression_rejected() {
        let config = CheckpointConfig {
            compression: "brotli".to_string(),
            ..Default::default()
        };
        assert!(FileCheckpointStore::new(Arc::new(MemoryStorage::new()), &config).is_err());
    }
}
