// rust/batch-core/src/storage/mod.rs

//! Storage abstraction for batch runs.
//!
//! Checkpoint records, metric reports and per-rank output artifacts are all
//! written through [`StorageBackend`]. Two backends ship with the crate:
//! [`LocalStorage`] for a filesystem shared by every rank, and
//! [`MemoryStorage`] for ranks that live in one process. Object-store
//! backends are recognised in configuration but rejected when resolved.
//!
//! # Example
//!
//! ```no_run
//! use batch_core::config::StorageConfig;
//! use batch_core::storage::{LocalStorage, StorageBackend};
//! use std::io::Write;
//! use std::path::Path;
//!
//! let storage = LocalStorage::new(&StorageConfig::default()).unwrap();
//! let mut writer = storage.open_write(Path::new("notes.txt")).unwrap();
//! writer.write_all(b"hello").unwrap();
//! writer.finish().unwrap();
//! ```

mod local;
mod memory;
mod traits;

use std::sync::Arc;

pub use local::LocalStorage;
pub use memory::MemoryStorage;
pub use traits::{read_all, write_all, StorageBackend, StorageReader, StorageWriter};

use crate::config::{StorageBackendType, StorageConfig};
use crate::error::{BatchError, Result};

/// Resolves the configured backend.
///
/// # Errors
///
/// Returns `UnsupportedBackend` for object-store backends, which are not
/// shipped with this crate.
pub fn open_storage(config: &StorageConfig) -> Result<Arc<dyn StorageBackend>> {
    match config.backend {
        StorageBackendType::SharedFs => Ok(Arc::new(LocalStorage::new(config)?)),
        StorageBackendType::Memory => Ok(Arc::new(MemoryStorage::new())),
        other => Err(BatchError::unsupported_backend(other.as_str())),
    }
}

/// Formats where default outputs for `run_uuid` live, in the notation users
/// of each backend expect.
pub fn describe_output_location(config: &StorageConfig, run_uuid: &str) -> Result<String> {
    let bucket = || {
        config.bucket.as_deref().ok_or_else(|| {
            BatchError::config(format!(
                "storage.bucket is required for the {} backend",
                config.backend.as_str()
            ))
        })
    };

    match config.backend {
        StorageBackendType::S3 => Ok(format!("s3://{}/{run_uuid}", bucket()?)),
        StorageBackendType::Gcs => Ok(format!("gs://{}/{run_uuid}", bucket()?)),
        StorageBackendType::Azure => {
            let container = config.container.as_deref().ok_or_else(|| {
                BatchError::config("storage.container is required for the azure backend")
            })?;
            Ok(format!("Azure container: {container}, directory: {run_uuid}"))
        }
        StorageBackendType::SharedFs => {
            Ok(config.base_path.join(run_uuid).display().to_string())
        }
        StorageBackendType::Memory => Ok(format!("memory://{run_uuid}")),
    }
}
