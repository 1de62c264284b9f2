// rust/batch-core/src/storage/traits.rs

//! Storage abstraction traits.
//!
//! Checkpoint records, metric reports, record files and default output
//! artifacts all go through these traits, so every backend is
//! interchangeable behind `Arc<dyn StorageBackend>`.

use std::io::{Read, Seek, Write};
use std::path::Path;

use crate::error::{BatchError, Result};

/// A handle for reading from storage with random access.
pub trait StorageReader: Read + Seek + Send {
    /// Total size of the object in bytes.
    fn size(&self) -> u64;

    /// Reads exactly `length` bytes starting at `start`.
    ///
    /// # Errors
    ///
    /// Returns an error if the range runs past the end of the object.
    fn read_range(&mut self, start: u64, length: usize) -> Result<Vec<u8>>;
}

/// A handle for writing to storage.
pub trait StorageWriter: Write + Send {
    /// Flushes and commits the written bytes. Nothing written through the
    /// handle is guaranteed visible until this returns.
    fn finish(self: Box<Self>) -> Result<()>;
}

/// Operations every storage backend supports.
///
/// Paths are relative to the backend's root unless absolute.
pub trait StorageBackend: Send + Sync {
    fn exists(&self, path: &Path) -> Result<bool>;

    fn open_read(&self, path: &Path) -> Result<Box<dyn StorageReader>>;

    /// Opens an object for writing, truncating any existing object and
    /// creating parent directories as needed.
    fn open_write(&self, path: &Path) -> Result<Box<dyn StorageWriter>>;

    /// Deletes a file, or a directory and everything under it.
    fn delete(&self, path: &Path) -> Result<()>;

    /// Lists the immediate children of `prefix`, sorted by name. A missing
    /// prefix lists as empty.
    fn list(&self, prefix: &Path) -> Result<Vec<String>>;

    fn rename(&self, from: &Path, to: &Path) -> Result<()>;

    fn create_dir_all(&self, path: &Path) -> Result<()>;

    /// Human-readable root of this backend, used in log messages.
    fn root(&self) -> String;
}

/// Reads an entire object into memory.
pub fn read_all(storage: &dyn StorageBackend, path: &Path) -> Result<Vec<u8>> {
    let mut reader = storage.open_read(path)?;
    let size = reader.size();
    let mut buf = Vec::with_capacity(size as usize);
    reader
        .read_to_end(&mut buf)
        .map_err(|e| BatchError::storage_with_source(path, "failed to read object", e))?;
    Ok(buf)
}

/// Writes `data` to `path` and commits it.
pub fn write_all(storage: &dyn StorageBackend, path: &Path, data: &[u8]) -> Result<()> {
    let mut writer = storage.open_write(path)?;
    writer
        .write_all(data)
        .map_err(|e| BatchError::storage_with_source(path, "failed to write object", e))?;
    writer.finish()
}
