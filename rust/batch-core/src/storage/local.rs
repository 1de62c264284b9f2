// rust/batch-core/src/storage/local.rs

//! Shared-filesystem storage backend.
//!
//! Every rank points at the same base directory (an NFS mount, a local disk
//! for single-host runs). Small objects are read through a buffered reader;
//! objects at or above `mmap_threshold` are memory-mapped.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use memmap2::Mmap;

use super::traits::{StorageBackend, StorageReader, StorageWriter};
use crate::config::StorageConfig;
use crate::error::{BatchError, Result};

pub struct LocalStorage {
    base_path: PathBuf,
    buffer_size: usize,
    use_mmap: bool,
    mmap_threshold: u64,
}

impl LocalStorage {
    /// Opens the backend, creating the base directory if needed.
    pub fn new(config: &StorageConfig) -> Result<Self> {
        let base_path = config.base_path.clone();
        fs::create_dir_all(&base_path).map_err(|e| {
            BatchError::storage_with_source(&base_path, "failed to create base directory", e)
        })?;

        Ok(Self {
            base_path,
            buffer_size: config.buffer_size.max(1),
            use_mmap: config.use_mmap,
            mmap_threshold: config.mmap_threshold,
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_path.join(path)
        }
    }

    fn ensure_parent(path: &Path) -> Result<()> {
        match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => {
                fs::create_dir_all(parent).map_err(|e| {
                    BatchError::storage_with_source(parent, "failed to create parent directories", e)
                })
            }
            _ => Ok(()),
        }
    }
}

impl StorageBackend for LocalStorage {
    fn exists(&self, path: &Path) -> Result<bool> {
        Ok(self.resolve(path).exists())
    }

    fn open_read(&self, path: &Path) -> Result<Box<dyn StorageReader>> {
        let full = self.resolve(path);
        let file = File::open(&full)
            .map_err(|e| BatchError::storage_with_source(&full, "failed to open file", e))?;
        let size = file
            .metadata()
            .map_err(|e| BatchError::storage_with_source(&full, "failed to read file metadata", e))?
            .len();

        if self.use_mmap && size > 0 && size >= self.mmap_threshold {
            // SAFETY: the map is read-only and owned by the reader. Callers
            // must not truncate the file while a reader is open.
            let mmap = unsafe { Mmap::map(&file) }.map_err(|e| {
                BatchError::storage_with_source(&full, "failed to memory-map file", e)
            })?;
            Ok(Box::new(MappedReader {
                mmap,
                pos: 0,
                path: full,
            }))
        } else {
            Ok(Box::new(FileReader {
                inner: BufReader::with_capacity(self.buffer_size, file),
                size,
                path: full,
            }))
        }
    }

    fn open_write(&self, path: &Path) -> Result<Box<dyn StorageWriter>> {
        let full = self.resolve(path);
        Self::ensure_parent(&full)?;

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&full)
            .map_err(|e| BatchError::storage_with_source(&full, "failed to create file", e))?;

        Ok(Box::new(FileWriter {
            inner: BufWriter::with_capacity(self.buffer_size, file),
            path: full,
        }))
    }

    fn delete(&self, path: &Path) -> Result<()> {
        let full = self.resolve(path);
        let result = if full.is_dir() {
            fs::remove_dir_all(&full)
        } else {
            fs::remove_file(&full)
        };
        result.map_err(|e| BatchError::storage_with_source(&full, "failed to delete", e))
    }

    fn list(&self, prefix: &Path) -> Result<Vec<String>> {
        let full = self.resolve(prefix);
        if !full.exists() {
            return Ok(Vec::new());
        }
        if !full.is_dir() {
            return Err(BatchError::storage(&full, "path is not a directory"));
        }

        let entries = fs::read_dir(&full)
            .map_err(|e| BatchError::storage_with_source(&full, "failed to read directory", e))?;

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| {
                BatchError::storage_with_source(&full, "failed to read directory entry", e)
            })?;
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        let from = self.resolve(from);
        let to = self.resolve(to);
        Self::ensure_parent(&to)?;

        fs::rename(&from, &to).map_err(|e| {
            BatchError::storage_with_source(&from, format!("failed to rename to {}", to.display()), e)
        })
    }

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        let full = self.resolve(path);
        fs::create_dir_all(&full)
            .map_err(|e| BatchError::storage_with_source(&full, "failed to create directories", e))
    }

    fn root(&self) -> String {
        self.base_path.display().to_string()
    }
}

struct FileReader {
    inner: BufReader<File>,
    size: u64,
    path: PathBuf,
}

impl Read for FileReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Seek for FileReader {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.inner.seek(pos)
    }
}

impl StorageReader for FileReader {
    fn size(&self) -> u64 {
        self.size
    }

    fn read_range(&mut self, start: u64, length: usize) -> Result<Vec<u8>> {
        self.inner.seek(SeekFrom::Start(start)).map_err(|e| {
            BatchError::storage_with_source(&self.path, format!("failed to seek to {start}"), e)
        })?;

        let mut buf = vec![0u8; length];
        self.inner.read_exact(&mut buf).map_err(|e| {
            BatchError::storage_with_source(
                &self.path,
                format!("failed to read {length} bytes at {start}"),
                e,
            )
        })?;
        Ok(buf)
    }
}

struct MappedReader {
    mmap: Mmap,
    pos: u64,
    path: PathBuf,
}

impl Read for MappedReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let len = self.mmap.len() as u64;
        if self.pos >= len {
            return Ok(0);
        }
        let start = self.pos as usize;
        let n = buf.len().min(self.mmap.len() - start);
        buf[..n].copy_from_slice(&self.mmap[start..start + n]);
        self.pos += n as u64;
        Ok(n)
    }
}

impl Seek for MappedReader {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::End(delta) => (self.mmap.len() as u64).checked_add_signed(delta),
            SeekFrom::Current(delta) => self.pos.checked_add_signed(delta),
        };
        match target {
            Some(p) => {
                self.pos = p;
                Ok(p)
            }
            None => Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "seek to negative position",
            )),
        }
    }
}

impl StorageReader for MappedReader {
    fn size(&self) -> u64 {
        self.mmap.len() as u64
    }

    fn read_range(&mut self, start: u64, length: usize) -> Result<Vec<u8>> {
        let end = start.saturating_add(length as u64);
        if end > self.mmap.len() as u64 {
            return Err(BatchError::storage(
                &self.path,
                format!(
                    "read range {start}..{end} exceeds file size {}",
                    self.mmap.len()
                ),
            ));
        }
        Ok(self.mmap[start as usize..end as usize].to_vec())
    }
}

struct FileWriter {
    inner: BufWriter<File>,
    path: PathBuf,
}

impl Write for FileWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

impl StorageWriter for FileWriter {
    fn finish(mut self: Box<Self>) -> Result<()> {
        self.inner
            .flush()
            .map_err(|e| BatchError::storage_with_source(&self.path, "failed to flush writer", e))?;
        self.inner
            .get_ref()
            .sync_all()
            .map_err(|e| BatchError::storage_with_source(&self.path, "failed to sync file", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{read_all, write_all};
    use tempfile::TempDir;

    fn storage_with_threshold(threshold: u64) -> (LocalStorage, TempDir) {
        let temp = TempDir::new().unwrap();
        let config = StorageConfig {
            base_path: temp.path().to_path_buf(),
            buffer_size: 512,
            use_mmap: true,
            mmap_threshold: threshold,
            ..Default::default()
        };
        (LocalStorage::new(&config).unwrap(), temp)
    }

    #[test]
    fn test_new_creates_base_dir() {
        let temp = TempDir::new().unwrap();
        let base = temp.path().join("run-output");
        let config = StorageConfig {
            base_path: base.clone(),
            ..Default::default()
        };

        let storage = LocalStorage::new(&config).unwrap();
        assert!(base.is_dir());
        assert_eq!(storage.root(), base.display().to_string());
    }

    #[test]
    fn test_buffered_and_mapped_reads_agree() {
        let data: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();

        for threshold in [u64::MAX, 1024] {
            let (storage, _temp) = storage_with_threshold(threshold);
            write_all(&storage, Path::new("records.bin"), &data).unwrap();

            let mut reader = storage.open_read(Path::new("records.bin")).unwrap();
            assert_eq!(reader.size(), 4096);
            assert_eq!(reader.read_range(1000, 16).unwrap(), &data[1000..1016]);

            reader.seek(SeekFrom::End(-2)).unwrap();
            let mut tail = Vec::new();
            reader.read_to_end(&mut tail).unwrap();
            assert_eq!(tail, &data[4094..]);

            assert!(reader.read_range(4090, 10).is_err());
        }
    }

    #[test]
    fn test_empty_file_reads_empty() {
        let (storage, _temp) = storage_with_threshold(0);
        write_all(&storage, Path::new("empty"), b"").unwrap();

        assert!(read_all(&storage, Path::new("empty")).unwrap().is_empty());
    }

    #[test]
    fn test_write_creates_parents_and_overwrites() {
        let (storage, _temp) = storage_with_threshold(u64::MAX);
        let path = Path::new("abc/rank_0/out.txt");

        write_all(&storage, path, b"first").unwrap();
        write_all(&storage, path, b"2nd").unwrap();

        assert_eq!(read_all(&storage, path).unwrap(), b"2nd");
    }

    #[test]
    fn test_list_sorted_and_missing() {
        let (storage, _temp) = storage_with_threshold(u64::MAX);
        for name in ["b", "c", "a"] {
            write_all(&storage, &Path::new("dir").join(name), b"x").unwrap();
        }

        assert_eq!(storage.list(Path::new("dir")).unwrap(), vec!["a", "b", "c"]);
        assert!(storage.list(Path::new("nope")).unwrap().is_empty());
        assert!(storage.list(Path::new("dir/a")).is_err());
    }

    #[test]
    fn test_rename_and_delete() {
        let (storage, _temp) = storage_with_threshold(u64::MAX);
        write_all(&storage, Path::new("tmp.part"), b"record").unwrap();

        storage
            .rename(Path::new("tmp.part"), Path::new("ckpt/final"))
            .unwrap();
        assert!(!storage.exists(Path::new("tmp.part")).unwrap());
        assert_eq!(read_all(&storage, Path::new("ckpt/final")).unwrap(), b"record");

        storage.delete(Path::new("ckpt")).unwrap();
        assert!(!storage.exists(Path::new("ckpt")).unwrap());
        assert!(storage.delete(Path::new("ckpt")).is_err());
    }

    #[test]
    fn test_open_missing_file_is_storage_error() {
        let (storage, _temp) = storage_with_threshold(u64::MAX);
        let err = storage.open_read(Path::new("missing")).err().unwrap();
        assert!(matches!(err, BatchError::Storage { .. }));
    }
}
