// rust/batch-core/src/storage/memory.rs

//! Process-local storage backend.
//!
//! Clones share the same object map, so ranks running as threads in one
//! process can hand each other a `MemoryStorage` and see a common store.

use std::collections::{BTreeMap, BTreeSet};
use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use super::traits::{StorageBackend, StorageReader, StorageWriter};
use crate::error::{BatchError, Result};

#[derive(Default)]
struct Objects {
    files: BTreeMap<PathBuf, Arc<[u8]>>,
    dirs: BTreeSet<PathBuf>,
}

#[derive(Clone, Default)]
pub struct MemoryStorage {
    objects: Arc<Mutex<Objects>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self, path: &Path) -> Result<MutexGuard<'_, Objects>> {
        lock_objects(&self.objects, path)
    }
}

fn lock_objects<'a>(objects: &'a Mutex<Objects>, path: &Path) -> Result<MutexGuard<'a, Objects>> {
    objects
        .lock()
        .map_err(|_| BatchError::storage(path, "memory storage lock poisoned"))
}

fn is_under(candidate: &Path, dir: &Path) -> bool {
    candidate != dir && candidate.starts_with(dir)
}

impl StorageBackend for MemoryStorage {
    fn exists(&self, path: &Path) -> Result<bool> {
        let objects = self.lock(path)?;
        Ok(objects.files.contains_key(path)
            || objects.dirs.contains(path)
            || objects.files.keys().any(|f| is_under(f, path)))
    }

    fn open_read(&self, path: &Path) -> Result<Box<dyn StorageReader>> {
        let data = self
            .lock(path)?
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| BatchError::storage(path, "object not found"))?;

        Ok(Box::new(MemoryReader {
            cursor: Cursor::new(data),
            path: path.to_path_buf(),
        }))
    }

    fn open_write(&self, path: &Path) -> Result<Box<dyn StorageWriter>> {
        Ok(Box::new(MemoryWriter {
            buf: Vec::new(),
            path: path.to_path_buf(),
            objects: Arc::clone(&self.objects),
        }))
    }

    fn delete(&self, path: &Path) -> Result<()> {
        let mut objects = self.lock(path)?;
        if objects.files.remove(path).is_some() {
            return Ok(());
        }

        let before = objects.files.len() + objects.dirs.len();
        objects.files.retain(|f, _| !is_under(f, path));
        objects.dirs.retain(|d| d != path && !is_under(d, path));
        if objects.files.len() + objects.dirs.len() == before {
            return Err(BatchError::storage(path, "object not found"));
        }
        Ok(())
    }

    fn list(&self, prefix: &Path) -> Result<Vec<String>> {
        let objects = self.lock(prefix)?;
        if objects.files.contains_key(prefix) {
            return Err(BatchError::storage(prefix, "path is not a directory"));
        }

        let children: BTreeSet<String> = objects
            .files
            .keys()
            .chain(objects.dirs.iter())
            .filter(|p| is_under(p, prefix))
            .filter_map(|p| p.strip_prefix(prefix).ok()?.components().next())
            .filter_map(|c| c.as_os_str().to_str().map(str::to_string))
            .collect();
        Ok(children.into_iter().collect())
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        let mut objects = self.lock(from)?;
        let data = objects
            .files
            .remove(from)
            .ok_or_else(|| BatchError::storage(from, "object not found"))?;
        objects.files.insert(to.to_path_buf(), data);
        Ok(())
    }

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        self.lock(path)?.dirs.insert(path.to_path_buf());
        Ok(())
    }

    fn root(&self) -> String {
        "memory://".to_string()
    }
}

struct MemoryReader {
    cursor: Cursor<Arc<[u8]>>,
    path: PathBuf,
}

impl Read for MemoryReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.cursor.read(buf)
    }
}

impl Seek for MemoryReader {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.cursor.seek(pos)
    }
}

impl StorageReader for MemoryReader {
    fn size(&self) -> u64 {
        self.cursor.get_ref().len() as u64
    }

    fn read_range(&mut self, start: u64, length: usize) -> Result<Vec<u8>> {
        let data = self.cursor.get_ref();
        let end = start.saturating_add(length as u64);
        if end > data.len() as u64 {
            return Err(BatchError::storage(
                &self.path,
                format!("read range {start}..{end} exceeds object size {}", data.len()),
            ));
        }
        Ok(data[start as usize..end as usize].to_vec())
    }
}

struct MemoryWriter {
    buf: Vec<u8>,
    path: PathBuf,
    objects: Arc<Mutex<Objects>>,
}

impl Write for MemoryWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl StorageWriter for MemoryWriter {
    fn finish(self: Box<Self>) -> Result<()> {
        let MemoryWriter { buf, path, objects } = *self;
        let mut guard = lock_objects(&objects, &path)?;
        guard.files.insert(path, Arc::from(buf));
        Ok(())
    }
}
