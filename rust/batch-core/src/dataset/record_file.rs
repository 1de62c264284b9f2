// rust/batch-core/src/dataset/record_file.rs

//! Record files read through a storage backend.
//!
//! The file is scanned once in fixed-size chunks to build a record index
//! (offset and length of every record). After that, `get` is a single
//! ranged read and `get_range` reads one contiguous span.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::debug;

use super::format::RecordFormat;
use super::traits::Dataset;
use crate::error::{BatchError, Result};
use crate::storage::{StorageBackend, StorageReader};

const DEFAULT_SCAN_CHUNK: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RecordSpan {
    offset: u64,
    len: u64,
}

pub struct RecordFileDataset {
    name: String,
    path: PathBuf,
    format: Arc<dyn RecordFormat>,
    index: Vec<RecordSpan>,
    reader: Mutex<Box<dyn StorageReader>>,
}

impl RecordFileDataset {
    /// Opens and indexes the record file at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or ends in a truncated
    /// record.
    pub fn open(
        storage: &dyn StorageBackend,
        path: impl AsRef<Path>,
        format: Arc<dyn RecordFormat>,
    ) -> Result<Self> {
        Self::open_with_chunk(storage, path, format, DEFAULT_SCAN_CHUNK)
    }

    pub fn open_with_chunk(
        storage: &dyn StorageBackend,
        path: impl AsRef<Path>,
        format: Arc<dyn RecordFormat>,
        scan_chunk: usize,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let name = path.display().to_string();
        let mut reader = storage.open_read(&path)?;
        let index = build_index(&mut *reader, &*format, scan_chunk.max(1), &name)?;

        debug!(
            path = %name,
            format = format.name(),
            records = index.len(),
            "indexed record file"
        );

        Ok(Self {
            name,
            path,
            format,
            index,
            reader: Mutex::new(reader),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn span(&self, index: u64) -> Result<RecordSpan> {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.index.get(i))
            .copied()
            .ok_or_else(|| {
                BatchError::dataset(
                    &self.name,
                    format!("index {index} out of range for {} records", self.index.len()),
                )
            })
    }

    fn read_span(&self, offset: u64, len: u64) -> Result<Vec<u8>> {
        let mut reader = self
            .reader
            .lock()
            .map_err(|_| BatchError::dataset(&self.name, "reader lock poisoned"))?;
        reader.read_range(offset, len as usize)
    }
}

fn build_index(
    reader: &mut dyn StorageReader,
    format: &dyn RecordFormat,
    chunk: usize,
    name: &str,
) -> Result<Vec<RecordSpan>> {
    let size = reader.size();
    let mut index = Vec::new();
    let mut buf: Vec<u8> = Vec::new();
    let mut buf_start = 0u64;
    let mut read_pos = 0u64;

    while read_pos < size {
        let n = chunk.min((size - read_pos) as usize);
        buf.extend(reader.read_range(read_pos, n)?);
        read_pos += n as u64;

        let mut cursor = 0usize;
        while let Some(end) = format.find_record_end(&buf, cursor) {
            if end <= cursor {
                return Err(BatchError::dataset(name, "record format made no progress"));
            }
            index.push(RecordSpan {
                offset: buf_start + cursor as u64,
                len: (end - cursor) as u64,
            });
            cursor = end;
        }
        buf.drain(..cursor);
        buf_start += cursor as u64;
    }

    if !buf.is_empty() {
        match format.finish_record(&buf) {
            Some(len) if len == buf.len() => index.push(RecordSpan {
                offset: buf_start,
                len: len as u64,
            }),
            _ => {
                return Err(BatchError::dataset(
                    name,
                    format!(
                        "truncated {} record at byte {buf_start}",
                        format.name()
                    ),
                ));
            }
        }
    }

    Ok(index)
}

impl Dataset for RecordFileDataset {
    type Item = Vec<u8>;

    fn len(&self) -> Option<u64> {
        Some(self.index.len() as u64)
    }

    fn get(&self, index: u64) -> Result<Vec<u8>> {
        let span = self.span(index)?;
        let record = self.read_span(span.offset, span.len)?;
        Ok(self.format.payload(&record).to_vec())
    }

    fn get_range(&self, start: u64, end: u64) -> Result<Vec<Vec<u8>>> {
        if start >= end {
            return Ok(Vec::new());
        }
        let first = self.span(start)?;
        let last = self.span(end - 1)?;
        let base = first.offset;
        let bytes = self.read_span(base, last.offset + last.len - base)?;

        self.index[start as usize..end as usize]
            .iter()
            .map(|span| {
                let from = (span.offset - base) as usize;
                let record = &bytes[from..from + span.len as usize];
                Ok(self.format.payload(record).to_vec())
            })
            .collect()
    }

    fn name(&self) -> &str {
        &self.name
    }
}
