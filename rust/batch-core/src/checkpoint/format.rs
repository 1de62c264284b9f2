// rust/batch-core/src/checkpoint/format.rs

//! Progress record file format.
//!
//! ```text
//! +----------------------+
//! | Header length (u32)  |  <- little-endian
//! +----------------------+
//! | Header (bincode)     |  <- RecordHeader
//! +----------------------+
//! | Body                 |  <- JSON CheckpointRecord, compressed per header
//! +----------------------+
//! ```

use std::hash::Hasher;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use twox_hash::XxHash64;
use uuid::Uuid;

use crate::error::{BatchError, Result};

/// The durable resume state of a run. The file name carries the save time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    /// Minimum completed-batch count across all ranks.
    pub steps_completed: u64,
    pub run_uuid: Uuid,
}

impl CheckpointRecord {
    pub fn new(steps_completed: u64, run_uuid: Uuid) -> Self {
        Self {
            steps_completed,
            run_uuid,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Compression {
    None,
    Lz4,
    Zstd { level: i32 },
}

impl Compression {
    pub fn from_config(name: &str, level: i32) -> Result<Self> {
        match name.parse::<Self>()? {
            Self::Zstd { .. } => Ok(Self::Zstd { level }),
            other => Ok(other),
        }
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Self::None => Ok(data.to_vec()),
            Self::Lz4 => Ok(lz4_flex::compress_prepend_size(data)),
            Self::Zstd { level } => zstd::encode_all(data, *level)
                .map_err(|e| BatchError::checkpoint_with_source("zstd compression failed", e)),
        }
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Self::None => Ok(data.to_vec()),
            Self::Lz4 => lz4_flex::decompress_size_prepended(data)
                .map_err(|e| BatchError::checkpoint_with_source("lz4 decompression failed", e)),
            Self::Zstd { .. } => zstd::decode_all(data)
                .map_err(|e| BatchError::checkpoint_with_source("zstd decompression failed", e)),
        }
    }
}

impl FromStr for Compression {
    type Err = BatchError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(Self::None),
            "lz4" => Ok(Self::Lz4),
            "zstd" => Ok(Self::Zstd { level: 1 }),
            other => Err(BatchError::config(format!(
                "unknown compression algorithm: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RecordHeader {
    magic: [u8; 4],
    version: u32,
    compression: Compression,
    uncompressed_size: u64,
    checksum: u64,
}

const MAGIC: [u8; 4] = *b"BRTC";
const VERSION: u32 = 1;

fn checksum(data: &[u8]) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(data);
    hasher.finish()
}

/// Serializes a record into a self-verifying byte buffer.
pub fn encode_record(record: &CheckpointRecord, compression: Compression) -> Result<Vec<u8>> {
    let body = serde_json::to_vec(record)
        .map_err(|e| BatchError::serialization(format!("failed to encode record: {e}")))?;

    let header = RecordHeader {
        magic: MAGIC,
        version: VERSION,
        compression,
        uncompressed_size: body.len() as u64,
        checksum: checksum(&body),
    };
    let header_bytes = bincode::serialize(&header)
        .map_err(|e| BatchError::serialization(format!("failed to encode header: {e}")))?;
    let compressed = compression.compress(&body)?;

    let mut out = Vec::with_capacity(4 + header_bytes.len() + compressed.len());
    out.extend_from_slice(&(header_bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(&header_bytes);
    out.extend_from_slice(&compressed);
    Ok(out)
}

/// Parses and verifies a buffer produced by [`encode_record`].
pub fn decode_record(data: &[u8]) -> Result<CheckpointRecord> {
    let len_bytes: [u8; 4] = data
        .get(..4)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| BatchError::checkpoint("record file too small"))?;
    let header_len = u32::from_le_bytes(len_bytes) as usize;
    let header_bytes = data
        .get(4..4 + header_len)
        .ok_or_else(|| BatchError::checkpoint("record file truncated: header incomplete"))?;

    let header: RecordHeader = bincode::deserialize(header_bytes)
        .map_err(|e| BatchError::checkpoint_with_source("failed to decode header", e))?;
    if header.magic != MAGIC {
        return Err(BatchError::checkpoint(format!(
            "invalid magic bytes: expected {MAGIC:?}, got {:?}",
            header.magic
        )));
    }
    if header.version != VERSION {
        return Err(BatchError::checkpoint(format!(
            "unsupported record version {}",
            header.version
        )));
    }

    let body = header.compression.decompress(&data[4 + header_len..])?;
    if body.len() as u64 != header.uncompressed_size {
        return Err(BatchError::checkpoint(format!(
            "size mismatch: expected {}, got {}",
            header.uncompressed_size,
            body.len()
        )));
    }
    let actual = checksum(&body);
    if actual != header.checksum {
        return Err(BatchError::checkpoint(format!(
            "checksum mismatch: expected {:016x}, got {actual:016x}",
            header.checksum
        )));
    }

    serde_json::from_slice(&body)
        .map_err(|e| BatchError::checkpoint_with_source("failed to decode record", e))
}
