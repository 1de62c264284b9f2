// rust/batch-core/src/config.rs

//! Configuration management for batch runs.
//!
//! This module provides configuration parsing from TOML files, environment
//! variable overrides, and validation of configuration values. It also reads
//! the launcher contract (rank, world size, prior checkpoint) from the
//! environment.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{BatchError, Result};

/// Batch size used when neither the run nor the loader specifies one.
pub const DEFAULT_BATCH_SIZE: u64 = 1;

// Top-level batch run configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub run: RunSection,
    pub loader: LoaderConfig,
    pub storage: StorageConfig,
    pub checkpoint: CheckpointConfig,
    pub distributed: DistributedConfig,
}

/// Options controlling the iteration itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunSection {
    /// Number of batches between progress checkpoints. Must be positive.
    pub checkpoint_interval: i64,
    /// Optional cap on batches per worker. Out-of-range values are ignored.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_batches: Option<i64>,
    /// Explicit batch size. Mutually exclusive with `loader.batch_size`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<u64>,
    /// Label under which finalized metrics are reported.
    pub metrics_group: String,
    /// Resume from the newest record in the store when the launcher does not
    /// name a checkpoint.
    pub resume_from_latest: bool,
}

/// Loader options. Ordering-related options exist only so that they can be
/// rejected: sharding and resume depend on a fixed record order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<u64>,
    pub shuffle: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sampler: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_sampler: Option<String>,
}

/// Storage backend type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackendType {
    /// Shared (or local) filesystem.
    #[default]
    SharedFs,
    /// Process-local memory; useful for tests and single-host runs.
    Memory,
    S3,
    Gcs,
    Azure,
}

impl StorageBackendType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SharedFs => "shared_fs",
            Self::Memory => "memory",
            Self::S3 => "s3",
            Self::Gcs => "gcs",
            Self::Azure => "azure",
        }
    }
}

impl FromStr for StorageBackendType {
    type Err = BatchError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "shared_fs" | "shared-fs" | "local" => Ok(Self::SharedFs),
            "memory" => Ok(Self::Memory),
            "s3" => Ok(Self::S3),
            "gcs" => Ok(Self::Gcs),
            "azure" => Ok(Self::Azure),
            other => Err(BatchError::config(format!(
                "unknown storage backend: '{other}'"
            ))),
        }
    }
}

// Storage configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackendType,
    // Base path for all storage operations.
    pub base_path: PathBuf,
    // Buffer size in bytes for I/O operations.
    pub buffer_size: usize,
    // Whether to use memory-mapped reads for large files.
    pub use_mmap: bool,
    // File size threshold (bytes) above which to use mmap.
    pub mmap_threshold: u64,
    /// Bucket name for object-store backends.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,
    /// Container name for the Azure backend.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
}

// Checkpoint configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    // Directory (relative to the storage base) holding progress records.
    pub checkpoint_dir: PathBuf,
    // Compression algorithm: "none", "lz4", or "zstd".
    pub compression: String,
    pub compression_level: i32,
    // Number of recent records to keep.
    pub keep_last_n: usize,
    // Write to a temp file then rename.
    pub atomic_writes: bool,
}

/// Where the chief serves collectives for workers in other processes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributedConfig {
    pub chief_addr: String,
    pub port: u16,
    pub connect_attempts: u32,
    pub connect_retry_delay_ms: u64,
}

impl Default for RunSection {
    fn default() -> Self {
        Self {
            checkpoint_interval: 5,
            max_batches: None,
            batch_size: None,
            metrics_group: "validation".to_string(),
            resume_from_latest: false,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackendType::SharedFs,
            base_path: PathBuf::from("./batch-output"),
            buffer_size: 64 * 1024, // 64 KB
            use_mmap: true,
            mmap_threshold: 1024 * 1024, // 1 MB
            bucket: None,
            container: None,
        }
    }
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            checkpoint_dir: PathBuf::from("checkpoints"),
            compression: "none".to_string(),
            compression_level: 1,
            keep_last_n: 3,
            atomic_writes: true,
        }
    }
}

impl Default for DistributedConfig {
    fn default() -> Self {
        Self {
            chief_addr: "127.0.0.1".to_string(),
            port: 29400,
            connect_attempts: 30,
            connect_retry_delay_ms: 1000,
        }
    }
}

impl FromStr for RunConfig {
    type Err = BatchError;

    /// Parse configuration from a TOML string.
    fn from_str(s: &str) -> Result<Self> {
        toml::from_str(s)
            .map_err(|e| BatchError::config_with_source("failed to parse TOML config", e))
    }
}

impl RunConfig {
    // Load configuration from a TOML file.
    //
    // # Errors
    //
    // Returns an error if the file cannot be read, parsed, or fails validation.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            BatchError::storage_with_source(path, "failed to read config file", e)
        })?;
        let config: Self = content.parse()?;
        config.validate()?;
        Ok(config)
    }

    // Apply environment variable overrides.
    //
    // Variables are prefixed with `BRT_` and name the section and field, e.g.
    // `BRT_RUN_CHECKPOINT_INTERVAL` or `BRT_STORAGE_BASE_PATH`. Values that
    // fail to parse are ignored.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        // Run overrides
        if let Some(v) = env_parse("BRT_RUN_CHECKPOINT_INTERVAL") {
            self.run.checkpoint_interval = v;
        }
        if let Some(v) = env_parse("BRT_RUN_MAX_BATCHES") {
            self.run.max_batches = Some(v);
        }
        if let Some(v) = env_parse("BRT_RUN_BATCH_SIZE") {
            self.run.batch_size = Some(v);
        }
        if let Ok(val) = std::env::var("BRT_RUN_METRICS_GROUP") {
            self.run.metrics_group = val;
        }
        if let Some(v) = env_parse("BRT_RUN_RESUME_FROM_LATEST") {
            self.run.resume_from_latest = v;
        }

        // Storage overrides
        if let Some(v) = env_parse::<StorageBackendType>("BRT_STORAGE_BACKEND") {
            self.storage.backend = v;
        }
        if let Ok(val) = std::env::var("BRT_STORAGE_BASE_PATH") {
            self.storage.base_path = PathBuf::from(val);
        }
        if let Some(v) = env_parse("BRT_STORAGE_BUFFER_SIZE") {
            self.storage.buffer_size = v;
        }
        if let Some(v) = env_parse("BRT_STORAGE_USE_MMAP") {
            self.storage.use_mmap = v;
        }
        if let Ok(val) = std::env::var("BRT_STORAGE_BUCKET") {
            self.storage.bucket = Some(val);
        }

        // Checkpoint overrides
        if let Ok(val) = std::env::var("BRT_CHECKPOINT_DIR") {
            self.checkpoint.checkpoint_dir = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("BRT_CHECKPOINT_COMPRESSION") {
            self.checkpoint.compression = val;
        }
        if let Some(v) = env_parse("BRT_CHECKPOINT_KEEP_LAST_N") {
            self.checkpoint.keep_last_n = v;
        }

        // Distributed overrides
        if let Ok(val) = std::env::var("BRT_CHIEF_ADDR") {
            self.distributed.chief_addr = val;
        }
        if let Some(v) = env_parse("BRT_CHIEF_PORT") {
            self.distributed.port = v;
        }

        self
    }

    // Validate all configuration values.
    //
    // # Errors
    //
    // Returns an error if any configuration value is invalid, including
    // loader options that would break deterministic sharding.
    pub fn validate(&self) -> Result<()> {
        if self.run.checkpoint_interval <= 0 {
            return Err(BatchError::config(
                "run.checkpoint_interval should be a positive integer",
            ));
        }
        if self.run.metrics_group.is_empty() || self.run.metrics_group.contains('.') {
            return Err(BatchError::config(format!(
                "run.metrics_group '{}' must be non-empty and must not contain '.'",
                self.run.metrics_group
            )));
        }

        self.validate_loader()?;
        self.effective_batch_size()?;

        if self.storage.buffer_size == 0 {
            return Err(BatchError::config(
                "storage.buffer_size must be greater than 0",
            ));
        }

        let valid_compression = ["none", "lz4", "zstd"];
        if !valid_compression.contains(&self.checkpoint.compression.as_str()) {
            return Err(BatchError::config(format!(
                "checkpoint.compression must be one of: {}",
                valid_compression.join(", ")
            )));
        }
        if self.checkpoint.keep_last_n == 0 {
            return Err(BatchError::config(
                "checkpoint.keep_last_n must be greater than 0",
            ));
        }

        if self.distributed.connect_attempts == 0 {
            return Err(BatchError::config(
                "distributed.connect_attempts must be greater than 0",
            ));
        }

        Ok(())
    }

    fn validate_loader(&self) -> Result<()> {
        if self.loader.shuffle {
            return Err(BatchError::config(
                "loader.shuffle must be false for accurate sharding and checkpointing",
            ));
        }
        if self.loader.sampler.is_some() {
            return Err(BatchError::config(
                "remove loader.sampler; records are sampled in order automatically",
            ));
        }
        if self.loader.batch_sampler.is_some() {
            return Err(BatchError::config(
                "remove loader.batch_sampler; batches are sharded automatically",
            ));
        }
        Ok(())
    }

    /// Resolves the batch size from the run section or the loader section.
    ///
    /// # Errors
    ///
    /// Returns an error if both sections set a batch size or the resolved
    /// size is zero.
    pub fn effective_batch_size(&self) -> Result<u64> {
        let size = match (self.run.batch_size, self.loader.batch_size) {
            (Some(_), Some(_)) => {
                return Err(BatchError::config(
                    "batch size is set in both run.batch_size and loader.batch_size",
                ));
            }
            (Some(size), None) | (None, Some(size)) => size,
            (None, None) => DEFAULT_BATCH_SIZE,
        };
        if size == 0 {
            return Err(BatchError::config("batch size must be at least 1"));
        }
        Ok(size)
    }

    /// Validated checkpoint interval as an unsigned count.
    pub fn checkpoint_interval(&self) -> Result<u64> {
        u64::try_from(self.run.checkpoint_interval)
            .ok()
            .filter(|v| *v > 0)
            .ok_or_else(|| {
                BatchError::config("run.checkpoint_interval should be a positive integer")
            })
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

/// What the external launcher tells a worker about its place in the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterInfo {
    pub rank: u32,
    pub world_size: u32,
    pub local_rank: u32,
    /// Handle of the checkpoint to resume from, if any.
    pub latest_checkpoint: Option<String>,
}

impl ClusterInfo {
    /// Cluster info for a single worker with no prior checkpoint.
    pub fn single() -> Self {
        Self {
            rank: 0,
            world_size: 1,
            local_rank: 0,
            latest_checkpoint: None,
        }
    }

    /// Reads `RANK`, `WORLD_SIZE`, `LOCAL_RANK` and `BRT_LATEST_CHECKPOINT`.
    ///
    /// Missing variables fall back to a single-worker layout; present but
    /// malformed ones are errors.
    pub fn from_env() -> Result<Self> {
        let rank = env_required_parse("RANK")?.unwrap_or(0);
        let world_size = env_required_parse("WORLD_SIZE")?.unwrap_or(1);
        let local_rank = env_required_parse("LOCAL_RANK")?.unwrap_or(0);
        let latest_checkpoint = std::env::var("BRT_LATEST_CHECKPOINT")
            .ok()
            .filter(|v| !v.is_empty());

        let info = Self {
            rank,
            world_size,
            local_rank,
            latest_checkpoint,
        };
        info.validate()?;
        Ok(info)
    }

    pub fn validate(&self) -> Result<()> {
        if self.world_size == 0 {
            return Err(BatchError::config("world_size must be at least 1"));
        }
        if self.rank >= self.world_size {
            return Err(BatchError::config(format!(
                "rank {} out of range for world_size {}",
                self.rank, self.world_size
            )));
        }
        Ok(())
    }

    pub fn is_chief(&self) -> bool {
        self.rank == 0
    }
}

fn env_required_parse(key: &str) -> Result<Option<u32>> {
    match std::env::var(key) {
        Ok(val) => val.trim().parse().map(Some).map_err(|e| {
            BatchError::config_with_source(format!("invalid value for {key}: '{val}'"), e)
        }),
        Err(_) => Ok(None),
    }
}
