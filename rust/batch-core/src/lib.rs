// rust/batch-core/src/lib.rs

//! Batch Core - sharded, resumable batch processing
//!
//! This crate iterates a fixed-size dataset across cooperating workers,
//! hands each worker's batches to a user processor, and periodically
//! persists the minimum progress every worker agrees on so that a run can
//! resume after a crash or preemption. Worker 0 (the chief) is the only
//! coordinator; collectives run over an in-process fabric or gRPC.

pub mod config;
pub mod error;
pub mod observability;
pub mod storage;

// Re-export commonly used types for convenience
pub use config::{ClusterInfo, RunConfig};
pub use error::{BatchError, Result};
pub use storage::{LocalStorage, MemoryStorage, StorageBackend, StorageReader, StorageWriter};

pub mod dataset;
pub use dataset::{
    Dataset, FixedSizeFormat, InMemoryDataset, LengthPrefixedFormat, NewlineDelimitedFormat,
    RecordFileDataset, RecordFormat,
};

pub mod shard;
pub use shard::{Batch, ShardPlan};

pub mod distributed;
pub use distributed::{DistributedContext, LocalFabric};

pub mod checkpoint;
pub use checkpoint::{CheckpointCoordinator, CheckpointHandle, CheckpointRecord, CheckpointStore};

pub mod metrics;
pub use metrics::{MetricsReducer, MetricsSink, Reducer};

pub mod preempt;
pub use preempt::{PreemptionMode, PreemptionMonitor};

pub mod processor;
pub use processor::{BatchProcessor, ProcessorContext};

pub mod orchestrator;
pub use orchestrator::{BatchRun, RunOutcome, RunState};
