// rust/batch-core/src/checkpoint/mod.rs

//! Progress checkpointing.
//!
//! The durable resume state of a run is a single [`CheckpointRecord`]:
//! the minimum completed-batch count over all ranks plus the run UUID.
//! [`CheckpointCoordinator`] agrees on that value through a gather and has
//! the chief persist it through a [`CheckpointStore`].

mod coordinator;
mod format;
mod store;

pub use coordinator::{CheckpointCoordinator, ResumePoint};
pub use format::{decode_record, encode_record, CheckpointRecord, Compression};
pub use store::{open_store, CheckpointHandle, CheckpointStore, FileCheckpointStore};
