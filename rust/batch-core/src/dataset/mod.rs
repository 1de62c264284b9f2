// rust/batch-core/src/dataset/mod.rs

//! Datasets that can be sharded across ranks.
//!
//! A [`Dataset`] has a known length and fixed order. [`InMemoryDataset`]
//! wraps a vector; [`RecordFileDataset`] indexes a file of records in one of
//! the [`RecordFormat`]s and serves records through a storage backend.
//!
//! # Example
//!
//! ```ignore
//! use batch_core::dataset::{Dataset, NewlineDelimitedFormat, RecordFileDataset};
//! use std::sync::Arc;
//!
//! let ds = RecordFileDataset::open(&*storage, "inputs.jsonl", Arc::new(NewlineDelimitedFormat))?;
//! let first = ds.get(0)?;
//! ```

mod format;
mod memory;
mod record_file;
mod traits;

pub use format::{FixedSizeFormat, LengthPrefixedFormat, NewlineDelimitedFormat, RecordFormat};
pub use memory::InMemoryDataset;
pub use record_file::RecordFileDataset;
pub use traits::Dataset;
