// rust/batch-core/src/shard/mod.rs

//! Shard planning and per-rank batch iteration.

mod loader;
mod planner;

pub use loader::{plan, Batch, ShardLoader, Step};
pub use planner::{BatchRange, ShardPlan};
