// rust/batch-core/src/shard/planner.rs

//! Round-robin batch sharding.
//!
//! Records are grouped into global batches of `batch_size` first; global
//! batch `g` then belongs to rank `g % world_size`. Every rank runs the same
//! number of iterations (`iterate_length`) so collective calls line up, which
//! means ranks with fewer real batches see padding slots at the end.

use tracing::warn;

use crate::error::{BatchError, Result};

/// Item range of one global batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchRange {
    pub global_index: u64,
    pub start: u64,
    pub end: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardPlan {
    pub dataset_length: u64,
    pub batch_size: u64,
    pub world_size: u32,
    pub rank: u32,
}

impl ShardPlan {
    /// # Errors
    ///
    /// Returns a configuration error if `batch_size` or `world_size` is zero
    /// or `rank` is not below `world_size`.
    pub fn new(dataset_length: u64, batch_size: u64, world_size: u32, rank: u32) -> Result<Self> {
        if batch_size == 0 {
            return Err(BatchError::config("batch_size must be at least 1"));
        }
        if world_size == 0 {
            return Err(BatchError::config("world_size must be at least 1"));
        }
        if rank >= world_size {
            return Err(BatchError::config(format!(
                "rank {rank} out of range for world_size {world_size}"
            )));
        }
        Ok(Self {
            dataset_length,
            batch_size,
            world_size,
            rank,
        })
    }

    /// Number of global batches across all ranks.
    pub fn global_batch_count(&self) -> u64 {
        self.dataset_length.div_ceil(self.batch_size)
    }

    /// Iterations every rank runs: `ceil(len / batch_size / world_size)`.
    pub fn dist_batch_count(&self) -> u64 {
        self.global_batch_count().div_ceil(u64::from(self.world_size))
    }

    /// Real (non-padding) batches owned by this rank.
    pub fn local_batch_count(&self) -> u64 {
        self.global_batch_count()
            .saturating_sub(u64::from(self.rank))
            .div_ceil(u64::from(self.world_size))
    }

    /// Applies an optional cap on iterations. Caps that are non-positive or
    /// larger than the full count are ignored with a warning.
    pub fn iterate_length(&self, max_batches: Option<i64>) -> u64 {
        let full = self.dist_batch_count();
        match max_batches {
            None => full,
            Some(cap) if cap > 0 && (cap as u64) <= full => cap as u64,
            Some(cap) => {
                warn!(
                    max_batches = cap,
                    dist_batch_count = full,
                    "max_batches must be positive and at most the per-rank batch count; ignoring it"
                );
                full
            }
        }
    }

    /// Item range of this rank's `local_index`-th batch, or `None` once the
    /// shard is exhausted.
    pub fn batch_range(&self, local_index: u64) -> Option<BatchRange> {
        let global_index = local_index
            .checked_mul(u64::from(self.world_size))?
            .checked_add(u64::from(self.rank))?;
        if global_index >= self.global_batch_count() {
            return None;
        }
        let start = global_index * self.batch_size;
        let end = (start + self.batch_size).min(self.dataset_length);
        Some(BatchRange {
            global_index,
            start,
            end,
        })
    }

    /// Fraction of the dataset covered once `steps_completed` iterations
    /// have finished on every rank.
    pub fn completion(&self, steps_completed: u64) -> f64 {
        if self.dataset_length == 0 {
            return 1.0;
        }
        let covered =
            steps_completed as f64 * f64::from(self.world_size) * self.batch_size as f64;
        (covered / self.dataset_length as f64).min(1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniform_iteration_count() {
        for rank in 0..2 {
            let plan = ShardPlan::new(10, 2, 2, rank).unwrap();
            assert_eq!(plan.dist_batch_count(), 3);
            assert_eq!(plan.iterate_length(None), 3);
        }
    }

    #[test]
    fn test_uneven_shards_pad() {
        // 5 global batches across 2 ranks: rank 0 owns 0,2,4 and rank 1 owns 1,3
        let r0 = ShardPlan::new(10, 2, 2, 0).unwrap();
        let r1 = ShardPlan::new(10, 2, 2, 1).unwrap();

        assert_eq!(r0.local_batch_count(), 3);
        assert_eq!(r1.local_batch_count(), 2);
        assert_eq!(r1.batch_range(2), None);
        assert_eq!(
            r0.batch_range(2),
            Some(BatchRange {
                global_index: 4,
                start: 8,
                end: 10
            })
        );
    }

    #[test]
    fn test_every_item_assigned_once() {
        let (len, bs, world) = (23u64, 4u64, 3u32);
        let mut seen = vec![0u32; len as usize];

        for rank in 0..world {
            let plan = ShardPlan::new(len, bs, world, rank).unwrap();
            for local in 0..plan.dist_batch_count() {
                if let Some(range) = plan.batch_range(local) {
                    assert_eq!(range.global_index % u64::from(world), u64::from(rank));
                    for item in range.start..range.end {
                        seen[item as usize] += 1;
                    }
                }
            }
        }
        assert!(seen.iter().all(|&n| n == 1));
    }

    #[test]
    fn test_short_last_batch() {
        let plan = ShardPlan::new(7, 3, 1, 0).unwrap();
        assert_eq!(plan.dist_batch_count(), 3);
        assert_eq!(plan.batch_range(2).map(|r| (r.start, r.end)), Some((6, 7)));
    }

    #[test]
    fn test_more_ranks_than_batches() {
        let plan = ShardPlan::new(3, 2, 4, 3).unwrap();
        assert_eq!(plan.dist_batch_count(), 1);
        assert_eq!(plan.local_batch_count(), 0);
        assert_eq!(plan.batch_range(0), None);
    }

    #[test]
    fn test_empty_dataset() {
        let plan = ShardPlan::new(0, 8, 2, 1).unwrap();
        assert_eq!(plan.dist_batch_count(), 0);
        assert_eq!(plan.completion(0), 1.0);
    }

    #[test]
    fn test_max_batches_cap() {
        let plan = ShardPlan::new(100, 10, 2, 0).unwrap();
        assert_eq!(plan.iterate_length(Some(2)), 2);
        assert_eq!(plan.iterate_length(Some(5)), 5);
        // Out of range caps are ignored
        assert_eq!(plan.iterate_length(Some(0)), 5);
        assert_eq!(plan.iterate_length(Some(-1)), 5);
        assert_eq!(plan.iterate_length(Some(6)), 5);
    }

    #[test]
    fn test_invalid_plans_are_config_errors() {
        assert!(ShardPlan::new(10, 0, 1, 0).unwrap_err().is_config());
        assert!(ShardPlan::new(10, 1, 0, 0).unwrap_err().is_config());
        assert!(ShardPlan::new(10, 1, 2, 2).unwrap_err().is_config());
    }

    #[test]
    fn test_completion() {
        let plan = ShardPlan::new(40, 5, 2, 0).unwrap();
        assert_eq!(plan.completion(2), 0.5);
        assert_eq!(plan.completion(10), 1.0);
    }
}
