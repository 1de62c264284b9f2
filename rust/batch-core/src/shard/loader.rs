// rust/batch-core/src/shard/loader.rs

use super::planner::ShardPlan;
use crate::dataset::Dataset;
use crate::error::{BatchError, Result};

/// A batch of records owned by this rank.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch<T> {
    pub items: Vec<T>,
    /// Index of the first record in the dataset.
    pub offset: u64,
    /// Index among all ranks' batches.
    pub global_index: u64,
    /// Index among this rank's batches; equals the loop's batch index.
    pub local_index: u64,
}

impl<T> Batch<T> {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// One loop iteration: a real batch, or `None` on a padding slot.
#[derive(Debug)]
pub struct Step<T> {
    pub batch_index: u64,
    pub batch: Option<Batch<T>>,
}

/// Iterates this rank's batch indices `start..iterate_length`, fetching
/// records for indices the rank owns.
pub struct ShardLoader<'a, D: Dataset> {
    dataset: &'a D,
    plan: ShardPlan,
    next: u64,
    iterate_length: u64,
}

impl<'a, D: Dataset> ShardLoader<'a, D> {
    pub fn new(dataset: &'a D, plan: ShardPlan, iterate_length: u64) -> Self {
        Self {
            dataset,
            plan,
            next: 0,
            iterate_length,
        }
    }

    /// Skips the first `steps` local batches. Skipping happens after
    /// sharding, so each rank skips its own batches.
    pub fn starting_at(mut self, steps: u64) -> Self {
        self.next = steps;
        self
    }

    pub fn plan(&self) -> &ShardPlan {
        &self.plan
    }

    pub fn iterate_length(&self) -> u64 {
        self.iterate_length
    }

    fn load(&self, local_index: u64) -> Result<Option<Batch<D::Item>>> {
        let Some(range) = self.plan.batch_range(local_index) else {
            return Ok(None);
        };
        let items = self.dataset.get_range(range.start, range.end)?;
        if items.len() as u64 != range.end - range.start {
            return Err(BatchError::dataset(
                self.dataset.name(),
                format!(
                    "expected {} records for batch {}, got {}",
                    range.end - range.start,
                    range.global_index,
                    items.len()
                ),
            ));
        }
        Ok(Some(Batch {
            items,
            offset: range.start,
            global_index: range.global_index,
            local_index,
        }))
    }
}

impl<D: Dataset> Iterator for ShardLoader<'_, D> {
    type Item = Result<Step<D::Item>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.iterate_length {
            return None;
        }
        let batch_index = self.next;
        self.next += 1;
        Some(self.load(batch_index).map(|batch| Step { batch_index, batch }))
    }
}

/// Plans this rank's shard of `dataset`.
///
/// Returns the loader (positioned at `steps_to_skip`) and the uniform
/// iteration count.
///
/// # Errors
///
/// Returns a configuration error if the dataset has no known length or the
/// plan parameters are invalid.
pub fn plan<D: Dataset>(
    dataset: &D,
    batch_size: u64,
    world_size: u32,
    rank: u32,
    max_batches: Option<i64>,
    steps_to_skip: u64,
) -> Result<(ShardLoader<'_, D>, u64)> {
    let len = dataset.len().ok_or_else(|| {
        BatchError::config(format!(
            "dataset '{}' must have a known length to be sharded",
            dataset.name()
        ))
    })?;
    let plan = ShardPlan::new(len, batch_size, world_size, rank)?;
    let iterate_length = plan.iterate_length(max_batches);
    let loader = ShardLoader::new(dataset, plan, iterate_length).starting_at(steps_to_skip);
    Ok((loader, iterate_length))
}
