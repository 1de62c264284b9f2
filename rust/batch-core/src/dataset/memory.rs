// rust/batch-core/src/dataset/memory.rs

use super::traits::Dataset;
use crate::error::{BatchError, Result};

/// A dataset backed by a vector.
#[derive(Debug, Clone)]
pub struct InMemoryDataset<T> {
    name: String,
    items: Vec<T>,
}

impl<T: Clone> InMemoryDataset<T> {
    pub fn new(items: Vec<T>) -> Self {
        Self {
            name: "in-memory".to_string(),
            items,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

impl<T: Clone> Dataset for InMemoryDataset<T> {
    type Item = T;

    fn len(&self) -> Option<u64> {
        Some(self.items.len() as u64)
    }

    fn get(&self, index: u64) -> Result<T> {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.items.get(i))
            .cloned()
            .ok_or_else(|| {
                BatchError::dataset(
                    &self.name,
                    format!("index {index} out of range for {} records", self.items.len()),
                )
            })
    }

    fn get_range(&self, start: u64, end: u64) -> Result<Vec<T>> {
        let len = self.items.len() as u64;
        if start > end || end > len {
            return Err(BatchError::dataset(
                &self.name,
                format!("range {start}..{end} out of bounds for {len} records"),
            ));
        }
        Ok(self.items[start as usize..end as usize].to_vec())
    }

    fn name(&self) -> &str {
        &self.name
    }
}
