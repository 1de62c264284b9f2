// rust/batch-core/src/dataset/traits.rs

use crate::error::Result;

/// An indexable, fixed-order collection of records.
///
/// Sharding and resume rely on `get(i)` returning the same record for the
/// same `i` on every rank and across restarts.
pub trait Dataset {
    type Item;

    /// Number of records, or `None` for datasets whose size is not known up
    /// front. Such datasets cannot be sharded.
    fn len(&self) -> Option<u64>;

    fn get(&self, index: u64) -> Result<Self::Item>;

    /// Fetches records `start..end`. Backends that can read a contiguous span
    /// more cheaply should override this.
    fn get_range(&self, start: u64, end: u64) -> Result<Vec<Self::Item>> {
        (start..end).map(|i| self.get(i)).collect()
    }

    /// Name used in error messages.
    fn name(&self) -> &str {
        "dataset"
    }
}
