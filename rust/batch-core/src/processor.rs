// rust/batch-core/src/processor.rs

//! The user-supplied processing unit and what it can reach while running.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use crate::error::Result;
use crate::metrics::{MetricsReducer, Reducer, ReducerId};
use crate::shard::Batch;
use crate::storage::StorageBackend;

/// Processes this rank's batches in increasing index order.
///
/// Padding slots never reach the processor. Returning an error aborts the
/// run without checkpointing the in-flight interval.
pub trait BatchProcessor<T> {
    fn process_batch(
        &mut self,
        ctx: &mut ProcessorContext,
        batch: Batch<T>,
        batch_index: u64,
    ) -> Result<()>;

    /// Called on every rank before each checkpoint, including the final one.
    fn on_checkpoint_start(
        &mut self,
        ctx: &mut ProcessorContext,
        steps_completed: u64,
    ) -> Result<()> {
        let _ = (ctx, steps_completed);
        Ok(())
    }

    /// Called after metrics are finalized. Errors are logged, not raised.
    fn on_finish(&mut self, ctx: &mut ProcessorContext) -> Result<()> {
        let _ = ctx;
        Ok(())
    }
}

/// Per-rank state handed to the processor.
pub struct ProcessorContext {
    rank: u32,
    world_size: u32,
    run_uuid: Uuid,
    storage: Arc<dyn StorageBackend>,
    metrics: MetricsReducer,
    used_default_output: bool,
}

impl ProcessorContext {
    pub fn new(
        rank: u32,
        world_size: u32,
        run_uuid: Uuid,
        storage: Arc<dyn StorageBackend>,
    ) -> Self {
        Self {
            rank,
            world_size,
            run_uuid,
            storage,
            metrics: MetricsReducer::new(),
            used_default_output: false,
        }
    }

    pub fn rank(&self) -> u32 {
        self.rank
    }

    pub fn world_size(&self) -> u32 {
        self.world_size
    }

    pub fn run_uuid(&self) -> Uuid {
        self.run_uuid
    }

    pub fn storage(&self) -> &Arc<dyn StorageBackend> {
        &self.storage
    }

    /// Registers a reducer. Every rank must register the same reducers in
    /// the same order.
    pub fn register_reducer<R>(
        &mut self,
        name: impl Into<String>,
        reducer: R,
    ) -> Result<ReducerId>
    where
        R: Reducer + 'static,
    {
        self.metrics.register(name, reducer)
    }

    pub fn accumulate(&mut self, id: ReducerId, sample: f64) -> Result<()> {
        self.metrics.accumulate(id, sample)
    }

    pub fn metrics(&self) -> &MetricsReducer {
        &self.metrics
    }

    /// Creates and returns `<run_uuid>/rank_<rank>` relative to the storage
    /// root. Stable across resumes of the same run.
    pub fn default_output_dir(&mut self) -> Result<PathBuf> {
        let dir = PathBuf::from(self.run_uuid.to_string()).join(format!("rank_{}", self.rank));
        self.storage.create_dir_all(&dir)?;
        if !self.used_default_output {
            debug!(rank = self.rank, dir = %dir.display(), "created default output directory");
        }
        self.used_default_output = true;
        Ok(dir)
    }

    pub fn used_default_output(&self) -> bool {
        self.used_default_output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::metrics::SumReducer;
    use crate::storage::{write_all, LocalStorage, MemoryStorage};
    use std::path::Path;
    use tempfile::TempDir;

    #[test]
    fn test_default_output_dir_is_namespaced() {
        let uuid = Uuid::new_v4();
        let mut ctx = ProcessorContext::new(3, 4, uuid, Arc::new(MemoryStorage::new()));
        assert!(!ctx.used_default_output());

        let dir = ctx.default_output_dir().unwrap();
        assert_eq!(dir, Path::new(&uuid.to_string()).join("rank_3"));
        assert!(ctx.used_default_output());
    }

    #[test]
    fn test_default_output_dir_on_shared_fs() {
        let tmp = TempDir::new().unwrap();
        let config = StorageConfig {
            base_path: tmp.path().to_path_buf(),
            ..Default::default()
        };
        let storage: Arc<dyn StorageBackend> = Arc::new(LocalStorage::new(&config).unwrap());
        let uuid = Uuid::new_v4();
        let mut ctx = ProcessorContext::new(0, 1, uuid, storage);

        let dir = ctx.default_output_dir().unwrap();
        write_all(&**ctx.storage(), &dir.join("out.txt"), b"ok").unwrap();
        assert!(tmp
            .path()
            .join(uuid.to_string())
            .join("rank_0")
            .join("out.txt")
            .is_file());
    }

    #[test]
    fn test_reducers_through_context() {
        let storage = Arc::new(MemoryStorage::new());
        let mut ctx = ProcessorContext::new(0, 1, Uuid::new_v4(), storage);
        let id = ctx.register_reducer("seen", SumReducer::new()).unwrap();
        ctx.accumulate(id, 2.0).unwrap();
        assert_eq!(ctx.metrics().len(), 1);
        assert!(ctx.register_reducer("seen", SumReducer::new()).is_err());
    }
}
