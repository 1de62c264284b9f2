// rust/batch-core/src/orchestrator.rs

//! Drives one rank through a batch run.
//!
//! Every rank runs the same state machine and issues the same collective
//! calls in the same order:
//!
//! ```text
//! Init -> Resuming -> Running <-> Checkpointing -> Preempted | Completed
//!      -> Finalizing -> Done
//! ```
//!
//! # Example
//!
//! ```no_run
//! use batch_core::dataset::InMemoryDataset;
//! use batch_core::distributed::DistributedContext;
//! use batch_core::error::Result;
//! use batch_core::orchestrator::BatchRun;
//! use batch_core::processor::{BatchProcessor, ProcessorContext};
//! use batch_core::shard::Batch;
//! use batch_core::RunConfig;
//!
//! struct Print;
//!
//! impl BatchProcessor<u32> for Print {
//!     fn process_batch(&mut self, _: &mut ProcessorContext, b: Batch<u32>, i: u64) -> Result<()> {
//!         println!("{i}: {:?}", b.items);
//!         Ok(())
//!     }
//! }
//!
//! let dataset = InMemoryDataset::new((0..10u32).collect());
//! let mut run = BatchRun::new(RunConfig::default(), DistributedContext::single(), &dataset);
//! run.run(|_| Ok(Print)).unwrap();
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, info, info_span, warn};
use uuid::Uuid;

use crate::checkpoint::{
    CheckpointCoordinator, CheckpointHandle, CheckpointStore, FileCheckpointStore,
};
use crate::config::RunConfig;
use crate::dataset::Dataset;
use crate::distributed::DistributedContext;
use crate::error::{BatchError, Result};
use crate::metrics::{LogSink, MetricsSink};
use crate::preempt::PreemptionMonitor;
use crate::processor::{BatchProcessor, ProcessorContext};
use crate::shard;
use crate::storage::{self, StorageBackend};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Init,
    Resuming,
    Running,
    Checkpointing,
    Preempted,
    Completed,
    Finalizing,
    Done,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "init",
            Self::Resuming => "resuming",
            Self::Running => "running",
            Self::Checkpointing => "checkpointing",
            Self::Preempted => "preempted",
            Self::Completed => "completed",
            Self::Finalizing => "finalizing",
            Self::Done => "done",
        };
        f.write_str(name)
    }
}

/// How a run ended on this rank.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    /// `Completed` or `Preempted`.
    pub state: RunState,
    pub steps_completed: u64,
    pub iterate_length: u64,
    pub run_uuid: Uuid,
    /// Reduced metrics; only the chief has them.
    pub metrics: Option<BTreeMap<String, f64>>,
}

impl RunOutcome {
    pub fn is_preempted(&self) -> bool {
        self.state == RunState::Preempted
    }
}

/// One rank's view of a batch run.
///
/// Storage and the checkpoint store are resolved from the configuration
/// unless supplied; the sink defaults to [`LogSink`] and preemption to
/// never.
pub struct BatchRun<'a, D: Dataset> {
    config: RunConfig,
    ctx: DistributedContext,
    dataset: &'a D,
    storage: Option<Arc<dyn StorageBackend>>,
    store: Option<Box<dyn CheckpointStore>>,
    sink: Arc<dyn MetricsSink>,
    preemption: PreemptionMonitor,
    resume_handle: Option<CheckpointHandle>,
    state: RunState,
}

impl<'a, D: Dataset> BatchRun<'a, D> {
    pub fn new(config: RunConfig, ctx: DistributedContext, dataset: &'a D) -> Self {
        Self {
            config,
            ctx,
            dataset,
            storage: None,
            store: None,
            sink: Arc::new(LogSink),
            preemption: PreemptionMonitor::never(),
            resume_handle: None,
            state: RunState::Init,
        }
    }

    pub fn with_storage(mut self, storage: Arc<dyn StorageBackend>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn with_checkpoint_store(mut self, store: Box<dyn CheckpointStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_preemption(mut self, monitor: PreemptionMonitor) -> Self {
        self.preemption = monitor;
        self
    }

    /// Checkpoint the launcher asked to resume from. Only the chief's value
    /// is used.
    pub fn resume_from(mut self, handle: Option<CheckpointHandle>) -> Self {
        self.resume_handle = handle;
        self
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn context(&self) -> &DistributedContext {
        &self.ctx
    }

    fn transition(&mut self, next: RunState) {
        debug!(rank = self.ctx.rank(), from = %self.state, to = %next, "run state");
        self.state = next;
    }

    /// Runs to completion or preemption.
    ///
    /// `factory` builds the processor once the run identity is known, so it
    /// can register reducers and look up its output directory.
    ///
    /// # Errors
    ///
    /// Configuration errors are raised before any batch is processed.
    /// Processor errors carry the failing batch index and abort the run
    /// without checkpointing the in-flight interval.
    pub fn run<P, F>(&mut self, factory: F) -> Result<RunOutcome>
    where
        P: BatchProcessor<D::Item>,
        F: FnOnce(&mut ProcessorContext) -> Result<P>,
    {
        if self.state != RunState::Init {
            return Err(BatchError::config(format!(
                "a batch run can only be started once (state: {})",
                self.state
            )));
        }

        let span = info_span!(
            "batch_run",
            rank = self.ctx.rank(),
            world_size = self.ctx.world_size()
        );
        let _guard = span.enter();

        self.config.validate()?;
        let batch_size = self.config.effective_batch_size()?;
        let interval = self.config.checkpoint_interval()?;

        let storage = match &self.storage {
            Some(storage) => Arc::clone(storage),
            None => storage::open_storage(&self.config.storage)?,
        };
        let store: Box<dyn CheckpointStore> = match self.store.take() {
            Some(store) => store,
            None => Box::new(FileCheckpointStore::new(
                Arc::clone(&storage),
                &self.config.checkpoint,
            )?),
        };
        let mut coordinator = CheckpointCoordinator::new(store, interval)?;

        self.transition(RunState::Resuming);
        let point = coordinator.resume(
            &self.ctx,
            self.resume_handle.as_ref(),
            self.config.run.resume_from_latest,
        )?;
        let dataset = self.dataset;
        let (loader, iterate_length) = shard::plan(
            dataset,
            batch_size,
            self.ctx.world_size(),
            self.ctx.rank(),
            self.config.run.max_batches,
            point.steps_to_skip,
        )?;
        let plan = loader.plan().clone();

        info!(
            run_uuid = %point.run_uuid,
            steps_to_skip = point.steps_to_skip,
            iterate_length,
            batch_size,
            "starting batch loop"
        );

        let mut pctx = ProcessorContext::new(
            self.ctx.rank(),
            self.ctx.world_size(),
            point.run_uuid,
            Arc::clone(&storage),
        );
        let mut processor = factory(&mut pctx)?;

        self.transition(RunState::Running);
        let mut steps_completed = point.steps_to_skip;
        let mut last_checkpoint = None;
        let mut preempted = false;

        for step in loader {
            let step = step?;
            let batch_index = step.batch_index;
            if let Some(batch) = step.batch {
                processor
                    .process_batch(&mut pctx, batch, batch_index)
                    .map_err(|e| e.at_batch(batch_index))?;
            }
            steps_completed = batch_index + 1;

            if !coordinator.is_checkpoint_due(batch_index) {
                continue;
            }

            self.checkpoint(&mut coordinator, &mut processor, &mut pctx, steps_completed)?;
            last_checkpoint = Some(steps_completed);
            if self.ctx.is_chief() {
                self.sink.report_progress(plan.completion(steps_completed))?;
            }

            if self.preemption.should_preempt(&self.ctx)? {
                preempted = true;
                break;
            }
            self.transition(RunState::Running);
        }

        if preempted {
            self.transition(RunState::Preempted);
            info!(steps_completed, "run preempted at checkpoint boundary");
        } else {
            self.transition(RunState::Completed);
            if last_checkpoint != Some(steps_completed) {
                self.checkpoint(&mut coordinator, &mut processor, &mut pctx, steps_completed)?;
            }
        }
        let end_state = self.state;

        self.transition(RunState::Finalizing);
        let metrics = pctx.metrics().finalize(
            &self.ctx,
            &*self.sink,
            &self.config.run.metrics_group,
            steps_completed,
        )?;

        if let Err(err) = processor.on_finish(&mut pctx) {
            warn!(error = %err, "on_finish hook failed");
        }

        // Doubles as the final barrier before the chief reports completion
        let used_default_output = self.ctx.gather(&pctx.used_default_output())?;
        if let Some(used) = used_default_output {
            if used.iter().any(|u| *u) {
                self.log_output_location(point.run_uuid);
            }
            if end_state == RunState::Completed {
                self.sink.report_completed()?;
            }
        }

        self.transition(RunState::Done);
        info!(state = %end_state, steps_completed, "batch run finished");

        Ok(RunOutcome {
            state: end_state,
            steps_completed,
            iterate_length,
            run_uuid: point.run_uuid,
            metrics,
        })
    }

    fn checkpoint<P>(
        &mut self,
        coordinator: &mut CheckpointCoordinator,
        processor: &mut P,
        pctx: &mut ProcessorContext,
        steps_completed: u64,
    ) -> Result<()>
    where
        P: BatchProcessor<D::Item>,
    {
        let resume_state = self.state;
        self.transition(RunState::Checkpointing);
        processor.on_checkpoint_start(pctx, steps_completed)?;
        let (saved, handle) = coordinator.checkpoint(&self.ctx, steps_completed)?;
        if let Some(handle) = handle {
            info!(checkpoint = %handle, steps_completed = saved, "checkpoint saved");
        }
        self.transition(resume_state);
        Ok(())
    }

    fn log_output_location(&self, run_uuid: Uuid) {
        match storage::describe_output_location(&self.config.storage, &run_uuid.to_string()) {
            Ok(location) => info!(%location, "default outputs written"),
            Err(err) => warn!(error = %err, "cannot describe default output location"),
        }
    }
}
