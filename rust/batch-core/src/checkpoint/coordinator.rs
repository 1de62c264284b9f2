// rust/batch-core/src/checkpoint/coordinator.rs

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use super::format::CheckpointRecord;
use super::store::{CheckpointHandle, CheckpointStore};
use crate::distributed::DistributedContext;
use crate::error::{BatchError, Result};

/// Where a run starts: how many local batches to skip and the run identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResumePoint {
    pub steps_to_skip: u64,
    pub run_uuid: Uuid,
}

/// What the chief broadcasts at resume.
#[derive(Debug, Serialize, Deserialize)]
struct ResumeSeed {
    run_uuid: Uuid,
    handle: Option<String>,
}

/// Agrees on a globally safe progress value and persists it.
///
/// Every rank holds one; only the chief writes to the store.
pub struct CheckpointCoordinator {
    store: Box<dyn CheckpointStore>,
    interval: u64,
    run_uuid: Option<Uuid>,
    last_saved: Option<u64>,
}

impl CheckpointCoordinator {
    /// # Errors
    ///
    /// Returns a configuration error if `interval` is zero.
    pub fn new(store: Box<dyn CheckpointStore>, interval: u64) -> Result<Self> {
        if interval == 0 {
            return Err(BatchError::config(
                "checkpoint_interval should be a positive integer",
            ));
        }
        Ok(Self {
            store,
            interval,
            run_uuid: None,
            last_saved: None,
        })
    }

    /// Establishes the run identity and resume position.
    ///
    /// The chief generates a fresh run UUID and, when `handle` is `None` and
    /// `resume_from_latest` is set, looks up the newest record. Both are
    /// broadcast so every rank loads the same record.
    pub fn resume(
        &mut self,
        ctx: &DistributedContext,
        handle: Option<&CheckpointHandle>,
        resume_from_latest: bool,
    ) -> Result<ResumePoint> {
        let seed = if ctx.is_chief() {
            let handle = match handle {
                Some(h) => Some(h.clone()),
                None if resume_from_latest => self.store.latest()?,
                None => None,
            };
            Some(ResumeSeed {
                run_uuid: Uuid::new_v4(),
                handle: handle.map(|h| h.as_str().to_string()),
            })
        } else {
            None
        };
        let seed: ResumeSeed = ctx.broadcast(seed)?;

        let point = match seed.handle.map(CheckpointHandle::new) {
            Some(handle) => {
                let record = self.store.load(&handle)?;
                info!(
                    checkpoint = %handle,
                    steps_completed = record.steps_completed,
                    run_uuid = %record.run_uuid,
                    "resuming from checkpoint"
                );
                self.last_saved = Some(record.steps_completed);
                ResumePoint {
                    steps_to_skip: record.steps_completed,
                    run_uuid: record.run_uuid,
                }
            }
            None => ResumePoint {
                steps_to_skip: 0,
                run_uuid: seed.run_uuid,
            },
        };

        self.run_uuid = Some(point.run_uuid);
        Ok(point)
    }

    pub fn interval(&self) -> u64 {
        self.interval
    }

    pub fn is_checkpoint_due(&self, batch_index: u64) -> bool {
        (batch_index + 1) % self.interval == 0
    }

    /// Steps recorded by the most recent checkpoint this rank took part in.
    pub fn last_saved(&self) -> Option<u64> {
        self.last_saved
    }

    /// Gathers every rank's progress; the chief persists the minimum.
    ///
    /// Returns the stored value and, on the chief, the new handle.
    pub fn checkpoint(
        &mut self,
        ctx: &DistributedContext,
        steps_completed: u64,
    ) -> Result<(u64, Option<CheckpointHandle>)> {
        let run_uuid = self
            .run_uuid
            .ok_or_else(|| BatchError::checkpoint("checkpoint before resume"))?;

        let gathered = ctx.gather(&steps_completed)?;
        let Some(all_steps) = gathered else {
            // Workers do not learn the minimum; their own count bounds it.
            self.last_saved = Some(steps_completed);
            return Ok((steps_completed, None));
        };

        let min_steps = all_steps.iter().copied().min().unwrap_or(steps_completed);
        let handle = self.store.save(&CheckpointRecord::new(min_steps, run_uuid))?;
        debug!(checkpoint = %handle, steps_completed = min_steps, "saved progress");
        self.last_saved = Some(min_steps);
        Ok((min_steps, Some(handle)))
    }
}
