// rust/batch-core/src/preempt.rs

//! Cooperative preemption.
//!
//! The run only asks whether to stop right after a checkpoint, so stopping
//! never loses more than the in-flight interval. A [`PreemptSignal`] is the
//! source of truth (a flag set by a signal handler, a file dropped by the
//! launcher); [`PreemptionMonitor`] decides who polls it.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::info;

use crate::distributed::DistributedContext;
use crate::error::Result;
use crate::storage::StorageBackend;

/// Answers whether the run has been asked to stop. Must not block.
pub trait PreemptSignal: Send + Sync {
    fn should_preempt(&self) -> Result<bool>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NeverPreempt;

impl PreemptSignal for NeverPreempt {
    fn should_preempt(&self) -> Result<bool> {
        Ok(false)
    }
}

/// A shared flag, typically set from a signal handler.
#[derive(Debug, Clone, Default)]
pub struct FlagSignal {
    flag: Arc<AtomicBool>,
}

impl FlagSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_flag(flag: Arc<AtomicBool>) -> Self {
        Self { flag }
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.flag)
    }
}

impl PreemptSignal for FlagSignal {
    fn should_preempt(&self) -> Result<bool> {
        Ok(self.flag.load(Ordering::SeqCst))
    }
}

/// Preempts once a sentinel object exists on a storage backend.
pub struct SentinelFileSignal {
    storage: Arc<dyn StorageBackend>,
    path: PathBuf,
}

impl SentinelFileSignal {
    pub fn new(storage: Arc<dyn StorageBackend>, path: impl Into<PathBuf>) -> Self {
        Self {
            storage,
            path: path.into(),
        }
    }
}

impl PreemptSignal for SentinelFileSignal {
    fn should_preempt(&self) -> Result<bool> {
        self.storage.exists(&self.path)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PreemptionMode {
    /// The chief polls the signal and broadcasts its answer, so every rank
    /// stops at the same boundary.
    #[default]
    WorkersAskChief,
    /// Every rank polls the signal itself. Only safe when the signal is
    /// guaranteed to read the same on every rank.
    WorkersAskSource,
}

pub struct PreemptionMonitor {
    signal: Box<dyn PreemptSignal>,
    mode: PreemptionMode,
    preempted: bool,
}

impl PreemptionMonitor {
    pub fn new(signal: Box<dyn PreemptSignal>, mode: PreemptionMode) -> Self {
        Self {
            signal,
            mode,
            preempted: false,
        }
    }

    pub fn never() -> Self {
        Self::new(Box::new(NeverPreempt), PreemptionMode::default())
    }

    pub fn mode(&self) -> PreemptionMode {
        self.mode
    }

    /// Once this returns true it keeps returning true without polling again.
    ///
    /// In `WorkersAskChief` mode this is a collective call until the first
    /// true answer.
    pub fn should_preempt(&mut self, ctx: &DistributedContext) -> Result<bool> {
        if self.preempted {
            return Ok(true);
        }

        let decision = match self.mode {
            PreemptionMode::WorkersAskChief => {
                let local = if ctx.is_chief() {
                    Some(self.signal.should_preempt()?)
                } else {
                    None
                };
                ctx.broadcast(local)?
            }
            PreemptionMode::WorkersAskSource => self.signal.should_preempt()?,
        };

        if decision {
            info!(rank = ctx.rank(), "preemption requested");
            self.preempted = true;
        }
        Ok(decision)
    }
}
