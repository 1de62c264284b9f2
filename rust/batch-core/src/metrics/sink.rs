// rust/batch-core/src/metrics/sink.rs

//! Destinations for reduced metrics and run progress.
//!
//! Only the chief reports. Sinks receive three kinds of events: reduced
//! metrics under a group label, fractional progress after each checkpoint,
//! and a final completion notice.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{BatchError, Result};
use crate::storage::{self, StorageBackend};

pub trait MetricsSink: Send + Sync {
    fn report(&self, group: &str, steps_completed: u64, metrics: &BTreeMap<String, f64>)
        -> Result<()>;

    /// Fraction of the dataset processed so far, in `0.0..=1.0`.
    fn report_progress(&self, completion: f64) -> Result<()> {
        let _ = completion;
        Ok(())
    }

    fn report_completed(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsReport {
    pub group: String,
    pub steps_completed: u64,
    pub metrics: BTreeMap<String, f64>,
}

#[derive(Debug, Default)]
struct SinkLog {
    reports: Vec<MetricsReport>,
    progress: Vec<f64>,
    completed: bool,
}

/// Keeps every event in memory. Clones share the same log.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    log: Arc<Mutex<SinkLog>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, SinkLog>> {
        self.log
            .lock()
            .map_err(|_| BatchError::processor("metrics sink lock poisoned"))
    }

    pub fn reports(&self) -> Vec<MetricsReport> {
        self.lock().map(|l| l.reports.clone()).unwrap_or_default()
    }

    pub fn progress(&self) -> Vec<f64> {
        self.lock().map(|l| l.progress.clone()).unwrap_or_default()
    }

    pub fn completed(&self) -> bool {
        self.lock().map(|l| l.completed).unwrap_or(false)
    }
}

impl MetricsSink for MemorySink {
    fn report(
        &self,
        group: &str,
        steps_completed: u64,
        metrics: &BTreeMap<String, f64>,
    ) -> Result<()> {
        self.lock()?.reports.push(MetricsReport {
            group: group.to_string(),
            steps_completed,
            metrics: metrics.clone(),
        });
        Ok(())
    }

    fn report_progress(&self, completion: f64) -> Result<()> {
        self.lock()?.progress.push(completion);
        Ok(())
    }

    fn report_completed(&self) -> Result<()> {
        self.lock()?.completed = true;
        Ok(())
    }
}

/// One line of a [`JsonlSink`] file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SinkEvent {
    Metrics {
        group: String,
        steps_completed: u64,
        metrics: BTreeMap<String, f64>,
        at: DateTime<Utc>,
    },
    Progress {
        completion: f64,
        at: DateTime<Utc>,
    },
    Completed {
        at: DateTime<Utc>,
    },
}

/// Writes one JSON object per event to a file on a storage backend.
///
/// Backends have no append, so the file is rewritten with every event;
/// event counts per run are small. Events already in the file are kept, so a
/// resumed run extends the log of the attempt it resumes.
pub struct JsonlSink {
    storage: Arc<dyn StorageBackend>,
    path: PathBuf,
    buffer: Mutex<Vec<u8>>,
}

impl JsonlSink {
    pub fn new(storage: Arc<dyn StorageBackend>, path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut buffer = if storage.exists(&path)? {
            storage::read_all(&*storage, &path)?
        } else {
            Vec::new()
        };
        if buffer.last().is_some_and(|b| *b != b'\n') {
            buffer.push(b'\n');
        }

        Ok(Self {
            storage,
            path,
            buffer: Mutex::new(buffer),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, event: &SinkEvent) -> Result<()> {
        let mut line = serde_json::to_vec(event)
            .map_err(|e| BatchError::serialization(format!("failed to encode event: {e}")))?;
        line.push(b'\n');

        let mut buffer = self
            .buffer
            .lock()
            .map_err(|_| BatchError::storage(&self.path, "sink buffer lock poisoned"))?;
        buffer.extend_from_slice(&line);
        storage::write_all(&*self.storage, &self.path, &buffer)
    }
}

impl MetricsSink for JsonlSink {
    fn report(
        &self,
        group: &str,
        steps_completed: u64,
        metrics: &BTreeMap<String, f64>,
    ) -> Result<()> {
        self.append(&SinkEvent::Metrics {
            group: group.to_string(),
            steps_completed,
            metrics: metrics.clone(),
            at: Utc::now(),
        })
    }

    fn report_progress(&self, completion: f64) -> Result<()> {
        self.append(&SinkEvent::Progress {
            completion,
            at: Utc::now(),
        })
    }

    fn report_completed(&self) -> Result<()> {
        self.append(&SinkEvent::Completed { at: Utc::now() })
    }
}

/// Emits events as `tracing` records.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl MetricsSink for LogSink {
    fn report(
        &self,
        group: &str,
        steps_completed: u64,
        metrics: &BTreeMap<String, f64>,
    ) -> Result<()> {
        for (name, value) in metrics {
            info!(group, steps_completed, metric = %name, value, "metric");
        }
        Ok(())
    }

    fn report_progress(&self, completion: f64) -> Result<()> {
        info!(completion, "progress");
        Ok(())
    }

    fn report_completed(&self) -> Result<()> {
        info!("run completed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn metrics() -> BTreeMap<String, f64> {
        BTreeMap::from([("accuracy".to_string(), 0.75)])
    }

    #[test]
    fn test_memory_sink_shared_between_clones() {
        let sink = MemorySink::new();
        let other = sink.clone();

        other.report("validation", 4, &metrics()).unwrap();
        other.report_progress(0.5).unwrap();
        other.report_completed().unwrap();

        assert_eq!(sink.reports()[0].metrics["accuracy"], 0.75);
        assert_eq!(sink.progress(), vec![0.5]);
        assert!(sink.completed());
    }

    #[test]
    fn test_jsonl_sink_appends_lines() {
        let storage = MemoryStorage::new();
        let sink = JsonlSink::new(Arc::new(storage.clone()), "metrics/run.jsonl").unwrap();

        sink.report("validation", 4, &metrics()).unwrap();
        sink.report_progress(1.0).unwrap();
        sink.report_completed().unwrap();

        let bytes = storage::read_all(&storage, Path::new("metrics/run.jsonl")).unwrap();
        let events: Vec<SinkEvent> = String::from_utf8(bytes)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();

        assert_eq!(events.len(), 3);
        match &events[0] {
            SinkEvent::Metrics {
                group,
                steps_completed,
                metrics,
                ..
            } => {
                assert_eq!(group, "validation");
                assert_eq!(*steps_completed, 4);
                assert_eq!(metrics["accuracy"], 0.75);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(matches!(events[1], SinkEvent::Progress { completion, .. } if completion == 1.0));
        assert!(matches!(events[2], SinkEvent::Completed { .. }));
    }

    #[test]
    fn test_jsonl_sink_keeps_events_of_earlier_attempt() {
        let storage = MemoryStorage::new();
        let path = Path::new("metrics/run.jsonl");

        let first = JsonlSink::new(Arc::new(storage.clone()), path).unwrap();
        first.report("validation", 2, &metrics()).unwrap();
        first.report_progress(0.25).unwrap();
        drop(first);

        let resumed = JsonlSink::new(Arc::new(storage.clone()), path).unwrap();
        resumed.report("validation", 8, &metrics()).unwrap();

        let text = String::from_utf8(storage::read_all(&storage, path).unwrap()).unwrap();
        let events: Vec<SinkEvent> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], SinkEvent::Metrics { steps_completed: 2, .. }));
        assert!(matches!(events[1], SinkEvent::Progress { .. }));
        assert!(matches!(events[2], SinkEvent::Metrics { steps_completed: 8, .. }));
    }

    #[test]
    fn test_log_sink_accepts_everything() {
        let sink = LogSink;
        sink.report("validation", 1, &metrics()).unwrap();
        sink.report_progress(0.1).unwrap();
        sink.report_completed().unwrap();
    }
}
