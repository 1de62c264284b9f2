// rust/batch-core/tests/batch_run.rs

//! Multi-rank runs with every rank on its own thread.

use std::net::TcpListener;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use batch_core::checkpoint::{
    CheckpointHandle, CheckpointRecord, CheckpointStore, FileCheckpointStore,
};
use batch_core::config::{CheckpointConfig, StorageBackendType};
use batch_core::dataset::{InMemoryDataset, NewlineDelimitedFormat, RecordFileDataset};
use batch_core::distributed::{DistributedContext, LocalFabric, GrpcTransport};
use batch_core::metrics::{JsonlSink, MeanReducer, MemorySink, ReducerId, SinkEvent, SumReducer};
use batch_core::preempt::{FlagSignal, PreemptionMode, PreemptionMonitor};
use batch_core::storage::{read_all, write_all, LocalStorage, MemoryStorage};
use batch_core::{
    Batch, BatchError, BatchProcessor, BatchRun, ProcessorContext, Result, RunConfig, RunOutcome,
    RunState, StorageBackend,
};
use tempfile::TempDir;

/// Runs `f` once per rank over an in-process fabric and returns the results
/// in rank order.
fn run_ranks<T, F>(world_size: u32, f: F) -> Vec<T>
where
    T: Send,
    F: Fn(DistributedContext) -> T + Sync,
{
    thread::scope(|s| {
        let handles: Vec<_> = LocalFabric::new(world_size)
            .into_iter()
            .map(|t| {
                let f = &f;
                s.spawn(move || f(DistributedContext::from_local(t).unwrap()))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    })
}

fn memory_config(interval: i64, batch_size: u64) -> RunConfig {
    let mut config = RunConfig::default();
    config.run.checkpoint_interval = interval;
    config.run.batch_size = Some(batch_size);
    config.storage.backend = StorageBackendType::Memory;
    config
}

const RUNNING_TOTAL: &str = "running_total";

/// Sums records into reducers and keeps a running total in the rank's
/// output directory at every checkpoint, so a resumed run can pick it up.
struct Tally {
    total: ReducerId,
    avg: ReducerId,
    running: f64,
    seen: Arc<Mutex<Vec<u64>>>,
    fail_at: Option<u64>,
    trigger_at: Option<(u64, FlagSignal)>,
}

impl Tally {
    fn build(ctx: &mut ProcessorContext, seen: Arc<Mutex<Vec<u64>>>) -> Result<Self> {
        let total = ctx.register_reducer("total", SumReducer::new())?;
        let avg = ctx.register_reducer("avg", MeanReducer::new())?;

        let path = ctx.default_output_dir()?.join(RUNNING_TOTAL);
        let mut running = 0.0;
        if ctx.storage().exists(&path)? {
            let bytes = read_all(&**ctx.storage(), &path)?;
            running = String::from_utf8_lossy(&bytes)
                .parse()
                .map_err(|_| BatchError::processor("corrupt running total"))?;
            ctx.accumulate(total, running)?;
        }

        Ok(Self {
            total,
            avg,
            running,
            seen,
            fail_at: None,
            trigger_at: None,
        })
    }
}

impl BatchProcessor<u32> for Tally {
    fn process_batch(
        &mut self,
        ctx: &mut ProcessorContext,
        batch: Batch<u32>,
        batch_index: u64,
    ) -> Result<()> {
        if self.fail_at == Some(batch_index) {
            return Err(BatchError::processor("simulated crash"));
        }
        for &item in &batch.items {
            let sample = f64::from(item);
            ctx.accumulate(self.total, sample)?;
            ctx.accumulate(self.avg, sample)?;
            self.running += sample;
        }
        self.seen.lock().unwrap().push(batch_index);
        if let Some((at, signal)) = &self.trigger_at {
            if *at == batch_index {
                signal.trigger();
            }
        }
        Ok(())
    }

    fn on_checkpoint_start(&mut self, ctx: &mut ProcessorContext, _steps: u64) -> Result<()> {
        let path = ctx.default_output_dir()?.join(RUNNING_TOTAL);
        write_all(&**ctx.storage(), &path, self.running.to_string().as_bytes())
    }
}

/// Records every value the chief persists.
struct RecordingStore {
    inner: FileCheckpointStore,
    saved: Arc<Mutex<Vec<u64>>>,
}

impl CheckpointStore for RecordingStore {
    fn save(&self, record: &CheckpointRecord) -> Result<CheckpointHandle> {
        self.saved.lock().unwrap().push(record.steps_completed);
        self.inner.save(record)
    }

    fn load(&self, handle: &CheckpointHandle) -> Result<CheckpointRecord> {
        self.inner.load(handle)
    }

    fn latest(&self) -> Result<Option<CheckpointHandle>> {
        self.inner.latest()
    }
}

fn latest_steps(storage: &MemoryStorage) -> u64 {
    let store =
        FileCheckpointStore::new(Arc::new(storage.clone()), &CheckpointConfig::default()).unwrap();
    let handle = store.latest().unwrap().unwrap();
    store.load(&handle).unwrap().steps_completed
}

#[test]
fn test_uniform_iteration_count_with_padding() {
    let dataset = InMemoryDataset::new((0..10u32).collect());
    let storage = MemoryStorage::new();
    let sink = MemorySink::new();

    let results = run_ranks(2, |ctx| {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let outcome = BatchRun::new(memory_config(5, 2), ctx, &dataset)
            .with_storage(Arc::new(storage.clone()))
            .with_sink(Arc::new(sink.clone()))
            .run({
                let seen = Arc::clone(&seen);
                move |pctx| Tally::build(pctx, seen)
            })
            .unwrap();
        let seen = seen.lock().unwrap().clone();
        (outcome, seen)
    });

    for (outcome, _) in &results {
        assert_eq!(outcome.iterate_length, 3);
        assert_eq!(outcome.steps_completed, 3);
        assert_eq!(outcome.state, RunState::Completed);
    }
    // Rank 1 owns global batches 1 and 3 only; index 2 is padding
    assert_eq!(results[0].1, vec![0, 1, 2]);
    assert_eq!(results[1].1, vec![0, 1]);

    let metrics = results[0].0.metrics.as_ref().unwrap();
    assert_eq!(metrics["total"], 45.0);
    assert!(results[1].0.metrics.is_none());

    // Interval 5 never fires; the final checkpoint records everything
    assert_eq!(latest_steps(&storage), 3);
    assert!(sink.completed());
    assert_eq!(sink.reports().len(), 1);
}

#[test]
fn test_resume_after_crash_matches_uninterrupted_run() {
    let dataset = InMemoryDataset::new((0..24u32).collect());

    let uninterrupted = {
        let storage = MemoryStorage::new();
        run_ranks(2, |ctx| {
            let seen = Arc::new(Mutex::new(Vec::new()));
            BatchRun::new(memory_config(2, 2), ctx, &dataset)
                .with_storage(Arc::new(storage.clone()))
                .run(move |pctx| Tally::build(pctx, seen))
                .unwrap()
        })
    };
    assert_eq!(uninterrupted[0].iterate_length, 6);

    let storage = MemoryStorage::new();
    let crashed = run_ranks(2, |ctx| {
        let seen = Arc::new(Mutex::new(Vec::new()));
        BatchRun::new(memory_config(2, 2), ctx, &dataset)
            .with_storage(Arc::new(storage.clone()))
            .run(move |pctx| {
                let mut tally = Tally::build(pctx, seen)?;
                tally.fail_at = Some(4);
                Ok(tally)
            })
            .unwrap_err()
    });
    for err in &crashed {
        assert!(matches!(
            err,
            BatchError::Processor {
                batch_index: Some(4),
                ..
            }
        ));
    }
    assert_eq!(latest_steps(&storage), 4);

    let mut config = memory_config(2, 2);
    config.run.resume_from_latest = true;
    let resumed = run_ranks(2, |ctx| {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let outcome = BatchRun::new(config.clone(), ctx, &dataset)
            .with_storage(Arc::new(storage.clone()))
            .run({
                let seen = Arc::clone(&seen);
                move |pctx| Tally::build(pctx, seen)
            })
            .unwrap();
        let seen = seen.lock().unwrap().clone();
        (outcome, seen)
    });

    for (outcome, seen) in &resumed {
        assert_eq!(seen, &vec![4, 5]);
        assert_eq!(outcome.steps_completed, 6);
    }
    assert_eq!(
        resumed[0].0.metrics.as_ref().unwrap()["total"],
        uninterrupted[0].metrics.as_ref().unwrap()["total"]
    );
    assert_eq!(resumed[0].0.run_uuid, resumed[1].0.run_uuid);
    assert_eq!(latest_steps(&storage), 6);
}

#[test]
fn test_checkpoints_are_monotonic() {
    let dataset = InMemoryDataset::new((0..14u32).collect());
    let storage = MemoryStorage::new();
    let saved = Arc::new(Mutex::new(Vec::new()));

    run_ranks(2, |ctx| {
        let store = RecordingStore {
            inner: FileCheckpointStore::new(
                Arc::new(storage.clone()),
                &CheckpointConfig::default(),
            )
            .unwrap(),
            saved: Arc::clone(&saved),
        };
        let seen = Arc::new(Mutex::new(Vec::new()));
        BatchRun::new(memory_config(2, 1), ctx, &dataset)
            .with_storage(Arc::new(storage.clone()))
            .with_checkpoint_store(Box::new(store))
            .run(move |pctx| Tally::build(pctx, seen))
            .unwrap()
    });

    // Only the chief writes: one entry per boundary plus the final one
    assert_eq!(*saved.lock().unwrap(), vec![2, 4, 6, 7]);
}

#[test]
fn test_preemption_stops_at_boundary_and_resumes_without_gaps() {
    let dataset = InMemoryDataset::new((0..20u32).collect());
    let storage = MemoryStorage::new();
    let signal = FlagSignal::new();

    let first = run_ranks(2, |ctx| {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let trigger = ctx.is_chief().then(|| (2, signal.clone()));
        let monitor =
            PreemptionMonitor::new(Box::new(signal.clone()), PreemptionMode::WorkersAskChief);
        let outcome = BatchRun::new(memory_config(2, 1), ctx, &dataset)
            .with_storage(Arc::new(storage.clone()))
            .with_preemption(monitor)
            .run({
                let seen = Arc::clone(&seen);
                move |pctx| {
                    let mut tally = Tally::build(pctx, seen)?;
                    tally.trigger_at = trigger;
                    Ok(tally)
                }
            })
            .unwrap();
        let seen = seen.lock().unwrap().clone();
        (outcome, seen)
    });

    for (outcome, seen) in &first {
        assert!(outcome.is_preempted());
        assert_eq!(outcome.steps_completed, 4);
        assert_eq!(seen, &vec![0, 1, 2, 3]);
    }
    assert_eq!(latest_steps(&storage), 4);

    let mut config = memory_config(2, 1);
    config.run.resume_from_latest = true;
    let second = run_ranks(2, |ctx| {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let outcome: RunOutcome = BatchRun::new(config.clone(), ctx, &dataset)
            .with_storage(Arc::new(storage.clone()))
            .run({
                let seen = Arc::clone(&seen);
                move |pctx| Tally::build(pctx, seen)
            })
            .unwrap();
        let seen = seen.lock().unwrap().clone();
        (outcome, seen)
    });

    for ((_, before), (outcome, after)) in first.iter().zip(&second) {
        assert_eq!(outcome.state, RunState::Completed);
        let all: Vec<u64> = before.iter().chain(after).copied().collect();
        assert_eq!(all, (0..10).collect::<Vec<_>>());
    }
    assert_eq!(
        second[0].0.metrics.as_ref().unwrap()["total"],
        (0..20).sum::<u32>() as f64
    );
}

#[test]
fn test_metrics_independent_of_world_size() {
    let dataset = InMemoryDataset::new((0..30u32).collect());

    let metrics_for = |world_size: u32| {
        let storage = MemoryStorage::new();
        let outcomes = run_ranks(world_size, |ctx| {
            let seen = Arc::new(Mutex::new(Vec::new()));
            BatchRun::new(memory_config(2, 4), ctx, &dataset)
                .with_storage(Arc::new(storage.clone()))
                .run(move |pctx| Tally::build(pctx, seen))
                .unwrap()
        });
        outcomes[0].metrics.clone().unwrap()
    };

    let single = metrics_for(1);
    let sharded = metrics_for(3);
    assert_eq!(single["total"], 435.0);
    assert_eq!(single["avg"], 14.5);
    assert_eq!(single, sharded);
}

#[test]
fn test_invalid_loader_options_fail_on_every_rank() {
    let dataset = InMemoryDataset::new((0..8u32).collect());

    let mut conflicting = memory_config(2, 2);
    conflicting.loader.batch_size = Some(2);
    let mut shuffled = memory_config(2, 2);
    shuffled.loader.shuffle = true;

    for config in [conflicting, shuffled] {
        let built = Arc::new(Mutex::new(0));
        let errors = run_ranks(2, |ctx| {
            let built = Arc::clone(&built);
            let mut run = BatchRun::new(config.clone(), ctx, &dataset);
            let err = run
                .run(move |pctx| {
                    *built.lock().unwrap() += 1;
                    Tally::build(pctx, Arc::default())
                })
                .unwrap_err();
            (err, run.state())
        });

        for (err, state) in errors {
            assert!(err.is_config());
            assert_eq!(state, RunState::Init);
        }
        assert_eq!(*built.lock().unwrap(), 0);
    }
}

/// Counts bytes of each record.
struct ByteCounter {
    bytes: ReducerId,
}

impl BatchProcessor<Vec<u8>> for ByteCounter {
    fn process_batch(
        &mut self,
        ctx: &mut ProcessorContext,
        batch: Batch<Vec<u8>>,
        _batch_index: u64,
    ) -> Result<()> {
        for record in &batch.items {
            ctx.accumulate(self.bytes, record.len() as f64)?;
        }
        Ok(())
    }
}

#[test]
fn test_record_file_on_shared_filesystem() {
    let tmp = TempDir::new().unwrap();
    let mut config = RunConfig::default();
    config.storage.base_path = tmp.path().to_path_buf();
    config.run.checkpoint_interval = 2;
    config.loader.batch_size = Some(2);

    let lines: Vec<String> = (1..=7).map(|n| "x".repeat(n)).collect();
    let setup = LocalStorage::new(&config.storage).unwrap();
    write_all(&setup, Path::new("inputs.txt"), lines.join("\n").as_bytes()).unwrap();

    let outcomes = run_ranks(2, |ctx| {
        let storage: Arc<dyn StorageBackend> =
            Arc::new(LocalStorage::new(&config.storage).unwrap());
        let dataset = RecordFileDataset::open(
            &*storage,
            "inputs.txt",
            Arc::new(NewlineDelimitedFormat::new()),
        )
        .unwrap();
        let sink = JsonlSink::new(Arc::clone(&storage), "metrics.jsonl").unwrap();

        BatchRun::new(config.clone(), ctx, &dataset)
            .with_sink(Arc::new(sink))
            .run(|pctx| {
                Ok(ByteCounter {
                    bytes: pctx.register_reducer("bytes", SumReducer::new())?,
                })
            })
            .unwrap()
    });

    // 7 records in batches of 2 make 4 global batches, 2 per rank
    assert_eq!(outcomes[0].iterate_length, 2);
    assert_eq!(outcomes[0].metrics.as_ref().unwrap()["bytes"], 28.0);

    let text = std::fs::read_to_string(tmp.path().join("metrics.jsonl")).unwrap();
    let events: Vec<SinkEvent> = text
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert!(matches!(events.first(), Some(SinkEvent::Progress { .. })));
    assert!(matches!(events.last(), Some(SinkEvent::Completed { .. })));
    assert!(events
        .iter()
        .any(|e| matches!(e, SinkEvent::Metrics { group, .. } if group == "validation")));
    assert!(tmp.path().join("checkpoints").is_dir());
}

#[test]
fn test_run_over_grpc() {
    let dataset = InMemoryDataset::new((0..9u32).collect());
    let storage = MemoryStorage::new();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    let outcomes: Vec<RunOutcome> = thread::scope(|s| {
        let run = |transport: GrpcTransport, rank: u32| {
            let ctx = DistributedContext::new(rank, 2, Box::new(transport)).unwrap();
            let seen = Arc::new(Mutex::new(Vec::new()));
            BatchRun::new(memory_config(1, 2), ctx, &dataset)
                .with_storage(Arc::new(storage.clone()))
                .run(move |pctx| Tally::build(pctx, seen))
                .unwrap()
        };

        let worker = s.spawn(move || {
            let transport =
                GrpcTransport::join(&addr, 1, 2, 20, Duration::from_millis(10)).unwrap();
            run(transport, 1)
        });
        let chief = run(GrpcTransport::serve(listener, 2).unwrap(), 0);
        vec![chief, worker.join().unwrap()]
    });

    assert_eq!(outcomes[0].run_uuid, outcomes[1].run_uuid);
    assert_eq!(outcomes[0].metrics.as_ref().unwrap()["total"], 36.0);
    assert_eq!(latest_steps(&storage), 3);
}
