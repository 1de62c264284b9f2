// rust/batch-core/src/metrics/registry.rs

use std::collections::BTreeMap;

use tracing::{debug, info};

use super::reducer::{MetricValue, Reducer};
use super::sink::MetricsSink;
use crate::distributed::DistributedContext;
use crate::error::{BatchError, Result};

/// Identifies a registered reducer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReducerId(usize);

/// Object-safe view of a [`Reducer`] that moves partials as bytes.
trait ErasedReducer: Send {
    fn accumulate(&mut self, sample: f64);
    fn encode_partial(&self) -> Result<Vec<u8>>;
    fn combine_encoded(&self, partials: &[Vec<u8>]) -> Result<Option<MetricValue>>;
}

impl<R: Reducer> ErasedReducer for R {
    fn accumulate(&mut self, sample: f64) {
        Reducer::accumulate(self, sample);
    }

    fn encode_partial(&self) -> Result<Vec<u8>> {
        bincode::serialize(&self.partial())
            .map_err(|e| BatchError::serialization(format!("failed to encode partial: {e}")))
    }

    fn combine_encoded(&self, partials: &[Vec<u8>]) -> Result<Option<MetricValue>> {
        let decoded = partials
            .iter()
            .map(|bytes| {
                bincode::deserialize(bytes).map_err(|e| {
                    BatchError::serialization(format!("failed to decode partial: {e}"))
                })
            })
            .collect::<Result<Vec<R::Partial>>>()?;
        self.combine(decoded)
    }
}

struct Entry {
    name: String,
    reducer: Box<dyn ErasedReducer>,
}

/// This rank's registered reducers.
///
/// Every rank must register the same reducers in the same order.
#[derive(Default)]
pub struct MetricsReducer {
    entries: Vec<Entry>,
}

impl MetricsReducer {
    pub fn new() -> Self {
        Self::default()
    }

    /// # Errors
    ///
    /// Returns a configuration error if `name` is empty or already taken.
    pub fn register<R>(&mut self, name: impl Into<String>, reducer: R) -> Result<ReducerId>
    where
        R: Reducer + 'static,
    {
        let name = name.into();
        if name.is_empty() {
            return Err(BatchError::config("reducer name must not be empty"));
        }
        if self.entries.iter().any(|e| e.name == name) {
            return Err(BatchError::config(format!(
                "reducer '{name}' is already registered"
            )));
        }
        self.entries.push(Entry {
            name,
            reducer: Box::new(reducer),
        });
        Ok(ReducerId(self.entries.len() - 1))
    }

    pub fn accumulate(&mut self, id: ReducerId, sample: f64) -> Result<()> {
        let entry = self
            .entries
            .get_mut(id.0)
            .ok_or_else(|| BatchError::processor(format!("unknown reducer id {}", id.0)))?;
        entry.reducer.accumulate(sample);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Gathers partials to the chief, which combines and reports them.
    ///
    /// With no reducers registered this is a no-op and makes no collective
    /// call. Returns the reported metrics on the chief and `None` elsewhere.
    pub fn finalize(
        &self,
        ctx: &DistributedContext,
        sink: &dyn MetricsSink,
        group: &str,
        steps_completed: u64,
    ) -> Result<Option<BTreeMap<String, f64>>> {
        if self.entries.is_empty() {
            return Ok(None);
        }

        let partials = self
            .entries
            .iter()
            .map(|e| {
                e.reducer
                    .encode_partial()
                    .map_err(|err| reducer_error(&e.name, err))
            })
            .collect::<Result<Vec<_>>>()?;

        let Some(per_rank) = ctx.gather(&partials)? else {
            debug!(rank = ctx.rank(), "sent metric partials to chief");
            return Ok(None);
        };

        let metrics = self.combine(&per_rank, ctx.rank())?;
        sink.report(group, steps_completed, &metrics)?;
        info!(
            group,
            steps_completed,
            metrics = metrics.len(),
            "reported reduced metrics"
        );
        Ok(Some(metrics))
    }

    fn combine(&self, per_rank: &[Vec<Vec<u8>>], rank: u32) -> Result<BTreeMap<String, f64>> {
        if let Some((r, p)) = per_rank
            .iter()
            .enumerate()
            .find(|(_, p)| p.len() != self.entries.len())
        {
            return Err(BatchError::collective(
                rank,
                format!(
                    "rank {r} registered {} reducers, expected {}",
                    p.len(),
                    self.entries.len()
                ),
            ));
        }

        let mut metrics = BTreeMap::new();
        for (i, entry) in self.entries.iter().enumerate() {
            let column: Vec<Vec<u8>> = per_rank.iter().map(|p| p[i].clone()).collect();
            let value = entry
                .reducer
                .combine_encoded(&column)
                .map_err(|err| reducer_error(&entry.name, err))?;
            match value {
                Some(MetricValue::Scalar(v)) => {
                    metrics.insert(entry.name.clone(), v);
                }
                Some(MetricValue::Map(map)) => {
                    for (key, v) in map {
                        metrics.insert(format!("{}_{key}", entry.name), v);
                    }
                }
                None => {}
            }
        }
        Ok(metrics)
    }
}

fn reducer_error(name: &str, err: BatchError) -> BatchError {
    BatchError::processor_with_source(format!("reducer '{name}' failed"), err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::LocalFabric;
    use crate::metrics::{HistogramReducer, MeanReducer, MemorySink, SumReducer};
    use std::thread;

    struct FailingReducer;

    impl Reducer for FailingReducer {
        type Partial = ();

        fn accumulate(&mut self, _sample: f64) {}

        fn partial(&self) {}

        fn combine(&self, _partials: Vec<()>) -> Result<Option<MetricValue>> {
            Err(BatchError::processor("bad partials"))
        }
    }

    #[test]
    fn test_register_rejects_duplicates() {
        let mut reducers = MetricsReducer::new();
        reducers.register("loss", SumReducer::new()).unwrap();
        assert!(reducers.register("loss", MeanReducer::new()).is_err());
        assert!(reducers.register("", MeanReducer::new()).is_err());
        assert_eq!(reducers.len(), 1);
    }

    #[test]
    fn test_empty_finalize_is_noop() {
        let sink = MemorySink::new();
        let reducers = MetricsReducer::new();

        // A two-rank context with no peer would block on any collective
        let mut endpoints = LocalFabric::new(2);
        let ctx = DistributedContext::from_local(endpoints.remove(0)).unwrap();

        assert!(reducers.finalize(&ctx, &sink, "validation", 3).unwrap().is_none());
        assert!(sink.reports().is_empty());
    }

    #[test]
    fn test_finalize_across_ranks() {
        let sink = MemorySink::new();
        let handles: Vec<_> = LocalFabric::new(2)
            .into_iter()
            .map(|t| {
                let sink = sink.clone();
                thread::spawn(move || {
                    let ctx = DistributedContext::from_local(t).unwrap();
                    let mut reducers = MetricsReducer::new();
                    let total = reducers.register("total", SumReducer::new()).unwrap();
                    let avg = reducers.register("avg", MeanReducer::new()).unwrap();
                    let hist = reducers
                        .register("hist", HistogramReducer::new(vec![1.0]).unwrap())
                        .unwrap();

                    let samples: &[f64] = if ctx.is_chief() { &[1.0, 2.0] } else { &[3.0] };
                    for &s in samples {
                        reducers.accumulate(total, s).unwrap();
                        reducers.accumulate(avg, s).unwrap();
                        reducers.accumulate(hist, s).unwrap();
                    }
                    reducers.finalize(&ctx, &sink, "validation", 6).unwrap()
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let metrics = results[0].clone().unwrap();
        assert!(results[1].is_none());
        assert_eq!(metrics["total"], 6.0);
        assert_eq!(metrics["avg"], 2.0);
        assert_eq!(metrics["hist_le_1"], 1.0);
        assert_eq!(metrics["hist_le_inf"], 2.0);

        let reports = sink.reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].group, "validation");
        assert_eq!(reports[0].steps_completed, 6);
    }

    #[test]
    fn test_reducer_error_names_reducer() {
        let mut reducers = MetricsReducer::new();
        reducers.register("broken", FailingReducer).unwrap();

        let err = reducers
            .finalize(&DistributedContext::single(), &MemorySink::new(), "validation", 1)
            .unwrap_err();
        assert!(err.to_string().contains("reducer 'broken' failed"));
    }

    #[test]
    fn test_unknown_reducer_id() {
        let mut reducers = MetricsReducer::new();
        assert!(reducers.accumulate(ReducerId(3), 1.0).is_err());
    }
}
