// rust/batch-core/src/metrics/reducer.rs

//! Two-phase metric reducers.
//!
//! Each rank accumulates samples into a bounded partial; at the end of the
//! run the chief combines every rank's partial. `combine` must not depend on
//! the order of the partials.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{BatchError, Result};

/// A combined metric.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricValue {
    Scalar(f64),
    /// Named sub-values, reported as `<reducer>_<key>`.
    Map(BTreeMap<String, f64>),
}

pub trait Reducer: Send {
    type Partial: Serialize + DeserializeOwned;

    fn accumulate(&mut self, sample: f64);

    /// This rank's partial reduction.
    fn partial(&self) -> Self::Partial;

    /// Combines every rank's partial. Returns `None` when there is nothing
    /// to report (e.g. a mean over zero samples).
    fn combine(&self, partials: Vec<Self::Partial>) -> Result<Option<MetricValue>>;
}

#[derive(Debug, Clone, Default)]
pub struct SumReducer {
    sum: f64,
}

impl SumReducer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Reducer for SumReducer {
    type Partial = f64;

    fn accumulate(&mut self, sample: f64) {
        self.sum += sample;
    }

    fn partial(&self) -> f64 {
        self.sum
    }

    fn combine(&self, partials: Vec<f64>) -> Result<Option<MetricValue>> {
        Ok(Some(MetricValue::Scalar(partials.into_iter().sum())))
    }
}

#[derive(Debug, Clone, Default)]
pub struct MeanReducer {
    sum: f64,
    count: u64,
}

impl MeanReducer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Reducer for MeanReducer {
    type Partial = (f64, u64);

    fn accumulate(&mut self, sample: f64) {
        self.sum += sample;
        self.count += 1;
    }

    fn partial(&self) -> (f64, u64) {
        (self.sum, self.count)
    }

    fn combine(&self, partials: Vec<(f64, u64)>) -> Result<Option<MetricValue>> {
        let (sum, count) = partials
            .into_iter()
            .fold((0.0, 0u64), |(s, c), (ps, pc)| (s + ps, c + pc));
        Ok((count > 0).then(|| MetricValue::Scalar(sum / count as f64)))
    }
}

/// Counts samples into buckets bounded above by `edges`; one extra bucket
/// holds samples above the last edge.
#[derive(Debug, Clone)]
pub struct HistogramReducer {
    edges: Vec<f64>,
    counts: Vec<u64>,
}

impl HistogramReducer {
    /// # Errors
    ///
    /// Returns a configuration error unless `edges` is non-empty, finite and
    /// strictly increasing.
    pub fn new(edges: Vec<f64>) -> Result<Self> {
        if edges.is_empty() || edges.iter().any(|e| !e.is_finite()) {
            return Err(BatchError::config(
                "histogram edges must be non-empty and finite",
            ));
        }
        if edges.windows(2).any(|w| w[0] >= w[1]) {
            return Err(BatchError::config(
                "histogram edges must be strictly increasing",
            ));
        }
        let counts = vec![0; edges.len() + 1];
        Ok(Self { edges, counts })
    }

    fn labels(&self) -> impl Iterator<Item = String> + '_ {
        self.edges
            .iter()
            .map(|e| format!("le_{e}"))
            .chain(std::iter::once("le_inf".to_string()))
    }
}

impl Reducer for HistogramReducer {
    type Partial = Vec<u64>;

    fn accumulate(&mut self, sample: f64) {
        let bucket = self.edges.partition_point(|&edge| edge < sample);
        self.counts[bucket] += 1;
    }

    fn partial(&self) -> Vec<u64> {
        self.counts.clone()
    }

    fn combine(&self, partials: Vec<Vec<u64>>) -> Result<Option<MetricValue>> {
        let mut totals = vec![0u64; self.counts.len()];
        for partial in partials {
            if partial.len() != totals.len() {
                return Err(BatchError::processor(format!(
                    "histogram partial has {} buckets, expected {}",
                    partial.len(),
                    totals.len()
                )));
            }
            for (total, count) in totals.iter_mut().zip(partial) {
                *total += count;
            }
        }
        let map = self
            .labels()
            .zip(totals)
            .map(|(label, count)| (label, count as f64))
            .collect();
        Ok(Some(MetricValue::Map(map)))
    }
}
