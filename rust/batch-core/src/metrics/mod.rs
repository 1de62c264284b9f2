// rust/batch-core/src/metrics/mod.rs

//! Metric reduction across ranks.
//!
//! Processors register [`Reducer`]s with the rank's [`MetricsReducer`] and
//! feed samples as they go. At the end of the run every rank sends its
//! partials to the chief, which combines them and reports the result to a
//! [`MetricsSink`].

mod reducer;
mod registry;
mod sink;

pub use reducer::{HistogramReducer, MeanReducer, MetricValue, Reducer, SumReducer};
pub use registry::{MetricsReducer, ReducerId};
pub use sink::{JsonlSink, LogSink, MemorySink, MetricsReport, MetricsSink, SinkEvent};
