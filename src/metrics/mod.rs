//! In-process request metrics

mod collector;

pub use collector::{MetricsCollector, MetricsSnapshot, OperationMetrics};

/// Latency samples kept per operation.
pub(crate) const MAX_METRICS_HISTORY: usize = 1000;
