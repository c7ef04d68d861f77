use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Serialize;

use super::MAX_METRICS_HISTORY;

/// Collects request counts, errors and latencies per operation.
pub struct MetricsCollector {
    state: RwLock<BTreeMap<&'static str, OperationState>>,
    start_time: Instant,
    history: usize,
}

#[derive(Debug, Default)]
struct OperationState {
    total_requests: u64,
    total_errors: u64,
    error_types: BTreeMap<String, u64>,
    latencies: VecDeque<Duration>,
}

/// Serializable view of one operation's metrics. Latencies in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationMetrics {
    pub total_requests: u64,
    pub total_errors: u64,
    pub error_rate: f64,
    pub average_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub p99_latency_ms: f64,
    pub error_types: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub operations: BTreeMap<&'static str, OperationMetrics>,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::with_history(MAX_METRICS_HISTORY)
    }

    /// Keep at most `history` latency samples per operation.
    pub fn with_history(history: usize) -> Self {
        Self {
            state: RwLock::new(BTreeMap::new()),
            start_time: Instant::now(),
            history: history.max(1),
        }
    }

    pub fn record_success(&self, operation: &'static str, latency: Duration) {
        let mut state = self.state.write();
        let op = state.entry(operation).or_default();
        op.total_requests += 1;
        Self::push_latency(op, latency, self.history);
    }

    /// Record a failed request, bucketed by `error_type`.
    pub fn record_error(&self, operation: &'static str, error_type: &str, latency: Duration) {
        let mut state = self.state.write();
        let op = state.entry(operation).or_default();
        op.total_requests += 1;
        op.total_errors += 1;
        *op.error_types.entry(error_type.to_string()).or_default() += 1;
        Self::push_latency(op, latency, self.history);
    }

    fn push_latency(op: &mut OperationState, latency: Duration, history: usize) {
        if op.latencies.len() == history {
            op.latencies.pop_front();
        }
        op.latencies.push_back(latency);
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let state = self.state.read();
        let operations = state
            .iter()
            .map(|(name, op)| (*name, Self::summarize(op)))
            .collect();
        MetricsSnapshot {
            uptime_secs: self.uptime().as_secs(),
            operations,
        }
    }

    fn summarize(op: &OperationState) -> OperationMetrics {
        let mut latencies: Vec<f64> = op.latencies.iter().map(|d| d.as_secs_f64() * 1000.0).collect();
        latencies.sort_by(|a, b| a.total_cmp(b));

        let average_latency_ms = if latencies.is_empty() {
            0.0
        } else {
            latencies.iter().sum::<f64>() / latencies.len() as f64
        };

        OperationMetrics {
            total_requests: op.total_requests,
            total_errors: op.total_errors,
            error_rate: if op.total_requests > 0 {
                op.total_errors as f64 / op.total_requests as f64
            } else {
                0.0
            },
            average_latency_ms,
            p95_latency_ms: percentile(&latencies, 0.95),
            p99_latency_ms: percentile(&latencies, 0.99),
            error_types: op.error_types.clone(),
        }
    }
}

/// Nearest-rank percentile of sorted samples.
fn percentile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (q * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_and_error_counts() {
        let collector = MetricsCollector::new();
        collector.record_success("classify", Duration::from_millis(10));
        collector.record_error("classify", "timeout", Duration::from_millis(30));
        collector.record_error("classify", "timeout", Duration::from_millis(30));
        collector.record_error("generate", "model_load", Duration::from_millis(5));

        let snapshot = collector.snapshot();
        let classify = &snapshot.operations["classify"];
        assert_eq!(classify.total_requests, 3);
        assert_eq!(classify.total_errors, 2);
        assert_eq!(classify.error_types["timeout"], 2);
        assert!((classify.error_rate - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(snapshot.operations["generate"].error_rate, 1.0);
    }

    #[test]
    fn test_latency_percentiles() {
        let collector = MetricsCollector::new();
        for i in 1..=100 {
            collector.record_success("generate", Duration::from_millis(i));
        }

        let generate = &collector.snapshot().operations["generate"];
        assert!((generate.average_latency_ms - 50.5).abs() < 1e-6);
        assert!((generate.p95_latency_ms - 95.0).abs() < 1e-6);
        assert!((generate.p99_latency_ms - 99.0).abs() < 1e-6);
    }

    #[test]
    fn test_history_is_bounded() {
        let collector = MetricsCollector::with_history(10);
        for i in 0..50 {
            collector.record_success("route", Duration::from_millis(i));
        }
        let route = &collector.snapshot().operations["route"];
        assert_eq!(route.total_requests, 50);
        // Only the last ten samples (40..50 ms) remain.
        assert!(route.average_latency_ms >= 40.0);
    }

    #[test]
    fn test_empty_snapshot() {
        let snapshot = MetricsCollector::new().snapshot();
        assert!(snapshot.operations.is_empty());
        assert_eq!(percentile(&[], 0.99), 0.0);
    }
}
