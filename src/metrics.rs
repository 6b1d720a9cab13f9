//! Metrics collection for observability.
//!
//! Tracks request latency, outcome counts, in-flight depth, stale replies
//! and relayed delegations for one worker handle.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

/// Point-in-time snapshot of all metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    // Counters
    pub requests_total: usize,
    pub requests_success: usize,
    pub requests_failed: usize,
    pub stale_replies: usize,
    pub delegations_relayed: usize,

    // Latency (milliseconds)
    pub latency_avg_ms: f64,
    pub latency_p50_ms: f64,
    pub latency_p95_ms: f64,
    pub latency_p99_ms: f64,
    pub latency_min_ms: f64,
    pub latency_max_ms: f64,

    // In-flight requests
    pub in_flight: usize,
    pub in_flight_max: usize,

    pub timestamp: f64,
}

/// Thread-safe metrics collector for a `WorkerHandle`.
///
/// # Example
///
/// ```rust
/// use workerlink::Metrics;
///
/// let metrics = Metrics::new();
/// let started = metrics.start_request();
/// metrics.end_request(started, true);
///
/// let snapshot = metrics.snapshot();
/// assert_eq!(snapshot.requests_success, 1);
/// ```
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<RwLock<MetricsInner>>,
}

struct MetricsInner {
    max_latency_samples: usize,

    requests_total: usize,
    requests_success: usize,
    requests_failed: usize,
    stale_replies: usize,
    delegations_relayed: usize,

    in_flight: usize,
    in_flight_max: usize,

    // Circular buffer
    latencies: VecDeque<f64>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::with_capacity(1000)
    }

    /// Collector keeping at most `max_latency_samples` latency samples.
    pub fn with_capacity(max_latency_samples: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(MetricsInner {
                max_latency_samples,
                requests_total: 0,
                requests_success: 0,
                requests_failed: 0,
                stale_replies: 0,
                delegations_relayed: 0,
                in_flight: 0,
                in_flight_max: 0,
                latencies: VecDeque::with_capacity(max_latency_samples),
            })),
        }
    }

    /// Start tracking a request. Returns the start instant for `end_request`.
    pub fn start_request(&self) -> Instant {
        let mut inner = self.inner.write();
        inner.requests_total += 1;
        inner.in_flight += 1;
        inner.in_flight_max = inner.in_flight_max.max(inner.in_flight);
        Instant::now()
    }

    /// End tracking a request. Returns latency in milliseconds.
    pub fn end_request(&self, started: Instant, success: bool) -> f64 {
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

        let mut inner = self.inner.write();
        inner.in_flight = inner.in_flight.saturating_sub(1);
        if success {
            inner.requests_success += 1;
        } else {
            inner.requests_failed += 1;
        }

        inner.latencies.push_back(latency_ms);
        if inner.latencies.len() > inner.max_latency_samples {
            inner.latencies.pop_front();
        }

        latency_ms
    }

    /// Start tracking a request whose end is recorded by the returned guard.
    pub fn track(&self) -> RequestTimer {
        RequestTimer {
            started: self.start_request(),
            metrics: self.clone(),
            ended: false,
        }
    }

    pub fn record_stale_reply(&self) {
        self.inner.write().stale_replies += 1;
    }

    pub fn record_delegation(&self) {
        self.inner.write().delegations_relayed += 1;
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let inner = self.inner.read();

        let mut latencies: Vec<f64> = inner.latencies.iter().copied().collect();
        latencies.sort_by(|a, b| a.total_cmp(b));
        let percentile = |p: f64| -> f64 {
            let n = latencies.len();
            latencies[((n as f64 * p) as usize).min(n - 1)]
        };
        let (avg, p50, p95, p99, min, max) = if latencies.is_empty() {
            (0.0, 0.0, 0.0, 0.0, 0.0, 0.0)
        } else {
            let n = latencies.len();
            (
                latencies.iter().sum::<f64>() / n as f64,
                percentile(0.50),
                percentile(0.95),
                percentile(0.99),
                latencies[0],
                latencies[n - 1],
            )
        };

        MetricsSnapshot {
            requests_total: inner.requests_total,
            requests_success: inner.requests_success,
            requests_failed: inner.requests_failed,
            stale_replies: inner.stale_replies,
            delegations_relayed: inner.delegations_relayed,
            latency_avg_ms: avg,
            latency_p50_ms: p50,
            latency_p95_ms: p95,
            latency_p99_ms: p99,
            latency_min_ms: min,
            latency_max_ms: max,
            in_flight: inner.in_flight,
            in_flight_max: inner.in_flight_max,
            timestamp: current_timestamp(),
        }
    }

    pub fn reset(&self) {
        let mut inner = self.inner.write();
        inner.requests_total = 0;
        inner.requests_success = 0;
        inner.requests_failed = 0;
        inner.stale_replies = 0;
        inner.delegations_relayed = 0;
        inner.in_flight = 0;
        inner.in_flight_max = 0;
        inner.latencies.clear();
    }
}

/// One tracked request. Dropping it unfinished records a failure.
pub struct RequestTimer {
    metrics: Metrics,
    started: Instant,
    ended: bool,
}

impl RequestTimer {
    /// Record the outcome. Returns latency in milliseconds.
    pub fn finish(mut self, success: bool) -> f64 {
        self.ended = true;
        self.metrics.end_request(self.started, success)
    }
}

impl Drop for RequestTimer {
    fn drop(&mut self) {
        if !self.ended {
            self.metrics.end_request(self.started, false);
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

fn current_timestamp() -> f64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
