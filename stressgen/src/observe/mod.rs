//! Observability sink for offered vs. accepted load and latency
//!
//! The engine only writes through [`MetricsSink`]. [`StressMetrics`] forwards
//! every observation to the `metrics` facade (so whichever recorder is
//! installed can export it) and keeps a local mirror for periodic reports.

pub mod exporter;
pub mod report;

use std::sync::atomic::{AtomicU64, Ordering};

use metrics::{Counter, Gauge, Histogram, Label, counter, gauge, histogram};

use crate::context::RequestStatus;

pub use report::{HistogramSummary, Monitor, StatsSnapshot};

pub const EXPECTED_RPS: &str = "stress_expected_rps";
pub const EXPECTED_WORKERS: &str = "stress_expected_workers";
pub const CURRENT_WORKERS: &str = "stress_current_workers";
pub const SENT_REQUESTS: &str = "stress_sent_request_counter";
pub const SKIPPED_REQUESTS: &str = "stress_skipped_request_counter";
pub const ERROR_REQUESTS: &str = "stress_errors_request_counter";
pub const STUCK_REQUESTS: &str = "stress_stuck_request_counter";
pub const REQUEST_LATENCY: &str = "stress_request_latency";

/// Upper bounds (seconds) of the latency histogram buckets
pub const LATENCY_BUCKETS: [f64; 12] = [
    0.001, 0.005, 0.01, 0.02, 0.05, 0.1, 0.2, 0.3, 0.5, 0.7, 1.0, 5.0,
];

/// Write-only observation hooks used by the engine.
///
/// Implementations must tolerate concurrent calls from many raters and workers.
pub trait MetricsSink: Send + Sync {
    fn set_expected_rps(&self, value: f64);
    fn set_expected_workers(&self, value: f64);
    fn set_current_workers(&self, value: f64);
    fn inc_sent(&self);
    fn inc_skipped(&self);
    fn inc_errors(&self);
    fn observe_latency(&self, status: RequestStatus, seconds: f64);

    /// A worker gave up waiting on an invocation after twice its timeout
    fn inc_stuck(&self) {}
}

/// Const labels attached to every series of one load test
pub fn const_labels(name: &str) -> Vec<Label> {
    let category = name.split('/').next().unwrap_or(name).to_string();
    vec![
        Label::new("group", "stress"),
        Label::new("stress_name", name.to_string()),
        Label::new("stress_category", category),
    ]
}

/// Gauge value stored as raw f64 bits
#[derive(Debug, Default)]
struct AtomicF64(AtomicU64);

impl AtomicF64 {
    fn set(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }

    fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }
}

/// Lock-free fixed-bucket latency histogram
#[derive(Debug, Default)]
pub struct LatencyHistogram {
    /// Per-bucket (non-cumulative) counts; the extra slot is the overflow bucket
    buckets: [AtomicU64; LATENCY_BUCKETS.len() + 1],
    count: AtomicU64,
    sum_nanos: AtomicU64,
}

impl LatencyHistogram {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&self, seconds: f64) {
        let seconds = seconds.max(0.0);
        let idx = LATENCY_BUCKETS
            .iter()
            .position(|upper| seconds <= *upper)
            .unwrap_or(LATENCY_BUCKETS.len());
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_nanos
            .fetch_add((seconds * 1e9) as u64, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn sum(&self) -> f64 {
        self.sum_nanos.load(Ordering::Relaxed) as f64 / 1e9
    }

    /// Cumulative counts for the finite buckets, aligned with [`LATENCY_BUCKETS`]
    pub fn cumulative(&self) -> Vec<u64> {
        let mut total = 0;
        LATENCY_BUCKETS
            .iter()
            .enumerate()
            .map(|(i, _)| {
                total += self.buckets[i].load(Ordering::Relaxed);
                total
            })
            .collect()
    }
}

/// Default sink: `metrics` facade plus a local mirror for reports
pub struct StressMetrics {
    name: String,

    expected_rps: Gauge,
    expected_workers: Gauge,
    current_workers: Gauge,
    sent: Counter,
    skipped: Counter,
    errors: Counter,
    stuck: Counter,
    latency_success: Histogram,
    latency_error: Histogram,

    local_expected_rps: AtomicF64,
    local_expected_workers: AtomicF64,
    local_current_workers: AtomicF64,
    local_sent: AtomicU64,
    local_skipped: AtomicU64,
    local_errors: AtomicU64,
    local_stuck: AtomicU64,
    local_success_latency: LatencyHistogram,
    local_error_latency: LatencyHistogram,
}

impl StressMetrics {
    /// Register the series for one named load test.
    ///
    /// Handles bind to the recorder installed at call time, so install the
    /// exporter first if the series should be scraped.
    pub fn new(name: &str) -> Self {
        metrics::describe_gauge!(EXPECTED_RPS, "stress expected rps");
        metrics::describe_gauge!(EXPECTED_WORKERS, "stress expected workers");
        metrics::describe_gauge!(CURRENT_WORKERS, "stress current workers");
        metrics::describe_counter!(SENT_REQUESTS, "stress sent request counter");
        metrics::describe_counter!(SKIPPED_REQUESTS, "stress skipped request counter");
        metrics::describe_counter!(ERROR_REQUESTS, "stress errors request counter");
        metrics::describe_counter!(STUCK_REQUESTS, "stress stuck request counter");
        metrics::describe_histogram!(REQUEST_LATENCY, metrics::Unit::Seconds, "stress request latency");

        let labels = const_labels(name);
        let with_status = |status: RequestStatus| {
            let mut labels = labels.clone();
            labels.push(Label::new("status", status.as_str()));
            labels
        };

        Self {
            name: name.to_string(),
            expected_rps: gauge!(EXPECTED_RPS, labels.clone()),
            expected_workers: gauge!(EXPECTED_WORKERS, labels.clone()),
            current_workers: gauge!(CURRENT_WORKERS, labels.clone()),
            sent: counter!(SENT_REQUESTS, labels.clone()),
            skipped: counter!(SKIPPED_REQUESTS, labels.clone()),
            errors: counter!(ERROR_REQUESTS, labels.clone()),
            stuck: counter!(STUCK_REQUESTS, labels.clone()),
            latency_success: histogram!(REQUEST_LATENCY, with_status(RequestStatus::Success)),
            latency_error: histogram!(REQUEST_LATENCY, with_status(RequestStatus::Error)),
            local_expected_rps: AtomicF64::default(),
            local_expected_workers: AtomicF64::default(),
            local_current_workers: AtomicF64::default(),
            local_sent: AtomicU64::new(0),
            local_skipped: AtomicU64::new(0),
            local_errors: AtomicU64::new(0),
            local_stuck: AtomicU64::new(0),
            local_success_latency: LatencyHistogram::new(),
            local_error_latency: LatencyHistogram::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sent(&self) -> u64 {
        self.local_sent.load(Ordering::Relaxed)
    }

    pub fn skipped(&self) -> u64 {
        self.local_skipped.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.local_errors.load(Ordering::Relaxed)
    }

    pub fn stuck(&self) -> u64 {
        self.local_stuck.load(Ordering::Relaxed)
    }

    pub fn expected_rps(&self) -> f64 {
        self.local_expected_rps.get()
    }

    pub fn expected_workers(&self) -> f64 {
        self.local_expected_workers.get()
    }

    pub fn current_workers(&self) -> f64 {
        self.local_current_workers.get()
    }

    pub fn latency(&self, status: RequestStatus) -> &LatencyHistogram {
        match status {
            RequestStatus::Success => &self.local_success_latency,
            RequestStatus::Error => &self.local_error_latency,
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot::from_metrics(self)
    }
}

impl MetricsSink for StressMetrics {
    fn set_expected_rps(&self, value: f64) {
        self.expected_rps.set(value);
        self.local_expected_rps.set(value);
    }

    fn set_expected_workers(&self, value: f64) {
        self.expected_workers.set(value);
        self.local_expected_workers.set(value);
    }

    fn set_current_workers(&self, value: f64) {
        self.current_workers.set(value);
        self.local_current_workers.set(value);
    }

    fn inc_sent(&self) {
        self.sent.increment(1);
        self.local_sent.fetch_add(1, Ordering::Relaxed);
    }

    fn inc_skipped(&self) {
        self.skipped.increment(1);
        self.local_skipped.fetch_add(1, Ordering::Relaxed);
    }

    fn inc_errors(&self) {
        self.errors.increment(1);
        self.local_errors.fetch_add(1, Ordering::Relaxed);
    }

    fn observe_latency(&self, status: RequestStatus, seconds: f64) {
        match status {
            RequestStatus::Success => self.latency_success.record(seconds),
            RequestStatus::Error => self.latency_error.record(seconds),
        }
        self.latency(status).observe(seconds);
    }

    fn inc_stuck(&self) {
        self.stuck.increment(1);
        self.local_stuck.fetch_add(1, Ordering::Relaxed);
    }
}
