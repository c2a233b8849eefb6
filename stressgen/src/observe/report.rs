//! Text/JSON stat reports and the periodic monitor that logs them

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::info;

use super::{
    CURRENT_WORKERS, ERROR_REQUESTS, EXPECTED_RPS, EXPECTED_WORKERS, LATENCY_BUCKETS,
    LatencyHistogram, REQUEST_LATENCY, SENT_REQUESTS, SKIPPED_REQUESTS, STUCK_REQUESTS,
    StressMetrics,
};
use crate::context::RequestStatus;

/// Estimate a quantile from cumulative bucket counts.
///
/// Interpolates inside the first bucket whose cumulative count reaches the
/// target rank; ranks past the last finite bucket clamp to its upper bound.
pub fn bucket_quantile(q: f64, cumulative: &[u64], total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    let rank = q * total as f64;
    let mut lower = 0.0;
    for (upper, cum) in LATENCY_BUCKETS.iter().zip(cumulative) {
        let cum = *cum as f64;
        if rank > cum {
            lower = *upper;
            continue;
        }
        let r = 1.0 - (cum - rank) / cum;
        return lower + (upper - lower) * r;
    }
    lower
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HistogramSummary {
    pub count: u64,
    pub avg: f64,
    pub p50: f64,
    pub p90: f64,
    pub p99: f64,
}

impl HistogramSummary {
    pub fn from_histogram(h: &LatencyHistogram) -> Self {
        let count = h.count();
        let cumulative = h.cumulative();
        let avg = if count > 0 { h.sum() / count as f64 } else { 0.0 };
        Self {
            count,
            avg,
            p50: bucket_quantile(0.50, &cumulative, count),
            p90: bucket_quantile(0.90, &cumulative, count),
            p99: bucket_quantile(0.99, &cumulative, count),
        }
    }
}

/// Point-in-time view of one load test's metrics
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatsSnapshot {
    pub name: String,
    pub expected_rps: f64,
    pub expected_workers: f64,
    pub current_workers: f64,
    pub sent: u64,
    pub skipped: u64,
    pub errors: u64,
    pub stuck: u64,
    pub latency_success: HistogramSummary,
    pub latency_error: HistogramSummary,
}

impl StatsSnapshot {
    pub fn from_metrics(metrics: &StressMetrics) -> Self {
        Self {
            name: metrics.name().to_string(),
            expected_rps: metrics.expected_rps(),
            expected_workers: metrics.expected_workers(),
            current_workers: metrics.current_workers(),
            sent: metrics.sent(),
            skipped: metrics.skipped(),
            errors: metrics.errors(),
            stuck: metrics.stuck(),
            latency_success: HistogramSummary::from_histogram(
                metrics.latency(RequestStatus::Success),
            ),
            latency_error: HistogramSummary::from_histogram(metrics.latency(RequestStatus::Error)),
        }
    }

    /// Fraction of offered requests that were shed
    pub fn skip_rate(&self) -> f64 {
        let offered = self.sent + self.skipped;
        if offered == 0 {
            0.0
        } else {
            self.skipped as f64 / offered as f64
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

fn write_histogram(f: &mut fmt::Formatter<'_>, label: &str, h: &HistogramSummary) -> fmt::Result {
    writeln!(
        f,
        "{:>32}: count={}, avg={:.4}, p50={:.4}, p90={:.4}, p99={:.4}",
        label, h.count, h.avg, h.p50, h.p90, h.p99
    )
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:>32}: value={}", EXPECTED_RPS, self.expected_rps)?;
        writeln!(f, "{:>32}: value={}", EXPECTED_WORKERS, self.expected_workers)?;
        writeln!(f, "{:>32}: value={}", CURRENT_WORKERS, self.current_workers)?;
        writeln!(f, "{:>32}: count={}", SENT_REQUESTS, self.sent)?;
        writeln!(f, "{:>32}: count={}", SKIPPED_REQUESTS, self.skipped)?;
        writeln!(f, "{:>32}: count={}", ERROR_REQUESTS, self.errors)?;
        writeln!(f, "{:>32}: count={}", STUCK_REQUESTS, self.stuck)?;
        writeln!(f, "{:>32}:", REQUEST_LATENCY)?;
        write_histogram(f, "{status:success}", &self.latency_success)?;
        write_histogram(f, "{status:error}", &self.latency_error)
    }
}

/// Background task that logs a snapshot every `interval` and once more on finish
pub struct Monitor {
    finish: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl Monitor {
    pub fn start(name: &str, interval: Duration, metrics: Arc<StressMetrics>) -> Self {
        let (finish_tx, mut finish_rx) = oneshot::channel();
        let name = name.to_string();
        let started = Instant::now();

        let handle = tokio::spawn(async move {
            // A zero period would panic inside tokio's interval
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        info!(
                            "stress test stat ({}, elapsed {:?})\n{}",
                            name,
                            started.elapsed(),
                            metrics.snapshot()
                        );
                    }
                    _ = &mut finish_rx => {
                        info!("stress test stat ({}, final)\n{}", name, metrics.snapshot());
                        return;
                    }
                }
            }
        });

        Self {
            finish: Some(finish_tx),
            handle,
        }
    }

    /// Stop the monitor after it logs the final snapshot
    pub async fn finish(mut self) {
        if let Some(tx) = self.finish.take() {
            let _ = tx.send(());
        }
        let _ = self.handle.await;
    }
}
