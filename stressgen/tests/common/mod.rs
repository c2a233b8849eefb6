//! Common Test Utilities for Integration Tests
//!
//! Shared helpers used across integration test modules.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use stressgen::{StressConfig, StressMetrics, Workload, WorkerPool, WorkerSettings, workload};

/// Workload that counts its invocations and sleeps for `latency`
pub fn counting_workload(latency: Duration) -> (Workload, Arc<AtomicU64>) {
    let calls = Arc::new(AtomicU64::new(0));
    let counter = calls.clone();
    let f = workload(move |_ctx| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            Ok(())
        }
    });
    (f, calls)
}

/// Metrics sink with a name unique to this test run
pub fn test_metrics(test: &str) -> Arc<StressMetrics> {
    Arc::new(StressMetrics::new(&format!(
        "integration/{}-{}",
        test,
        &uuid::Uuid::new_v4().to_string()[..8]
    )))
}

pub fn test_pool(metrics: &Arc<StressMetrics>, f: Workload) -> Arc<WorkerPool> {
    Arc::new(WorkerPool::new(WorkerSettings::default(), metrics.clone(), f))
}

/// Configuration that never binds a port
pub fn quiet_config() -> StressConfig {
    StressConfig {
        serve_metrics: false,
        ..StressConfig::default()
    }
}
