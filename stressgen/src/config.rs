//! Load test configuration
//!
//! Configuration is loaded from environment variables on top of defaults.
//! Unparseable values are ignored and the default is kept.

use std::env;
use std::time::Duration;

use tracing::warn;

use crate::engine::WorkerSettings;
use crate::types::{LoadParams, LoadSchedule, StressError};

/// Main load test configuration
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Per-request deadline handed to the workload
    pub worker_timeout: Duration,
    /// How often the monitor logs a snapshot
    pub report_interval: Duration,
    /// Port of the Prometheus endpoint
    pub metrics_port: u16,
    /// Whether to serve `/metrics` while running
    pub serve_metrics: bool,
    /// Cap on abandoned invocations per worker (unbounded when unset)
    pub max_abandoned_per_worker: Option<usize>,
    pub schedule: LoadSchedule,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            worker_timeout: Duration::from_secs(1),
            report_interval: Duration::from_secs(10),
            metrics_port: 3000,
            serve_metrics: true,
            max_abandoned_per_worker: None,
            schedule: LoadSchedule::new(vec![LoadParams::new(
                10,
                2,
                Duration::from_secs(30),
            )]),
        }
    }
}

impl StressConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(val) = lookup("STRESS_WORKER_TIMEOUT_MS")
            && let Ok(ms) = val.parse::<u64>()
        {
            config.worker_timeout = Duration::from_millis(ms);
        }
        if let Some(val) = lookup("STRESS_REPORT_INTERVAL_SECS")
            && let Ok(secs) = val.parse::<u64>()
            && secs > 0
        {
            config.report_interval = Duration::from_secs(secs);
        }
        if let Some(val) = lookup("STRESS_METRICS_PORT")
            && let Ok(port) = val.parse()
        {
            config.metrics_port = port;
        }
        if let Some(val) = lookup("STRESS_SERVE_METRICS") {
            config.serve_metrics = val.to_lowercase() == "true" || val == "1";
        }
        if let Some(val) = lookup("STRESS_MAX_ABANDONED")
            && let Ok(cap) = val.parse::<usize>()
        {
            config.max_abandoned_per_worker = (cap > 0).then_some(cap);
        }
        if let Some(val) = lookup("STRESS_SCHEDULE") {
            match parse_schedule(&val) {
                Ok(schedule) => config.schedule = schedule,
                Err(e) => warn!("ignoring STRESS_SCHEDULE: {}", e),
            }
        }

        config
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            timeout: self.worker_timeout,
            max_abandoned: self.max_abandoned_per_worker,
        }
    }
}

/// Parse `rps:workers:duration` points separated by commas.
///
/// Durations take an `ms`, `s` or `m` suffix; a bare number is seconds.
pub fn parse_schedule(input: &str) -> Result<LoadSchedule, StressError> {
    let points = input
        .split(',')
        .map(str::trim)
        .filter(|point| !point.is_empty())
        .map(parse_point)
        .collect::<Result<Vec<_>, _>>()?;
    if points.is_empty() {
        return Err(StressError::EmptySchedule);
    }
    Ok(LoadSchedule::new(points))
}

fn parse_point(point: &str) -> Result<LoadParams, StressError> {
    let fields: Vec<&str> = point.split(':').map(str::trim).collect();
    let [rps, workers, duration] = fields.as_slice() else {
        return Err(StressError::Config(format!(
            "expected rps:workers:duration, got {:?}",
            point
        )));
    };
    let rps = rps
        .parse()
        .map_err(|_| StressError::Config(format!("invalid rps {:?}", rps)))?;
    let workers = workers
        .parse()
        .map_err(|_| StressError::Config(format!("invalid workers {:?}", workers)))?;
    Ok(LoadParams::new(rps, workers, parse_duration(duration)?))
}

fn parse_duration(input: &str) -> Result<Duration, StressError> {
    let invalid = || StressError::Config(format!("invalid duration {:?}", input));
    let (digits, unit): (&str, fn(u64) -> Duration) = if let Some(ms) = input.strip_suffix("ms") {
        (ms, Duration::from_millis)
    } else if let Some(m) = input.strip_suffix('m') {
        (m, |v| Duration::from_secs(v * 60))
    } else if let Some(s) = input.strip_suffix('s') {
        (s, Duration::from_secs)
    } else {
        (input, Duration::from_secs)
    };
    digits.parse::<u64>().map(unit).map_err(|_| invalid())
}
