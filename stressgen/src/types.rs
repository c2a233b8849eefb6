//! Shared load-test types and error definitions

use std::fmt;
use std::time::Duration;

use metrics_exporter_prometheus::BuildError;
use serde::Serialize;
use thiserror::Error;

/// Errors surfaced by the load-scheduling engine and its harness
#[derive(Debug, Error)]
pub enum StressError {
    #[error("forcibly finished schedule: cancellation was requested")]
    Cancelled,

    #[error("load schedule is empty")]
    EmptySchedule,

    #[error("schedule element {index} would run with zero rps")]
    InvalidRps { index: usize },

    #[error("segment {start} -> {end} has no positive rps")]
    InvalidSegment { start: LoadParams, end: LoadParams },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("metrics recorder error: {0}")]
    Metrics(#[from] BuildError),

    #[error("remote execution failed: {0}")]
    Remote(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Identifier of one dispatched (or skipped) request, unique per `Runner`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a worker, unique per `WorkerPool`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct WorkerId(pub u64);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single target-rate plateau or ramp endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LoadParams {
    /// Target requests per second
    pub rps: u32,
    /// Target number of live workers
    pub workers: u32,
    /// How long the ramp starting at this point lasts
    pub duration: Duration,
}

impl LoadParams {
    pub fn new(rps: u32, workers: u32, duration: Duration) -> Self {
        Self {
            rps,
            workers,
            duration,
        }
    }
}

impl fmt::Display for LoadParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{rps: {}, workers: {}, duration: {:?}}}",
            self.rps, self.workers, self.duration
        )
    }
}

/// Linear interpolation of rps and workers between two points.
///
/// The ramp is always paced by `start.duration`, and each component is
/// truncated toward zero. A zero-length start yields `end` directly.
pub fn interpolate(start: &LoadParams, end: &LoadParams, elapsed: Duration) -> LoadParams {
    if start.duration.is_zero() {
        return LoadParams::new(end.rps, end.workers, Duration::ZERO);
    }
    let f = elapsed.as_nanos() as f64 / start.duration.as_nanos() as f64;
    let lerp = |from: u32, to: u32| -> u32 {
        let delta = (to as i64 - from as i64) as f64 * f;
        (from as i64 + delta as i64).clamp(0, u32::MAX as i64) as u32
    };
    LoadParams::new(
        lerp(start.rps, end.rps),
        lerp(start.workers, end.workers),
        Duration::ZERO,
    )
}

/// Ordered sequence of load points; adjacent points form ramps
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadSchedule(pub Vec<LoadParams>);

impl LoadSchedule {
    pub fn new(points: Vec<LoadParams>) -> Self {
        Self(points)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Segments as `(start, end)` pairs; the last point is paired with itself
    pub fn segments(&self) -> impl Iterator<Item = (LoadParams, LoadParams)> + '_ {
        self.0.iter().enumerate().map(|(i, start)| {
            let end = self.0.get(i + 1).unwrap_or(start);
            (*start, *end)
        })
    }

    /// Reject schedules that would execute a segment with no positive rps
    pub fn validate(&self) -> Result<(), StressError> {
        if self.is_empty() {
            return Err(StressError::EmptySchedule);
        }
        for (index, (start, end)) in self.segments().enumerate() {
            if start.rps == 0 && end.rps == 0 && !start.duration.is_zero() {
                return Err(StressError::InvalidRps { index });
            }
        }
        Ok(())
    }
}

impl fmt::Display for LoadSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, params) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", params)?;
        }
        write!(f, "]")
    }
}

impl From<Vec<LoadParams>> for LoadSchedule {
    fn from(points: Vec<LoadParams>) -> Self {
        Self(points)
    }
}
