//! stressgen Library
//!
//! Programmable load generator: drives a user-supplied async workload at a
//! scheduled request rate with an elastic pool of workers, sheds load when no
//! worker is free, and exports what it offered versus what it achieved.

pub mod cancellation;
pub mod config;
pub mod context;
pub mod engine;
pub mod observe;
pub mod remote;
pub mod stress;
pub mod types;

#[cfg(test)]
mod test_utils;

// Re-export commonly used types
pub use cancellation::{is_finished, shutdown_token};
pub use config::{StressConfig, parse_schedule};
pub use context::{RequestContext, RequestStatus, Workload, workload};
pub use engine::{Runner, WorkQueue, WorkerPool, WorkerSettings};
pub use observe::{MetricsSink, StatsSnapshot, StressMetrics};
pub use stress::{Outcome, Stress};
pub use types::{LoadParams, LoadSchedule, RequestId, StressError, WorkerId, interpolate};
