//! Load generation engine
//!
//! Raters ([`Runner`]) offer request ids at the target rate, idle workers
//! ([`Worker`]) accept them through a zero-capacity [`WorkQueue`], and the
//! [`WorkerPool`] keeps the number of workers at the interpolated target.

pub mod pool;
pub mod queue;
pub mod runner;
pub mod worker;

pub use pool::WorkerPool;
pub use queue::WorkQueue;
pub use runner::{MAX_RATER_RPS, Runner, raters_count};
pub use worker::{Worker, WorkerHandle, WorkerSettings};
