//! Rate distribution and schedule driving
//!
//! A segment's target rate is split across `ceil(max_rps / MAX_RATER_RPS)`
//! raters. Each rater sleeps a uniformly random interval in
//! `[0, 2 * raters / rps)` between triggers, so the expected aggregate rate is
//! `rps` while raters never fall into lock-step.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::pool::WorkerPool;
use super::queue::WorkQueue;
use crate::cancellation::is_finished;
use crate::observe::MetricsSink;
use crate::types::{LoadParams, LoadSchedule, RequestId, StressError, interpolate};

/// Highest rate a single rater is responsible for
pub const MAX_RATER_RPS: u32 = 20;

/// Number of raters needed to cover a ramp between `start` and `end`
pub fn raters_count(start: &LoadParams, end: &LoadParams) -> u32 {
    start.rps.max(end.rps).div_ceil(MAX_RATER_RPS)
}

/// Segment shared by all raters of one `run_simple_schedule` call
#[derive(Debug, Clone, Copy)]
struct Segment {
    start: LoadParams,
    end: LoadParams,
    started: Instant,
    raters: u32,
}

/// Issues request ids and turns load segments into dispatch attempts
pub struct Runner {
    last_id: AtomicU64,
    sink: Arc<dyn MetricsSink>,
    seed: Option<u64>,
}

impl Runner {
    pub fn new(sink: Arc<dyn MetricsSink>) -> Self {
        Self {
            last_id: AtomicU64::new(0),
            sink,
            seed: None,
        }
    }

    /// Runner whose rater jitter is reproducible across runs
    pub fn with_seed(sink: Arc<dyn MetricsSink>, seed: u64) -> Self {
        Self {
            seed: Some(seed),
            ..Self::new(sink)
        }
    }

    /// Allocate the next id and offer it to an idle worker without waiting.
    ///
    /// Returns the id and whether a worker accepted it. A refused request is
    /// shed: counted and dropped, never retried.
    pub fn trigger(&self, queue: &WorkQueue) -> (RequestId, bool) {
        let id = RequestId(self.last_id.fetch_add(1, Ordering::Relaxed) + 1);
        match queue.try_send(id) {
            Ok(()) => {
                self.sink.inc_sent();
                (id, true)
            }
            Err(_) => {
                warn!("request {} was skipped because there were no free worker", id);
                self.sink.inc_skipped();
                (id, false)
            }
        }
    }

    /// Drive one ramp from `start` to `end` over `start.duration`.
    ///
    /// Returns once every rater has exited, either because the segment elapsed
    /// or because `cancel` fired.
    pub async fn run_simple_schedule(
        self: &Arc<Self>,
        cancel: &CancellationToken,
        start: LoadParams,
        end: LoadParams,
        pool: &Arc<WorkerPool>,
    ) -> Result<(), StressError> {
        if start.duration.is_zero() {
            return Ok(());
        }
        let raters = raters_count(&start, &end);
        if raters == 0 {
            return Err(StressError::InvalidSegment { start, end });
        }
        info!("start simple schedule: start={}, end={}", start, end);
        // Workers spawned before the raters get to park before the first tick
        pool.adjust(start.workers as usize).await;

        let started = Instant::now();
        let mut set = JoinSet::new();
        for rater in 0..raters {
            let rng = match self.seed {
                Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(rater as u64)),
                None => StdRng::from_os_rng(),
            };
            set.spawn(self.clone().rate(
                cancel.clone(),
                Segment {
                    start,
                    end,
                    started,
                    raters,
                },
                pool.clone(),
                rng,
            ));
        }
        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined {
                error!("rater task failed: {}", e);
            }
        }
        Ok(())
    }

    /// Walk the whole schedule segment by segment.
    ///
    /// Returns [`StressError::Cancelled`] if `cancel` fired before the last
    /// segment completed.
    pub async fn run_schedule(
        self: &Arc<Self>,
        cancel: &CancellationToken,
        schedule: &LoadSchedule,
        pool: &Arc<WorkerPool>,
    ) -> Result<(), StressError> {
        schedule.validate()?;
        info!("start schedule: {}", schedule);
        for (start, end) in schedule.segments() {
            if is_finished(cancel) {
                break;
            }
            self.run_simple_schedule(cancel, start, end, pool).await?;
        }
        if is_finished(cancel) {
            return Err(StressError::Cancelled);
        }
        Ok(())
    }

    async fn rate(
        self: Arc<Self>,
        cancel: CancellationToken,
        segment: Segment,
        pool: Arc<WorkerPool>,
        mut rng: StdRng,
    ) {
        let Segment {
            start,
            end,
            started,
            raters,
        } = segment;
        // Absolute deadlines keep timer rounding from accumulating
        let mut next = started;
        let idle_interval =
            Duration::from_secs_f64(raters as f64 / start.rps.max(end.rps) as f64);

        while !is_finished(&cancel) {
            let elapsed = started.elapsed();
            if elapsed >= start.duration {
                break;
            }
            let current = interpolate(&start, &end, elapsed);
            pool.adjust(current.workers as usize).await;
            self.sink.set_expected_rps(current.rps as f64);
            self.sink.set_expected_workers(current.workers as f64);
            self.sink.set_current_workers(pool.size() as f64);

            let interval = if current.rps == 0 {
                // Ramping through zero: nothing to offer this tick
                idle_interval
            } else {
                self.trigger(pool.queue());
                Duration::from_secs_f64(
                    2.0 * rng.random::<f64>() / current.rps as f64 * raters as f64,
                )
            };

            next += interval;
            tokio::select! {
                _ = tokio::time::sleep_until(next) => {}
                _ = cancel.cancelled() => break,
            }
        }
    }
}
