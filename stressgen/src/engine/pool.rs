//! Elastic pool of workers sharing one hand-off queue

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Mutex;
use tracing::info;

use super::queue::WorkQueue;
use super::worker::{Worker, WorkerHandle, WorkerSettings};
use crate::context::Workload;
use crate::observe::MetricsSink;
use crate::types::WorkerId;

/// Live worker set guarded by the pool lock
struct Roster {
    workers: Vec<WorkerHandle>,
    next_id: u64,
}

/// Pool of workers kept at a requested size.
///
/// Only structural changes take the lock. Dispatch goes through [`WorkQueue`],
/// and `size()` is an unsynchronized snapshot that may briefly lag.
pub struct WorkerPool {
    queue: Arc<WorkQueue>,
    roster: Mutex<Roster>,
    size: AtomicUsize,
    workload: Workload,
    sink: Arc<dyn MetricsSink>,
    settings: WorkerSettings,
}

impl WorkerPool {
    pub fn new(settings: WorkerSettings, sink: Arc<dyn MetricsSink>, workload: Workload) -> Self {
        Self {
            queue: Arc::new(WorkQueue::new()),
            roster: Mutex::new(Roster {
                workers: Vec::new(),
                next_id: 0,
            }),
            size: AtomicUsize::new(0),
            workload,
            sink,
            settings,
        }
    }

    /// Shared queue that raters dispatch into
    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }

    /// Current number of live workers (best effort)
    pub fn size(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    /// Grow or shrink the pool to exactly `target` workers.
    ///
    /// Shrinking stops the most recently added workers and returns without
    /// waiting for their in-flight requests.
    pub async fn adjust(&self, target: usize) {
        if self.size() == target {
            return;
        }
        let mut roster = self.roster.lock().await;
        if roster.workers.len() == target {
            return;
        }
        info!(
            "adjusting workers pool: current={}, target={}",
            roster.workers.len(),
            target
        );
        while roster.workers.len() < target {
            let id = WorkerId(roster.next_id);
            roster.next_id += 1;
            let handle = Worker::spawn(
                id,
                self.queue.clone(),
                self.workload.clone(),
                self.sink.clone(),
                &self.settings,
            );
            roster.workers.push(handle);
            self.size.store(roster.workers.len(), Ordering::Release);
        }
        while roster.workers.len() > target {
            // Publish the smaller size first so readers never see more than are live
            self.size.store(roster.workers.len() - 1, Ordering::Release);
            if let Some(last) = roster.workers.pop() {
                last.stop();
            }
        }
    }

    /// Stop every worker and wait for each loop to exit.
    ///
    /// Abandoned invocations are not waited on.
    pub async fn shutdown(&self) {
        let workers = {
            let mut roster = self.roster.lock().await;
            self.size.store(0, Ordering::Release);
            std::mem::take(&mut roster.workers)
        };
        if workers.is_empty() {
            return;
        }
        info!("shutting down workers pool: current={}", workers.len());
        for worker in &workers {
            worker.stop();
        }
        for worker in workers {
            worker.finished().await;
        }
    }

    /// Ids of live workers in spawn order
    #[cfg(test)]
    pub(crate) async fn worker_ids(&self) -> Vec<WorkerId> {
        let roster = self.roster.lock().await;
        roster.workers.iter().map(|w| w.id()).collect()
    }
}
