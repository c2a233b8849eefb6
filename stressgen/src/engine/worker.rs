//! Worker execution loop and its timeout handling
//!
//! A worker parks on the shared [`WorkQueue`] until it is handed a request or
//! told to stop. Each request runs in its own task; the worker waits for it at
//! most twice the request timeout and then moves on without cancelling it.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, warn};

use super::queue::WorkQueue;
use crate::context::{RequestContext, RequestStatus, Workload};
use crate::observe::MetricsSink;
use crate::types::{RequestId, WorkerId};

/// Execution settings shared by every worker of a pool
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Per-request deadline; the worker disengages after twice this long
    pub timeout: Duration,
    /// Maximum abandoned invocations a worker may leave running (`None` = unbounded)
    pub max_abandoned: Option<usize>,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(1),
            max_abandoned: None,
        }
    }
}

/// Control handle for a spawned worker
#[derive(Debug)]
pub struct WorkerHandle {
    id: WorkerId,
    shutdown: CancellationToken,
    finished: oneshot::Receiver<()>,
}

impl WorkerHandle {
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Ask the worker to stop once it is idle; does not wait
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Wait until the worker loop has exited
    pub async fn finished(self) {
        let _ = self.finished.await;
    }
}

pub struct Worker {
    id: WorkerId,
    queue: Arc<WorkQueue>,
    workload: Workload,
    sink: Arc<dyn MetricsSink>,
    timeout: Duration,
    abandoned: Option<Arc<Semaphore>>,
    shutdown: CancellationToken,
}

impl Worker {
    /// Spawn a worker task consuming from `queue`
    pub fn spawn(
        id: WorkerId,
        queue: Arc<WorkQueue>,
        workload: Workload,
        sink: Arc<dyn MetricsSink>,
        settings: &WorkerSettings,
    ) -> WorkerHandle {
        let shutdown = CancellationToken::new();
        let (finished_tx, finished_rx) = oneshot::channel();

        let worker = Worker {
            id,
            queue,
            workload,
            sink,
            timeout: settings.timeout,
            abandoned: settings
                .max_abandoned
                .map(|cap| Arc::new(Semaphore::new(cap))),
            shutdown: shutdown.clone(),
        };
        tokio::spawn(worker.run(finished_tx));

        WorkerHandle {
            id,
            shutdown,
            finished: finished_rx,
        }
    }

    async fn run(self, finished: oneshot::Sender<()>) {
        debug!("worker[{}]: created", self.id);
        while !self.shutdown.is_cancelled() {
            let mut slot = self.queue.park();
            tokio::select! {
                biased;
                received = &mut slot => match received {
                    Ok(id) => self.execute(id).await,
                    Err(_) => break,
                },
                _ = self.shutdown.cancelled() => {
                    // A request handed over in the same instant was already
                    // counted as sent, so it still runs.
                    slot.close();
                    if let Ok(id) = slot.try_recv() {
                        self.execute(id).await;
                    }
                    break;
                }
            }
        }
        debug!("worker[{}]: shutdown requested, stopping", self.id);
        let _ = finished.send(());
    }

    async fn execute(&self, id: RequestId) {
        let dispatched = Instant::now();
        let ctx = RequestContext::with_timeout(id, self.id, self.timeout);
        let (done_tx, mut done_rx) = oneshot::channel::<()>();
        let (permit_tx, permit_rx) = oneshot::channel::<OwnedSemaphorePermit>();

        let workload = self.workload.clone();
        let sink = self.sink.clone();
        let worker = self.id;
        tokio::spawn(async move {
            // Holds the abandonment permit, if one is handed over, until the call returns
            let _permit = permit_rx;
            let token = ctx.token().clone();
            let span = ctx.span().clone();

            let result = workload(ctx).instrument(span).await;
            let latency = dispatched.elapsed();
            token.cancel();

            let status = match result {
                Ok(()) => RequestStatus::Success,
                Err(e) => {
                    sink.inc_errors();
                    error!("worker[{}]: request {} finished with error: {:#}", worker, id, e);
                    RequestStatus::Error
                }
            };
            sink.observe_latency(status, latency.as_secs_f64());
            let _ = done_tx.send(());
        });

        let stuck_after = self.timeout * 2;
        tokio::select! {
            _ = &mut done_rx => return,
            _ = tokio::time::sleep(stuck_after) => {}
        }

        if let Some(abandoned) = &self.abandoned {
            let permit = match abandoned.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    warn!(
                        "worker[{}]: too many abandoned requests, waiting on request {}",
                        self.id, id
                    );
                    tokio::select! {
                        _ = &mut done_rx => return,
                        permit = abandoned.clone().acquire_owned() => match permit {
                            Ok(permit) => permit,
                            Err(_) => return,
                        },
                    }
                }
            };
            let _ = permit_tx.send(permit);
        }

        error!(
            "worker[{}]: request {} seems to be stuck (didn't finish within {:?}), moving on",
            self.id, id, stuck_after
        );
        self.sink.inc_stuck();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::workload;
    use crate::test_utils::RecordingSink;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn spawn_worker(
        queue: &Arc<WorkQueue>,
        sink: &Arc<RecordingSink>,
        settings: WorkerSettings,
        f: Workload,
    ) -> WorkerHandle {
        Worker::spawn(WorkerId(0), queue.clone(), f, sink.clone(), &settings)
    }

    #[tokio::test]
    async fn test_worker_runs_all_items_before_finishing() {
        let queue = Arc::new(WorkQueue::new());
        let sink = Arc::new(RecordingSink::default());
        let called = Arc::new(AtomicU32::new(0));

        let counter = called.clone();
        let handle = spawn_worker(
            &queue,
            &sink,
            WorkerSettings::default(),
            workload(move |_ctx| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        );

        for i in 0..10 {
            queue.send(RequestId(i)).await;
        }
        handle.stop();
        handle.finished().await;

        assert_eq!(called.load(Ordering::SeqCst), 10);
        assert_eq!(sink.latencies(RequestStatus::Success), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_request_does_not_block_worker() {
        let queue = Arc::new(WorkQueue::new());
        let sink = Arc::new(RecordingSink::default());
        let called = Arc::new(AtomicU32::new(0));

        let counter = called.clone();
        let handle = spawn_worker(
            &queue,
            &sink,
            WorkerSettings {
                timeout: Duration::from_secs(1),
                max_abandoned: None,
            },
            workload(move |ctx| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    if ctx.id() == RequestId(0) {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                    }
                    Ok(())
                }
            }),
        );

        for i in 0..10 {
            queue.send(RequestId(i)).await;
        }
        handle.stop();
        handle.finished().await;

        assert_eq!(called.load(Ordering::SeqCst), 10);
        assert_eq!(sink.stuck(), 1);
        // the abandoned call has not reported yet
        assert_eq!(sink.latencies(RequestStatus::Success), 9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_call_still_reports() {
        let queue = Arc::new(WorkQueue::new());
        let sink = Arc::new(RecordingSink::default());

        let handle = spawn_worker(
            &queue,
            &sink,
            WorkerSettings {
                timeout: Duration::from_millis(100),
                max_abandoned: None,
            },
            workload(|_ctx| async move {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Err(anyhow::anyhow!("too slow"))
            }),
        );

        queue.send(RequestId(1)).await;
        tokio::time::sleep(Duration::from_secs(2)).await;
        handle.stop();
        handle.finished().await;

        assert_eq!(sink.stuck(), 1);
        assert_eq!(sink.errors(), 1);
        assert_eq!(sink.latencies(RequestStatus::Error), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandon_cap_holds_worker_back() {
        let queue = Arc::new(WorkQueue::new());
        let sink = Arc::new(RecordingSink::default());

        let _handle = spawn_worker(
            &queue,
            &sink,
            WorkerSettings {
                timeout: Duration::from_millis(100),
                max_abandoned: Some(1),
            },
            workload(|_ctx| async move {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            }),
        );

        queue.send(RequestId(1)).await;
        queue.send(RequestId(2)).await;
        // first call abandoned, second one is held until the first returns
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(sink.stuck(), 1);
        assert_eq!(queue.try_send(RequestId(3)), Err(RequestId(3)));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(sink.stuck(), 2);
    }

    #[tokio::test]
    async fn test_stop_while_idle_signals_once() {
        let queue = Arc::new(WorkQueue::new());
        let sink = Arc::new(RecordingSink::default());
        let handle = spawn_worker(
            &queue,
            &sink,
            WorkerSettings::default(),
            workload(|_ctx| async move { Ok(()) }),
        );

        handle.stop();
        handle.stop();
        tokio::time::timeout(Duration::from_secs(5), handle.finished())
            .await
            .expect("worker should finish after stop");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_stop_racing_hand_off_runs_accepted_request_once() {
        for _ in 0..500 {
            let queue = Arc::new(WorkQueue::new());
            let sink = Arc::new(RecordingSink::default());
            let called = Arc::new(AtomicU32::new(0));

            let counter = called.clone();
            let handle = spawn_worker(
                &queue,
                &sink,
                WorkerSettings::default(),
                workload(move |_ctx| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }),
            );
            while queue.idle_hint() == 0 {
                tokio::task::yield_now().await;
            }

            let sender = queue.clone();
            let dispatch = tokio::spawn(async move { sender.try_send(RequestId(1)).is_ok() });
            handle.stop();
            tokio::time::timeout(Duration::from_secs(5), handle.finished())
                .await
                .expect("worker should finish after stop");

            let accepted = dispatch.await.unwrap();
            assert_eq!(called.load(Ordering::SeqCst), u32::from(accepted));
            assert_eq!(sink.latencies(RequestStatus::Success), u64::from(accepted));
        }
    }
}
