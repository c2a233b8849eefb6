//! Load test harness
//!
//! Wires the engine, metrics, monitor and Prometheus endpoint together for one
//! named load test, and decides whether it runs here or in a remote sandbox.

use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

use crate::config::StressConfig;
use crate::context::Workload;
use crate::engine::{Runner, WorkerPool};
use crate::observe::exporter::{install_recorder, serve};
use crate::observe::{MetricsSink, Monitor, StatsSnapshot, StressMetrics};
use crate::remote::{RemoteRunner, SandboxSpec, is_remote_env};
use crate::types::StressError;

/// Where a load test ended up running
#[derive(Debug)]
pub enum Outcome {
    Local(StatsSnapshot),
    /// Output of the remote run
    Remote(String),
}

pub struct Stress {
    name: String,
    nonce: String,
    config: StressConfig,
    metrics: Arc<StressMetrics>,
    prometheus: Option<PrometheusHandle>,
    pool: Arc<WorkerPool>,
    runner: Arc<Runner>,
}

impl Stress {
    /// Build a load test named `name` that runs `workload` for every request.
    ///
    /// When metrics are served, the Prometheus recorder is installed before
    /// any series is registered.
    pub fn new(name: &str, config: StressConfig, workload: Workload) -> Result<Self, StressError> {
        let prometheus = if config.serve_metrics {
            Some(install_recorder()?)
        } else {
            None
        };

        let metrics = Arc::new(StressMetrics::new(name));
        let sink: Arc<dyn MetricsSink> = metrics.clone();
        let pool = Arc::new(WorkerPool::new(
            config.worker_settings(),
            sink.clone(),
            workload,
        ));
        let runner = Arc::new(Runner::new(sink));
        let nonce = Uuid::new_v4().to_string()[..8].to_string();

        info!(
            "initialized stress instance for test {} with timeout {:?}",
            name, config.worker_timeout
        );
        Ok(Self {
            name: name.to_string(),
            nonce,
            config,
            metrics,
            prometheus,
            pool,
            runner,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Short random suffix distinguishing runs of the same test
    pub fn nonce(&self) -> &str {
        &self.nonce
    }

    pub fn config(&self) -> &StressConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<StressMetrics> {
        &self.metrics
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Run the schedule in this process.
    ///
    /// Always returns the final snapshot, even when the schedule failed or was
    /// cancelled.
    pub async fn run_local(
        &self,
        cancel: &CancellationToken,
    ) -> (Result<(), StressError>, StatsSnapshot) {
        let exporter_cancel = CancellationToken::new();
        let exporter = self.prometheus.clone().map(|handle| {
            let port = self.config.metrics_port;
            let stop = exporter_cancel.clone();
            tokio::spawn(async move {
                if let Err(e) = serve(port, handle, stop).await {
                    error!("metrics endpoint failed: {}", e);
                }
            })
        });
        let monitor = Monitor::start(&self.name, self.config.report_interval, self.metrics.clone());

        let result = self
            .runner
            .run_schedule(cancel, &self.config.schedule, &self.pool)
            .await;
        self.pool.shutdown().await;
        match &result {
            Ok(()) => info!("run schedule finished successfully"),
            Err(e) => error!("run schedule failed with error: {}", e),
        }

        monitor.finish().await;
        exporter_cancel.cancel();
        if let Some(exporter) = exporter {
            let _ = exporter.await;
        }
        (result, self.metrics.snapshot())
    }

    /// Run remotely through `remote`, or locally when no remote is given or
    /// this process already is the remote side.
    pub async fn run(
        &self,
        cancel: &CancellationToken,
        remote: Option<&dyn RemoteRunner>,
    ) -> Result<Outcome, StressError> {
        match remote {
            Some(remote) if !is_remote_env() => {
                let mut spec = SandboxSpec::new(&self.name, &self.nonce);
                spec.metrics_port = self.config.metrics_port;
                remote
                    .run_stress(cancel, &self.name, &spec)
                    .await
                    .map(Outcome::Remote)
            }
            _ => {
                if is_remote_env() {
                    info!("detected remote environment, run test locally");
                }
                let (result, snapshot) = self.run_local(cancel).await;
                result.map(|()| Outcome::Local(snapshot))
            }
        }
    }
}
