//! Prometheus exposition for load-test metrics

use std::net::SocketAddr;
use std::sync::{Mutex, OnceLock};

use axum::{Router, extract::State, routing::get};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use super::{LATENCY_BUCKETS, REQUEST_LATENCY};
use crate::types::StressError;

/// Prometheus handle for the process-wide recorder
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
/// Serializes the first install; the global recorder can only be set once
static INSTALL_LOCK: Mutex<()> = Mutex::new(());

/// Install the Prometheus recorder, or return the one already installed.
///
/// Must run before any `StressMetrics` is created for its series to be exported.
pub fn install_recorder() -> Result<PrometheusHandle, StressError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let _guard = INSTALL_LOCK
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }
    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(Matcher::Full(REQUEST_LATENCY.to_string()), &LATENCY_BUCKETS)?
        .install_recorder()?;
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

async fn prometheus_metrics(State(handle): State<PrometheusHandle>) -> String {
    handle.render()
}

async fn health() -> &'static str {
    "ok"
}

pub fn metrics_router(handle: PrometheusHandle) -> Router {
    Router::new()
        .route("/metrics", get(prometheus_metrics))
        .route("/health", get(health))
        .with_state(handle)
        .layer(TraceLayer::new_for_http())
}

/// Serve `/metrics` on `port` until `cancel` fires
pub async fn serve(
    port: u16,
    handle: PrometheusHandle,
    cancel: CancellationToken,
) -> Result<(), StressError> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("metrics endpoint listening on {}", listener.local_addr()?);

    axum::serve(listener, metrics_router(handle))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}
