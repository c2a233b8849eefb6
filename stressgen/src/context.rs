//! Per-request execution context handed to the user workload

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Span;

use crate::types::{RequestId, WorkerId};

/// User-supplied workload invoked once per accepted request.
///
/// The engine never aborts a running invocation; a workload that ignores its
/// deadline keeps running until it returns on its own.
pub type Workload =
    Arc<dyn Fn(RequestContext) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Wrap an async closure into a [`Workload`]
pub fn workload<F, Fut>(f: F) -> Workload
where
    F: Fn(RequestContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |ctx: RequestContext| -> BoxFuture<'static, anyhow::Result<()>> {
        Box::pin(f(ctx))
    })
}

/// Outcome label attached to latency observations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestStatus {
    Success,
    Error,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Success => "success",
            RequestStatus::Error => "error",
        }
    }
}

/// Deadline-scoped handle for one in-flight invocation
#[derive(Debug, Clone)]
pub struct RequestContext {
    id: RequestId,
    worker: WorkerId,
    deadline: Instant,
    cancel: CancellationToken,
    span: Span,
}

impl RequestContext {
    /// Create a context whose token is cancelled once `timeout` elapses.
    ///
    /// The deadline timer stops as soon as the returned token is cancelled by
    /// the owner, so finished invocations do not keep timers alive.
    pub fn with_timeout(id: RequestId, worker: WorkerId, timeout: Duration) -> Self {
        let deadline = Instant::now() + timeout;
        let cancel = CancellationToken::new();

        let timer = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => timer.cancel(),
                _ = timer.cancelled() => {}
            }
        });

        let span = tracing::info_span!("request", request = id.0, worker = worker.0);
        Self {
            id,
            worker,
            deadline,
            cancel,
            span,
        }
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Time left before the deadline, zero once it has passed
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when the deadline elapses or the engine retires the invocation
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Logger/trace handle carrying the request and worker ids
    pub fn span(&self) -> &Span {
        &self.span
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.cancel
    }
}
