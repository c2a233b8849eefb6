//! Process-level cancellation

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Token cancelled on the first Ctrl-C
pub fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("interrupt received, stopping load"),
            Err(e) => {
                // Without a signal handler the run can still be cancelled programmatically
                warn!("failed to listen for interrupt: {}", e);
                return;
            }
        }
        trigger.cancel();
    });
    token
}

/// Non-blocking check for cancellation
pub fn is_finished(token: &CancellationToken) -> bool {
    token.is_cancelled()
}
