use std::env;

use anyhow::Context;
use stressgen::{Outcome, Stress, StressConfig, StressError, shutdown_token, workload};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stressgen=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration from environment
    let config = StressConfig::from_env();
    let target = env::var("STRESS_TARGET_URL").context("STRESS_TARGET_URL must be set")?;
    let name = env::var("STRESS_NAME").unwrap_or_else(|_| "http/get".to_string());
    info!(
        "Loaded configuration: target={}, schedule={}, timeout={:?}",
        target, config.schedule, config.worker_timeout
    );

    let client = reqwest::Client::builder()
        .timeout(config.worker_timeout * 2)
        .build()?;
    let stress = Stress::new(
        &name,
        config,
        workload(move |ctx| {
            let request = client.get(&target).timeout(ctx.remaining());
            async move {
                request.send().await?.error_for_status()?;
                Ok(())
            }
        }),
    )?;

    let cancel = shutdown_token();
    match stress.run(&cancel, None).await {
        Ok(Outcome::Local(snapshot)) => println!("{}", snapshot.to_json()),
        Ok(Outcome::Remote(output)) => println!("{}", output),
        Err(StressError::Cancelled) => {
            warn!("load test interrupted");
            println!("{}", stress.metrics().snapshot().to_json());
        }
        Err(e) => return Err(e.into()),
    }

    Ok(())
}
