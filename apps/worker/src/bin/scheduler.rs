use anyhow::Context;
use romvault_worker::{AppContext, Config};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "romvault_worker=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load environment variables
    dotenvy::dotenv().ok();

    let config = Config::from_env().context("Failed to load scheduler configuration")?;
    let tick = config.scheduler_tick;

    tracing::info!(tick_secs = tick.as_secs(), "Starting romvault scheduler");

    let ctx = AppContext::connect(config)
        .await
        .context("Failed to initialize scheduler context")?;

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
                return;
            }
            cancel.cancel();
        }
    });

    // Extra replicas stand by until the lease holder stops renewing
    ctx.scheduler()
        .run(tick, cancel)
        .await
        .context("Scheduler failed")?;
    ctx.shutdown().await;

    Ok(())
}
