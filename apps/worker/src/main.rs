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

    let config = Config::from_env().context("Failed to load worker configuration")?;

    tracing::info!(
        concurrency = config.concurrency,
        environment = %config.environment(),
        "Starting romvault worker"
    );

    let ctx = AppContext::connect(config)
        .await
        .context("Failed to initialize worker context")?;

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
                return;
            }
            tracing::info!("Shutdown requested, waiting for running jobs");
            cancel.cancel();
        }
    });

    ctx.worker_pool().run(cancel).await?;
    ctx.shutdown().await;

    Ok(())
}
