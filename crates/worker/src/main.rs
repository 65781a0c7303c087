use anyhow::Result;
use docket_worker::{init_telemetry, run_until, TelemetryConfig, WorkerHostConfig};

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env file is fine
    let _ = dotenvy::dotenv();

    // Configure via environment variables:
    // - RUST_LOG or LOG_LEVEL: Log filter (default: "docket=info")
    init_telemetry(TelemetryConfig::from_env())?;

    tracing::info!("docket-worker starting...");

    let config = WorkerHostConfig::from_env()?;

    run_until(config, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for shutdown signal");
        }
    })
    .await
}
