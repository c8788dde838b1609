use anyhow::Context;
use procwarden::{Supervisor, SupervisorConfig};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    tracing::info!("procwarden {} starting", env!("CARGO_PKG_VERSION"));

    let config = SupervisorConfig::load()?;
    let supervisor = Supervisor::new(config).context("Invalid supervisor configuration")?;
    supervisor.boot().await;

    // Ctrl+C 시 관리 중인 프로세스 모두 정리
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutdown signal received, stopping supervised processes...");
    supervisor.shutdown().await;

    tracing::info!("procwarden shutting down");
    Ok(())
}
