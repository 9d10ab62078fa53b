use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use synapse_core::config::ServerConfig;
use synapse_core::credentials::CredentialPool;
use synapse_core::server::{router, AppState};
use synapse_core::telemetry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = ServerConfig::from_env();
    tracing::info!(data_dir = %config.data_dir.display(), "starting synapse backend");

    let cwd = std::env::current_dir()?;
    let pool = Arc::new(CredentialPool::discover(&cwd)?);

    let state = AppState::new(config.clone(), pool);
    let telemetry_task = state.telemetry.spawn();

    let app = router(state);
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!(addr = config.bind_addr, "server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            telemetry::request_shutdown();
        })
        .await?;

    telemetry_task.await.ok();
    Ok(())
}
