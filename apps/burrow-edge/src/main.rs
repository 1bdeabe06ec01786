use anyhow::{Context, Result};
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use burrow_edge::config::EdgeConfig;
use burrow_edge::registry::Registry;
use burrow_edge::AppState;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = EdgeConfig::from_env();
    info!(
        port = config.port,
        zone = %config.zone,
        database_url = %config.database_url,
        "starting burrow edge"
    );

    let registry = Registry::connect(&config.database_url)
        .await
        .context("failed to open tunnel registry")?;
    let state = AppState::new(&config, registry);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("burrow edge listening on {addr}");

    tokio::select! {
        result = burrow_edge::serve(listener, state) => {
            result.context("server exited with error")?;
        }
        _ = signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    Ok(())
}
