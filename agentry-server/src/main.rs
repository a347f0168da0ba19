//! Agentry server binary: load configuration, assemble the engine, start
//! the scheduler, and serve the API until shutdown.

mod api;
mod engine;

use anyhow::Context;
use std::path::Path;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = agentry_core::EngineConfig::load(Path::new("."))
        .context("failed to load configuration")?;
    let port = config.port;

    let engine = engine::Engine::build(config).context("failed to assemble engine")?;
    let scheduled = engine.start_scheduler().context("failed to start scheduler")?;
    info!(agents = scheduled, "Heartbeat scheduler running");

    let app = api::router(engine.clone());
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("failed to bind port {port}"))?;
    info!(port, "Listening");

    let shutdown_engine = engine.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
            shutdown_engine.shutdown();
        })
        .await
        .context("server error")?;

    Ok(())
}
