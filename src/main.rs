//! imgproxy server entry point.
//!
//! Loads configuration, wires the pipeline into the HTTP surface, and
//! serves until shutdown. Invalid configuration is fatal before the
//! listener is bound.

use anyhow::{Context, Result};
use imgproxy::{api, config::Config, pipeline::ImageService, state::AppState};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env().context("invalid configuration")?;

    // Initialize tracing (prefer RUST_LOG, fallback to IMGPROXY_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting imgproxy");
    info!(
        origin_url = %config.origin_url,
        mode = ?config.mode,
        max_image_size = config.max_image_size,
        quality = config.quality,
        "Configuration loaded"
    );

    let service = ImageService::new(&config).context("failed to build image service")?;
    let state = AppState::new(service);
    let app = api::create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    info!(addr = %config.listen_addr, "Listening for connections");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Received shutdown signal");
        })
        .await?;

    Ok(())
}
