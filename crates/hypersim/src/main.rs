//! Hypersim - headless OPC receiver
//!
//! Usage: `hypersim [config.toml]`

use anyhow::{Context, Result};
use hypersim_opc::{OpcServer, PixelSink};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

mod config;
mod logging_setup;
mod sink;

use config::AppConfig;
use sink::FrameLogger;

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args_os().nth(1).map(PathBuf::from);
    let config = AppConfig::load(config_path.as_deref())?;

    // Guard must outlive every log statement
    let _log_guard = logging_setup::init(&config.log)?;

    if let Some(path) = &config_path {
        tracing::info!("Loaded configuration from {:?}", path);
    }

    let logger = Arc::new(FrameLogger::new());
    let server = OpcServer::start(
        config.server.clone(),
        Some(logger.clone() as Arc<dyn PixelSink>),
    )
    .await
    .context("Failed to start OPC server")?;

    let started = Instant::now();
    tracing::info!(
        "Hypersim ready on {} (Ctrl-C to quit)",
        server.local_addr()
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    tracing::info!("Shutting down");
    server.stop();
    server.stopped().await;

    tracing::info!("Received {}", logger.summary(started.elapsed()));

    Ok(())
}
