mod config;
mod engine;
mod platform;
mod scheduler;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::engine::Engine;
use crate::platform::telegram::TelegramSession;
use crate::platform::{feed, PlatformSession};
use crate::scheduler::StatusReport;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,autostar=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    info!("Loading configuration from: {}", config_path.display());
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    let settings = config.engine_settings();
    info!("Configuration loaded successfully");
    info!("  Reaction: {}", settings.reaction);
    info!("  Delay: {:.1}s", settings.min_delay.as_secs_f64());
    info!("  Scope: {}", settings.scope);
    info!("  Mode: {:?}", settings.normalizer.mode);

    info!("Starting Autostar...");
    let session = Arc::new(TelegramSession::new(teloxide::Bot::new(
        &config.telegram.bot_token,
    )));
    let me = session
        .whoami()
        .await
        .context("Failed to authenticate with Telegram")?;
    info!("Logged in as {}", me);

    let engine = Engine::new(settings, session);

    // Periodic status report
    let report =
        StatusReport::start(&config.report.status_cron, engine.stats(), engine.ledger()).await?;

    // Raw updates from the session bridge
    let (update_tx, update_rx) = mpsc::channel(1024);
    let feed_path = config.feed.path.clone();
    let feed_handle =
        tokio::spawn(async move { feed::pump_from(feed_path.as_deref(), update_tx).await });

    // Ctrl-C drains gracefully
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown requested, finishing in-flight reaction...");
                let _ = shutdown_tx.send(true);
            }
            Err(e) => warn!("Failed to listen for Ctrl-C: {}", e),
        }
    });

    info!("Listening for read updates... Press Ctrl+C to stop.");
    let stop_signal = shutdown_rx.clone();
    let result = engine.run(update_rx, shutdown_rx).await;

    // A failed engine or Ctrl-C leaves the feed possibly blocked on input
    let interrupted = result.is_err() || *stop_signal.borrow();
    let feed_result = feed::join_pump(feed_handle, interrupted).await;

    if let Err(e) = report.stop().await {
        warn!("{:#}", e);
    }

    result?;
    match feed_result {
        Ok(count) => info!("Stopped after {} updates", count),
        Err(e) => {
            error!("Update feed failed: {:#}", e);
            return Err(e);
        }
    }
    Ok(())
}
