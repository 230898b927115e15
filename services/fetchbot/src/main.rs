mod cancel;
mod config;
mod errors;
mod extractor;
mod extractor_ytdlp;
mod orchestrator;
mod probe_http;
mod progress;
mod render;
mod state;
mod telegram_receive;
mod transport;
mod transport_telegram;
mod types;
mod worker_loop;

#[cfg(test)]
mod testkit;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::AppConfig;
use crate::extractor_ytdlp::YtDlpExtractor;
use crate::probe_http::HttpRangeProbe;
use crate::state::AppState;
use crate::transport_telegram::TelegramTransport;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cfg = AppConfig::from_env()?;

    tokio::fs::create_dir_all(&cfg.output_dir)
        .await
        .with_context(|| format!("Failed to create output dir {}", cfg.output_dir.display()))?;
    worker_loop::purge_stale_workspaces(&cfg.output_dir)
        .await
        .context("Failed to clean output dir")?;

    let extractor = YtDlpExtractor::new(cfg.ytdlp_bin.clone(), cfg.ffmpeg_bin.clone(), cfg.concurrent_fragments);
    let transport = TelegramTransport::new(cfg.api_base.clone(), cfg.bot_token.clone())
        .context("Failed to build Bot API client")?;
    let probe = HttpRangeProbe::new(cfg.probe_timeout).context("Failed to build probe client")?;

    info!(
        workers = cfg.workers,
        queue_capacity = cfg.queue_capacity,
        max_send_bytes = cfg.max_send_bytes,
        output_dir = %cfg.output_dir.display(),
        "fetchbot starting"
    );

    let state = Arc::new(AppState::new(cfg, Arc::new(extractor), Arc::new(transport), Arc::new(probe)));

    let workers = worker_loop::spawn_workers(&state);
    let sweeper = tokio::spawn(orchestrator::run_store_sweeper(state.clone()));

    let shutdown = CancellationToken::new();
    let receiver = tokio::spawn(telegram_receive::telegram_receive_loop(state.clone(), shutdown.clone()));

    tokio::signal::ctrl_c().await.context("Failed to listen for ctrl-c")?;
    info!("shutdown requested");
    shutdown.cancel();

    match receiver.await {
        Ok(result) => result?,
        Err(e) => tracing::warn!("receive loop panicked: {e}"),
    }
    sweeper.abort();
    for worker in workers {
        worker.abort();
    }
    info!(
        active = state.pool.active(),
        peak_active = state.pool.peak_active(),
        pending = state.store.len().await,
        "fetchbot stopped"
    );
    Ok(())
}
