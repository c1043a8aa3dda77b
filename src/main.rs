// =============================================================================
// ticker-live — Main Entry Point
// =============================================================================
//
// Runs one stream session and one chat session for the selected symbol and
// exposes their output over HTTP + a push socket. The symbol selected last
// is remembered in the config file on shutdown.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod channel;
mod error;
mod market_data;
mod runtime_config;
mod session;
mod types;

use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::{AppState, FeedMonitor};
use crate::channel::{Transport, WsTransport};
use crate::runtime_config::FeedConfig;
use crate::session::{ChatSession, StreamSession};

const CONFIG_PATH: &str = "feed_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("ticker-live starting up");

    let mut config = FeedConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        FeedConfig::default()
    });
    config.apply_env_overrides();
    config.validate().context("invalid feed configuration")?;

    info!(
        server = %config.server_url,
        symbol = %config.symbol,
        chat_send_mode = %config.chat_send_mode,
        "feed configured"
    );

    // ── 2. Sessions ──────────────────────────────────────────────────────
    let transport: Arc<dyn Transport> = Arc::new(WsTransport::new());
    let monitor = Arc::new(FeedMonitor::new());

    let stream = StreamSession::new(
        transport.clone(),
        config.stream_endpoint(),
        monitor.clone(),
    );
    let chat = ChatSession::new(
        transport,
        config.chat_endpoint(),
        monitor.clone(),
        config.chat_send_mode,
    )
    .with_local_echo(config.chat_local_echo);

    let (chat_tx, chat_rx) = tokio::sync::mpsc::unbounded_channel();
    let close_timeout = config.close_timeout();
    let bind_addr = config.bind_addr.clone();

    // ── 3. Shared state ──────────────────────────────────────────────────
    let state = Arc::new(AppState::new(
        config,
        monitor,
        stream.frames(),
        chat.log(),
        chat_tx,
    ));

    let stream_task = tokio::spawn(stream.run(
        state.symbols(),
        state.shutdown_signal(),
        close_timeout,
    ));
    let chat_task = tokio::spawn(chat.run(
        state.symbols(),
        chat_rx,
        state.shutdown_signal(),
        close_timeout,
    ));

    // ── 4. API server ────────────────────────────────────────────────────
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind API server on {bind_addr}"))?;
    info!(addr = %bind_addr, "API server listening");

    let app = api::rest::router(state.clone());
    let mut server_shutdown = state.shutdown_signal();
    let server = tokio::spawn(async move {
        let stop = async move {
            let _ = server_shutdown.changed().await;
        };
        if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(stop).await {
            error!(error = %e, "API server failed");
        }
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 5. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received, stopping gracefully");
    state.request_shutdown();

    for (name, task) in [("stream", stream_task), ("chat", chat_task)] {
        if let Err(e) = task.await {
            error!(session = name, error = %e, "session task panicked");
        }
    }
    if let Err(e) = server.await {
        error!(error = %e, "API server task panicked");
    }

    if let Err(e) = state.feed_config.read().save(CONFIG_PATH) {
        error!(error = %e, "Failed to save feed config on shutdown");
    }

    info!("ticker-live shut down complete.");
    Ok(())
}
