// =============================================================================
// Feed Configuration — endpoint, symbol and chat settings with atomic save
// =============================================================================
//
// Where the feed server lives, which symbol to show on startup and how chat
// messages are sent. The last selected symbol is written back on shutdown.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash.  All fields carry `#[serde(default)]` so that adding new fields
// never breaks loading an older config file.
//
// =============================================================================

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::channel::Endpoint;
use crate::types::ChatSendMode;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_server_url() -> String {
    "ws://localhost:8000".to_string()
}

fn default_stream_path() -> String {
    "/ws/stocks".to_string()
}

fn default_chat_path() -> String {
    "/ws/chat".to_string()
}

fn default_symbol_param() -> String {
    "symbol".to_string()
}

fn default_symbol() -> String {
    "BINANCE:BTCUSDT".to_string()
}

fn default_close_timeout_ms() -> u64 {
    2_000
}

fn default_bind_addr() -> String {
    "0.0.0.0:3001".to_string()
}

// =============================================================================
// FeedConfig
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedConfig {
    // --- Feed server ---------------------------------------------------------

    /// Base URL of the push server (`ws://` or `wss://`).
    #[serde(default = "default_server_url")]
    pub server_url: String,

    /// Route of the market-data feed.
    #[serde(default = "default_stream_path")]
    pub stream_path: String,

    /// Route of the per-symbol chat.
    #[serde(default = "default_chat_path")]
    pub chat_path: String,

    /// Query parameter carrying the symbol on both routes.
    #[serde(default = "default_symbol_param")]
    pub symbol_param: String,

    // --- Session -------------------------------------------------------------

    /// Symbol subscribed at startup. Exchange prefix included.
    #[serde(default = "default_symbol")]
    pub symbol: String,

    /// How long teardown waits for the transport to confirm a close.
    #[serde(default = "default_close_timeout_ms")]
    pub close_timeout_ms: u64,

    // --- Chat ----------------------------------------------------------------

    #[serde(default)]
    pub chat_send_mode: ChatSendMode,

    /// Log our own chat messages locally on send. The server already
    /// broadcasts them back, so this doubles them unless it is changed.
    #[serde(default)]
    pub chat_local_echo: bool,

    // --- Host ----------------------------------------------------------------

    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            stream_path: default_stream_path(),
            chat_path: default_chat_path(),
            symbol_param: default_symbol_param(),
            symbol: default_symbol(),
            close_timeout_ms: default_close_timeout_ms(),
            chat_send_mode: ChatSendMode::default(),
            chat_local_echo: false,
            bind_addr: default_bind_addr(),
        }
    }
}

impl FeedConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read feed config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse feed config from {}", path.display()))?;

        info!(
            path = %path.display(),
            server = %config.server_url,
            symbol = %config.symbol,
            chat_send_mode = %config.chat_send_mode,
            "feed config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialise feed config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "feed config saved (atomic)");
        Ok(())
    }

    /// Apply `TICKER_*` environment overrides on top of the loaded file.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(url) = non_empty("TICKER_SERVER_URL") {
            self.server_url = url.trim().to_string();
        }
        if let Some(symbol) = non_empty("TICKER_SYMBOL") {
            self.symbol = symbol.trim().to_string();
        }
        if let Some(addr) = non_empty("TICKER_BIND_ADDR") {
            self.bind_addr = addr.trim().to_string();
        }
        if let Some(mode) = non_empty("TICKER_CHAT_SEND_MODE") {
            match mode.parse::<ChatSendMode>() {
                Ok(mode) => self.chat_send_mode = mode,
                Err(e) => warn!(error = %e, "ignoring TICKER_CHAT_SEND_MODE"),
            }
        }
    }

    /// Reject settings no session could start with.
    pub fn validate(&self) -> Result<()> {
        if self.symbol.trim().is_empty() {
            bail!("symbol must not be empty");
        }
        if self.close_timeout_ms == 0 {
            bail!("close_timeout_ms must be positive");
        }
        self.stream_endpoint()
            .address_for(&self.symbol)
            .context("invalid stream endpoint")?;
        self.chat_endpoint()
            .address_for(&self.symbol)
            .context("invalid chat endpoint")?;
        Ok(())
    }

    pub fn stream_endpoint(&self) -> Endpoint {
        Endpoint::new(&self.server_url, &self.stream_path, &self.symbol_param)
    }

    pub fn chat_endpoint(&self) -> Endpoint {
        Endpoint::new(&self.server_url, &self.chat_path, &self.symbol_param)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }
}
