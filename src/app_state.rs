// =============================================================================
// Central Application State — ticker-live host
// =============================================================================
//
// Ties the two session tasks to the HTTP/WebSocket surface. Sessions own
// their data and publish it on watch channels; the host only holds the
// receiving ends plus the inputs it feeds back (symbol, chat commands,
// shutdown).
//
// Thread safety:
//   - Atomic counters for lock-free version tracking.
//   - parking_lot::RwLock for the config, error log and session status.
//   - tokio watch / mpsc channels between host and session tasks.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};

use crate::error::ChannelError;
use crate::runtime_config::FeedConfig;
use crate::session::observer::{DiscardReason, SessionKind, SessionObserver, TracingObserver};
use crate::session::ChatCommand;
use crate::types::{
    ChartFrame, ChatMessage, ChatSendMode, ConnectionStatus, ControlToken, LifecycleState,
};

// =============================================================================
// Error Record
// =============================================================================

/// A recorded error event for the UI error log.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    /// Human-readable error message.
    pub message: String,
    /// Which session raised it (`stream` / `chat`), if any.
    pub code: Option<String>,
    /// ISO 8601 timestamp.
    pub at: String,
}

/// Maximum number of recent errors to retain.
const MAX_RECENT_ERRORS: usize = 50;

// =============================================================================
// FeedMonitor — the observer injected into both sessions
// =============================================================================

/// Last known lifecycle and discard counters of one session.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionStatus {
    pub symbol: Option<String>,
    pub state: LifecycleState,
    pub stale_messages: u64,
    pub unrecognized_messages: u64,
    pub control_tokens: u64,
    pub last_control: Option<ControlToken>,
    pub errors: u64,
}

/// Collects what the sessions report and bumps the state version so the
/// push socket knows when to send a fresh snapshot.
#[derive(Debug, Default)]
pub struct FeedMonitor {
    state_version: AtomicU64,
    recent_errors: RwLock<Vec<ErrorRecord>>,
    stream: RwLock<SessionStatus>,
    chat: RwLock<SessionStatus>,
    log: TracingObserver,
}

impl FeedMonitor {
    pub fn new() -> Self {
        Self {
            state_version: AtomicU64::new(1),
            ..Self::default()
        }
    }

    // ── Version Management ──────────────────────────────────────────────

    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }

    // ── Error Logging ───────────────────────────────────────────────────

    /// Record an error with an optional code. The log is capped at
    /// [`MAX_RECENT_ERRORS`]; oldest entries are evicted first.
    pub fn push_error_with_code(&self, msg: String, code: Option<String>) {
        let record = ErrorRecord {
            message: msg,
            code,
            at: Utc::now().to_rfc3339(),
        };
        let mut errors = self.recent_errors.write();
        errors.push(record);
        while errors.len() > MAX_RECENT_ERRORS {
            errors.remove(0);
        }
        drop(errors);
        self.increment_version();
    }

    pub fn recent_errors(&self) -> Vec<ErrorRecord> {
        self.recent_errors.read().clone()
    }

    pub fn session_status(&self, kind: SessionKind) -> SessionStatus {
        self.slot(kind).read().clone()
    }

    fn slot(&self, kind: SessionKind) -> &RwLock<SessionStatus> {
        match kind {
            SessionKind::Stream => &self.stream,
            SessionKind::Chat => &self.chat,
        }
    }
}

impl SessionObserver for FeedMonitor {
    fn state_changed(&self, kind: SessionKind, symbol: Option<&str>, state: LifecycleState) {
        self.log.state_changed(kind, symbol, state);
        {
            let mut status = self.slot(kind).write();
            status.symbol = symbol.map(str::to_string);
            status.state = state;
        }
        self.increment_version();
    }

    fn channel_error(&self, kind: SessionKind, symbol: Option<&str>, error: &ChannelError) {
        self.log.channel_error(kind, symbol, error);
        self.slot(kind).write().errors += 1;
        let message = match symbol {
            Some(symbol) => format!("{symbol}: {error}"),
            None => error.to_string(),
        };
        self.push_error_with_code(message, Some(kind.to_string()));
    }

    fn discarded(&self, kind: SessionKind, reason: DiscardReason) {
        self.log.discarded(kind, reason);
        let mut status = self.slot(kind).write();
        match reason {
            DiscardReason::Stale => status.stale_messages += 1,
            DiscardReason::Unrecognized => status.unrecognized_messages += 1,
        }
    }

    fn control_token(&self, kind: SessionKind, token: ControlToken) {
        self.log.control_token(kind, token);
        let mut status = self.slot(kind).write();
        status.control_tokens += 1;
        status.last_control = Some(token);
    }

    fn updated(&self, _kind: SessionKind) {
        self.increment_version();
    }
}

// =============================================================================
// AppState
// =============================================================================

/// Shared across all async tasks via `Arc<AppState>`.
pub struct AppState {
    pub monitor: Arc<FeedMonitor>,

    // ── Configuration ───────────────────────────────────────────────────
    pub feed_config: RwLock<FeedConfig>,

    // ── Session links ───────────────────────────────────────────────────
    symbol_tx: watch::Sender<String>,
    shutdown_tx: watch::Sender<bool>,
    chart_rx: watch::Receiver<ChartFrame>,
    chat_rx: watch::Receiver<Vec<ChatMessage>>,
    chat_tx: mpsc::UnboundedSender<ChatCommand>,

    // ── Timing ──────────────────────────────────────────────────────────
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(
        config: FeedConfig,
        monitor: Arc<FeedMonitor>,
        chart_rx: watch::Receiver<ChartFrame>,
        chat_rx: watch::Receiver<Vec<ChatMessage>>,
        chat_tx: mpsc::UnboundedSender<ChatCommand>,
    ) -> Self {
        let (symbol_tx, _) = watch::channel(config.symbol.clone());
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            monitor,
            feed_config: RwLock::new(config),
            symbol_tx,
            shutdown_tx,
            chart_rx,
            chat_rx,
            chat_tx,
            start_time: std::time::Instant::now(),
        }
    }

    pub fn increment_version(&self) -> u64 {
        self.monitor.increment_version()
    }

    pub fn current_state_version(&self) -> u64 {
        self.monitor.current_state_version()
    }

    // ── Session inputs ──────────────────────────────────────────────────

    /// Routing input for both sessions.
    pub fn symbols(&self) -> watch::Receiver<String> {
        self.symbol_tx.subscribe()
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn current_symbol(&self) -> String {
        self.symbol_tx.borrow().clone()
    }

    /// Select `symbol` on both sessions. Selecting the current symbol again
    /// is forwarded too, so a session that gave up after an error reconnects.
    pub fn select_symbol(&self, symbol: &str) -> Result<String, ChannelError> {
        let symbol = symbol.trim();
        if symbol.is_empty() {
            return Err(ChannelError::Address("empty symbol".into()));
        }
        self.symbol_tx.send_replace(symbol.to_string());
        self.feed_config.write().symbol = symbol.to_string();
        self.increment_version();
        Ok(symbol.to_string())
    }

    /// Hand a chat message to the chat session and wait for its verdict.
    pub async fn send_chat(&self, text: String) -> Result<(), ChannelError> {
        let (reply, verdict) = oneshot::channel();
        self.chat_tx
            .send(ChatCommand::Send { text, reply })
            .map_err(|_| chat_not_running())?;
        verdict.await.map_err(|_| chat_not_running())?
    }

    /// Switch how the chat session delivers outgoing messages. Takes effect
    /// from the next send; the receive channel is left alone.
    pub fn set_chat_mode(&self, mode: ChatSendMode) -> Result<(), ChannelError> {
        self.chat_tx
            .send(ChatCommand::SetMode(mode))
            .map_err(|_| chat_not_running())?;
        self.feed_config.write().chat_send_mode = mode;
        self.increment_version();
        Ok(())
    }

    pub fn request_shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    // ── Session outputs ─────────────────────────────────────────────────

    pub fn chart_frame(&self) -> ChartFrame {
        self.chart_rx.borrow().clone()
    }

    pub fn chat_log(&self) -> Vec<ChatMessage> {
        self.chat_rx.borrow().clone()
    }

    // ── Snapshot Builder ────────────────────────────────────────────────

    /// Everything the UI needs in one payload. Served by
    /// `GET /api/v1/state` and the push socket.
    pub fn build_snapshot(&self) -> StateSnapshot {
        let now = Utc::now();
        let config = self.feed_config.read();

        let chart = {
            let frame = self.chart_rx.borrow();
            ChartSummary {
                symbol: frame.symbol.clone(),
                status: frame.status,
                points: frame.points.len(),
                last_price: frame.points.last().map(|p| p.price),
                volume: frame.volume,
                frame_version: frame.version,
            }
        };

        let chat = {
            let log = self.chat_rx.borrow();
            ChatSummary {
                messages: log.len(),
                last_message: log.last().cloned(),
                send_mode: config.chat_send_mode.to_string(),
                local_echo: config.chat_local_echo,
            }
        };

        StateSnapshot {
            state_version: self.current_state_version(),
            server_time: now.timestamp_millis(),
            uptime_s: self.start_time.elapsed().as_secs(),
            symbol: self.current_symbol(),
            server_url: config.server_url.clone(),
            chart,
            chat,
            sessions: SessionsSnapshot {
                stream: self.monitor.session_status(SessionKind::Stream),
                chat: self.monitor.session_status(SessionKind::Chat),
            },
            recent_errors: self.monitor.recent_errors(),
        }
    }
}

fn chat_not_running() -> ChannelError {
    ChannelError::SendFailed("chat session is not running".into())
}

// =============================================================================
// Serialisable snapshot types
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub state_version: u64,
    pub server_time: i64,
    pub uptime_s: u64,
    pub symbol: String,
    pub server_url: String,
    pub chart: ChartSummary,
    pub chat: ChatSummary,
    pub sessions: SessionsSnapshot,
    pub recent_errors: Vec<ErrorRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChartSummary {
    pub symbol: Option<String>,
    pub status: ConnectionStatus,
    pub points: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<f64>,
    pub frame_version: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatSummary {
    pub messages: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_message: Option<ChatMessage>,
    pub send_mode: String,
    pub local_echo: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionsSnapshot {
    pub stream: SessionStatus,
    pub chat: SessionStatus,
}

// =============================================================================
// Tests
// =============================================================================


#[cfg(test)]
mod tests {
    use super::testing::harness;
    use super::*;
    use crate::types::SeriesPoint;

    #[test]
    fn error_log_is_capped() {
        let monitor = FeedMonitor::new();
        for i in 0..(MAX_RECENT_ERRORS + 5) {
            monitor.push_error_with_code(format!("err {i}"), None);
        }
        let errors = monitor.recent_errors();
        assert_eq!(errors.len(), MAX_RECENT_ERRORS);
        assert_eq!(errors[0].message, "err 5");
    }

    #[test]
    fn monitor_tracks_session_activity() {
        let monitor = FeedMonitor::new();
        let v0 = monitor.current_state_version();

        monitor.state_changed(SessionKind::Stream, Some("AAPL"), LifecycleState::Open);
        monitor.discarded(SessionKind::Stream, DiscardReason::Stale);
        monitor.discarded(SessionKind::Stream, DiscardReason::Unrecognized);
        monitor.control_token(SessionKind::Stream, ControlToken::Ping);
        monitor.channel_error(
            SessionKind::Chat,
            Some("AAPL"),
            &ChannelError::ClosedByPeer,
        );

        let stream = monitor.session_status(SessionKind::Stream);
        assert_eq!(stream.state, LifecycleState::Open);
        assert_eq!(stream.symbol.as_deref(), Some("AAPL"));
        assert_eq!(stream.stale_messages, 1);
        assert_eq!(stream.unrecognized_messages, 1);
        assert_eq!(stream.last_control, Some(ControlToken::Ping));

        let chat = monitor.session_status(SessionKind::Chat);
        assert_eq!(chat.errors, 1);
        let errors = monitor.recent_errors();
        assert_eq!(errors[0].code.as_deref(), Some("chat"));
        assert!(errors[0].message.starts_with("AAPL: "));
        assert!(monitor.current_state_version() > v0);
    }

    #[test]
    fn select_symbol_trims_and_rejects_empty() {
        let h = harness();
        let mut rx = h.state.symbols();
        assert_eq!(rx.borrow_and_update().as_str(), "BINANCE:BTCUSDT");

        assert!(h.state.select_symbol("  ").is_err());
        assert!(!rx.has_changed().unwrap());

        assert_eq!(h.state.select_symbol(" TSLA ").unwrap(), "TSLA");
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().as_str(), "TSLA");
        assert_eq!(h.state.feed_config.read().symbol, "TSLA");

        // Same symbol again still notifies.
        h.state.select_symbol("TSLA").unwrap();
        assert!(rx.has_changed().unwrap());
    }

    #[test]
    fn snapshot_reflects_published_data() {
        let h = harness();
        h.chart_tx.send_replace(ChartFrame {
            symbol: Some("AAPL".into()),
            status: ConnectionStatus::Live,
            points: vec![SeriesPoint {
                time: Utc::now(),
                price: 190.5,
            }],
            volume: Some(12.0),
            version: 3,
        });
        h.chat_log_tx.send_replace(vec![ChatMessage::remote("hi")]);

        let snap = h.state.build_snapshot();
        assert_eq!(snap.chart.points, 1);
        assert_eq!(snap.chart.last_price, Some(190.5));
        assert_eq!(snap.chart.status, ConnectionStatus::Live);
        assert_eq!(snap.chat.messages, 1);
        assert_eq!(snap.chat.send_mode, "persistent");
        assert_eq!(snap.symbol, "BINANCE:BTCUSDT");
    }

    #[tokio::test]
    async fn send_chat_relays_the_session_verdict() {
        let mut h = harness();
        let state = h.state.clone();
        let send = tokio::spawn(async move { state.send_chat("gm".into()).await });

        let Some(ChatCommand::Send { text, reply }) = h.chat_cmd_rx.recv().await else {
            panic!("expected a send command");
        };
        assert_eq!(text, "gm");
        reply.send(Err(ChannelError::NotOpen)).unwrap();
        assert_eq!(send.await.unwrap(), Err(ChannelError::NotOpen));

        drop(h.chat_cmd_rx);
        assert!(matches!(
            h.state.send_chat("later".into()).await,
            Err(ChannelError::SendFailed(_))
        ));
    }

    #[test]
    fn chat_mode_switch_reaches_session_and_config() {
        let mut h = harness();
        let v0 = h.state.current_state_version();

        h.state.set_chat_mode(ChatSendMode::ShortLived).unwrap();
        assert!(matches!(
            h.chat_cmd_rx.try_recv(),
            Ok(ChatCommand::SetMode(ChatSendMode::ShortLived))
        ));
        assert_eq!(
            h.state.feed_config.read().chat_send_mode,
            ChatSendMode::ShortLived
        );
        assert!(h.state.current_state_version() > v0);
        assert_eq!(h.state.build_snapshot().chat.send_mode, "short_lived");

        drop(h.chat_cmd_rx);
        assert!(matches!(
            h.state.set_chat_mode(ChatSendMode::Persistent),
            Err(ChannelError::SendFailed(_))
        ));
        assert_eq!(
            h.state.feed_config.read().chat_send_mode,
            ChatSendMode::ShortLived
        );
    }

    #[test]
    fn shutdown_signal_flips_once_requested() {
        let h = harness();
        let rx = h.state.shutdown_signal();
        assert!(!*rx.borrow());
        h.state.request_shutdown();
        assert!(*rx.borrow());
    }
}
