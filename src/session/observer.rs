// =============================================================================
// Session Observer — injected diagnostics sink
// =============================================================================
//
// Sessions never log through ambient globals alone: every notable event goes
// through the observer they were built with. `TracingObserver` turns those
// events into structured tracing output; the host wraps it to also feed its
// error log and state version.
// =============================================================================

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::ChannelError;
use crate::types::{ControlToken, LifecycleState};

/// Which of the two sibling channels an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    Stream,
    Chat,
}

impl std::fmt::Display for SessionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stream => write!(f, "stream"),
            Self::Chat => write!(f, "chat"),
        }
    }
}

/// Why an inbound message was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscardReason {
    /// From a superseded channel, or received while Closing/Closed.
    Stale,
    /// Neither a trade batch nor a known control token.
    Unrecognized,
}

impl std::fmt::Display for DiscardReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stale => write!(f, "stale"),
            Self::Unrecognized => write!(f, "unrecognized"),
        }
    }
}

/// Per-session counters, owned by the session.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionDiagnostics {
    pub stale_messages: u64,
    pub unrecognized_messages: u64,
    pub control_tokens: u64,
    pub trades_accepted: u64,
    pub trades_other_symbols: u64,
    pub last_control: Option<ControlToken>,
    pub last_error: Option<String>,
}

impl SessionDiagnostics {
    /// Final counters, logged once when a session unmounts.
    pub fn log_summary(&self, kind: SessionKind) {
        info!(
            session = %kind,
            trades_accepted = self.trades_accepted,
            trades_other_symbols = self.trades_other_symbols,
            stale = self.stale_messages,
            unrecognized = self.unrecognized_messages,
            control_tokens = self.control_tokens,
            last_control = ?self.last_control,
            last_error = self.last_error.as_deref().unwrap_or("-"),
            "session unmounted"
        );
    }
}

pub trait SessionObserver: Send + Sync {
    fn state_changed(&self, _kind: SessionKind, _symbol: Option<&str>, _state: LifecycleState) {}

    fn channel_error(&self, _kind: SessionKind, _symbol: Option<&str>, _error: &ChannelError) {}

    fn discarded(&self, _kind: SessionKind, _reason: DiscardReason) {}

    fn control_token(&self, _kind: SessionKind, _token: ControlToken) {}

    /// Session-visible data changed (series point appended, chat message
    /// logged, status flipped).
    fn updated(&self, _kind: SessionKind) {}
}

/// Structured logging of session activity.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl SessionObserver for TracingObserver {
    fn state_changed(&self, kind: SessionKind, symbol: Option<&str>, state: LifecycleState) {
        info!(session = %kind, symbol = symbol.unwrap_or("-"), state = %state, "session state changed");
    }

    fn channel_error(&self, kind: SessionKind, symbol: Option<&str>, error: &ChannelError) {
        warn!(session = %kind, symbol = symbol.unwrap_or("-"), error = %error, "channel failed, not retrying");
    }

    fn discarded(&self, kind: SessionKind, reason: DiscardReason) {
        debug!(session = %kind, reason = %reason, "message discarded");
    }

    fn control_token(&self, kind: SessionKind, token: ControlToken) {
        debug!(session = %kind, token = %token, "control token received");
    }
}

// ---------------------------------------------------------------------------
// Test observer
// ---------------------------------------------------------------------------
