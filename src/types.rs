// =============================================================================
// Shared types used across the live feed client
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One priced unit of market activity, decoded from a single batch record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub symbol: String,
    pub price: f64,
    pub volume: f64,
    /// Local instant at which the carrying message was received.
    pub received_at: DateTime<Utc>,
}

/// Plain-text liveness sentinels sent outside the batch envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlToken {
    Ping,
    Pong,
}

impl ControlToken {
    pub const ALL: [ControlToken; 2] = [ControlToken::Ping, ControlToken::Pong];

    /// Exact wire form of the token.
    pub fn as_wire(self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::Pong => "pong",
        }
    }

    /// Match a raw body against the known token set (exact, case-sensitive).
    pub fn from_wire(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_wire() == raw)
    }
}

impl std::fmt::Display for ControlToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_wire())
    }
}

/// A single point of the display series.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SeriesPoint {
    pub time: DateTime<Utc>,
    pub price: f64,
}

/// Lifecycle of a session's channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleState {
    Idle,
    Connecting,
    Open,
    Closing,
    Closed,
}

impl Default for LifecycleState {
    fn default() -> Self {
        Self::Idle
    }
}

impl LifecycleState {
    /// `true` while a channel is requested or live.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Connecting | Self::Open)
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Open => write!(f, "Open"),
            Self::Closing => write!(f, "Closing"),
            Self::Closed => write!(f, "Closed"),
        }
    }
}

/// What the UI shows about the feed connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Idle,
    Connecting,
    Live,
    Disconnected,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self::Idle
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Connecting => write!(f, "connecting"),
            Self::Live => write!(f, "live"),
            Self::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// Where a chat message came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    Local,
    Remote,
}

/// One entry of the per-symbol chat log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub text: String,
    pub origin: Origin,
    pub received_at: DateTime<Utc>,
}

impl ChatMessage {
    pub fn remote(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            origin: Origin::Remote,
            received_at: Utc::now(),
        }
    }

    pub fn local(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            origin: Origin::Local,
            received_at: Utc::now(),
        }
    }
}

/// How outgoing chat messages reach the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatSendMode {
    /// Over the long-lived receive channel.
    Persistent,
    /// Over a fresh send-only channel that closes right after the payload.
    ShortLived,
}

impl Default for ChatSendMode {
    fn default() -> Self {
        Self::Persistent
    }
}

impl std::fmt::Display for ChatSendMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Persistent => write!(f, "persistent"),
            Self::ShortLived => write!(f, "short_lived"),
        }
    }
}

impl std::str::FromStr for ChatSendMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "persistent" => Ok(Self::Persistent),
            "short_lived" | "short-lived" => Ok(Self::ShortLived),
            other => Err(format!("unknown chat send mode: {other}")),
        }
    }
}

/// Everything the chart renderer needs for one redraw.
///
/// `points` is always the full buffer contents; the renderer owns its own
/// redraw cadence and never receives diffs.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ChartFrame {
    pub symbol: Option<String>,
    pub status: ConnectionStatus,
    pub points: Vec<SeriesPoint>,
    pub volume: Option<f64>,
    /// Bumped on every published frame.
    pub version: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_token_matches_exactly() {
        assert_eq!(ControlToken::from_wire("ping"), Some(ControlToken::Ping));
        assert_eq!(ControlToken::from_wire("pong"), Some(ControlToken::Pong));
        assert_eq!(ControlToken::from_wire("PING"), None);
        assert_eq!(ControlToken::from_wire(" ping"), None);
    }

    #[test]
    fn lifecycle_activity() {
        assert!(LifecycleState::Connecting.is_active());
        assert!(LifecycleState::Open.is_active());
        assert!(!LifecycleState::Closing.is_active());
        assert!(!LifecycleState::Idle.is_active());
    }

    #[test]
    fn origin_serialises_lowercase() {
        let json = serde_json::to_string(&Origin::Local).unwrap();
        assert_eq!(json, "\"local\"");
    }
}
