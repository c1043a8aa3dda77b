// =============================================================================
// Error taxonomy for the feed client
// =============================================================================
//
// Decode failures are absorbed by the wire decoder; only channel failures are
// surfaced outward to the owning session. Stale messages are not errors at
// all and only show up in the session diagnostics counters.
// =============================================================================

/// A structured payload that could not be turned into trades.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid batch JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("field {field} is not a number: {value}")]
    NotNumeric { field: &'static str, value: String },
}

/// Transport-level failure of a channel.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("channel closed by peer")]
    ClosedByPeer,

    #[error("channel is not open")]
    NotOpen,

    #[error("failed to send payload: {0}")]
    SendFailed(String),

    #[error("invalid channel address: {0}")]
    Address(String),
}
