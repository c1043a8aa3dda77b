// =============================================================================
// Wire Decoder — inbound stream message classification
// =============================================================================
//
// The feed server pushes two shapes over the same channel:
//   1. A JSON trade batch: `{"data":[{"s":"AAPL","p":190.1,"v":3}, ...]}`
//   2. A bare control token (`ping` / `pong`) that is not valid JSON.
//
// Anything else is expected chatter and is dropped as `Unrecognized`.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::DecodeError;
use crate::types::{ControlToken, Trade};

/// Typed classification of one inbound message body.
#[derive(Debug, Clone, PartialEq)]
pub enum WireEvent {
    /// One trade per batch record, in arrival order.
    Trades(Vec<Trade>),
    Control(ControlToken),
    Unrecognized,
}

#[derive(Debug, Deserialize, Serialize)]
struct BatchEnvelope {
    data: Vec<TradeRecord>,
}

/// Raw record. Prices and volumes arrive either as JSON numbers or as numeric
/// strings depending on the upstream exchange, so they are parsed by hand.
#[derive(Debug, Deserialize, Serialize)]
struct TradeRecord {
    s: String,
    p: serde_json::Value,
    v: serde_json::Value,
}

/// Classify a raw message body. Never fails: malformed input degrades to
/// [`WireEvent::Unrecognized`].
pub fn decode(raw: &str, received_at: DateTime<Utc>) -> WireEvent {
    match decode_batch(raw, received_at) {
        Ok(trades) => WireEvent::Trades(trades),
        Err(e) => match ControlToken::from_wire(raw) {
            Some(token) => WireEvent::Control(token),
            None => {
                debug!(error = %e, len = raw.len(), "unrecognized stream message");
                WireEvent::Unrecognized
            }
        },
    }
}

/// Strict structured decode of a trade batch.
pub fn decode_batch(raw: &str, received_at: DateTime<Utc>) -> Result<Vec<Trade>, DecodeError> {
    let envelope: BatchEnvelope = serde_json::from_str(raw)?;

    envelope
        .data
        .into_iter()
        .map(|record| {
            Ok(Trade {
                price: parse_number(&record.p, "p")?,
                volume: parse_number(&record.v, "v")?,
                symbol: record.s,
                received_at,
            })
        })
        .collect()
}

/// Re-serialise trades into the batch envelope (numbers, not strings).
#[cfg(test)]
pub fn encode_batch(trades: &[Trade]) -> Result<String, serde_json::Error> {
    let envelope = BatchEnvelope {
        data: trades
            .iter()
            .map(|t| TradeRecord {
                s: t.symbol.clone(),
                p: serde_json::json!(t.price),
                v: serde_json::json!(t.volume),
            })
            .collect(),
    };
    serde_json::to_string(&envelope)
}

fn parse_number(val: &serde_json::Value, field: &'static str) -> Result<f64, DecodeError> {
    let parsed = match val {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };

    parsed
        .filter(|n| n.is_finite())
        .ok_or_else(|| DecodeError::NotNumeric {
            field,
            value: val.to_string(),
        })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
