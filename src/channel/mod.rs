// =============================================================================
// Channels — addressing, events and handles for push connections
// =============================================================================
//
// A channel is opened by a `Transport`, which runs the actual connection in
// its own task and reports every callback (open, message, error, close) as a
// `ChannelEvent` tagged with the channel id. The owning session consumes those
// events sequentially from a single queue, so the id tag is what keeps
// messages from a torn-down channel away from the next subscription.
// =============================================================================

pub mod lifecycle;
pub mod ws;

use tokio::sync::{mpsc, watch};
use url::Url;

use crate::error::ChannelError;

pub use lifecycle::{ChannelLifecycle, CloseOutcome, Transition};
pub use ws::WsTransport;

/// Session-local channel identifier. Never reused within a session.
pub type ChannelId = u64;

// ---------------------------------------------------------------------------
// Addressing
// ---------------------------------------------------------------------------

/// Routing path plus the name of the symbol-bearing query parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub server_url: String,
    pub path: String,
    pub symbol_param: String,
}

impl Endpoint {
    pub fn new(
        server_url: impl Into<String>,
        path: impl Into<String>,
        symbol_param: impl Into<String>,
    ) -> Self {
        Self {
            server_url: server_url.into(),
            path: path.into(),
            symbol_param: symbol_param.into(),
        }
    }

    /// Build the address of the feed for `symbol`, e.g.
    /// `ws://localhost:8000/ws/stocks?symbol=BINANCE%3ABTCUSDT`.
    pub fn address_for(&self, symbol: &str) -> Result<ChannelAddress, ChannelError> {
        let mut url = Url::parse(&self.server_url)
            .map_err(|e| ChannelError::Address(format!("{}: {e}", self.server_url)))?;

        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(ChannelError::Address(format!(
                "unsupported scheme {} in {}",
                url.scheme(),
                self.server_url
            )));
        }

        url.set_path(&self.path);
        url.query_pairs_mut()
            .clear()
            .append_pair(&self.symbol_param, symbol);

        Ok(ChannelAddress {
            symbol: symbol.to_string(),
            url,
        })
    }
}

/// Fully resolved channel address for one symbol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelAddress {
    symbol: String,
    url: Url,
}

impl ChannelAddress {
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn as_str(&self) -> &str {
        self.url.as_str()
    }
}

impl std::fmt::Display for ChannelAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.url.as_str())
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEventKind {
    Opened,
    Message(String),
    Error(ChannelError),
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelEvent {
    pub channel: ChannelId,
    pub kind: ChannelEventKind,
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Owner side of an open channel: close it or push outbound text.
///
/// Dropping the handle also signals the channel task to close.
#[derive(Debug)]
pub struct ChannelHandle {
    close_tx: watch::Sender<bool>,
    outbound_tx: mpsc::UnboundedSender<String>,
    close_requested: bool,
}

/// Transport side of a handle.
#[derive(Debug)]
pub struct ChannelControl {
    pub close_rx: watch::Receiver<bool>,
    pub outbound_rx: mpsc::UnboundedReceiver<String>,
}

impl ChannelHandle {
    pub fn new() -> (Self, ChannelControl) {
        let (close_tx, close_rx) = watch::channel(false);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        (
            Self {
                close_tx,
                outbound_tx,
                close_requested: false,
            },
            ChannelControl {
                close_rx,
                outbound_rx,
            },
        )
    }

    /// Queue a bare text payload for sending.
    pub fn send(&self, payload: String) -> Result<(), ChannelError> {
        if self.close_requested {
            return Err(ChannelError::NotOpen);
        }
        self.outbound_tx
            .send(payload)
            .map_err(|_| ChannelError::SendFailed("channel task has ended".into()))
    }

    /// Request close. Returns `true` only for the first request; later calls
    /// are no-ops.
    pub fn close(&mut self) -> bool {
        if self.close_requested {
            return false;
        }
        self.close_requested = true;
        // The task may already be gone; that is as closed as it gets.
        let _ = self.close_tx.send(true);
        true
    }
}

// ---------------------------------------------------------------------------
// Transport seam
// ---------------------------------------------------------------------------

/// Opens channels. Implementations must report, for every opened channel,
/// either `Opened` or `Error`, any number of `Message`s, and finally one
/// `Closed`, all tagged with `id` and delivered in order on `events`.
pub trait Transport: Send + Sync + 'static {
    fn open(
        &self,
        id: ChannelId,
        address: ChannelAddress,
        events: mpsc::UnboundedSender<ChannelEvent>,
    ) -> ChannelHandle;
}

// ---------------------------------------------------------------------------
// Test transport
// ---------------------------------------------------------------------------


#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint() -> Endpoint {
        Endpoint::new("ws://localhost:8000", "/ws/stocks", "symbol")
    }

    #[test]
    fn address_encodes_exchange_prefix() {
        let addr = endpoint().address_for("BINANCE:BTCUSDT").unwrap();
        assert_eq!(
            addr.as_str(),
            "ws://localhost:8000/ws/stocks?symbol=BINANCE%3ABTCUSDT"
        );
        assert_eq!(addr.symbol(), "BINANCE:BTCUSDT");
    }

    #[test]
    fn address_replaces_existing_query() {
        let ep = Endpoint::new("wss://feed.example.com/ignored?x=1", "/ws/chat", "symbol");
        let addr = ep.address_for("TSLA").unwrap();
        assert_eq!(addr.as_str(), "wss://feed.example.com/ws/chat?symbol=TSLA");
    }

    #[test]
    fn address_rejects_non_websocket_urls() {
        let ep = Endpoint::new("http://localhost:8000", "/ws/stocks", "symbol");
        assert!(matches!(ep.address_for("AAPL"), Err(ChannelError::Address(_))));

        let ep = Endpoint::new("not a url", "/ws/stocks", "symbol");
        assert!(matches!(ep.address_for("AAPL"), Err(ChannelError::Address(_))));
    }

    #[test]
    fn handle_close_is_idempotent() {
        let (mut handle, control) = ChannelHandle::new();
        assert!(handle.close());
        assert!(!handle.close());
        assert!(*control.close_rx.borrow());
        assert_eq!(handle.send("late".into()), Err(ChannelError::NotOpen));
    }

    #[test]
    fn handle_send_reaches_control() {
        let (handle, mut control) = ChannelHandle::new();
        handle.send("hello".into()).unwrap();
        assert_eq!(control.outbound_rx.try_recv().unwrap(), "hello");
    }
}
