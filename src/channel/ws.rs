// =============================================================================
// WebSocket Transport — tokio-tungstenite client channels
// =============================================================================

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use super::{
    ChannelAddress, ChannelControl, ChannelEvent, ChannelEventKind, ChannelHandle, ChannelId,
    Transport,
};
use crate::error::ChannelError;

/// Opens one tokio task per channel.
#[derive(Debug, Clone, Default)]
pub struct WsTransport;

impl WsTransport {
    pub fn new() -> Self {
        Self
    }
}

impl Transport for WsTransport {
    fn open(
        &self,
        id: ChannelId,
        address: ChannelAddress,
        events: mpsc::UnboundedSender<ChannelEvent>,
    ) -> ChannelHandle {
        let (handle, control) = ChannelHandle::new();
        tokio::spawn(run_channel(id, address, events, control));
        handle
    }
}

/// Drive a single connection until it closes, for whatever reason.
///
/// Always finishes with exactly one `Closed` event.
async fn run_channel(
    id: ChannelId,
    address: ChannelAddress,
    events: mpsc::UnboundedSender<ChannelEvent>,
    mut control: ChannelControl,
) {
    let emit = |kind: ChannelEventKind| {
        // The owning session may already be gone.
        let _ = events.send(ChannelEvent { channel: id, kind });
    };

    info!(channel = id, url = %address, "connecting channel");

    let connected = tokio::select! {
        res = connect_async(address.as_str()) => res,
        _ = control.close_rx.changed() => {
            debug!(channel = id, "close requested before connect completed");
            emit(ChannelEventKind::Closed);
            return;
        }
    };

    let ws_stream = match connected {
        Ok((ws_stream, _response)) => ws_stream,
        Err(e) => {
            warn!(channel = id, url = %address, error = %e, "channel connect failed");
            emit(ChannelEventKind::Error(ChannelError::Connect {
                url: address.to_string(),
                reason: e.to_string(),
            }));
            emit(ChannelEventKind::Closed);
            return;
        }
    };

    info!(channel = id, symbol = %address.symbol(), "channel open");
    emit(ChannelEventKind::Opened);

    let (mut write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            _ = control.close_rx.changed() => {
                // Also fires when the handle was dropped. Payloads queued
                // before the close request still go out first.
                while let Ok(payload) = control.outbound_rx.try_recv() {
                    if let Err(e) = write.send(Message::Text(payload)).await {
                        warn!(channel = id, error = %e, "channel send failed during close");
                        emit(ChannelEventKind::Error(ChannelError::SendFailed(e.to_string())));
                        break;
                    }
                }
                if let Err(e) = write.send(Message::Close(None)).await {
                    debug!(channel = id, error = %e, "close frame not delivered");
                }
                break;
            }

            Some(payload) = control.outbound_rx.recv() => {
                if let Err(e) = write.send(Message::Text(payload)).await {
                    warn!(channel = id, error = %e, "channel send failed");
                    emit(ChannelEventKind::Error(ChannelError::SendFailed(e.to_string())));
                    break;
                }
            }

            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => emit(ChannelEventKind::Message(text)),
                    Some(Ok(Message::Close(frame))) => {
                        debug!(channel = id, frame = ?frame, "close frame received");
                        break;
                    }
                    // Ping / Pong / Binary / raw frames carry no feed data;
                    // tungstenite answers pings on its own.
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(channel = id, error = %e, "channel read error");
                        emit(ChannelEventKind::Error(ChannelError::Transport(e.to_string())));
                        break;
                    }
                    None => {
                        debug!(channel = id, "channel stream ended");
                        break;
                    }
                }
            }
        }
    }

    info!(channel = id, "channel closed");
    emit(ChannelEventKind::Closed);
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
