// =============================================================================
// Stream Session — live price series for one symbol at a time
// =============================================================================
//
// Owns exactly one feed channel, its series buffer and the chart frame
// published to the renderer. Raw messages go through the wire decoder and
// the symbol filter before anything touches the buffer.
//
// Symbol change order matters: close the old channel, replace the buffer,
// then open the new channel. Every event carries its channel id, so traffic
// from the old channel that is still in flight is discarded as stale rather
// than appended to the new symbol's series.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::channel::{
    ChannelEvent, ChannelLifecycle, CloseOutcome, Endpoint, Transition, Transport,
};
use crate::error::ChannelError;
use crate::market_data::{symbol_filter, wire, SeriesBuffer, WireEvent};
use crate::session::observer::{DiscardReason, SessionDiagnostics, SessionKind, SessionObserver};
use crate::types::{ChartFrame, ConnectionStatus, LifecycleState};

const KIND: SessionKind = SessionKind::Stream;

pub struct StreamSession {
    transport: Arc<dyn Transport>,
    endpoint: Endpoint,
    observer: Arc<dyn SessionObserver>,
    lifecycle: ChannelLifecycle,
    events_rx: mpsc::UnboundedReceiver<ChannelEvent>,
    symbol: Option<String>,
    buffer: SeriesBuffer,
    status: ConnectionStatus,
    diagnostics: SessionDiagnostics,
    frames: watch::Sender<ChartFrame>,
    frame_version: u64,
    /// Set when the buffer was replaced; the next publish rebuilds the
    /// frame's points instead of extending them.
    frame_reset: bool,
}

impl StreamSession {
    pub fn new(
        transport: Arc<dyn Transport>,
        endpoint: Endpoint,
        observer: Arc<dyn SessionObserver>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (frames, _) = watch::channel(ChartFrame::default());
        Self {
            transport,
            endpoint,
            observer,
            lifecycle: ChannelLifecycle::new(events_tx),
            events_rx,
            symbol: None,
            buffer: SeriesBuffer::new(),
            status: ConnectionStatus::Idle,
            diagnostics: SessionDiagnostics::default(),
            frames,
            frame_version: 0,
            frame_reset: false,
        }
    }

    #[cfg(test)]
    fn symbol(&self) -> Option<&str> {
        self.symbol.as_deref()
    }

    #[cfg(test)]
    fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    #[cfg(test)]
    fn status(&self) -> ConnectionStatus {
        self.status
    }

    #[cfg(test)]
    fn buffer(&self) -> &SeriesBuffer {
        &self.buffer
    }

    #[cfg(test)]
    fn diagnostics(&self) -> &SessionDiagnostics {
        &self.diagnostics
    }

    /// Renderer-side view: always the latest full frame.
    pub fn frames(&self) -> watch::Receiver<ChartFrame> {
        self.frames.subscribe()
    }

    /// Switch the session to `symbol`. Re-subscribing to the live symbol is a
    /// no-op; re-subscribing after a failure reconnects.
    pub fn subscribe(&mut self, symbol: &str) -> Result<(), ChannelError> {
        let symbol = symbol.trim();
        if symbol.is_empty() {
            return Err(ChannelError::Address("empty symbol".into()));
        }

        if self.symbol.as_deref() == Some(symbol) && self.lifecycle.state().is_active() {
            debug!(symbol = %symbol, "already subscribed");
            return Ok(());
        }

        let address = self.endpoint.address_for(symbol)?;

        if self.lifecycle.begin_close() == CloseOutcome::Requested {
            self.observer
                .state_changed(KIND, self.symbol.as_deref(), LifecycleState::Closing);
        }

        // New subscription, new buffer.
        self.buffer = SeriesBuffer::new();
        self.frame_reset = true;
        self.symbol = Some(symbol.to_string());

        let channel = self.lifecycle.open(self.transport.as_ref(), address);
        debug!(symbol = %symbol, channel, "stream channel requested");

        self.status = ConnectionStatus::Connecting;
        self.observer
            .state_changed(KIND, Some(symbol), LifecycleState::Connecting);
        self.publish();
        Ok(())
    }

    /// Apply one channel callback.
    pub fn handle_event(&mut self, event: ChannelEvent) {
        match self.lifecycle.apply(event) {
            Transition::Opened => {
                self.status = ConnectionStatus::Live;
                self.observer
                    .state_changed(KIND, self.symbol.as_deref(), LifecycleState::Open);
                self.publish();
            }
            Transition::Message(raw) => self.ingest(&raw),
            Transition::Failed(error) => {
                self.status = ConnectionStatus::Disconnected;
                self.diagnostics.last_error = Some(error.to_string());
                self.observer.channel_error(KIND, self.symbol.as_deref(), &error);
                self.observer
                    .state_changed(KIND, self.symbol.as_deref(), LifecycleState::Closing);
                self.observer
                    .state_changed(KIND, self.symbol.as_deref(), LifecycleState::Closed);
                self.publish();
            }
            Transition::Closed => {
                self.observer
                    .state_changed(KIND, self.symbol.as_deref(), LifecycleState::Closed);
            }
            Transition::Stale => {
                self.diagnostics.stale_messages += 1;
                self.observer.discarded(KIND, DiscardReason::Stale);
            }
            Transition::Ignored => {}
        }
    }

    fn ingest(&mut self, raw: &str) {
        match wire::decode(raw, Utc::now()) {
            WireEvent::Trades(batch) => {
                let Some(active) = self.symbol.as_deref() else {
                    return;
                };
                let total = batch.len();
                let accepted = symbol_filter::for_symbol(batch, active);
                self.diagnostics.trades_other_symbols += (total - accepted.len()) as u64;

                if accepted.is_empty() {
                    return;
                }

                for trade in &accepted {
                    self.buffer.append_trade(trade);
                }
                self.diagnostics.trades_accepted += accepted.len() as u64;
                self.publish();
            }
            WireEvent::Control(token) => {
                self.diagnostics.control_tokens += 1;
                self.diagnostics.last_control = Some(token);
                self.observer.control_token(KIND, token);
            }
            WireEvent::Unrecognized => {
                self.diagnostics.unrecognized_messages += 1;
                self.observer.discarded(KIND, DiscardReason::Unrecognized);
            }
        }
    }

    /// Close the channel and discard the buffer. Safe to call repeatedly and
    /// on a session that never opened.
    pub fn teardown(&mut self) -> CloseOutcome {
        let outcome = self.lifecycle.begin_close();
        match outcome {
            CloseOutcome::Requested => {
                self.observer
                    .state_changed(KIND, self.symbol.as_deref(), LifecycleState::Closing);
            }
            CloseOutcome::NeverOpened => {
                self.observer
                    .state_changed(KIND, self.symbol.as_deref(), LifecycleState::Closed);
            }
            CloseOutcome::AlreadyClosing | CloseOutcome::AlreadyClosed => {}
        }

        if !self.buffer.is_empty() || self.status != ConnectionStatus::Idle {
            self.buffer.reset();
            self.frame_reset = true;
            self.status = ConnectionStatus::Idle;
            self.publish();
        }
        outcome
    }

    /// Event loop: follow `symbols` until the routing side goes away or
    /// `shutdown` fires, then tear down and wait (bounded) for the close
    /// confirmation.
    pub async fn run(
        mut self,
        mut symbols: watch::Receiver<String>,
        mut shutdown: watch::Receiver<bool>,
        close_timeout: Duration,
    ) {
        let initial = symbols.borrow_and_update().clone();
        if !initial.trim().is_empty() {
            self.subscribe_logged(&initial);
        }

        loop {
            tokio::select! {
                changed = symbols.changed() => {
                    if changed.is_err() {
                        info!("symbol source dropped, unmounting stream session");
                        break;
                    }
                    let next = symbols.borrow_and_update().clone();
                    self.subscribe_logged(&next);
                }
                _ = shutdown.changed() => {
                    info!("shutdown requested, closing stream session");
                    break;
                }
                Some(event) = self.events_rx.recv() => self.handle_event(event),
            }
        }

        self.teardown();
        self.await_closed(close_timeout).await;
        self.diagnostics.log_summary(KIND);
    }

    fn subscribe_logged(&mut self, symbol: &str) {
        if let Err(e) = self.subscribe(symbol) {
            warn!(symbol = %symbol, error = %e, "stream subscribe rejected");
            self.diagnostics.last_error = Some(e.to_string());
        }
    }

    async fn await_closed(&mut self, timeout: Duration) {
        let wait = async {
            while self.lifecycle.state() != LifecycleState::Closed {
                match self.events_rx.recv().await {
                    Some(event) => self.handle_event(event),
                    None => break,
                }
            }
        };
        let timed_out = tokio::time::timeout(timeout, wait).await.is_err();

        if timed_out {
            warn!(timeout_ms = timeout.as_millis() as u64, "stream close not confirmed in time");
            self.lifecycle.force_closed();
            self.observer
                .state_changed(KIND, self.symbol.as_deref(), LifecycleState::Closed);
        }
    }

    /// Bring the published frame up to date. The frame mirrors the buffer,
    /// so only points appended since the last publish are copied.
    fn publish(&mut self) {
        self.frame_version += 1;
        let reset = std::mem::take(&mut self.frame_reset);
        let points = self.buffer.points();
        let symbol = &self.symbol;
        let status = self.status;
        let volume = self.buffer.latest_volume();
        let version = self.frame_version;

        self.frames.send_modify(|frame| {
            if reset || frame.points.len() > points.len() {
                frame.points.clear();
            }
            let synced = frame.points.len();
            frame.points.extend_from_slice(&points[synced..]);
            if frame.symbol != *symbol {
                frame.symbol = symbol.clone();
            }
            frame.status = status;
            frame.volume = volume;
            frame.version = version;
        });
        self.observer.updated(KIND);
    }

    #[cfg(test)]
    fn process_pending(&mut self) {
        while let Ok(event) = self.events_rx.try_recv() {
            self.handle_event(event);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
