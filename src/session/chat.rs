// =============================================================================
// Chat Session — per-symbol message stream
// =============================================================================
//
// Receive side: one long-lived channel per symbol, every inbound text goes to
// an append-only log. Lifecycle and teardown follow the stream session.
//
// Send side, chosen by `ChatSendMode`:
//   - Persistent: write to the open receive channel.
//   - ShortLived: open a dedicated channel, send once it opens, close it.
//     These channels share the session's event queue but never touch the
//     receive channel or the log.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::channel::{
    ChannelEvent, ChannelEventKind, ChannelHandle, ChannelId, ChannelLifecycle, CloseOutcome,
    Endpoint, Transition, Transport,
};
use crate::error::ChannelError;
use crate::session::observer::{DiscardReason, SessionDiagnostics, SessionKind, SessionObserver};
use crate::types::{ChatMessage, ChatSendMode, LifecycleState};

const KIND: SessionKind = SessionKind::Chat;

/// Input from the UI side.
#[derive(Debug)]
pub enum ChatCommand {
    /// Outgoing message, answered once the send was queued (or refused).
    Send {
        text: String,
        reply: oneshot::Sender<Result<(), ChannelError>>,
    },
    /// Change how later messages are sent.
    SetMode(ChatSendMode),
}

/// A short-lived send-only channel waiting to open.
struct PendingSend {
    handle: ChannelHandle,
    payload: Option<String>,
}

pub struct ChatSession {
    transport: Arc<dyn Transport>,
    endpoint: Endpoint,
    observer: Arc<dyn SessionObserver>,
    send_mode: ChatSendMode,
    local_echo: bool,
    lifecycle: ChannelLifecycle,
    events_rx: mpsc::UnboundedReceiver<ChannelEvent>,
    symbol: Option<String>,
    /// The message log itself; receivers see every change.
    log: watch::Sender<Vec<ChatMessage>>,
    pending: HashMap<ChannelId, PendingSend>,
    diagnostics: SessionDiagnostics,
}

impl ChatSession {
    pub fn new(
        transport: Arc<dyn Transport>,
        endpoint: Endpoint,
        observer: Arc<dyn SessionObserver>,
        send_mode: ChatSendMode,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (log, _) = watch::channel(Vec::new());
        Self {
            transport,
            endpoint,
            observer,
            send_mode,
            local_echo: false,
            lifecycle: ChannelLifecycle::new(events_tx),
            events_rx,
            symbol: None,
            log,
            pending: HashMap::new(),
            diagnostics: SessionDiagnostics::default(),
        }
    }

    /// Also log our own messages as `Local` when sending. Off by default: the
    /// server broadcasts every message back to all clients, sender included.
    pub fn with_local_echo(mut self, enabled: bool) -> Self {
        self.local_echo = enabled;
        self
    }

    pub fn set_send_mode(&mut self, mode: ChatSendMode) {
        if mode != self.send_mode {
            info!(from = %self.send_mode, to = %mode, "chat send mode changed");
            self.send_mode = mode;
        }
    }

    #[cfg(test)]
    fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    #[cfg(test)]
    fn messages(&self) -> Vec<ChatMessage> {
        self.log.borrow().clone()
    }

    #[cfg(test)]
    fn diagnostics(&self) -> &SessionDiagnostics {
        &self.diagnostics
    }

    pub fn log(&self) -> watch::Receiver<Vec<ChatMessage>> {
        self.log.subscribe()
    }

    /// Open the receive channel for `symbol`, replacing any previous one and
    /// starting a fresh log.
    pub fn subscribe(&mut self, symbol: &str) -> Result<(), ChannelError> {
        let symbol = symbol.trim();
        if symbol.is_empty() {
            return Err(ChannelError::Address("empty symbol".into()));
        }

        if self.symbol.as_deref() == Some(symbol) && self.lifecycle.state().is_active() {
            debug!(symbol = %symbol, "chat already subscribed");
            return Ok(());
        }

        let address = self.endpoint.address_for(symbol)?;

        if self.lifecycle.begin_close() == CloseOutcome::Requested {
            self.observer
                .state_changed(KIND, self.symbol.as_deref(), LifecycleState::Closing);
        }

        self.symbol = Some(symbol.to_string());
        self.lifecycle.open(self.transport.as_ref(), address);

        self.observer
            .state_changed(KIND, Some(symbol), LifecycleState::Connecting);
        self.publish_log(Vec::clear);
        Ok(())
    }

    /// Send one bare-text message using the configured send mode.
    pub fn send(&mut self, text: &str) -> Result<(), ChannelError> {
        if text.trim().is_empty() {
            return Err(ChannelError::SendFailed("message is empty".into()));
        }
        let Some(symbol) = self.symbol.clone() else {
            return Err(ChannelError::NotOpen);
        };

        match self.send_mode {
            ChatSendMode::Persistent => self.lifecycle.send(text.to_string())?,
            ChatSendMode::ShortLived => {
                let address = self.endpoint.address_for(&symbol)?;
                let id = self.lifecycle.allocate_id();
                let handle = self
                    .transport
                    .open(id, address, self.lifecycle.events_sender());
                debug!(channel = id, symbol = %symbol, "short-lived chat channel requested");
                self.pending.insert(
                    id,
                    PendingSend {
                        handle,
                        payload: Some(text.to_string()),
                    },
                );
            }
        }

        if self.local_echo {
            self.publish_log(|log| log.push(ChatMessage::local(text)));
        }
        Ok(())
    }

    pub fn handle_event(&mut self, event: ChannelEvent) {
        if self.pending.contains_key(&event.channel) {
            self.handle_pending(event);
            return;
        }

        match self.lifecycle.apply(event) {
            Transition::Opened => {
                self.observer
                    .state_changed(KIND, self.symbol.as_deref(), LifecycleState::Open);
            }
            Transition::Message(text) => {
                self.publish_log(|log| log.push(ChatMessage::remote(text)));
            }
            Transition::Failed(error) => {
                self.diagnostics.last_error = Some(error.to_string());
                self.observer.channel_error(KIND, self.symbol.as_deref(), &error);
                self.observer
                    .state_changed(KIND, self.symbol.as_deref(), LifecycleState::Closing);
                self.observer
                    .state_changed(KIND, self.symbol.as_deref(), LifecycleState::Closed);
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

    fn handle_pending(&mut self, event: ChannelEvent) {
        let id = event.channel;
        let Some(pending) = self.pending.get_mut(&id) else {
            return;
        };

        match event.kind {
            ChannelEventKind::Opened => {
                if let Some(payload) = pending.payload.take() {
                    if let Err(e) = pending.handle.send(payload) {
                        self.diagnostics.last_error = Some(e.to_string());
                        self.observer.channel_error(KIND, self.symbol.as_deref(), &e);
                    }
                }
                pending.handle.close();
            }
            // Send-only: whatever the server pushes here is read on the
            // receive channel instead.
            ChannelEventKind::Message(_) => {}
            ChannelEventKind::Error(e) => {
                if pending.payload.take().is_some() {
                    warn!(channel = id, error = %e, "chat message not delivered");
                }
                pending.handle.close();
                self.diagnostics.last_error = Some(e.to_string());
                self.observer.channel_error(KIND, self.symbol.as_deref(), &e);
            }
            ChannelEventKind::Closed => {
                self.pending.remove(&id);
            }
        }
    }

    /// Close the receive channel and drop the log. Short-lived send channels
    /// are left to finish on their own.
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

        let has_messages = !self.log.borrow().is_empty();
        if has_messages {
            self.publish_log(Vec::clear);
        }
        outcome
    }

    pub async fn run(
        mut self,
        mut symbols: watch::Receiver<String>,
        mut commands: mpsc::UnboundedReceiver<ChatCommand>,
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
                        info!("symbol source dropped, unmounting chat session");
                        break;
                    }
                    let next = symbols.borrow_and_update().clone();
                    self.subscribe_logged(&next);
                }
                _ = shutdown.changed() => {
                    info!("shutdown requested, closing chat session");
                    break;
                }
                Some(command) = commands.recv() => match command {
                    ChatCommand::Send { text, reply } => {
                        let result = self.send(&text);
                        if let Err(e) = &result {
                            debug!(error = %e, "chat send refused");
                        }
                        let _ = reply.send(result);
                    }
                    ChatCommand::SetMode(mode) => self.set_send_mode(mode),
                },
                Some(event) = self.events_rx.recv() => self.handle_event(event),
            }
        }

        self.teardown();
        self.await_closed(close_timeout).await;
        self.diagnostics.log_summary(KIND);
    }

    fn subscribe_logged(&mut self, symbol: &str) {
        if let Err(e) = self.subscribe(symbol) {
            warn!(symbol = %symbol, error = %e, "chat subscribe rejected");
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
            warn!(timeout_ms = timeout.as_millis() as u64, "chat close not confirmed in time");
            self.lifecycle.force_closed();
            self.observer
                .state_changed(KIND, self.symbol.as_deref(), LifecycleState::Closed);
        }
    }

    fn publish_log(&self, edit: impl FnOnce(&mut Vec<ChatMessage>)) {
        self.log.send_modify(edit);
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::testing::MockTransport;
    use crate::session::observer::testing::RecordingObserver;
    use crate::types::Origin;

    fn session(mode: ChatSendMode) -> (ChatSession, MockTransport, Arc<RecordingObserver>) {
        let mock = MockTransport::new();
        let observer = Arc::new(RecordingObserver::default());
        let session = ChatSession::new(
            Arc::new(mock.clone()),
            Endpoint::new("ws://localhost:8000", "/ws/chat", "symbol"),
            observer.clone(),
            mode,
        );
        (session, mock, observer)
    }

    fn open(session: &mut ChatSession, mock: &MockTransport, symbol: &str) -> usize {
        session.subscribe(symbol).unwrap();
        let idx = mock.opened() - 1;
        mock.emit(idx, ChannelEventKind::Opened);
        session.process_pending();
        idx
    }

    fn msg(text: &str) -> ChannelEventKind {
        ChannelEventKind::Message(text.to_string())
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn inbound_messages_are_logged_in_order() {
        let (mut s, mock, _) = session(ChatSendMode::Persistent);
        let ch = open(&mut s, &mock, "AAPL");
        assert_eq!(mock.url(ch), "ws://localhost:8000/ws/chat?symbol=AAPL");

        mock.emit(ch, msg("first"));
        mock.emit(ch, msg("second"));
        s.process_pending();

        let log = s.messages();
        let texts: Vec<&str> = log.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["first", "second"]);
        assert!(s.messages().iter().all(|m| m.origin == Origin::Remote));
        assert_eq!(s.log().borrow().len(), 2);
    }

    #[test]
    fn symbol_change_clears_log_and_discards_old_channel() {
        let (mut s, mock, _) = session(ChatSendMode::Persistent);
        let old = open(&mut s, &mock, "AAPL");
        mock.emit(old, msg("about apple"));
        s.process_pending();

        s.subscribe("TSLA").unwrap();
        assert!(mock.close_requested(old));
        assert!(s.messages().is_empty());
        assert_eq!(mock.symbol(1), "TSLA");

        mock.emit(old, msg("late apple talk"));
        s.process_pending();
        assert!(s.messages().is_empty());
        assert_eq!(s.diagnostics().stale_messages, 1);
    }

    #[test]
    fn persistent_send_uses_receive_channel() {
        let (mut s, mock, _) = session(ChatSendMode::Persistent);
        let ch = open(&mut s, &mock, "AAPL");

        s.send("hello").unwrap();
        assert_eq!(mock.sent(ch), vec!["hello".to_string()]);
        assert_eq!(mock.opened(), 1);
        // No local echo by default; the server broadcast brings it back.
        assert!(s.messages().is_empty());
    }

    #[test]
    fn persistent_send_requires_open_channel() {
        let (mut s, mock, _) = session(ChatSendMode::Persistent);
        assert_eq!(s.send("hello"), Err(ChannelError::NotOpen));

        s.subscribe("AAPL").unwrap();
        assert_eq!(s.send("hello"), Err(ChannelError::NotOpen));
        assert!(mock.sent(0).is_empty());
    }

    #[test]
    fn short_lived_send_opens_sends_and_closes() {
        let (mut s, mock, _) = session(ChatSendMode::ShortLived);
        let rx = open(&mut s, &mock, "AAPL");

        s.send("hi there").unwrap();
        assert_eq!(mock.opened(), 2);
        assert_eq!(mock.url(1), "ws://localhost:8000/ws/chat?symbol=AAPL");
        assert!(mock.sent(1).is_empty());

        mock.emit(1, ChannelEventKind::Opened);
        s.process_pending();
        assert_eq!(mock.sent(1), vec!["hi there".to_string()]);
        assert!(mock.close_requested(1));

        // The receive channel is untouched.
        assert!(!mock.close_requested(rx));
        assert!(mock.sent(rx).is_empty());
        assert_eq!(s.state(), LifecycleState::Open);

        // The echo that the send channel may see is not logged; the one on
        // the receive channel is.
        mock.emit(1, msg("hi there"));
        mock.emit(1, ChannelEventKind::Closed);
        mock.emit(rx, msg("hi there"));
        s.process_pending();
        assert_eq!(s.messages().len(), 1);
        assert_eq!(s.state(), LifecycleState::Open);
    }

    #[test]
    fn short_lived_send_works_without_receive_channel_open() {
        let (mut s, mock, _) = session(ChatSendMode::ShortLived);
        s.subscribe("AAPL").unwrap();

        s.send("queued").unwrap();
        mock.emit(1, ChannelEventKind::Opened);
        s.process_pending();
        assert_eq!(mock.sent(1), vec!["queued".to_string()]);
        assert_eq!(s.state(), LifecycleState::Connecting);
    }

    #[test]
    fn short_lived_failure_is_reported_not_fatal() {
        let (mut s, mock, observer) = session(ChatSendMode::ShortLived);
        let rx = open(&mut s, &mock, "AAPL");

        s.send("lost").unwrap();
        mock.emit(1, ChannelEventKind::Error(ChannelError::Transport("refused".into())));
        mock.emit(1, ChannelEventKind::Closed);
        s.process_pending();

        assert_eq!(observer.errors.lock().len(), 1);
        assert_eq!(s.state(), LifecycleState::Open);
        assert!(!mock.close_requested(rx));
    }

    #[test]
    fn switching_modes_keeps_the_data_model() {
        let (s, mock, _) = session(ChatSendMode::Persistent);
        let mut s_echo = s.with_local_echo(true);
        let rx = open(&mut s_echo, &mock, "AAPL");

        s_echo.send("one").unwrap();
        s_echo.set_send_mode(ChatSendMode::ShortLived);
        s_echo.send("two").unwrap();

        assert_eq!(mock.sent(rx), vec!["one".to_string()]);
        assert_eq!(mock.opened(), 2);
        let log = s_echo.messages();
        let local: Vec<&str> = log
            .iter()
            .filter(|m| m.origin == Origin::Local)
            .map(|m| m.text.as_str())
            .collect();
        assert_eq!(local, vec!["one", "two"]);
    }

    #[test]
    fn receive_failure_reports_closing_then_closed() {
        let (mut s, mock, observer) = session(ChatSendMode::Persistent);
        let ch = open(&mut s, &mock, "AAPL");
        mock.emit(ch, msg("kept"));
        mock.emit(ch, ChannelEventKind::Error(ChannelError::ClosedByPeer));
        mock.emit(ch, ChannelEventKind::Closed);
        s.process_pending();

        assert_eq!(
            observer.states_for(KIND),
            vec![
                LifecycleState::Connecting,
                LifecycleState::Open,
                LifecycleState::Closing,
                LifecycleState::Closed,
            ]
        );
        assert_eq!(s.state(), LifecycleState::Closed);
        // The log survives the failure until the next subscribe or teardown.
        assert_eq!(s.messages().len(), 1);
    }

    #[test]
    fn log_edits_reach_receivers_without_rebuilding() {
        let (mut s, mock, observer) = session(ChatSendMode::Persistent);
        let mut log = s.log();
        let ch = open(&mut s, &mock, "AAPL");
        let _ = log.borrow_and_update();
        let updates_before = *observer.updates.lock();

        for i in 0..10 {
            mock.emit(ch, msg(&format!("m{i}")));
        }
        s.process_pending();

        assert!(log.has_changed().unwrap());
        assert_eq!(log.borrow_and_update().len(), 10);
        assert_eq!(*observer.updates.lock(), updates_before + 10);

        s.teardown();
        assert!(log.has_changed().unwrap());
        assert!(log.borrow_and_update().is_empty());
    }

    #[test]
    fn empty_messages_are_refused() {
        let (mut s, mock, _) = session(ChatSendMode::ShortLived);
        open(&mut s, &mock, "AAPL");
        assert!(s.send("   ").is_err());
        assert_eq!(mock.opened(), 1);
    }

    #[test]
    fn teardown_twice_is_harmless() {
        let (mut s, mock, _) = session(ChatSendMode::Persistent);
        let ch = open(&mut s, &mock, "AAPL");
        mock.emit(ch, msg("x"));
        s.process_pending();

        assert_eq!(s.teardown(), CloseOutcome::Requested);
        assert_eq!(s.teardown(), CloseOutcome::AlreadyClosing);
        assert!(s.messages().is_empty());

        mock.emit(ch, ChannelEventKind::Closed);
        s.process_pending();
        assert_eq!(s.state(), LifecycleState::Closed);
    }

    #[tokio::test]
    async fn run_serves_commands_and_symbol_changes() {
        let (s, mock, _) = session(ChatSendMode::Persistent);
        let log = s.log();
        let (sym_tx, sym_rx) = watch::channel("AAPL".to_string());
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (_stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(s.run(sym_rx, cmd_rx, stop_rx, Duration::from_secs(5)));

        settle().await;
        mock.emit(0, ChannelEventKind::Opened);
        settle().await;

        let (reply_tx, reply_rx) = oneshot::channel();
        cmd_tx
            .send(ChatCommand::Send {
                text: "gm".into(),
                reply: reply_tx,
            })
            .unwrap();
        assert_eq!(reply_rx.await.unwrap(), Ok(()));
        assert_eq!(mock.sent(0), vec!["gm".to_string()]);

        // Later sends go over their own channel.
        cmd_tx.send(ChatCommand::SetMode(ChatSendMode::ShortLived)).unwrap();
        let (reply_tx, reply_rx) = oneshot::channel();
        cmd_tx
            .send(ChatCommand::Send {
                text: "gn".into(),
                reply: reply_tx,
            })
            .unwrap();
        assert_eq!(reply_rx.await.unwrap(), Ok(()));
        assert_eq!(mock.opened(), 2);
        assert_eq!(mock.sent(0), vec!["gm".to_string()]);
        mock.emit(1, ChannelEventKind::Opened);
        settle().await;
        assert_eq!(mock.sent(1), vec!["gn".to_string()]);
        mock.emit(1, ChannelEventKind::Closed);

        mock.emit(0, msg("gm"));
        settle().await;
        assert_eq!(log.borrow().len(), 1);

        sym_tx.send("TSLA".to_string()).unwrap();
        settle().await;
        assert!(mock.close_requested(0));
        assert!(log.borrow().is_empty());
        assert_eq!(mock.symbol(2), "TSLA");

        drop(sym_tx);
        settle().await;
        mock.emit(2, ChannelEventKind::Closed);
        task.await.unwrap();
    }
}
