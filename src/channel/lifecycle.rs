// =============================================================================
// Channel Lifecycle — Idle → Connecting → Open → Closing → Closed
// =============================================================================
//
// Tracks the one channel a session currently owns and classifies every
// incoming event against it. At most one channel is ever Connecting or Open:
// `open` closes the previous channel before asking the transport for a new
// one, and events carrying any other channel id are reported as stale.
// =============================================================================

use tokio::sync::mpsc;

use super::{ChannelAddress, ChannelEvent, ChannelEventKind, ChannelHandle, ChannelId, Transport};
use crate::error::ChannelError;
use crate::types::LifecycleState;

/// What an event meant for the owning session.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Connecting → Open.
    Opened,
    /// Inbound payload on the live channel.
    Message(String),
    /// Transport failure while Connecting/Open. The close is already done,
    /// so the session reports Closing and Closed back to back.
    Failed(ChannelError),
    /// Close confirmed after a requested close.
    Closed,
    /// A message from a superseded channel, or one arriving while Closing.
    Stale,
    /// Nothing to do (late confirmations of superseded channels, duplicates).
    Ignored,
}

/// Result of a close request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    /// A live channel was asked to close; now Closing.
    Requested,
    /// There never was a channel; now Closed.
    NeverOpened,
    AlreadyClosing,
    AlreadyClosed,
}

pub struct ChannelLifecycle {
    state: LifecycleState,
    current: Option<ChannelHandle>,
    current_id: Option<ChannelId>,
    next_id: ChannelId,
    events_tx: mpsc::UnboundedSender<ChannelEvent>,
}

impl ChannelLifecycle {
    pub fn new(events_tx: mpsc::UnboundedSender<ChannelEvent>) -> Self {
        Self {
            state: LifecycleState::Idle,
            current: None,
            current_id: None,
            next_id: 1,
            events_tx,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    #[cfg(test)]
    pub fn current_id(&self) -> Option<ChannelId> {
        self.current_id
    }

    /// Hand out an id from the same space as owned channels, for auxiliary
    /// channels whose events share the session queue.
    pub fn allocate_id(&mut self) -> ChannelId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn events_sender(&self) -> mpsc::UnboundedSender<ChannelEvent> {
        self.events_tx.clone()
    }

    /// Close whatever is live, then open a new channel to `address`.
    pub fn open<T: Transport + ?Sized>(
        &mut self,
        transport: &T,
        address: ChannelAddress,
    ) -> ChannelId {
        self.begin_close();

        let id = self.allocate_id();
        let handle = transport.open(id, address, self.events_tx.clone());
        self.current = Some(handle);
        self.current_id = Some(id);
        self.state = LifecycleState::Connecting;
        id
    }

    /// Ask the current channel to close. Safe to call in any state.
    pub fn begin_close(&mut self) -> CloseOutcome {
        match self.state {
            LifecycleState::Connecting | LifecycleState::Open => {
                if let Some(handle) = self.current.as_mut() {
                    handle.close();
                }
                self.state = LifecycleState::Closing;
                CloseOutcome::Requested
            }
            LifecycleState::Idle => {
                self.state = LifecycleState::Closed;
                CloseOutcome::NeverOpened
            }
            LifecycleState::Closing => CloseOutcome::AlreadyClosing,
            LifecycleState::Closed => CloseOutcome::AlreadyClosed,
        }
    }

    /// Give up waiting for a close confirmation.
    pub fn force_closed(&mut self) {
        if let Some(handle) = self.current.as_mut() {
            handle.close();
        }
        self.current = None;
        self.state = LifecycleState::Closed;
    }

    /// Send text over the current channel; only valid while Open.
    pub fn send(&self, payload: String) -> Result<(), ChannelError> {
        match (&self.current, self.state) {
            (Some(handle), LifecycleState::Open) => handle.send(payload),
            _ => Err(ChannelError::NotOpen),
        }
    }

    /// Classify `event` and advance the state machine.
    pub fn apply(&mut self, event: ChannelEvent) -> Transition {
        if self.current_id != Some(event.channel) {
            return match event.kind {
                ChannelEventKind::Message(_) => Transition::Stale,
                _ => Transition::Ignored,
            };
        }

        match (self.state, event.kind) {
            (LifecycleState::Connecting, ChannelEventKind::Opened) => {
                self.state = LifecycleState::Open;
                Transition::Opened
            }
            (LifecycleState::Open, ChannelEventKind::Message(raw)) => Transition::Message(raw),
            (_, ChannelEventKind::Message(_)) => Transition::Stale,

            (LifecycleState::Connecting | LifecycleState::Open, ChannelEventKind::Error(e)) => {
                self.finish();
                Transition::Failed(e)
            }
            (LifecycleState::Connecting | LifecycleState::Open, ChannelEventKind::Closed) => {
                self.finish();
                Transition::Failed(ChannelError::ClosedByPeer)
            }
            (LifecycleState::Closing, ChannelEventKind::Error(_) | ChannelEventKind::Closed) => {
                self.finish();
                Transition::Closed
            }
            _ => Transition::Ignored,
        }
    }

    fn finish(&mut self) {
        if let Some(mut handle) = self.current.take() {
            handle.close();
        }
        self.state = LifecycleState::Closed;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
