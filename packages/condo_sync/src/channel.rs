use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::TransportError;
use crate::transport::{Transport, TransportEvent};

/// Lifecycle of one channel subscription.
///
/// `Connecting → Subscribed` on confirmation, `Connecting/Subscribed → Error`
/// when the transport reports a failure, and any state `→ Closed` on close.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChannelState {
    Connecting,
    Subscribed,
    Error,
    Closed,
}

impl ChannelState {
    /// Still (or about to be) receiving events. Errored and closed
    /// subscriptions are not reused.
    pub fn is_live(&self) -> bool {
        matches!(self, ChannelState::Connecting | ChannelState::Subscribed)
    }

    /// The connectivity flag shown to users.
    pub fn is_connected(&self) -> bool {
        *self == ChannelState::Subscribed
    }
}

impl std::fmt::Display for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ChannelState::Connecting => "connecting",
            ChannelState::Subscribed => "subscribed",
            ChannelState::Error => "error",
            ChannelState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// A named event delivered on a channel.
#[derive(Clone, Debug, PartialEq)]
pub struct ChannelEvent {
    pub channel: String,
    pub name: String,
    pub payload: Value,
}

#[derive(Clone, Debug, PartialEq)]
pub struct StateChange {
    pub channel: String,
    pub state: ChannelState,
    pub error: Option<TransportError>,
}

/// Receiver of everything a subscription produces. Called from the
/// subscription's task, one call at a time, in delivery order.
pub trait EventSink: Send + Sync {
    fn on_event(&self, event: &ChannelEvent);
    fn on_state_change(&self, change: &StateChange);
}

/// Handle to a running subscription. Dropping it closes the subscription
/// without waiting for it.
pub struct ChannelHandle {
    channel: String,
    cancel: CancellationToken,
    state_rx: watch::Receiver<ChannelState>,
}

impl ChannelHandle {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn state(&self) -> ChannelState {
        *self.state_rx.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<ChannelState> {
        self.state_rx.clone()
    }

    /// Close the subscription and wait until the transport has let go of
    /// the channel. Closing twice is a no-op.
    pub async fn close(&self) {
        self.cancel.cancel();
        let mut rx = self.state_rx.clone();
        let _ = rx.wait_for(|state| *state == ChannelState::Closed).await;
    }
}

impl Drop for ChannelHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Actor owning one channel on the shared transport.
pub struct ChannelSubscription {
    transport: Arc<dyn Transport>,
    channel: String,
    sink: Arc<dyn EventSink>,
    state_tx: watch::Sender<ChannelState>,
    cancel: CancellationToken,
}

impl ChannelSubscription {
    /// Start subscribing to `channel`. Events and state changes go to `sink`.
    pub fn open(
        transport: Arc<dyn Transport>,
        channel: impl Into<String>,
        sink: Arc<dyn EventSink>,
    ) -> ChannelHandle {
        let channel = channel.into();
        let (state_tx, state_rx) = watch::channel(ChannelState::Connecting);
        let cancel = CancellationToken::new();

        let actor = Self {
            transport,
            channel: channel.clone(),
            sink,
            state_tx,
            cancel: cancel.clone(),
        };
        tokio::spawn(actor.run());

        ChannelHandle {
            channel,
            cancel,
            state_rx,
        }
    }

    async fn run(self) {
        info!(channel = %self.channel, "opening channel");
        self.sink.on_state_change(&StateChange {
            channel: self.channel.clone(),
            state: ChannelState::Connecting,
            error: None,
        });

        let opened = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            result = self.transport.open_channel(&self.channel) => Some(result),
        };

        match opened {
            None => {}
            Some(Err(e)) => {
                warn!(channel = %self.channel, error = %e, "channel failed to open");
                self.transition(ChannelState::Error, Some(e));
                self.cancel.cancelled().await;
            }
            Some(Ok(rx)) => self.pump(rx).await,
        }

        self.transport.leave_channel(&self.channel).await;
        self.transition(ChannelState::Closed, None);
        info!(channel = %self.channel, "channel closed");
    }

    async fn pump(&self, mut rx: mpsc::Receiver<TransportEvent>) {
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return,
                event = rx.recv() => match event {
                    Some(TransportEvent::Subscribed) => {
                        debug!(channel = %self.channel, "subscription confirmed");
                        self.transition(ChannelState::Subscribed, None);
                    }
                    Some(TransportEvent::Failed(e)) => {
                        warn!(channel = %self.channel, error = %e, "channel error");
                        self.transition(ChannelState::Error, Some(e));
                    }
                    Some(TransportEvent::Event { name, payload }) => {
                        debug!(channel = %self.channel, event = %name, "event received");
                        self.sink.on_event(&ChannelEvent {
                            channel: self.channel.clone(),
                            name,
                            payload,
                        });
                    }
                    None => {
                        if *self.state_tx.borrow() != ChannelState::Error {
                            self.transition(ChannelState::Error, Some(TransportError::ConnectionLost));
                        }
                        self.cancel.cancelled().await;
                        return;
                    }
                }
            }
        }
    }

    fn transition(&self, state: ChannelState, error: Option<TransportError>) {
        let changed = self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        if changed || error.is_some() {
            self.sink.on_state_change(&StateChange {
                channel: self.channel.clone(),
                state,
                error,
            });
        }
    }
}
