//! The boundary to the process-wide realtime connection.
//!
//! A [`Transport`] delivers named events on named channels. It is shared
//! by every subscription in the process and only the
//! [`SubscriptionManager`](crate::SubscriptionManager) drives it.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::TransportError;

/// What a transport reports on an open channel.
#[derive(Clone, Debug, PartialEq)]
pub enum TransportEvent {
    /// The server confirmed the subscription
    Subscribed,
    /// The subscription failed or the connection under it went away
    Failed(TransportError),
    /// A named broadcast with its decoded payload
    Event { name: String, payload: Value },
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Establish the shared connection. Calling it while connected is a no-op.
    async fn connect(&self) -> Result<(), TransportError>;

    /// Ask the server for `channel`. Confirmation or rejection arrives on
    /// the returned stream, followed by the channel's events.
    async fn open_channel(
        &self,
        channel: &str,
    ) -> Result<mpsc::Receiver<TransportEvent>, TransportError>;

    /// Stop receiving `channel`. Unknown channels are ignored.
    async fn leave_channel(&self, channel: &str);

    /// Tear the shared connection down.
    async fn disconnect(&self);
}

#[derive(Default)]
struct MemoryState {
    connected: bool,
    refuse_connections: bool,
    manual_confirm: bool,
    rejected: HashSet<String>,
    channels: HashMap<String, mpsc::Sender<TransportEvent>>,
    opened: Vec<String>,
    left: Vec<String>,
    connects: usize,
    disconnects: usize,
    duplicate_opens: usize,
}

/// In-process transport. Tests and demos publish into it directly and
/// inspect what the engine asked of it.
#[derive(Clone)]
pub struct MemoryTransport {
    state: Arc<Mutex<MemoryState>>,
    buffer: usize,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::with_buffer(crate::SyncConfig::default().channel_buffer)
    }

    pub fn with_buffer(buffer: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            buffer: buffer.max(1),
        }
    }

    /// Hold subscriptions in `connecting` until [`confirm`](Self::confirm).
    pub fn manual_confirm(self) -> Self {
        self.lock().manual_confirm = true;
        self
    }

    /// Make every future subscription to `channel` fail.
    pub fn reject_channel(&self, channel: &str) {
        self.lock().rejected.insert(channel.to_string());
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.lock().refuse_connections = refuse;
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn sender(&self, channel: &str) -> Option<mpsc::Sender<TransportEvent>> {
        self.lock().channels.get(channel).cloned()
    }

    /// Broadcast `event` on `channel`. Returns false when nobody is subscribed.
    pub async fn publish(&self, channel: &str, event: &str, payload: Value) -> bool {
        let Some(tx) = self.sender(channel) else {
            return false;
        };
        tx.send(TransportEvent::Event {
            name: event.to_string(),
            payload,
        })
        .await
        .is_ok()
    }

    pub async fn confirm(&self, channel: &str) -> bool {
        let Some(tx) = self.sender(channel) else {
            return false;
        };
        tx.send(TransportEvent::Subscribed).await.is_ok()
    }

    pub async fn fail(&self, channel: &str, error: TransportError) -> bool {
        let Some(tx) = self.sender(channel) else {
            return false;
        };
        tx.send(TransportEvent::Failed(error)).await.is_ok()
    }

    /// Simulate the socket going away: every open channel fails and its
    /// stream ends.
    pub fn drop_connection(&self) {
        let mut state = self.lock();
        state.connected = false;
        for (_, tx) in state.channels.drain() {
            let _ = tx.try_send(TransportEvent::Failed(TransportError::ConnectionLost));
        }
    }

    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }

    pub fn is_open(&self, channel: &str) -> bool {
        self.lock().channels.contains_key(channel)
    }

    pub fn open_channels(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().channels.keys().cloned().collect();
        names.sort();
        names
    }

    /// Every `open_channel` call, in order.
    pub fn opened(&self) -> Vec<String> {
        self.lock().opened.clone()
    }

    /// Every `leave_channel` call for a channel that was open, in order.
    pub fn left(&self) -> Vec<String> {
        self.lock().left.clone()
    }

    /// Connections actually established (no-op reconnects not counted).
    pub fn connects(&self) -> usize {
        self.lock().connects
    }

    pub fn disconnects(&self) -> usize {
        self.lock().disconnects
    }

    /// Opens of a channel that was already open. Stays zero while the
    /// one-subscription-per-channel rule holds.
    pub fn duplicate_opens(&self) -> usize {
        self.lock().duplicate_opens
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        let mut state = self.lock();
        if state.refuse_connections {
            return Err(TransportError::Connect("connection refused".into()));
        }
        if !state.connected {
            state.connected = true;
            state.connects += 1;
            debug!("memory transport connected");
        }
        Ok(())
    }

    async fn open_channel(
        &self,
        channel: &str,
    ) -> Result<mpsc::Receiver<TransportEvent>, TransportError> {
        let mut state = self.lock();
        if !state.connected {
            return Err(TransportError::Connect("not connected".into()));
        }

        let (tx, rx) = mpsc::channel(self.buffer);
        if state.rejected.contains(channel) {
            let _ = tx.try_send(TransportEvent::Failed(TransportError::Subscribe {
                channel: channel.to_string(),
                reason: "rejected".into(),
            }));
        } else if !state.manual_confirm {
            let _ = tx.try_send(TransportEvent::Subscribed);
        }

        if state.channels.insert(channel.to_string(), tx).is_some() {
            state.duplicate_opens += 1;
        }
        state.opened.push(channel.to_string());
        Ok(rx)
    }

    async fn leave_channel(&self, channel: &str) {
        let mut state = self.lock();
        if state.channels.remove(channel).is_some() {
            state.left.push(channel.to_string());
        }
    }

    async fn disconnect(&self) {
        let mut state = self.lock();
        state.channels.clear();
        if state.connected {
            state.connected = false;
            state.disconnects += 1;
            debug!("memory transport disconnected");
        }
    }
}
