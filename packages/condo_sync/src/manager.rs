use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::channel::{
    ChannelEvent, ChannelHandle, ChannelState, ChannelSubscription, EventSink, StateChange,
};
use crate::transport::Transport;

/// Proof of one handler's interest in one channel. Hand it back to
/// [`SubscriptionManager::unsubscribe`] to detach.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionToken {
    id: u64,
    channel: String,
}

impl SubscriptionToken {
    pub fn channel(&self) -> &str {
        &self.channel
    }
}

#[derive(Default)]
struct HandlerList {
    sinks: Vec<(u64, Arc<dyn EventSink>)>,
    last_state: Option<StateChange>,
}

/// Fan-out sink in front of one subscription.
#[derive(Default)]
struct Handlers {
    inner: Mutex<HandlerList>,
}

impl Handlers {
    fn lock(&self) -> MutexGuard<'_, HandlerList> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a handler and replay the current state to it, so a late
    /// attacher learns the subscription is already confirmed.
    fn attach(&self, id: u64, sink: Arc<dyn EventSink>) {
        let mut list = self.lock();
        if let Some(last) = &list.last_state {
            sink.on_state_change(last);
        }
        list.sinks.push((id, sink));
    }

    fn detach(&self, id: u64) -> bool {
        let mut list = self.lock();
        let before = list.sinks.len();
        list.sinks.retain(|(sink_id, _)| *sink_id != id);
        list.sinks.len() != before
    }

    fn len(&self) -> usize {
        self.lock().sinks.len()
    }
}

impl EventSink for Handlers {
    fn on_event(&self, event: &ChannelEvent) {
        let sinks: Vec<Arc<dyn EventSink>> =
            self.lock().sinks.iter().map(|(_, s)| s.clone()).collect();
        for sink in sinks {
            sink.on_event(event);
        }
    }

    // Delivered under the lock so a replay in `attach` cannot overtake a
    // newer state.
    fn on_state_change(&self, change: &StateChange) {
        let mut list = self.lock();
        list.last_state = Some(change.clone());
        for (_, sink) in &list.sinks {
            sink.on_state_change(change);
        }
    }
}

struct ManagedChannel {
    handle: ChannelHandle,
    handlers: Arc<Handlers>,
}

#[derive(Default)]
struct Registry {
    channels: HashMap<String, ManagedChannel>,
    connected: bool,
}

/// Owner of every channel subscription in the process.
///
/// At most one subscription exists per channel name; further subscribers
/// share it. The shared transport connection is opened on the first
/// subscription and torn down when the last one goes away. Requests are
/// serialized, so a channel being closed reaches `Closed` before it can be
/// opened again.
pub struct SubscriptionManager {
    transport: Arc<dyn Transport>,
    registry: tokio::sync::Mutex<Registry>,
    next_id: AtomicU64,
}

impl SubscriptionManager {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            registry: tokio::sync::Mutex::new(Registry::default()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register `handler` for `channel`, opening the channel if no live
    /// subscription exists. Errors are reported to the handler through
    /// [`EventSink::on_state_change`], never retried here.
    pub async fn subscribe(&self, channel: &str, handler: Arc<dyn EventSink>) -> SubscriptionToken {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let token = SubscriptionToken {
            id,
            channel: channel.to_string(),
        };

        let mut registry = self.registry.lock().await;

        let handlers = match registry.channels.remove(channel) {
            Some(managed) if managed.handle.state().is_live() => {
                managed.handlers.attach(id, handler);
                debug!(
                    channel,
                    handlers = managed.handlers.len(),
                    "attached to existing subscription"
                );
                registry.channels.insert(channel.to_string(), managed);
                return token;
            }
            Some(stale) => {
                // Errored: the old subscription must be closed before the
                // channel is opened again. Its handlers move over.
                info!(channel, state = %stale.handle.state(), "reopening channel");
                stale.handle.close().await;
                stale.handlers.attach(id, handler);
                stale.handlers
            }
            None => {
                let handlers = Arc::new(Handlers::default());
                handlers.attach(id, handler);
                handlers
            }
        };

        self.ensure_connected(&mut registry).await;
        let handle = ChannelSubscription::open(self.transport.clone(), channel, handlers.clone());
        registry
            .channels
            .insert(channel.to_string(), ManagedChannel { handle, handlers });
        token
    }

    async fn ensure_connected(&self, registry: &mut Registry) {
        match self.transport.connect().await {
            Ok(()) => {
                if !registry.connected {
                    info!("realtime connection established");
                }
                registry.connected = true;
            }
            Err(e) => warn!(error = %e, "realtime connection failed"),
        }
    }

    /// Detach the handler behind `token`. The channel closes when its last
    /// handler leaves, and the connection when the last channel does.
    /// Returns false for a token that is no longer attached.
    pub async fn unsubscribe(&self, token: &SubscriptionToken) -> bool {
        let mut registry = self.registry.lock().await;

        let Some(managed) = registry.channels.get(&token.channel) else {
            return false;
        };
        if !managed.handlers.detach(token.id) {
            return false;
        }
        if managed.handlers.len() > 0 {
            return true;
        }

        if let Some(managed) = registry.channels.remove(&token.channel) {
            managed.handle.close().await;
        }
        if registry.channels.is_empty() && registry.connected {
            self.transport.disconnect().await;
            registry.connected = false;
            info!("realtime connection closed, no channels left");
        }
        true
    }

    pub async fn state(&self, channel: &str) -> Option<ChannelState> {
        let registry = self.registry.lock().await;
        registry.channels.get(channel).map(|m| m.handle.state())
    }

    pub async fn watch(&self, channel: &str) -> Option<watch::Receiver<ChannelState>> {
        let registry = self.registry.lock().await;
        registry.channels.get(channel).map(|m| m.handle.watch())
    }

    pub async fn active_channels(&self) -> Vec<String> {
        let registry = self.registry.lock().await;
        let mut names: Vec<String> = registry.channels.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn handler_count(&self, channel: &str) -> usize {
        let registry = self.registry.lock().await;
        registry
            .channels
            .get(channel)
            .map(|m| m.handlers.len())
            .unwrap_or(0)
    }

    /// Close every channel and the connection.
    pub async fn shutdown(&self) {
        let mut registry = self.registry.lock().await;
        for (_, managed) in registry.channels.drain() {
            managed.handle.close().await;
        }
        if registry.connected {
            self.transport.disconnect().await;
            registry.connected = false;
        }
        info!("subscription manager shut down");
    }
}
