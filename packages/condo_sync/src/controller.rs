use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::api::{ChatApi, OutgoingMessage};
use crate::channel::{ChannelEvent, ChannelState, EventSink, StateChange};
use crate::config::SyncConfig;
use crate::error::{ApiError, HistoryFetchError, SendFailure};
use crate::manager::{SubscriptionManager, SubscriptionToken};
use crate::messages::{MessageStore, Reconciled};
use crate::model::{ConversationId, Identity, Message};
use crate::wire;

/// Where the controller is in opening a conversation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// No conversation open
    Idle,
    /// History fetch in flight and no live event seen yet
    Loading(ConversationId),
    /// History applied (or given up on) or a live event arrived
    Live(ConversationId),
}

impl Phase {
    pub fn conversation(&self) -> Option<ConversationId> {
        match self {
            Phase::Idle => None,
            Phase::Loading(id) | Phase::Live(id) => Some(*id),
        }
    }
}

/// Result of opening (or reopening) a context.
#[derive(Clone, Debug, PartialEq)]
pub enum LoadOutcome {
    /// History applied; `entries` is the list length afterwards
    Loaded { entries: usize },
    /// History unavailable; the context is live with whatever the channel
    /// delivers
    Degraded(HistoryFetchError),
    /// Another context was selected before the fetch returned; the response
    /// was discarded
    Superseded,
    /// Nothing is open
    Closed,
}

struct Session {
    phase: Phase,
    store: MessageStore,
}

struct Shared {
    session: Mutex<Session>,
    connectivity: watch::Sender<ChannelState>,
    revision: watch::Sender<u64>,
}

impl Shared {
    fn session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn bump(&self) {
        self.revision.send_modify(|r| *r += 1);
    }
}

/// Delivers one conversation's channel into the shared session. Anything
/// arriving once another conversation is open is dropped.
struct ConversationSink {
    conversation: ConversationId,
    shared: Arc<Shared>,
}

impl EventSink for ConversationSink {
    fn on_event(&self, event: &ChannelEvent) {
        if wire::normalize_event_name(&event.name) != wire::MESSAGE_SENT {
            debug!(channel = %event.channel, event = %event.name, "ignoring event");
            return;
        }
        let message = match wire::decode_message_event(&event.payload, self.conversation) {
            Ok(message) => message,
            Err(e) => {
                warn!(channel = %event.channel, error = %e, "dropping malformed event");
                return;
            }
        };

        let changed = {
            let mut session = self.shared.session();
            if session.phase.conversation() != Some(self.conversation) {
                debug!(conversation = %self.conversation, "event for closed conversation dropped");
                return;
            }
            let outcome = session.store.reconcile_server(message);
            let promoted = session.phase == Phase::Loading(self.conversation);
            if promoted {
                session.phase = Phase::Live(self.conversation);
            }
            debug!(conversation = %self.conversation, ?outcome, "live message");
            promoted || matches!(outcome, Reconciled::Inserted | Reconciled::Replaced { .. })
        };
        if changed {
            self.shared.bump();
        }
    }

    fn on_state_change(&self, change: &StateChange) {
        if self.shared.session().phase.conversation() == Some(self.conversation) {
            self.shared.connectivity.send_replace(change.state);
        }
    }
}

/// Drives the open conversation: which channel is subscribed, what the
/// message list holds, and optimistic sends.
pub struct ConversationController {
    manager: Arc<SubscriptionManager>,
    api: Arc<dyn ChatApi>,
    identity: Identity,
    shared: Arc<Shared>,
    subscription: tokio::sync::Mutex<Option<SubscriptionToken>>,
}

impl ConversationController {
    pub fn new(
        manager: Arc<SubscriptionManager>,
        api: Arc<dyn ChatApi>,
        identity: Identity,
        config: &SyncConfig,
    ) -> Self {
        let shared = Shared {
            session: Mutex::new(Session {
                phase: Phase::Idle,
                store: MessageStore::new(config.reconciliation_window),
            }),
            connectivity: watch::Sender::new(ChannelState::Closed),
            revision: watch::Sender::new(0),
        };
        Self {
            manager,
            api,
            identity,
            shared: Arc::new(shared),
            subscription: tokio::sync::Mutex::new(None),
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Open `conversation`, or close the current one with `None`.
    ///
    /// The previous channel is unsubscribed before anything else, the list
    /// is cleared, the new channel is subscribed and history is fetched. A
    /// failed fetch still leaves the conversation live.
    pub async fn select_conversation(&self, conversation: Option<ConversationId>) -> LoadOutcome {
        let mut subscription = self.subscription.lock().await;
        if let Some(token) = subscription.take() {
            debug!(channel = token.channel(), "leaving conversation channel");
            self.manager.unsubscribe(&token).await;
        }

        {
            let mut session = self.shared.session();
            session.store.open(conversation);
            session.phase = match conversation {
                Some(id) => Phase::Loading(id),
                None => Phase::Idle,
            };
        }
        self.shared.connectivity.send_replace(match conversation {
            Some(_) => ChannelState::Connecting,
            None => ChannelState::Closed,
        });
        self.shared.bump();

        let Some(conversation) = conversation else {
            info!("conversation closed");
            return LoadOutcome::Closed;
        };
        info!(conversation = %conversation, "opening conversation");

        *subscription = Some(self.subscribe(conversation).await);
        drop(subscription);

        let history = self.api.fetch_history(conversation).await;
        self.apply_history(conversation, history)
    }

    async fn subscribe(&self, conversation: ConversationId) -> SubscriptionToken {
        let sink = Arc::new(ConversationSink {
            conversation,
            shared: self.shared.clone(),
        });
        self.manager
            .subscribe(&conversation.channel_name(), sink)
            .await
    }

    fn apply_history(
        &self,
        conversation: ConversationId,
        history: Result<Vec<Message>, ApiError>,
    ) -> LoadOutcome {
        let outcome = {
            let mut session = self.shared.session();
            if session.phase.conversation() != Some(conversation) {
                warn!(conversation = %conversation, "discarding history for a conversation no longer open");
                return LoadOutcome::Superseded;
            }

            let outcome = match history {
                Ok(history) => {
                    session.store.load(conversation, history);
                    LoadOutcome::Loaded {
                        entries: session.store.len(),
                    }
                }
                Err(source) => {
                    let err = HistoryFetchError {
                        channel: conversation.channel_name(),
                        source,
                    };
                    warn!(conversation = %conversation, error = %err, "history unavailable, continuing with live events only");
                    LoadOutcome::Degraded(err)
                }
            };
            session.phase = Phase::Live(conversation);
            outcome
        };
        self.shared.bump();
        outcome
    }

    /// Subscribe the open conversation's channel again and refetch its
    /// history. Used after a transport error; nothing retries on its own.
    pub async fn retry(&self) -> LoadOutcome {
        let mut subscription = self.subscription.lock().await;
        let Some(conversation) = self.phase().conversation() else {
            return LoadOutcome::Closed;
        };
        info!(conversation = %conversation, "retrying conversation");

        if let Some(token) = subscription.take() {
            self.manager.unsubscribe(&token).await;
        }
        self.shared.connectivity.send_replace(ChannelState::Connecting);
        *subscription = Some(self.subscribe(conversation).await);
        drop(subscription);

        let history = self.api.fetch_history(conversation).await;
        self.apply_history(conversation, history)
    }

    /// Send `text` to the open conversation.
    ///
    /// A placeholder appears immediately. On success it is replaced by the
    /// confirmed message; on failure it stays, marked failed.
    pub async fn send(&self, text: &str) -> Result<Message, SendFailure> {
        let text = text.trim();
        if text.is_empty() {
            return Err(SendFailure::EmptyMessage);
        }

        let placeholder = {
            let mut session = self.shared.session();
            let Some(conversation) = session.phase.conversation() else {
                return Err(SendFailure::NoConversation);
            };
            let placeholder = Message::local(
                conversation,
                self.identity.id,
                self.identity.name.clone(),
                text,
            );
            session.store.append_local(placeholder.clone());
            placeholder
        };
        self.shared.bump();

        let outgoing = OutgoingMessage {
            conversation: placeholder.conversation_id,
            text: text.to_string(),
            sender_id: self.identity.id,
            sender_name: self.identity.name.clone(),
        };
        let result = self.api.send_message(&outgoing).await;

        let result = {
            let mut session = self.shared.session();
            match result {
                Ok(confirmed) => {
                    let outcome = session.store.confirm_local(&placeholder.id, confirmed.clone());
                    debug!(local_id = %placeholder.id, id = %confirmed.id, ?outcome, "send confirmed");
                    Ok(confirmed)
                }
                Err(source) => {
                    session.store.mark_failed(&placeholder.id);
                    warn!(local_id = %placeholder.id, error = %source, "send failed");
                    Err(SendFailure::Rejected {
                        local_id: placeholder.id,
                        source,
                    })
                }
            }
        };
        self.shared.bump();
        result
    }

    /// Close the open conversation.
    pub async fn close(&self) {
        self.select_conversation(None).await;
    }

    pub fn phase(&self) -> Phase {
        self.shared.session().phase
    }

    pub fn conversation(&self) -> Option<ConversationId> {
        self.phase().conversation()
    }

    /// Messages of the open conversation, in display order.
    pub fn snapshot(&self) -> Vec<Message> {
        self.shared.session().store.snapshot()
    }

    /// State of the open conversation's channel; `Closed` when idle.
    pub fn connectivity(&self) -> ChannelState {
        *self.shared.connectivity.borrow()
    }

    pub fn watch_connectivity(&self) -> watch::Receiver<ChannelState> {
        self.shared.connectivity.subscribe()
    }

    /// Ticks whenever the snapshot or the phase may have changed.
    pub fn watch_revision(&self) -> watch::Receiver<u64> {
        self.shared.revision.subscribe()
    }
}
