use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::api::{NotificationApi, NotificationPage};
use crate::channel::{ChannelEvent, ChannelState, EventSink, StateChange};
use crate::controller::LoadOutcome;
use crate::error::{ApiError, HistoryFetchError, PersistenceFailure};
use crate::manager::{SubscriptionManager, SubscriptionToken};
use crate::model::{Notification, NotificationId, UserId};
use crate::notifications::NotificationStore;
use crate::wire;

struct FeedState {
    user: Option<UserId>,
    store: NotificationStore,
}

struct Shared {
    state: Mutex<FeedState>,
    connectivity: watch::Sender<ChannelState>,
    revision: watch::Sender<u64>,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, FeedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn bump(&self) {
        self.revision.send_modify(|r| *r += 1);
    }
}

struct FeedSink {
    user: UserId,
    shared: Arc<Shared>,
}

impl EventSink for FeedSink {
    fn on_event(&self, event: &ChannelEvent) {
        if wire::normalize_event_name(&event.name) != wire::NOTIFICATION_SENT {
            debug!(channel = %event.channel, event = %event.name, "ignoring event");
            return;
        }
        let notification = match wire::decode_notification_event(&event.payload) {
            Ok(n) => n,
            Err(e) => {
                warn!(channel = %event.channel, error = %e, "dropping malformed event");
                return;
            }
        };

        let pushed = {
            let mut state = self.shared.state();
            if state.user != Some(self.user) {
                return;
            }
            state.store.push_live(notification)
        };
        if pushed {
            self.shared.bump();
        }
    }

    fn on_state_change(&self, change: &StateChange) {
        if self.shared.state().user == Some(self.user) {
            self.shared.connectivity.send_replace(change.state);
        }
    }
}

/// A user's notification feed kept live over `user.{id}`.
pub struct NotificationFeed {
    manager: Arc<SubscriptionManager>,
    api: Arc<dyn NotificationApi>,
    shared: Arc<Shared>,
    subscription: tokio::sync::Mutex<Option<SubscriptionToken>>,
}

impl NotificationFeed {
    pub fn new(manager: Arc<SubscriptionManager>, api: Arc<dyn NotificationApi>) -> Self {
        let shared = Shared {
            state: Mutex::new(FeedState {
                user: None,
                store: NotificationStore::new(),
            }),
            connectivity: watch::Sender::new(ChannelState::Closed),
            revision: watch::Sender::new(0),
        };
        Self {
            manager,
            api,
            shared: Arc::new(shared),
            subscription: tokio::sync::Mutex::new(None),
        }
    }

    /// Follow `user`'s feed: subscribe to its channel and load history.
    /// A previously followed user is dropped first.
    pub async fn start(&self, user: UserId) -> LoadOutcome {
        let mut subscription = self.subscription.lock().await;
        if let Some(token) = subscription.take() {
            self.manager.unsubscribe(&token).await;
        }

        {
            let mut state = self.shared.state();
            state.user = Some(user);
            state.store.clear();
        }
        self.shared.connectivity.send_replace(ChannelState::Connecting);
        self.shared.bump();
        info!(user = %user, "following notifications");

        let sink = Arc::new(FeedSink {
            user,
            shared: self.shared.clone(),
        });
        *subscription = Some(self.manager.subscribe(&user.channel_name(), sink).await);
        drop(subscription);

        let page = self.api.fetch_notifications(user).await;
        self.apply_page(user, page)
    }

    fn apply_page(&self, user: UserId, page: Result<NotificationPage, ApiError>) -> LoadOutcome {
        let outcome = {
            let mut state = self.shared.state();
            if state.user != Some(user) {
                warn!(user = %user, "discarding notifications for a user no longer followed");
                return LoadOutcome::Superseded;
            }
            match page {
                Ok(page) => {
                    state.store.load(page.notifications);
                    let local = state.store.unread_count();
                    if page.unread_count.is_some_and(|server| server != local) {
                        info!(user = %user, server = ?page.unread_count, local, "unread count differs from server, using local");
                    }
                    LoadOutcome::Loaded {
                        entries: state.store.len(),
                    }
                }
                Err(source) => {
                    let err = HistoryFetchError {
                        channel: user.channel_name(),
                        source,
                    };
                    warn!(user = %user, error = %err, "notification history unavailable");
                    LoadOutcome::Degraded(err)
                }
            }
        };
        self.shared.bump();
        outcome
    }

    /// Stop following the current user.
    pub async fn stop(&self) {
        let mut subscription = self.subscription.lock().await;
        if let Some(token) = subscription.take() {
            self.manager.unsubscribe(&token).await;
        }
        {
            let mut state = self.shared.state();
            state.user = None;
            state.store.clear();
        }
        self.shared.connectivity.send_replace(ChannelState::Closed);
        self.shared.bump();
    }

    /// Mark one notification read locally, then tell the backend. Returns
    /// whether the local entry changed. A backend failure is reported but
    /// the local change stays.
    pub async fn mark_read(&self, id: &NotificationId) -> Result<bool, PersistenceFailure> {
        let flipped = self.shared.state().store.mark_read(id);
        if flipped {
            self.shared.bump();
        }

        self.api.mark_notification_read(id).await.map_err(|source| {
            warn!(notification = %id, error = %source, "failed to persist read state");
            PersistenceFailure {
                notification: Some(id.clone()),
                source,
            }
        })?;
        Ok(flipped)
    }

    /// Mark everything read locally, then tell the backend. Returns how
    /// many entries changed.
    pub async fn mark_all_read(&self) -> Result<usize, PersistenceFailure> {
        let (user, flipped) = {
            let mut state = self.shared.state();
            (state.user, state.store.mark_all_read())
        };
        self.shared.bump();

        let Some(user) = user else {
            return Ok(flipped);
        };
        self.api
            .mark_all_notifications_read(user)
            .await
            .map_err(|source| {
                warn!(user = %user, error = %source, "failed to persist read-all");
                PersistenceFailure {
                    notification: None,
                    source,
                }
            })?;
        Ok(flipped)
    }

    pub fn user(&self) -> Option<UserId> {
        self.shared.state().user
    }

    /// Feed entries, most recent first.
    pub fn snapshot(&self) -> Vec<Notification> {
        self.shared.state().store.snapshot()
    }

    pub fn unread_count(&self) -> usize {
        self.shared.state().store.unread_count()
    }

    pub fn badge(&self) -> Option<String> {
        self.shared.state().store.badge()
    }

    pub fn connectivity(&self) -> ChannelState {
        *self.shared.connectivity.borrow()
    }

    pub fn watch_connectivity(&self) -> watch::Receiver<ChannelState> {
        self.shared.connectivity.subscribe()
    }

    pub fn watch_revision(&self) -> watch::Receiver<u64> {
        self.shared.revision.subscribe()
    }
}
