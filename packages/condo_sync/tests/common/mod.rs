#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{oneshot, watch};

use condo_sync::{
    ApiError, ChannelState, ChatApi, ConversationController, ConversationId, Identity,
    MemoryTransport, Message, Notification, NotificationApi, NotificationFeed, NotificationId,
    NotificationPage, OutgoingMessage, SubscriptionManager, SyncConfig, UserId,
};

pub const ME: UserId = UserId(1);
pub const MY_NAME: &str = "Administrador";

#[derive(Default)]
struct BackendState {
    history: HashMap<ConversationId, Vec<Message>>,
    notifications: HashMap<UserId, Vec<Notification>>,
    history_gates: HashMap<ConversationId, oneshot::Receiver<()>>,
    send_gate: Option<oneshot::Receiver<()>>,
    fail_history: bool,
    fail_send: bool,
    fail_notifications: bool,
    fail_mark: bool,
    next_id: u64,
    sent: Vec<OutgoingMessage>,
    marked: Vec<NotificationId>,
    marked_all: Vec<UserId>,
}

/// In-memory stand-in for the REST backend.
pub struct FakeBackend {
    state: Mutex<BackendState>,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(BackendState {
                next_id: 1000,
                ..Default::default()
            }),
        })
    }

    pub fn set_history(&self, conversation: ConversationId, messages: Vec<Message>) {
        self.state
            .lock()
            .unwrap()
            .history
            .insert(conversation, messages);
    }

    pub fn set_notifications(&self, user: UserId, notifications: Vec<Notification>) {
        self.state
            .lock()
            .unwrap()
            .notifications
            .insert(user, notifications);
    }

    /// Hold the next history fetch for `conversation` until the returned
    /// sender fires (or is dropped).
    pub fn hold_history(&self, conversation: ConversationId) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.state
            .lock()
            .unwrap()
            .history_gates
            .insert(conversation, rx);
        tx
    }

    pub fn hold_send(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.state.lock().unwrap().send_gate = Some(rx);
        tx
    }

    /// Id the next sent message will get.
    pub fn next_message_id(&self, id: u64) {
        self.state.lock().unwrap().next_id = id;
    }

    pub fn fail_history(&self, fail: bool) {
        self.state.lock().unwrap().fail_history = fail;
    }

    pub fn fail_send(&self, fail: bool) {
        self.state.lock().unwrap().fail_send = fail;
    }

    pub fn fail_notifications(&self, fail: bool) {
        self.state.lock().unwrap().fail_notifications = fail;
    }

    pub fn fail_mark(&self, fail: bool) {
        self.state.lock().unwrap().fail_mark = fail;
    }

    pub fn sent(&self) -> Vec<OutgoingMessage> {
        self.state.lock().unwrap().sent.clone()
    }

    pub fn marked(&self) -> Vec<NotificationId> {
        self.state.lock().unwrap().marked.clone()
    }

    pub fn marked_all(&self) -> Vec<UserId> {
        self.state.lock().unwrap().marked_all.clone()
    }
}

fn unavailable() -> ApiError {
    ApiError::Unavailable("connection refused".into())
}

#[async_trait]
impl ChatApi for FakeBackend {
    async fn fetch_history(&self, conversation: ConversationId) -> Result<Vec<Message>, ApiError> {
        let gate = self
            .state
            .lock()
            .unwrap()
            .history_gates
            .remove(&conversation);
        if let Some(gate) = gate {
            let _ = gate.await;
        }

        let state = self.state.lock().unwrap();
        if state.fail_history {
            return Err(unavailable());
        }
        Ok(state
            .history
            .get(&conversation)
            .cloned()
            .unwrap_or_default())
    }

    async fn send_message(&self, message: &OutgoingMessage) -> Result<Message, ApiError> {
        let gate = self.state.lock().unwrap().send_gate.take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }

        let mut state = self.state.lock().unwrap();
        if state.fail_send {
            return Err(ApiError::Status {
                status: 500,
                body: "Server Error".into(),
            });
        }
        let id = state.next_id;
        state.next_id += 1;
        state.sent.push(message.clone());

        let confirmed = Message::server(
            id,
            message.conversation,
            message.sender_id,
            message.sender_name.clone(),
            message.text.clone(),
            Utc::now(),
        );
        state
            .history
            .entry(message.conversation)
            .or_default()
            .push(confirmed.clone());
        Ok(confirmed)
    }
}

#[async_trait]
impl NotificationApi for FakeBackend {
    async fn fetch_notifications(&self, user: UserId) -> Result<NotificationPage, ApiError> {
        let state = self.state.lock().unwrap();
        if state.fail_notifications {
            return Err(unavailable());
        }
        let notifications = state.notifications.get(&user).cloned().unwrap_or_default();
        let unread_count = Some(notifications.iter().filter(|n| !n.read).count());
        Ok(NotificationPage {
            notifications,
            unread_count,
        })
    }

    async fn mark_notification_read(&self, id: &NotificationId) -> Result<(), ApiError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_mark {
            return Err(unavailable());
        }
        state.marked.push(id.clone());
        Ok(())
    }

    async fn mark_all_notifications_read(&self, user: UserId) -> Result<(), ApiError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_mark {
            return Err(unavailable());
        }
        state.marked_all.push(user);
        Ok(())
    }
}

/// Engine wired to a memory transport and a fake backend.
pub struct Harness {
    pub transport: MemoryTransport,
    pub manager: Arc<SubscriptionManager>,
    pub backend: Arc<FakeBackend>,
}

impl Harness {
    pub fn new() -> Self {
        let transport = MemoryTransport::new();
        let manager = Arc::new(SubscriptionManager::new(Arc::new(transport.clone())));
        Self {
            transport,
            manager,
            backend: FakeBackend::new(),
        }
    }

    pub fn controller(&self) -> Arc<ConversationController> {
        Arc::new(ConversationController::new(
            self.manager.clone(),
            self.backend.clone(),
            Identity::new(ME, MY_NAME),
            &SyncConfig::default(),
        ))
    }

    pub fn feed(&self) -> Arc<NotificationFeed> {
        Arc::new(NotificationFeed::new(
            self.manager.clone(),
            self.backend.clone(),
        ))
    }
}

/// Poll `check` until it holds, failing the test after two seconds.
pub async fn eventually(what: &str, check: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !check() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Wait until a connectivity flag reports the channel as subscribed.
pub async fn subscribed(mut connectivity: watch::Receiver<ChannelState>) {
    tokio::time::timeout(
        Duration::from_secs(2),
        connectivity.wait_for(|s| *s == ChannelState::Subscribed),
    )
    .await
    .expect("timed out waiting for subscription")
    .expect("connectivity sender dropped");
}

pub fn ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw).unwrap().with_timezone(&Utc)
}

pub fn history_message(
    id: u64,
    conversation: ConversationId,
    sender: UserId,
    text: &str,
    at: &str,
) -> Message {
    Message::server(id, conversation, sender, format!("user {}", sender.0), text, ts(at))
}

/// A `message.sent` payload as the backend broadcasts it.
pub fn message_event(id: u64, sender: UserId, text: &str, at: DateTime<Utc>) -> Value {
    json!({
        "id": id,
        "user_id": sender.0,
        "user_name": format!("user {}", sender.0),
        "message": text,
        "created_at": at.to_rfc3339(),
    })
}

/// A `notification.sent` payload.
pub fn notification_event(id: u64, kind: &str, read: bool) -> Value {
    json!({
        "id": id,
        "type": kind,
        "read": read,
        "title": format!("Aviso {id}"),
        "message": "Cuota mensual pendiente",
        "data": { "monto": 2500, "currency": "MXN" },
        "created_at": Utc::now().to_rfc3339(),
    })
}
