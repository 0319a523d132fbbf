//! Domain types shared by the stores, the controller and the wire codecs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use uuid::Uuid;

/// Prefix of client-generated placeholder ids.
const LOCAL_ID_PREFIX: &str = "local-";

/// A department conversation. Live traffic flows on `department.{id}`.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(pub u64);

impl ConversationId {
    pub fn channel_name(&self) -> String {
        format!("department.{}", self.0)
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "department-{}", self.0)
    }
}

/// A resident or administrator. Notifications for a user flow on `user.{id}`.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub u64);

impl UserId {
    pub fn channel_name(&self) -> String {
        format!("user.{}", self.0)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "user-{}", self.0)
    }
}

/// The signed-in user on whose behalf messages are sent.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: UserId,
    pub name: String,
}

impl Identity {
    pub fn new(id: UserId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }
}

/// Message identifier. Server ids are numeric; placeholders carry a
/// `local-` prefixed UUID that never collides with them.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh placeholder id for an optimistic send.
    pub fn local() -> Self {
        Self(format!("{}{}", LOCAL_ID_PREFIX, Uuid::new_v4()))
    }

    pub fn is_local(&self) -> bool {
        self.0.starts_with(LOCAL_ID_PREFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<u64> for MessageId {
    fn from(id: u64) -> Self {
        Self(id.to_string())
    }
}

impl From<&str> for MessageId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// Numeric ids compare numerically so "9" sorts before "10"; the raw string
// breaks remaining ties to stay consistent with Eq.
impl Ord for MessageId {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.0.parse::<u64>(), other.0.parse::<u64>()) {
            (Ok(a), Ok(b)) => a.cmp(&b).then_with(|| self.0.cmp(&other.0)),
            (Ok(_), Err(_)) => Ordering::Less,
            (Err(_), Ok(_)) => Ordering::Greater,
            (Err(_), Err(_)) => self.0.cmp(&other.0),
        }
    }
}

impl PartialOrd for MessageId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Where a message entry came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    /// Optimistic placeholder created on send
    Local,
    /// Confirmed by the backend (history, send response or live event)
    Server,
}

/// Delivery status shown next to a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Failed,
    Confirmed,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub sender_name: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
    pub origin: Origin,
    pub status: DeliveryStatus,
}

impl Message {
    /// Optimistic placeholder stamped with the local clock.
    pub fn local(
        conversation_id: ConversationId,
        sender_id: UserId,
        sender_name: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            id: MessageId::local(),
            conversation_id,
            sender_id,
            sender_name: sender_name.into(),
            text: text.into(),
            created_at: Utc::now(),
            origin: Origin::Local,
            status: DeliveryStatus::Pending,
        }
    }

    pub fn server(
        id: impl Into<MessageId>,
        conversation_id: ConversationId,
        sender_id: UserId,
        sender_name: impl Into<String>,
        text: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            conversation_id,
            sender_id,
            sender_name: sender_name.into(),
            text: text.into(),
            created_at,
            origin: Origin::Server,
            status: DeliveryStatus::Confirmed,
        }
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn is_local(&self) -> bool {
        self.origin == Origin::Local
    }

    /// The same message marked as backend-confirmed.
    pub fn confirmed(mut self) -> Self {
        self.origin = Origin::Server;
        self.status = DeliveryStatus::Confirmed;
        self
    }
}

#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NotificationId(String);

impl NotificationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<u64> for NotificationId {
    fn from(id: u64) -> Self {
        Self(id.to_string())
    }
}

impl From<&str> for NotificationId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for NotificationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Notification type. The backend speaks Spanish type tags; the English
/// names are accepted as aliases.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NotificationKind {
    #[serde(rename = "mensaje", alias = "message")]
    Message,
    #[serde(rename = "multa", alias = "fine")]
    Fine,
    #[serde(rename = "asamblea", alias = "assembly")]
    Assembly,
    #[serde(rename = "pago_atrasado", alias = "overdue_payment")]
    OverduePayment,
}

impl NotificationKind {
    pub fn label(&self) -> &'static str {
        match self {
            NotificationKind::Message => "Mensaje",
            NotificationKind::Fine => "Multa",
            NotificationKind::Assembly => "Asamblea",
            NotificationKind::OverduePayment => "Pago",
        }
    }
}

/// Type-specific notification fields.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NotificationPayload {
    Message {
        department_id: Option<ConversationId>,
    },
    Fine {
        amount: Option<f64>,
        currency: String,
    },
    Assembly {
        date: Option<String>,
        time: Option<String>,
    },
    OverduePayment {
        amount: Option<f64>,
        currency: String,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: NotificationId,
    pub kind: NotificationKind,
    pub title: String,
    pub body: String,
    pub payload: NotificationPayload,
    pub read: bool,
    pub created_at: DateTime<Utc>,
}
