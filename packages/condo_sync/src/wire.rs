//! JSON shapes spoken by the backend, over HTTP and on realtime channels.
//!
//! The backend is loose about scalar types (ids arrive as numbers or strings,
//! `read` as a bool or 0/1, timestamps with or without an offset), so every
//! row decodes through tolerant field deserializers before being turned into
//! the strongly-typed model.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::api::NotificationPage;
use crate::model::{
    ConversationId, Message, MessageId, Notification, NotificationId, NotificationKind,
    NotificationPayload, UserId,
};

/// Event carrying a chat message on `department.{id}`.
pub const MESSAGE_SENT: &str = "message.sent";
/// Event carrying a notification on `user.{id}`.
pub const NOTIFICATION_SENT: &str = "notification.sent";

const DEFAULT_CURRENCY: &str = "MXN";

/// Strip the leading dot listeners use for explicitly-named broadcasts.
pub fn normalize_event_name(name: &str) -> &str {
    name.strip_prefix('.').unwrap_or(name)
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed {event} payload: {reason}")]
pub struct PayloadError {
    pub event: &'static str,
    pub reason: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Scalar {
    Int(u64),
    Float(f64),
    Text(String),
}

fn id_string<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    match Scalar::deserialize(d)? {
        Scalar::Int(n) => Ok(n.to_string()),
        Scalar::Float(f) => Ok(f.to_string()),
        Scalar::Text(s) => Ok(s),
    }
}

fn id_number<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
    match Scalar::deserialize(d)? {
        Scalar::Int(n) => Ok(n),
        Scalar::Text(s) => s
            .trim()
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("invalid numeric id {s:?}"))),
        Scalar::Float(f) => Err(serde::de::Error::custom(format!("invalid numeric id {f}"))),
    }
}

fn optional_id_number<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u64>, D::Error> {
    match Option::<Scalar>::deserialize(d)? {
        None => Ok(None),
        Some(Scalar::Int(n)) => Ok(Some(n)),
        Some(Scalar::Text(s)) => Ok(s.trim().parse().ok()),
        Some(Scalar::Float(_)) => Ok(None),
    }
}

fn flexible_bool<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Int(i64),
        Text(String),
    }
    Ok(match Option::<Flag>::deserialize(d)? {
        None => false,
        Some(Flag::Bool(b)) => b,
        Some(Flag::Int(n)) => n != 0,
        Some(Flag::Text(s)) => matches!(s.as_str(), "1" | "true"),
    })
}

fn timestamp<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
    let raw = String::deserialize(d)?;
    parse_timestamp(&raw).ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp {raw:?}")))
}

/// Parse an RFC 3339 timestamp, or a naive `YYYY-MM-DD[T ]HH:MM:SS[.fff]`
/// one which is taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

/// A chat message as returned by history, the send endpoint and
/// `message.sent`.
#[derive(Debug, Clone, Deserialize)]
pub struct MessageRow {
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    #[serde(deserialize_with = "id_number")]
    pub user_id: u64,
    #[serde(default)]
    pub user_name: String,
    pub message: String,
    #[serde(deserialize_with = "timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(default, deserialize_with = "optional_id_number")]
    pub department_id: Option<u64>,
}

impl MessageRow {
    /// Convert to a confirmed message. Rows that carry no department are
    /// attributed to `fallback`.
    pub fn into_message(self, fallback: ConversationId) -> Message {
        let conversation = self.department_id.map(ConversationId).unwrap_or(fallback);
        Message::server(
            MessageId::new(self.id),
            conversation,
            UserId(self.user_id),
            self.user_name,
            self.message,
            self.created_at,
        )
    }
}

/// A notification as returned by the feed endpoint and `notification.sent`.
#[derive(Debug, Clone, Deserialize)]
pub struct NotificationRow {
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, deserialize_with = "flexible_bool")]
    pub read: bool,
    #[serde(deserialize_with = "timestamp")]
    pub created_at: DateTime<Utc>,
}

impl NotificationRow {
    pub fn into_notification(self) -> Notification {
        Notification {
            id: NotificationId::new(self.id),
            payload: decode_payload(self.kind, &self.data),
            kind: self.kind,
            title: self.title,
            body: self.message,
            read: self.read,
            created_at: self.created_at,
        }
    }
}

fn amount(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Decode the type-specific `data` object. Missing or ill-typed fields
/// become `None`.
pub fn decode_payload(kind: NotificationKind, data: &Value) -> NotificationPayload {
    let currency = || text(data.get("currency")).unwrap_or_else(|| DEFAULT_CURRENCY.to_string());
    match kind {
        NotificationKind::Message => NotificationPayload::Message {
            department_id: match data.get("department_id") {
                Some(Value::Number(n)) => n.as_u64().map(ConversationId),
                Some(Value::String(s)) => s.trim().parse().ok().map(ConversationId),
                _ => None,
            },
        },
        NotificationKind::Fine => NotificationPayload::Fine {
            amount: amount(data.get("monto")),
            currency: currency(),
        },
        NotificationKind::Assembly => NotificationPayload::Assembly {
            date: text(data.get("fecha")),
            time: text(data.get("hora")),
        },
        NotificationKind::OverduePayment => NotificationPayload::OverduePayment {
            amount: amount(data.get("monto")),
            currency: currency(),
        },
    }
}

fn decode_rows<T: DeserializeOwned>(
    what: &'static str,
    rows: Vec<Value>,
) -> (Vec<T>, Vec<PayloadError>) {
    let mut decoded = Vec::with_capacity(rows.len());
    let mut skipped = Vec::new();
    for row in rows {
        match T::deserialize(row) {
            Ok(row) => decoded.push(row),
            Err(e) => skipped.push(PayloadError {
                event: what,
                reason: e.to_string(),
            }),
        }
    }
    (decoded, skipped)
}

/// Decode the rows of `GET /chat/messages`, each on its own. Rows that fail
/// are returned as errors next to the messages that did decode.
pub fn decode_history(
    rows: Vec<Value>,
    conversation: ConversationId,
) -> (Vec<Message>, Vec<PayloadError>) {
    let (decoded, skipped) = decode_rows::<MessageRow>("chat history", rows);
    let messages = decoded
        .into_iter()
        .map(|row| row.into_message(conversation))
        .collect();
    (messages, skipped)
}

/// Response of `GET /notifications`.
#[derive(Debug, Clone, Deserialize)]
pub struct NotificationsResponse {
    #[serde(default)]
    pub notifications: Vec<Value>,
    #[serde(default)]
    pub unread_count: Option<usize>,
}

impl NotificationsResponse {
    pub fn into_page(self) -> (NotificationPage, Vec<PayloadError>) {
        let (rows, skipped) = decode_rows::<NotificationRow>("notification feed", self.notifications);
        let page = NotificationPage {
            notifications: rows.into_iter().map(NotificationRow::into_notification).collect(),
            unread_count: self.unread_count,
        };
        (page, skipped)
    }
}

/// Response of `POST /chat/messages`: usually `{ "message": row }`, but a
/// bare row is accepted too.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum SendResponse {
    Wrapped { message: MessageRow },
    Bare(MessageRow),
}

impl SendResponse {
    pub fn into_row(self) -> MessageRow {
        match self {
            SendResponse::Wrapped { message } => message,
            SendResponse::Bare(row) => row,
        }
    }
}

/// Body of `POST /chat/messages`.
#[derive(Debug, Clone, Serialize)]
pub struct SendMessageBody<'a> {
    pub message: &'a str,
    pub department_id: u64,
    pub user_id: u64,
    pub user_name: &'a str,
}

/// Body of `POST /notifications/read-all`.
#[derive(Debug, Clone, Serialize)]
pub struct ReadAllBody {
    pub user_id: u64,
}

// Broadcast payloads are either the row itself or the row nested under a
// key. A flat message row also has a `message` key, but it holds a string.
fn unwrap_nested<'a>(payload: &'a Value, key: &str) -> &'a Value {
    match payload.get(key) {
        Some(inner @ Value::Object(_)) => inner,
        _ => payload,
    }
}

/// Decode a `message.sent` payload received on `conversation`'s channel.
pub fn decode_message_event(
    payload: &Value,
    conversation: ConversationId,
) -> Result<Message, PayloadError> {
    let row = MessageRow::deserialize(unwrap_nested(payload, "message")).map_err(|e| {
        PayloadError {
            event: MESSAGE_SENT,
            reason: e.to_string(),
        }
    })?;
    Ok(row.into_message(conversation))
}

/// Decode a `notification.sent` payload.
pub fn decode_notification_event(payload: &Value) -> Result<Notification, PayloadError> {
    let row = NotificationRow::deserialize(unwrap_nested(payload, "notification")).map_err(
        |e| PayloadError {
            event: NOTIFICATION_SENT,
            reason: e.to_string(),
        },
    )?;
    Ok(row.into_notification())
}
