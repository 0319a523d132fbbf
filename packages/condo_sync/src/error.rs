//! Typed failures. None of these are fatal: each degrades the engine to a
//! reduced but usable state and is handed back to the caller.

use crate::model::{MessageId, NotificationId};

/// A channel failed to open, or stopped delivering.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("failed to connect to realtime server: {0}")]
    Connect(String),

    #[error("subscription to {channel} rejected: {reason}")]
    Subscribe { channel: String, reason: String },

    #[error("realtime connection lost")]
    ConnectionLost,

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl TransportError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::Connect(_) => "transport_connect",
            Self::Subscribe { .. } => "transport_subscribe",
            Self::ConnectionLost => "transport_connection_lost",
            Self::Protocol(_) => "transport_protocol",
        }
    }
}

/// What the HTTP boundary reports when a request does not succeed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("backend returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("failed to decode response: {0}")]
    Decode(String),

    #[error("request failed: {0}")]
    Request(String),
}

impl ApiError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::Unavailable(_) => "api_unavailable",
            Self::Status { .. } => "api_status",
            Self::Decode(_) => "api_decode",
            Self::Request(_) => "api_request",
        }
    }
}

/// History could not be fetched; the channel opens with an empty list.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("history fetch for {channel} failed: {source}")]
pub struct HistoryFetchError {
    pub channel: String,
    #[source]
    pub source: ApiError,
}

impl HistoryFetchError {
    pub fn error_code(&self) -> &str {
        "history_fetch"
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendFailure {
    #[error("no conversation is open")]
    NoConversation,

    #[error("message is empty")]
    EmptyMessage,

    /// The placeholder stays in the list, marked failed.
    #[error("send of {local_id} rejected: {source}")]
    Rejected {
        local_id: MessageId,
        #[source]
        source: ApiError,
    },
}

impl SendFailure {
    pub fn error_code(&self) -> &str {
        match self {
            Self::NoConversation => "no_conversation",
            Self::EmptyMessage => "empty_message",
            Self::Rejected { .. } => "send_rejected",
        }
    }

    pub fn local_id(&self) -> Option<&MessageId> {
        match self {
            Self::Rejected { local_id, .. } => Some(local_id),
            _ => None,
        }
    }
}

/// A read-state write did not reach the backend. Local state is kept.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("failed to persist read state{}: {source}", target(.notification))]
pub struct PersistenceFailure {
    /// `None` for mark-all-read
    pub notification: Option<NotificationId>,
    #[source]
    pub source: ApiError,
}

fn target(notification: &Option<NotificationId>) -> String {
    match notification {
        Some(id) => format!(" of {id}"),
        None => String::new(),
    }
}

impl PersistenceFailure {
    pub fn error_code(&self) -> &str {
        "persistence_failure"
    }
}
