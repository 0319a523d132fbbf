//! The HTTP side of the backend, as the engine consumes it.

use async_trait::async_trait;

use crate::error::ApiError;
use crate::model::{ConversationId, Message, Notification, NotificationId, UserId};

/// A message about to be sent.
#[derive(Clone, Debug, PartialEq)]
pub struct OutgoingMessage {
    pub conversation: ConversationId,
    pub text: String,
    pub sender_id: UserId,
    pub sender_name: String,
}

#[async_trait]
pub trait ChatApi: Send + Sync {
    /// Messages of `conversation`, oldest first.
    async fn fetch_history(&self, conversation: ConversationId) -> Result<Vec<Message>, ApiError>;

    /// Send a message; the result carries the server-assigned id and time.
    async fn send_message(&self, message: &OutgoingMessage) -> Result<Message, ApiError>;
}

/// One fetch of a user's notification feed.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NotificationPage {
    /// Most recent first
    pub notifications: Vec<Notification>,
    /// The server's own count, if it sent one
    pub unread_count: Option<usize>,
}

#[async_trait]
pub trait NotificationApi: Send + Sync {
    async fn fetch_notifications(&self, user: UserId) -> Result<NotificationPage, ApiError>;

    async fn mark_notification_read(&self, id: &NotificationId) -> Result<(), ApiError>;

    async fn mark_all_notifications_read(&self, user: UserId) -> Result<(), ApiError>;
}
