//! REST backend over reqwest.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

use condo_sync::wire::{
    self, NotificationsResponse, PayloadError, ReadAllBody, SendMessageBody, SendResponse,
};
use condo_sync::{
    ApiError, ChatApi, ConversationId, Message, NotificationApi, NotificationId, NotificationPage,
    OutgoingMessage, UserId,
};

/// Map a reqwest failure onto the engine's error taxonomy. Anything that
/// never reached the server counts as the backend being unavailable.
pub fn from_reqwest(err: reqwest::Error) -> ApiError {
    if err.is_connect() || err.is_timeout() {
        ApiError::Unavailable(err.to_string())
    } else if err.is_decode() {
        ApiError::Decode(err.to_string())
    } else {
        ApiError::Request(err.to_string())
    }
}

fn log_skipped(skipped: &[PayloadError]) {
    for e in skipped {
        warn!(error = %e, "skipping malformed row");
    }
}

pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
}

impl HttpBackend {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(from_reqwest)?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn read<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let bytes = response.bytes().await.map_err(from_reqwest)?;
        serde_json::from_slice(&bytes).map_err(|e| ApiError::Decode(e.to_string()))
    }

    async fn expect_success(response: reqwest::Response) -> Result<(), ApiError> {
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::Status {
                status: status.as_u16(),
                body,
            })
        }
    }
}

#[async_trait]
impl ChatApi for HttpBackend {
    async fn fetch_history(&self, conversation: ConversationId) -> Result<Vec<Message>, ApiError> {
        let response = self
            .client
            .get(self.url("chat/messages"))
            .query(&[("department_id", conversation.0)])
            .send()
            .await
            .map_err(from_reqwest)?;
        let rows: Vec<Value> = Self::read(response).await?;
        let (messages, skipped) = wire::decode_history(rows, conversation);
        log_skipped(&skipped);
        debug!(conversation = %conversation, count = messages.len(), "fetched history");
        Ok(messages)
    }

    async fn send_message(&self, message: &OutgoingMessage) -> Result<Message, ApiError> {
        let body = SendMessageBody {
            message: &message.text,
            department_id: message.conversation.0,
            user_id: message.sender_id.0,
            user_name: &message.sender_name,
        };
        let response = self
            .client
            .post(self.url("chat/messages"))
            .json(&body)
            .send()
            .await
            .map_err(from_reqwest)?;
        let sent: SendResponse = Self::read(response).await?;
        Ok(sent.into_row().into_message(message.conversation))
    }
}

#[async_trait]
impl NotificationApi for HttpBackend {
    async fn fetch_notifications(&self, user: UserId) -> Result<NotificationPage, ApiError> {
        let response = self
            .client
            .get(self.url("notifications"))
            .query(&[("user_id", user.0)])
            .send()
            .await
            .map_err(from_reqwest)?;
        let feed: NotificationsResponse = Self::read(response).await?;
        let (page, skipped) = feed.into_page();
        log_skipped(&skipped);
        Ok(page)
    }

    async fn mark_notification_read(&self, id: &NotificationId) -> Result<(), ApiError> {
        let response = self
            .client
            .post(self.url(&format!("notifications/{id}/read")))
            .send()
            .await
            .map_err(from_reqwest)?;
        Self::expect_success(response).await
    }

    async fn mark_all_notifications_read(&self, user: UserId) -> Result<(), ApiError> {
        let response = self
            .client
            .post(self.url("notifications/read-all"))
            .json(&ReadAllBody { user_id: user.0 })
            .send()
            .await
            .map_err(from_reqwest)?;
        Self::expect_success(response).await
    }
}
