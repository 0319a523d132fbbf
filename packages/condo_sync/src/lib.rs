//! Condo Sync - real-time synchronization engine for department chat and
//! resident notifications
//!
//! This crate keeps a conversation's message list and a user's notification
//! feed consistent while history fetches, optimistic sends and live channel
//! events race each other. It has no HTTP or WebSocket dependencies: the
//! backend is reached through the [`ChatApi`] / [`NotificationApi`] traits
//! and the realtime connection through [`Transport`].
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use condo_sync::{
//!     ConversationController, ConversationId, Identity, MemoryTransport,
//!     SubscriptionManager, SyncConfig, UserId,
//! };
//! # use condo_sync::{ApiError, ChatApi, Message, OutgoingMessage};
//! # struct Backend;
//! # #[async_trait::async_trait]
//! # impl ChatApi for Backend {
//! #     async fn fetch_history(&self, _: ConversationId) -> Result<Vec<Message>, ApiError> { Ok(vec![]) }
//! #     async fn send_message(&self, _: &OutgoingMessage) -> Result<Message, ApiError> { unimplemented!() }
//! # }
//!
//! #[tokio::main]
//! async fn main() {
//!     let manager = Arc::new(SubscriptionManager::new(Arc::new(MemoryTransport::new())));
//!     let controller = ConversationController::new(
//!         manager,
//!         Arc::new(Backend),
//!         Identity::new(UserId(1), "Administrador"),
//!         &SyncConfig::default(),
//!     );
//!
//!     controller.select_conversation(Some(ConversationId(2))).await;
//!     controller.send("La reunión es a las 18:00").await.unwrap();
//!
//!     for message in controller.snapshot() {
//!         println!("{}: {}", message.sender_name, message.text);
//!     }
//! }
//! ```

mod api;
pub mod channel;
mod config;
mod controller;
mod error;
mod feed;
mod manager;
pub mod messages;
pub mod model;
pub mod notifications;
pub mod transport;
pub mod wire;

pub use api::{ChatApi, NotificationApi, NotificationPage, OutgoingMessage};
pub use channel::{
    ChannelEvent, ChannelHandle, ChannelState, ChannelSubscription, EventSink, StateChange,
};
pub use config::SyncConfig;
pub use controller::{ConversationController, LoadOutcome, Phase};
pub use error::{ApiError, HistoryFetchError, PersistenceFailure, SendFailure, TransportError};
pub use feed::NotificationFeed;
pub use manager::{SubscriptionManager, SubscriptionToken};
pub use messages::{MessageStore, Received, Reconciled, day_breaks, pair_placeholders, reconcile};
pub use model::{
    ConversationId, DeliveryStatus, Identity, Message, MessageId, Notification, NotificationId,
    NotificationKind, NotificationPayload, Origin, UserId,
};
pub use notifications::NotificationStore;
pub use transport::{MemoryTransport, Transport, TransportEvent};
