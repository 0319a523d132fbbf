//! Concrete adapters for [`condo_sync`]: a reqwest REST backend and a
//! Pusher-protocol realtime transport, wired together from the client
//! configuration.

pub mod config;
pub mod http;
pub mod pusher;

use anyhow::{Context, Result};
use std::sync::Arc;

use condo_sync::{ConversationController, NotificationFeed, SubscriptionManager};

use crate::config::CondoConfig;
use crate::http::HttpBackend;
use crate::pusher::{PusherConfig, PusherTransport};

/// Everything a command needs, sharing one realtime connection.
pub struct Engine {
    pub backend: Arc<HttpBackend>,
    pub manager: Arc<SubscriptionManager>,
    pub controller: ConversationController,
    pub feed: NotificationFeed,
}

impl Engine {
    pub fn new(config: &CondoConfig) -> Result<Self> {
        let backend = Arc::new(
            HttpBackend::new(&config.file.api.base_url, config.request_timeout())
                .context("Failed to build HTTP client")?,
        );
        let sync = config.sync();
        let transport = PusherTransport::new(PusherConfig {
            url: config.file.realtime.url.clone(),
            app_key: config.file.realtime.app_key.clone(),
            activity_timeout: config.activity_timeout(),
            channel_buffer: sync.channel_buffer,
        });
        let manager = Arc::new(SubscriptionManager::new(Arc::new(transport)));
        let controller = ConversationController::new(
            manager.clone(),
            backend.clone(),
            config.identity(),
            &sync,
        );
        let feed = NotificationFeed::new(manager.clone(), backend.clone());
        Ok(Self {
            backend,
            manager,
            controller,
            feed,
        })
    }

    /// Leave every channel and drop the realtime connection.
    pub async fn shutdown(&self) {
        self.controller.close().await;
        self.feed.stop().await;
        self.manager.shutdown().await;
    }
}
