use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use ward_call_types::CallNotification;

/// Link between a logical recipient and an external messaging-bot chat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BotLink {
    pub identifier: String,
    pub chat_id: String,
}

/// Delivery channel for recipients without a live socket.
#[async_trait]
pub trait ExternalBotTransport: Send + Sync {
    async fn linked_recipient(&self, identifier: &str) -> Result<Option<BotLink>>;

    async fn push_call(&self, link: &BotLink, notification: &CallNotification) -> Result<()>;
}
