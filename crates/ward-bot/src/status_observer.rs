use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use ward_call_runtime::CallStatusObserver;
use ward_call_types::{ResolutionCause, StatusChange};

use crate::TelegramBotTransport;

/// Tells bot-linked recipients when a call they were offered ends without them.
#[derive(Debug, Clone)]
pub struct TelegramStatusObserver {
    transport: Arc<TelegramBotTransport>,
}

impl TelegramStatusObserver {
    pub fn new(transport: Arc<TelegramBotTransport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl CallStatusObserver for TelegramStatusObserver {
    fn observer_name(&self) -> &'static str {
        "telegram_status"
    }

    async fn on_status_change(&self, change: &StatusChange) -> Result<()> {
        if !matches!(
            change.cause,
            ResolutionCause::ClaimedByOther
                | ResolutionCause::CancelledBySender
                | ResolutionCause::TimedOut
        ) {
            return Ok(());
        }
        let Some(link) = self.transport.links().link_for_identifier(&change.to_identifier) else {
            return Ok(());
        };

        let text = format!(
            "Call from {}: {}",
            change.from_identifier,
            change.cause.notice()
        );
        self.transport
            .send_message(&link.chat_id, &text, None)
            .await?;
        Ok(())
    }
}
