//! Telegram Bot API delivery for call notifications.
//!
//! `dry_run` shapes requests and records receipts without network access;
//! `provider` posts them to `{api_base}/bot{token}/sendMessage`. Failures carry
//! stable reason codes so callers can log and classify them.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use ward_call_runtime::{BotLink, ExternalBotTransport};
use ward_call_types::CallNotification;

use crate::{BotCallbackAction, BotLinkDirectory};

const DRY_RUN_TELEGRAM_TOKEN: &str = "dry-run-telegram-token";
const DRY_RUN_RECEIPT_CAPACITY: usize = 256;
const REASON_MISSING_TOKEN: &str = "delivery_missing_telegram_bot_token";
const REASON_CLIENT_UNAVAILABLE: &str = "delivery_provider_client_unavailable";
const REASON_TRANSPORT_ERROR: &str = "delivery_transport_error";
const REASON_INVALID_CHAT: &str = "delivery_invalid_chat_id";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelegramBotMode {
    DryRun,
    Provider,
}

impl TelegramBotMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DryRun => "dry_run",
            Self::Provider => "provider",
        }
    }
}

impl std::str::FromStr for TelegramBotMode {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim() {
            "dry_run" | "dry-run" => Ok(Self::DryRun),
            "provider" => Ok(Self::Provider),
            other => Err(anyhow!(
                "unsupported telegram mode '{other}'; expected dry_run or provider"
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TelegramBotConfig {
    pub mode: TelegramBotMode,
    pub api_base: String,
    pub bot_token: Option<String>,
    pub http_timeout_ms: u64,
}

impl Default for TelegramBotConfig {
    fn default() -> Self {
        Self {
            mode: TelegramBotMode::DryRun,
            api_base: "https://api.telegram.org".to_string(),
            bot_token: None,
            http_timeout_ms: 5_000,
        }
    }
}

/// Record of one outbound Telegram request.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TelegramDeliveryReceipt {
    pub mode: String,
    pub status: String,
    pub chat_id: String,
    pub endpoint: String,
    pub request_body: Value,
    pub http_status: Option<u16>,
    pub provider_message_id: Option<String>,
}

/// Delivery failure with a stable reason code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("reason_code={reason_code} retryable={retryable} detail={detail}")]
pub struct BotDeliveryError {
    pub reason_code: String,
    pub detail: String,
    pub retryable: bool,
    pub http_status: Option<u16>,
}

impl BotDeliveryError {
    fn new(reason_code: &str, detail: impl Into<String>, retryable: bool) -> Self {
        Self {
            reason_code: reason_code.to_string(),
            detail: detail.into(),
            retryable,
            http_status: None,
        }
    }
}

/// Telegram-backed [`ExternalBotTransport`].
#[derive(Debug)]
pub struct TelegramBotTransport {
    config: TelegramBotConfig,
    client: Option<reqwest::Client>,
    links: Arc<BotLinkDirectory>,
    receipts: Mutex<VecDeque<TelegramDeliveryReceipt>>,
}

impl TelegramBotTransport {
    pub fn new(config: TelegramBotConfig, links: Arc<BotLinkDirectory>) -> Result<Self> {
        if config.mode == TelegramBotMode::Provider && config.http_timeout_ms == 0 {
            return Err(anyhow!(
                "telegram provider mode requires http timeout > 0"
            ));
        }
        let client = if config.mode == TelegramBotMode::Provider {
            Some(
                reqwest::Client::builder()
                    .timeout(Duration::from_millis(config.http_timeout_ms))
                    .build()
                    .context("failed to build telegram http client")?,
            )
        } else {
            None
        };
        Ok(Self {
            config,
            client,
            links,
            receipts: Mutex::new(VecDeque::new()),
        })
    }

    pub fn mode(&self) -> TelegramBotMode {
        self.config.mode
    }

    pub fn links(&self) -> &Arc<BotLinkDirectory> {
        &self.links
    }

    /// Most recent dry-run receipts, oldest first. Provider sends are not kept.
    pub fn receipts(&self) -> Vec<TelegramDeliveryReceipt> {
        self.receipts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    pub async fn send_message(
        &self,
        chat_id: &str,
        text: &str,
        reply_markup: Option<Value>,
    ) -> Result<TelegramDeliveryReceipt, BotDeliveryError> {
        let chat_id = chat_id.trim();
        if chat_id.is_empty() {
            return Err(BotDeliveryError::new(
                REASON_INVALID_CHAT,
                "telegram chat id must not be empty",
                false,
            ));
        }
        let endpoint = self.send_message_endpoint()?;
        let mut body = json!({
            "chat_id": chat_id,
            "text": text,
            "disable_web_page_preview": true,
        });
        if let Some(reply_markup) = reply_markup {
            body["reply_markup"] = reply_markup;
        }

        if self.config.mode == TelegramBotMode::Provider {
            return self.post(chat_id, endpoint, body).await;
        }
        let receipt = TelegramDeliveryReceipt {
            mode: self.config.mode.as_str().to_string(),
            status: "dry_run".to_string(),
            chat_id: chat_id.to_string(),
            endpoint,
            request_body: body,
            http_status: None,
            provider_message_id: None,
        };
        let mut receipts = self.receipts.lock().unwrap_or_else(PoisonError::into_inner);
        if receipts.len() == DRY_RUN_RECEIPT_CAPACITY {
            receipts.pop_front();
        }
        receipts.push_back(receipt.clone());
        Ok(receipt)
    }

    fn send_message_endpoint(&self) -> Result<String, BotDeliveryError> {
        let token = self
            .config
            .bot_token
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
            .or_else(|| {
                (self.config.mode == TelegramBotMode::DryRun)
                    .then(|| DRY_RUN_TELEGRAM_TOKEN.to_string())
            })
            .ok_or_else(|| {
                BotDeliveryError::new(
                    REASON_MISSING_TOKEN,
                    "telegram provider mode requires WARD_TELEGRAM_BOT_TOKEN",
                    false,
                )
            })?;
        Ok(format!(
            "{}/bot{}/sendMessage",
            self.config.api_base.trim_end_matches('/'),
            token
        ))
    }

    async fn post(
        &self,
        chat_id: &str,
        endpoint: String,
        body: Value,
    ) -> Result<TelegramDeliveryReceipt, BotDeliveryError> {
        let client = self.client.as_ref().ok_or_else(|| {
            BotDeliveryError::new(
                REASON_CLIENT_UNAVAILABLE,
                "provider mode requested without initialized HTTP client",
                false,
            )
        })?;
        let response = client
            .post(endpoint.as_str())
            .json(&body)
            .send()
            .await
            .map_err(|error| BotDeliveryError::new(REASON_TRANSPORT_ERROR, error.to_string(), true))?;
        let status = response.status();
        let body_raw = response.text().await.unwrap_or_default();
        if !status.is_success() {
            let (reason_code, retryable) = classify_provider_status(status);
            return Err(BotDeliveryError {
                reason_code: reason_code.to_string(),
                detail: truncate_detail(&body_raw),
                retryable,
                http_status: Some(status.as_u16()),
            });
        }

        let payload = serde_json::from_str::<Value>(&body_raw).unwrap_or(Value::Null);
        Ok(TelegramDeliveryReceipt {
            mode: self.config.mode.as_str().to_string(),
            status: "sent".to_string(),
            chat_id: chat_id.to_string(),
            endpoint,
            request_body: body,
            http_status: Some(status.as_u16()),
            provider_message_id: payload
                .get("result")
                .and_then(|value| value.get("message_id"))
                .and_then(Value::as_i64)
                .map(|value| value.to_string()),
        })
    }
}

#[async_trait]
impl ExternalBotTransport for TelegramBotTransport {
    async fn linked_recipient(&self, identifier: &str) -> Result<Option<BotLink>> {
        Ok(self.links.link_for_identifier(identifier).cloned())
    }

    async fn push_call(&self, link: &BotLink, notification: &CallNotification) -> Result<()> {
        let receipt = self
            .send_message(
                &link.chat_id,
                &render_call_message(notification),
                Some(call_keyboard(&notification.call_id)),
            )
            .await?;
        tracing::debug!(
            call_id = %notification.call_id,
            chat_id = %receipt.chat_id,
            status = %receipt.status,
            "telegram call notification sent"
        );
        Ok(())
    }
}

pub(crate) fn render_call_message(notification: &CallNotification) -> String {
    let mut text = format!(
        "Emergency call from {} to {}",
        notification.from_identifier, notification.to_identifier
    );
    if let Some(message) = notification.message.as_deref() {
        text.push_str("\n\n");
        text.push_str(message);
    }
    if let Some(attachment_ref) = notification.attachment_ref.as_deref() {
        text.push_str("\n\nAttachment: ");
        text.push_str(attachment_ref);
    }
    text
}

pub(crate) fn call_keyboard(call_id: &str) -> Value {
    json!({
        "inline_keyboard": [[
            {
                "text": "Accept",
                "callback_data": BotCallbackAction::Accept { call_id: call_id.to_string() }.callback_data(),
            },
            {
                "text": "Reject",
                "callback_data": BotCallbackAction::Reject { call_id: call_id.to_string() }.callback_data(),
            }
        ]]
    })
}

fn classify_provider_status(status: StatusCode) -> (&'static str, bool) {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return ("delivery_rate_limited", true);
    }
    if status.is_server_error() {
        return ("delivery_provider_unavailable", true);
    }
    if status.is_client_error() {
        return ("delivery_request_rejected", false);
    }
    ("delivery_unknown_http_failure", true)
}

fn truncate_detail(raw: &str) -> String {
    const LIMIT: usize = 512;
    let trimmed = raw.trim();
    if trimmed.chars().count() <= LIMIT {
        return trimmed.to_string();
    }
    let mut output = trimmed.chars().take(LIMIT).collect::<String>();
    output.push_str("...");
    output
}
