//! Call placement and notification fanout.

use chrono::Utc;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::task::JoinHandle;
use ward_call_store::CallStore;
use ward_call_types::{CallAttempt, CallNotification, NewCall};
use ward_core::normalize_identifier;
use ward_identity::IdentityResolver;
use ward_presence::{ConnectionId, PresencePush, RecipientRegistry};

use crate::{CallError, CallReconciler, CallRuntimeConfig, ExternalBotTransport, ResponseTimers};

pub const CALL_INCOMING_PUSH_KIND: &str = "call.incoming";

const UNREACHABLE_REASON_NO_ROUTE: &str = "no_live_transport_or_bot_link";
const UNREACHABLE_REASON_BOT_PUSH_FAILED: &str = "bot_push_failed";
const UNREACHABLE_REASON_BOT_LOOKUP_FAILED: &str = "bot_link_lookup_failed";

/// Input to [`CallDispatcher::place_call`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaceCallRequest {
    pub from_identifier: String,
    pub targets: Vec<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub attachment_ref: Option<String>,
}

/// How one target was reached during fanout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "route", rename_all = "snake_case")]
pub enum DeliveryRoute {
    Live { connection_id: ConnectionId },
    Bot { chat_id: String },
    Unreachable { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetDelivery {
    pub to_identifier: String,
    #[serde(flatten)]
    pub route: DeliveryRoute,
}

/// Handle to a placed call whose fanout may still be running.
#[derive(Debug)]
pub struct DispatchedCall {
    pub call_id: String,
    pub fanout: JoinHandle<Vec<TargetDelivery>>,
}

/// Creates calls, arms their response timers and pushes notifications.
#[derive(Clone)]
pub struct CallDispatcher {
    store: Arc<dyn CallStore>,
    timers: Arc<ResponseTimers>,
    identities: Arc<dyn IdentityResolver>,
    registry: Arc<RecipientRegistry>,
    bot: Option<Arc<dyn ExternalBotTransport>>,
    reconciler: Arc<CallReconciler>,
    config: CallRuntimeConfig,
}

impl CallDispatcher {
    pub fn new(
        reconciler: Arc<CallReconciler>,
        registry: Arc<RecipientRegistry>,
        config: CallRuntimeConfig,
    ) -> Self {
        Self {
            store: Arc::clone(reconciler.store()),
            timers: Arc::clone(reconciler.timers()),
            identities: Arc::clone(reconciler.identities()),
            registry,
            bot: None,
            reconciler,
            config,
        }
    }

    pub fn with_bot_transport(mut self, bot: Arc<dyn ExternalBotTransport>) -> Self {
        self.bot = Some(bot);
        self
    }

    pub fn config(&self) -> &CallRuntimeConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<RecipientRegistry> {
        &self.registry
    }

    /// Places a call and returns its id once every attempt row exists.
    pub async fn place_call(&self, request: PlaceCallRequest) -> Result<String, CallError> {
        Ok(self.dispatch(request).await?.call_id)
    }

    /// Same as [`Self::place_call`] but hands back the fanout task.
    pub async fn dispatch(&self, request: PlaceCallRequest) -> Result<DispatchedCall, CallError> {
        let from_identifier = request.from_identifier.trim().to_string();
        if from_identifier.is_empty() {
            return Err(CallError::InvalidArgument(
                "from_identifier must not be empty".to_string(),
            ));
        }
        let targets = dedupe_targets(&request.targets);
        if targets.is_empty() {
            return Err(CallError::InvalidArgument(
                "at least one non-empty target is required".to_string(),
            ));
        }

        let organization_id = self
            .identities
            .resolve_identity(&from_identifier)
            .await
            .map_err(CallError::Identity)?
            .and_then(|identity| identity.organization_id);
        let call_id = uuid::Uuid::new_v4().to_string();
        let attempts = self
            .store
            .create_attempts(NewCall {
                call_id: call_id.clone(),
                from_identifier: from_identifier.clone(),
                organization_id,
                targets,
                message: non_empty(request.message),
                attachment_ref: non_empty(request.attachment_ref),
                created_at: Utc::now(),
            })
            .await?;

        let reconciler = Arc::clone(&self.reconciler);
        let timed_call_id = call_id.clone();
        self.timers
            .arm(&call_id, self.config.response_window, async move {
                if let Err(error) = reconciler.timeout(&timed_call_id).await {
                    tracing::warn!(
                        call_id = %timed_call_id,
                        error = %error,
                        "response timeout reconciliation failed"
                    );
                }
            });

        tracing::info!(
            call_id = %call_id,
            from_identifier = %from_identifier,
            targets = attempts.len(),
            response_window_ms = u64::try_from(self.config.response_window.as_millis()).unwrap_or(u64::MAX),
            "call placed"
        );

        let dispatcher = self.clone();
        let fanout = tokio::spawn(async move { dispatcher.deliver(&attempts).await });
        Ok(DispatchedCall { call_id, fanout })
    }

    /// Pushes each attempt to its recipient concurrently.
    pub async fn deliver(&self, attempts: &[CallAttempt]) -> Vec<TargetDelivery> {
        join_all(attempts.iter().map(|attempt| self.deliver_one(attempt))).await
    }

    async fn deliver_one(&self, attempt: &CallAttempt) -> TargetDelivery {
        let notification = CallNotification::from(attempt);
        let route = self.route_notification(&notification).await;
        match &route {
            DeliveryRoute::Live { connection_id } => tracing::debug!(
                call_id = %attempt.call_id,
                to_identifier = %attempt.to_identifier,
                %connection_id,
                "call pushed to live transport"
            ),
            DeliveryRoute::Bot { chat_id } => tracing::debug!(
                call_id = %attempt.call_id,
                to_identifier = %attempt.to_identifier,
                chat_id = %chat_id,
                "call pushed to bot-linked recipient"
            ),
            DeliveryRoute::Unreachable { reason } => tracing::warn!(
                call_id = %attempt.call_id,
                to_identifier = %attempt.to_identifier,
                reason = %reason,
                "call target unreachable; attempt stays pending until timeout"
            ),
        }
        TargetDelivery {
            to_identifier: attempt.to_identifier.clone(),
            route,
        }
    }

    async fn route_notification(&self, notification: &CallNotification) -> DeliveryRoute {
        let to_identifier = notification.to_identifier.as_str();
        let registration = self
            .registry
            .lookup(to_identifier)
            .or_else(|| self.registry.resolve_by_display_name(to_identifier));
        if let Some(registration) = registration {
            let push = PresencePush::new(
                CALL_INCOMING_PUSH_KIND,
                call_incoming_payload(notification),
            );
            match registration.transport.push(push) {
                Ok(()) => {
                    return DeliveryRoute::Live {
                        connection_id: registration.connection_id(),
                    }
                }
                Err(error) => tracing::warn!(
                    call_id = %notification.call_id,
                    to_identifier,
                    error = %error,
                    "live push failed; trying bot link"
                ),
            }
        }

        let Some(bot) = self.bot.as_ref() else {
            return unreachable(UNREACHABLE_REASON_NO_ROUTE);
        };
        let link = match bot.linked_recipient(to_identifier).await {
            Ok(Some(link)) => link,
            Ok(None) => return unreachable(UNREACHABLE_REASON_NO_ROUTE),
            Err(error) => {
                tracing::warn!(
                    to_identifier,
                    error = %format!("{error:#}"),
                    "bot link lookup failed"
                );
                return unreachable(UNREACHABLE_REASON_BOT_LOOKUP_FAILED);
            }
        };
        match bot.push_call(&link, notification).await {
            Ok(()) => DeliveryRoute::Bot {
                chat_id: link.chat_id,
            },
            Err(error) => {
                tracing::warn!(
                    to_identifier,
                    chat_id = %link.chat_id,
                    error = %format!("{error:#}"),
                    "bot push failed"
                );
                unreachable(UNREACHABLE_REASON_BOT_PUSH_FAILED)
            }
        }
    }
}

/// JSON body pushed to live recipients for a new call.
pub fn call_incoming_payload(notification: &CallNotification) -> Value {
    json!({
        "call_id": notification.call_id,
        "from_identifier": notification.from_identifier,
        "to_identifier": notification.to_identifier,
        "message": notification.message,
        "attachment_ref": notification.attachment_ref,
        "created_at": notification.created_at.to_rfc3339(),
    })
}

fn unreachable(reason: &str) -> DeliveryRoute {
    DeliveryRoute::Unreachable {
        reason: reason.to_string(),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Trims targets and drops blanks and normalized duplicates, keeping the first spelling.
fn dedupe_targets(targets: &[String]) -> Vec<String> {
    let mut seen = Vec::new();
    let mut kept = Vec::new();
    for target in targets {
        let target = target.trim();
        let key = normalize_identifier(target);
        if key.is_empty() || seen.contains(&key) {
            continue;
        }
        seen.push(key);
        kept.push(target.to_string());
    }
    kept
}
