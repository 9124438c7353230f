//! Inline-keyboard callbacks from Telegram mapped onto call responses.

use serde_json::Value;
use thiserror::Error;
use ward_call_runtime::{CallError, CallReconciler, ResponseOutcome};
use ward_identity::Principal;

use crate::BotLinkDirectory;

const CALLBACK_PREFIX: &str = "ward";

#[derive(Debug, Error)]
pub enum BotCallbackError {
    #[error("unrecognized callback data '{0}'")]
    UnknownAction(String),
    #[error("telegram chat '{0}' is not linked to a recipient")]
    UnlinkedChat(String),
    #[error(transparent)]
    Call(#[from] CallError),
    #[error("identity resolution failed: {0}")]
    Identity(#[source] anyhow::Error),
}

/// Decoded `ward:<action>:<call_id>` callback data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BotCallbackAction {
    Accept { call_id: String },
    Reject { call_id: String },
}

impl BotCallbackAction {
    pub fn parse(data: &str) -> Result<Self, BotCallbackError> {
        let unknown = || BotCallbackError::UnknownAction(data.to_string());
        let mut parts = data.trim().splitn(3, ':');
        if parts.next() != Some(CALLBACK_PREFIX) {
            return Err(unknown());
        }
        let action = parts.next().ok_or_else(unknown)?;
        let call_id = parts
            .next()
            .map(str::trim)
            .filter(|call_id| !call_id.is_empty())
            .ok_or_else(unknown)?
            .to_string();
        match action {
            "accept" => Ok(Self::Accept { call_id }),
            "reject" => Ok(Self::Reject { call_id }),
            _ => Err(unknown()),
        }
    }

    pub fn callback_data(&self) -> String {
        match self {
            Self::Accept { call_id } => format!("{CALLBACK_PREFIX}:accept:{call_id}"),
            Self::Reject { call_id } => format!("{CALLBACK_PREFIX}:reject:{call_id}"),
        }
    }

    pub fn call_id(&self) -> &str {
        match self {
            Self::Accept { call_id } | Self::Reject { call_id } => call_id,
        }
    }
}

/// Fields of a Telegram `callback_query` update that drive a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelegramCallback {
    pub callback_query_id: String,
    pub chat_id: String,
    pub data: String,
}

/// Extracts the callback query from a Telegram update, if it has one.
///
/// The chat id comes from the originating message, falling back to the
/// sender's user id for private chats.
pub fn parse_telegram_callback_update(update: &Value) -> Option<TelegramCallback> {
    let query = update.get("callback_query")?;
    let data = query.get("data").and_then(Value::as_str)?.to_string();
    let chat_id = query
        .get("message")
        .and_then(|message| message.get("chat"))
        .and_then(|chat| chat.get("id"))
        .or_else(|| query.get("from").and_then(|from| from.get("id")))
        .and_then(id_as_string)?;
    let callback_query_id = query
        .get("id")
        .and_then(id_as_string)
        .unwrap_or_default();
    Some(TelegramCallback {
        callback_query_id,
        chat_id,
        data,
    })
}

fn id_as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(raw) => Some(raw.trim().to_string()).filter(|raw| !raw.is_empty()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BotCallbackOutcome {
    pub identifier: String,
    pub action: BotCallbackAction,
    pub outcome: ResponseOutcome,
}

/// Applies a callback as an accept or reject on behalf of the linked recipient.
///
/// Repeated taps are harmless: the reconciler reports them as already resolved.
pub async fn apply_bot_callback(
    reconciler: &CallReconciler,
    links: &BotLinkDirectory,
    callback: &TelegramCallback,
) -> Result<BotCallbackOutcome, BotCallbackError> {
    let action = BotCallbackAction::parse(&callback.data)?;
    let link = links
        .link_for_chat(&callback.chat_id)
        .ok_or_else(|| BotCallbackError::UnlinkedChat(callback.chat_id.clone()))?;

    let principal = match reconciler
        .identities()
        .resolve_identity(&link.identifier)
        .await
        .map_err(BotCallbackError::Identity)?
    {
        Some(identity) => Principal::from(&identity),
        None => Principal {
            id: format!("telegram:{}", callback.chat_id),
            name: link.identifier.clone(),
            organization_id: None,
            department: None,
            is_floor_account: false,
            is_department_account: false,
        },
    };

    let outcome = match &action {
        BotCallbackAction::Accept { call_id } => {
            reconciler
                .accept(call_id, &link.identifier, &principal)
                .await?
        }
        BotCallbackAction::Reject { call_id } => {
            reconciler
                .reject(call_id, &link.identifier, &principal)
                .await?
        }
    };
    tracing::info!(
        call_id = action.call_id(),
        chat_id = %callback.chat_id,
        identifier = %link.identifier,
        applied = outcome.is_applied(),
        "telegram callback applied"
    );
    Ok(BotCallbackOutcome {
        identifier: link.identifier.clone(),
        action,
        outcome,
    })
}

#[cfg(test)]
mod tests {
    use super::{
        apply_bot_callback, parse_telegram_callback_update, BotCallbackAction, BotCallbackError,
        TelegramCallback,
    };
    use crate::BotLinkDirectory;
    use chrono::Utc;
    use serde_json::json;
    use std::sync::Arc;
    use ward_call_runtime::{BotLink, CallReconciler, ObserverSet, ResponseTimers};
    use ward_call_store::{CallStore, InMemoryCallStore, NewCall};
    use ward_call_types::CallStatus;
    use ward_identity::DirectoryIdentityResolver;

    #[test]
    fn unit_parse_round_trips_callback_data() {
        let accept = BotCallbackAction::parse("ward:accept:c-1").expect("accept");
        assert_eq!(
            accept,
            BotCallbackAction::Accept {
                call_id: "c-1".to_string()
            }
        );
        assert_eq!(accept.callback_data(), "ward:accept:c-1");
        assert_eq!(
            BotCallbackAction::parse(" ward:reject:c-2 ").expect("reject").call_id(),
            "c-2"
        );
    }

    #[test]
    fn regression_parse_rejects_foreign_or_incomplete_data() {
        for data in ["", "ward", "ward:accept", "ward:accept: ", "ward:snooze:c-1", "other:accept:c-1"] {
            assert!(
                matches!(
                    BotCallbackAction::parse(data),
                    Err(BotCallbackError::UnknownAction(_))
                ),
                "{data}"
            );
        }
    }

    #[test]
    fn functional_update_parsing_prefers_message_chat_and_accepts_numeric_ids() {
        let update = json!({
            "update_id": 7,
            "callback_query": {
                "id": "cb-1",
                "from": {"id": 555},
                "message": {"message_id": 9, "chat": {"id": 1002}},
                "data": "ward:accept:c-1"
            }
        });
        assert_eq!(
            parse_telegram_callback_update(&update),
            Some(TelegramCallback {
                callback_query_id: "cb-1".to_string(),
                chat_id: "1002".to_string(),
                data: "ward:accept:c-1".to_string(),
            })
        );

        let private = json!({"callback_query": {"id": "cb-2", "from": {"id": 555}, "data": "x"}});
        assert_eq!(
            parse_telegram_callback_update(&private).expect("callback").chat_id,
            "555"
        );
        assert!(parse_telegram_callback_update(&json!({"message": {}})).is_none());
    }

    async fn reconciler_with_call() -> (CallReconciler, Arc<InMemoryCallStore>) {
        let store = Arc::new(InMemoryCallStore::new());
        store
            .create_attempts(NewCall {
                call_id: "c-1".to_string(),
                from_identifier: "ICU".to_string(),
                organization_id: None,
                targets: vec!["FloorA".to_string(), "FloorB".to_string()],
                message: None,
                attachment_ref: None,
                created_at: Utc::now(),
            })
            .await
            .expect("seed call");
        let reconciler = CallReconciler::new(
            store.clone(),
            Arc::new(DirectoryIdentityResolver::default()),
            Arc::new(ResponseTimers::new()),
            ObserverSet::new(),
        );
        (reconciler, store)
    }

    fn links() -> BotLinkDirectory {
        BotLinkDirectory::new(vec![BotLink {
            identifier: "FloorB".to_string(),
            chat_id: "1002".to_string(),
        }])
    }

    fn callback(chat_id: &str, data: &str) -> TelegramCallback {
        TelegramCallback {
            callback_query_id: "cb-1".to_string(),
            chat_id: chat_id.to_string(),
            data: data.to_string(),
        }
    }

    #[tokio::test]
    async fn integration_accept_callback_claims_call_for_linked_recipient() {
        let (reconciler, store) = reconciler_with_call().await;
        let links = links();

        let outcome = apply_bot_callback(&reconciler, &links, &callback("1002", "ward:accept:c-1"))
            .await
            .expect("apply");
        assert_eq!(outcome.identifier, "FloorB");
        assert!(outcome.outcome.is_applied());

        let rows = store.find_by_call_id("c-1").await.expect("rows");
        assert_eq!(rows[0].status, CallStatus::Cancelled);
        assert_eq!(rows[1].status, CallStatus::Accepted);

        let repeated = apply_bot_callback(&reconciler, &links, &callback("1002", "ward:accept:c-1"))
            .await
            .expect("repeat tap");
        assert!(!repeated.outcome.is_applied());
    }

    #[tokio::test]
    async fn regression_unlinked_chat_changes_nothing() {
        let (reconciler, store) = reconciler_with_call().await;
        let error = apply_bot_callback(&reconciler, &links(), &callback("9999", "ward:reject:c-1"))
            .await
            .expect_err("unlinked chat");
        assert!(matches!(error, BotCallbackError::UnlinkedChat(_)));
        assert_eq!(
            store.find_pending_by_call_id("c-1").await.expect("pending").len(),
            2
        );
    }
}
