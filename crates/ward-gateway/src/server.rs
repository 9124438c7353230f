//! HTTP routes for placing, answering and inspecting calls.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::rejection::QueryRejection;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::http::{header::AUTHORIZATION, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use ward_bot::{apply_bot_callback, parse_telegram_callback_update, BotLinkDirectory};
use ward_call_runtime::{CallDispatcher, CallError, CallReconciler, PlaceCallRequest, ResponseOutcome};
use ward_call_types::{CallAttemptQuery, CallStatus};
use ward_identity::{principal_may_act_for, Principal, PrincipalAuthenticator};
use ward_presence::RecipientRegistry;

use crate::api_error::WardApiError;
use crate::websocket::run_ward_ws_connection;

pub const CALLS_ENDPOINT: &str = "/calls";
pub const CALL_ENDPOINT: &str = "/calls/{call_id}";
pub const CALL_ACCEPT_ENDPOINT: &str = "/calls/{call_id}/accept";
pub const CALL_REJECT_ENDPOINT: &str = "/calls/{call_id}/reject";
pub const CALL_CANCEL_ENDPOINT: &str = "/calls/{call_id}/cancel";
pub const TELEGRAM_CALLBACK_ENDPOINT: &str = "/bot/telegram/callback";
pub const WS_ENDPOINT: &str = "/ws";

const TELEGRAM_SECRET_HEADER: &str = "x-telegram-bot-api-secret-token";
const DEFAULT_CALL_LIST_LIMIT: usize = 100;
const MAX_CALL_LIST_LIMIT: usize = 500;

/// Shared collaborators behind every route and websocket connection.
#[derive(Clone)]
pub struct WardGatewayState {
    pub dispatcher: CallDispatcher,
    pub reconciler: Arc<CallReconciler>,
    pub registry: Arc<RecipientRegistry>,
    pub authenticator: Arc<dyn PrincipalAuthenticator>,
    pub bot_links: Arc<BotLinkDirectory>,
    pub telegram_webhook_secret: Option<String>,
}

pub fn build_ward_gateway_router(state: Arc<WardGatewayState>) -> Router {
    Router::new()
        .route(
            CALLS_ENDPOINT,
            post(handle_place_call).get(handle_list_calls),
        )
        .route(CALL_ENDPOINT, get(handle_get_call))
        .route(CALL_ACCEPT_ENDPOINT, post(handle_accept_call))
        .route(CALL_REJECT_ENDPOINT, post(handle_reject_call))
        .route(CALL_CANCEL_ENDPOINT, post(handle_cancel_call))
        .route(TELEGRAM_CALLBACK_ENDPOINT, post(handle_telegram_callback))
        .route(WS_ENDPOINT, get(handle_ward_ws_upgrade))
        .with_state(state)
}

fn bearer_token_from_headers(headers: &HeaderMap) -> Option<String> {
    let header = headers.get(AUTHORIZATION)?;
    let raw = header.to_str().ok()?;
    let token = raw.strip_prefix("Bearer ")?;
    let token = token.trim();
    if token.is_empty() {
        return None;
    }
    Some(token.to_string())
}

pub(crate) async fn authorize_ward_request(
    state: &WardGatewayState,
    headers: &HeaderMap,
) -> Result<Principal, WardApiError> {
    let token = bearer_token_from_headers(headers).ok_or_else(WardApiError::unauthorized)?;
    match state.authenticator.authenticate(&token).await {
        Ok(Some(principal)) => Ok(principal),
        Ok(None) => Err(WardApiError::unauthorized()),
        Err(error) => {
            tracing::error!(%error, "principal authentication failed");
            Err(WardApiError::internal("principal authentication failed"))
        }
    }
}

pub(crate) async fn ensure_may_act_for(
    state: &WardGatewayState,
    principal: &Principal,
    identifier: &str,
) -> Result<(), WardApiError> {
    let allowed = principal_may_act_for(state.reconciler.identities().as_ref(), principal, identifier)
        .await
        .map_err(|error| WardApiError::from(CallError::Identity(error)))?;
    if allowed {
        return Ok(());
    }
    Err(WardApiError::forbidden(
        "not_permitted",
        format!("'{}' may not act for '{identifier}'", principal.name),
    ))
}

fn parse_ward_json_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, WardApiError> {
    serde_json::from_slice::<T>(body).map_err(|error| {
        WardApiError::bad_request(
            "malformed_json",
            format!("failed to parse request body: {error}"),
        )
    })
}

fn parse_optional_ward_json_body<T: DeserializeOwned + Default>(
    body: &Bytes,
) -> Result<T, WardApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    parse_ward_json_body(body)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CallResponseKind {
    Accept,
    Reject,
}

/// Accepts or rejects on behalf of `to_identifier` (the principal's own name by default).
pub(crate) async fn respond_to_call(
    state: &WardGatewayState,
    principal: &Principal,
    call_id: &str,
    to_identifier: Option<String>,
    kind: CallResponseKind,
) -> Result<Value, WardApiError> {
    let to_identifier = to_identifier.unwrap_or_else(|| principal.name.clone());
    let outcome = match kind {
        CallResponseKind::Accept => {
            state
                .reconciler
                .accept(call_id, &to_identifier, principal)
                .await?
        }
        CallResponseKind::Reject => {
            state
                .reconciler
                .reject(call_id, &to_identifier, principal)
                .await?
        }
    };
    Ok(response_outcome_payload(call_id, &to_identifier, &outcome))
}

pub(crate) fn response_outcome_payload(
    call_id: &str,
    to_identifier: &str,
    outcome: &ResponseOutcome,
) -> Value {
    let cancelled_siblings = match outcome {
        ResponseOutcome::Applied {
            cancelled_siblings, ..
        } => cancelled_siblings.clone(),
        ResponseOutcome::AlreadyResolved { .. } => Vec::new(),
    };
    json!({
        "call_id": call_id,
        "to_identifier": to_identifier,
        "applied": outcome.is_applied(),
        "status": outcome.status().as_str(),
        "cancelled_siblings": cancelled_siblings,
    })
}

pub(crate) async fn cancel_call(
    state: &WardGatewayState,
    principal: &Principal,
    call_id: &str,
    targets: Option<Vec<String>>,
) -> Result<Value, WardApiError> {
    let outcome = state
        .reconciler
        .cancel(call_id, principal, targets.as_deref())
        .await?;
    Ok(json!({
        "call_id": call_id,
        "cancelled": outcome.cancelled,
    }))
}

#[derive(Debug, Deserialize)]
struct PlaceCallBody {
    #[serde(default)]
    from_identifier: Option<String>,
    #[serde(default)]
    targets: Vec<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    attachment_ref: Option<String>,
}

async fn handle_place_call(
    State(state): State<Arc<WardGatewayState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match place_call(&state, &headers, &body).await {
        Ok(call_id) => (StatusCode::CREATED, Json(json!({ "call_id": call_id }))).into_response(),
        Err(error) => error.into_response(),
    }
}

async fn place_call(
    state: &WardGatewayState,
    headers: &HeaderMap,
    body: &Bytes,
) -> Result<String, WardApiError> {
    let principal = authorize_ward_request(state, headers).await?;
    let body = parse_ward_json_body::<PlaceCallBody>(body)?;
    let from_identifier = body
        .from_identifier
        .unwrap_or_else(|| principal.name.clone());
    ensure_may_act_for(state, &principal, &from_identifier).await?;

    let call_id = state
        .dispatcher
        .place_call(PlaceCallRequest {
            from_identifier,
            targets: body.targets,
            message: body.message,
            attachment_ref: body.attachment_ref,
        })
        .await?;
    Ok(call_id)
}

#[derive(Debug, Default, Deserialize)]
struct CallListParams {
    call_id: Option<String>,
    from_identifier: Option<String>,
    to_identifier: Option<String>,
    organization_id: Option<String>,
    /// Comma-separated status names.
    status: Option<String>,
    created_after: Option<String>,
    created_before: Option<String>,
    offset: Option<usize>,
    limit: Option<usize>,
}

fn parse_query_timestamp(field: &str, raw: Option<&str>) -> Result<Option<DateTime<Utc>>, WardApiError> {
    raw.map(|raw| {
        DateTime::parse_from_rfc3339(raw.trim())
            .map(|parsed| parsed.with_timezone(&Utc))
            .map_err(|error| {
                WardApiError::bad_request(
                    "invalid_query",
                    format!("{field} must be an RFC 3339 timestamp: {error}"),
                )
            })
    })
    .transpose()
}

fn build_call_attempt_query(
    principal: &Principal,
    params: CallListParams,
) -> Result<CallAttemptQuery, WardApiError> {
    let organization_id = match (&principal.organization_id, params.organization_id) {
        (Some(own), Some(requested)) if own != &requested => {
            return Err(WardApiError::forbidden(
                "not_permitted",
                format!("'{}' may not read organization '{requested}'", principal.name),
            ))
        }
        (Some(own), _) => Some(own.clone()),
        (None, requested) => requested,
    };
    let statuses = params
        .status
        .as_deref()
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|status| !status.is_empty())
                .map(|status| {
                    status.parse::<CallStatus>().map_err(|error| {
                        WardApiError::bad_request("invalid_query", error.to_string())
                    })
                })
                .collect::<Result<Vec<_>, _>>()
        })
        .transpose()?;

    Ok(CallAttemptQuery {
        call_id: params.call_id,
        from_identifier: params.from_identifier,
        to_identifier: params.to_identifier,
        organization_id,
        statuses,
        created_after: parse_query_timestamp("created_after", params.created_after.as_deref())?,
        created_before: parse_query_timestamp("created_before", params.created_before.as_deref())?,
        offset: params.offset.unwrap_or(0),
        limit: Some(
            params
                .limit
                .unwrap_or(DEFAULT_CALL_LIST_LIMIT)
                .min(MAX_CALL_LIST_LIMIT),
        ),
    })
}

async fn handle_list_calls(
    State(state): State<Arc<WardGatewayState>>,
    headers: HeaderMap,
    params: Result<Query<CallListParams>, QueryRejection>,
) -> Response {
    let result = async {
        let principal = authorize_ward_request(&state, &headers).await?;
        let Query(params) = params
            .map_err(|error| WardApiError::bad_request("invalid_query", error.body_text()))?;
        let query = build_call_attempt_query(&principal, params)?;
        let offset = query.offset;
        let attempts = state
            .reconciler
            .store()
            .query_attempts(query)
            .await
            .map_err(CallError::from)?;
        Ok::<_, WardApiError>(json!({
            "offset": offset,
            "count": attempts.len(),
            "attempts": attempts,
        }))
    }
    .await;
    match result {
        Ok(payload) => (StatusCode::OK, Json(payload)).into_response(),
        Err(error) => error.into_response(),
    }
}

async fn handle_get_call(
    State(state): State<Arc<WardGatewayState>>,
    headers: HeaderMap,
    Path(call_id): Path<String>,
) -> Response {
    let result = async {
        let principal = authorize_ward_request(&state, &headers).await?;
        let attempts = state
            .reconciler
            .store()
            .find_by_call_id(&call_id)
            .await
            .map_err(CallError::from)?;
        let visible = attempts.first().is_some_and(|attempt| {
            principal.organization_id.is_none()
                || attempt.organization_id.is_none()
                || attempt.organization_id == principal.organization_id
        });
        if !visible {
            return Err(WardApiError::not_found(
                "call_not_found",
                format!("call '{call_id}' does not exist"),
            ));
        }
        Ok::<_, WardApiError>(json!({
            "call_id": call_id,
            "attempts": attempts,
        }))
    }
    .await;
    match result {
        Ok(payload) => (StatusCode::OK, Json(payload)).into_response(),
        Err(error) => error.into_response(),
    }
}

#[derive(Debug, Default, Deserialize)]
struct CallResponseBody {
    #[serde(default)]
    to_identifier: Option<String>,
}

async fn handle_call_response(
    state: Arc<WardGatewayState>,
    headers: HeaderMap,
    call_id: String,
    body: Bytes,
    kind: CallResponseKind,
) -> Response {
    let result = async {
        let principal = authorize_ward_request(&state, &headers).await?;
        let body = parse_optional_ward_json_body::<CallResponseBody>(&body)?;
        respond_to_call(&state, &principal, &call_id, body.to_identifier, kind).await
    }
    .await;
    match result {
        Ok(payload) => (StatusCode::OK, Json(payload)).into_response(),
        Err(error) => error.into_response(),
    }
}

async fn handle_accept_call(
    State(state): State<Arc<WardGatewayState>>,
    headers: HeaderMap,
    Path(call_id): Path<String>,
    body: Bytes,
) -> Response {
    handle_call_response(state, headers, call_id, body, CallResponseKind::Accept).await
}

async fn handle_reject_call(
    State(state): State<Arc<WardGatewayState>>,
    headers: HeaderMap,
    Path(call_id): Path<String>,
    body: Bytes,
) -> Response {
    handle_call_response(state, headers, call_id, body, CallResponseKind::Reject).await
}

#[derive(Debug, Default, Deserialize)]
struct CancelCallBody {
    #[serde(default)]
    targets: Option<Vec<String>>,
}

async fn handle_cancel_call(
    State(state): State<Arc<WardGatewayState>>,
    headers: HeaderMap,
    Path(call_id): Path<String>,
    body: Bytes,
) -> Response {
    let result = async {
        let principal = authorize_ward_request(&state, &headers).await?;
        let body = parse_optional_ward_json_body::<CancelCallBody>(&body)?;
        cancel_call(&state, &principal, &call_id, body.targets).await
    }
    .await;
    match result {
        Ok(payload) => (StatusCode::OK, Json(payload)).into_response(),
        Err(error) => error.into_response(),
    }
}

/// Telegram webhooks authenticate with the configured secret header; without
/// one the route falls back to bearer auth and yields that principal.
async fn authorize_telegram_webhook(
    state: &WardGatewayState,
    headers: &HeaderMap,
) -> Result<Option<Principal>, WardApiError> {
    let Some(secret) = state.telegram_webhook_secret.as_deref() else {
        return authorize_ward_request(state, headers).await.map(Some);
    };
    let presented = headers
        .get(TELEGRAM_SECRET_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim);
    if presented == Some(secret) {
        return Ok(None);
    }
    Err(WardApiError::new(
        StatusCode::UNAUTHORIZED,
        "unauthorized",
        "missing or invalid telegram webhook secret",
    ))
}

async fn handle_telegram_callback(
    State(state): State<Arc<WardGatewayState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let result = async {
        let bearer = authorize_telegram_webhook(&state, &headers).await?;
        let update = parse_ward_json_body::<Value>(&body)?;
        let Some(callback) = parse_telegram_callback_update(&update) else {
            return Ok(json!({ "ok": true, "handled": false }));
        };
        if let Some(principal) = bearer.as_ref() {
            if let Some(link) = state.bot_links.link_for_chat(&callback.chat_id) {
                ensure_may_act_for(&state, principal, &link.identifier).await?;
            }
        }
        let applied = apply_bot_callback(&state.reconciler, &state.bot_links, &callback).await?;
        Ok::<_, WardApiError>(json!({
            "ok": true,
            "handled": true,
            "callback_query_id": callback.callback_query_id,
            "response": response_outcome_payload(
                applied.action.call_id(),
                &applied.identifier,
                &applied.outcome,
            ),
        }))
    }
    .await;
    match result {
        Ok(payload) => (StatusCode::OK, Json(payload)).into_response(),
        Err(error) => error.into_response(),
    }
}

async fn handle_ward_ws_upgrade(
    State(state): State<Arc<WardGatewayState>>,
    headers: HeaderMap,
    websocket: WebSocketUpgrade,
) -> Response {
    let principal = match authorize_ward_request(&state, &headers).await {
        Ok(principal) => principal,
        Err(error) => return error.into_response(),
    };

    websocket
        .on_upgrade(move |socket| run_ward_ws_connection(state, socket, principal))
        .into_response()
}
