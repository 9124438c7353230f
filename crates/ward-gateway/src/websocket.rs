//! Websocket connection lifecycle: registration, response frames and pushes.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Map, Value};
use ward_core::{current_unix_timestamp_ms, normalize_identifier};
use ward_identity::Principal;
use ward_presence::{RegistrationMetadata, TransportHandle};

use crate::api_error::WardApiError;
use crate::server::{
    cancel_call, ensure_may_act_for, respond_to_call, CallResponseKind, WardGatewayState,
};
use crate::ws_protocol::{
    best_effort_ward_ws_request_id, build_ward_ws_error_frame, build_ward_ws_response_frame,
    classify_ward_ws_parse_error, parse_optional_string, parse_optional_string_list,
    parse_required_string, parse_ward_ws_request_frame, ward_ws_capabilities_payload,
    WardWsRequestKind, WardWsResponseFrame, WARD_WS_ERROR_CODE_INTERNAL_ERROR,
    WARD_WS_ERROR_CODE_INVALID_PAYLOAD, WARD_WS_HEARTBEAT_INTERVAL_SECONDS,
    WARD_WS_HEARTBEAT_REQUEST_ID, WARD_WS_PUSH_REQUEST_ID,
};

fn ward_ws_message_from_frame(frame: &WardWsResponseFrame) -> WsMessage {
    match serde_json::to_string(frame) {
        Ok(raw) => WsMessage::Text(raw.into()),
        Err(error) => {
            let fallback = build_ward_ws_error_frame(
                &frame.request_id,
                WARD_WS_ERROR_CODE_INTERNAL_ERROR,
                format!("failed to serialize ward websocket frame: {error}").as_str(),
            );
            WsMessage::Text(
                serde_json::to_string(&fallback)
                    .unwrap_or_else(|_| {
                        "{\"schema_version\":1,\"request_id\":\"unknown-request\",\"kind\":\"error\",\"payload\":{\"code\":\"internal_error\",\"message\":\"failed to serialize ward websocket frame\"}}".to_string()
                    })
                    .into(),
            )
        }
    }
}

fn payload_error(error: anyhow::Error) -> WardApiError {
    WardApiError::bad_request(WARD_WS_ERROR_CODE_INVALID_PAYLOAD, error.to_string())
}

async fn register_recipient(
    state: &WardGatewayState,
    principal: &Principal,
    transport: &TransportHandle,
    payload: &Map<String, Value>,
) -> Result<Value, WardApiError> {
    let key = parse_optional_string(payload, "key")
        .map_err(payload_error)?
        .unwrap_or_else(|| principal.name.clone());
    let display_name = parse_optional_string(payload, "display_name")
        .map_err(payload_error)?
        .unwrap_or_else(|| key.clone());
    ensure_may_act_for(state, principal, &key).await?;

    let superseded = state
        .registry
        .register(
            &key,
            transport.clone(),
            RegistrationMetadata {
                display_name,
                organization_scope: principal.organization_id.clone(),
            },
        )
        .map_err(|error| {
            WardApiError::bad_request(WARD_WS_ERROR_CODE_INVALID_PAYLOAD, error.to_string())
        })?;
    Ok(json!({
        "key": normalize_identifier(&key),
        "connection_id": transport.connection_id(),
        "superseded": superseded.is_some(),
    }))
}

async fn dispatch_ward_ws_text_frame(
    state: &WardGatewayState,
    principal: &Principal,
    transport: &TransportHandle,
    raw: &str,
) -> WardWsResponseFrame {
    let frame = match parse_ward_ws_request_frame(raw) {
        Ok(frame) => frame,
        Err(error) => {
            let request_id = best_effort_ward_ws_request_id(raw)
                .unwrap_or_else(|| "unknown-request".to_string());
            let message = error.to_string();
            let code = classify_ward_ws_parse_error(message.as_str());
            return build_ward_ws_error_frame(&request_id, code, message.as_str());
        }
    };

    let result = match frame.kind {
        WardWsRequestKind::Capabilities => Ok(ward_ws_capabilities_payload()),
        WardWsRequestKind::RecipientRegister => {
            register_recipient(state, principal, transport, &frame.payload).await
        }
        WardWsRequestKind::CallAccept | WardWsRequestKind::CallReject => {
            let kind = if frame.kind == WardWsRequestKind::CallAccept {
                CallResponseKind::Accept
            } else {
                CallResponseKind::Reject
            };
            match (
                parse_required_string(&frame.payload, "call_id"),
                parse_optional_string(&frame.payload, "to_identifier"),
            ) {
                (Ok(call_id), Ok(to_identifier)) => {
                    respond_to_call(state, principal, &call_id, to_identifier, kind).await
                }
                (Err(error), _) | (_, Err(error)) => Err(payload_error(error)),
            }
        }
        WardWsRequestKind::CallCancel => {
            match (
                parse_required_string(&frame.payload, "call_id"),
                parse_optional_string_list(&frame.payload, "targets"),
            ) {
                (Ok(call_id), Ok(targets)) => cancel_call(state, principal, &call_id, targets).await,
                (Err(error), _) | (_, Err(error)) => Err(payload_error(error)),
            }
        }
    };

    match result {
        Ok(payload) => {
            build_ward_ws_response_frame(&frame.request_id, frame.kind.response_kind(), payload)
        }
        Err(error) => build_ward_ws_error_frame(&frame.request_id, error.code, &error.message),
    }
}

/// Serves one authenticated socket until it closes.
///
/// The connection is registered under the principal's name on entry and every
/// registration it holds is removed on exit.
pub(crate) async fn run_ward_ws_connection(
    state: Arc<WardGatewayState>,
    socket: WebSocket,
    principal: Principal,
) {
    let (transport, mut outbox) = TransportHandle::channel();
    let connection_id = transport.connection_id();
    if let Err(error) = state.registry.register(
        &principal.name,
        transport.clone(),
        RegistrationMetadata {
            display_name: principal.name.clone(),
            organization_scope: principal.organization_id.clone(),
        },
    ) {
        tracing::warn!(%connection_id, %error, "default recipient registration skipped");
    }
    tracing::info!(%connection_id, principal = %principal.name, "websocket connected");

    let (mut sender, mut receiver) = socket.split();
    let mut heartbeat = tokio::time::interval(Duration::from_secs(
        WARD_WS_HEARTBEAT_INTERVAL_SECONDS.max(1),
    ));
    heartbeat.tick().await;

    loop {
        tokio::select! {
            inbound = receiver.next() => {
                let Some(inbound) = inbound else {
                    break;
                };
                let message = match inbound {
                    Ok(message) => message,
                    Err(_) => break,
                };

                match message {
                    WsMessage::Text(text) => {
                        let response = dispatch_ward_ws_text_frame(
                            &state,
                            &principal,
                            &transport,
                            text.as_str(),
                        )
                        .await;
                        if sender
                            .send(ward_ws_message_from_frame(&response))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    WsMessage::Binary(bytes) => {
                        let response = match String::from_utf8(bytes.to_vec()) {
                            Ok(text) => {
                                dispatch_ward_ws_text_frame(&state, &principal, &transport, &text)
                                    .await
                            }
                            Err(_) => build_ward_ws_error_frame(
                                "unknown-request",
                                WARD_WS_ERROR_CODE_INVALID_PAYLOAD,
                                "ward websocket binary frame must be UTF-8 encoded JSON text",
                            ),
                        };
                        if sender
                            .send(ward_ws_message_from_frame(&response))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    WsMessage::Ping(payload) => {
                        if sender.send(WsMessage::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    WsMessage::Pong(_) => {}
                    WsMessage::Close(_) => break,
                }
            }
            push = outbox.recv() => {
                let Some(push) = push else {
                    break;
                };
                let frame = build_ward_ws_response_frame(
                    WARD_WS_PUSH_REQUEST_ID,
                    &push.kind,
                    push.payload,
                );
                if sender
                    .send(ward_ws_message_from_frame(&frame))
                    .await
                    .is_err()
                {
                    break;
                }
            }
            _ = heartbeat.tick() => {
                if sender.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
                let heartbeat_frame = build_ward_ws_response_frame(
                    WARD_WS_HEARTBEAT_REQUEST_ID,
                    "ward.heartbeat",
                    json!({
                        "ts_unix_ms": current_unix_timestamp_ms(),
                    }),
                );
                if sender
                    .send(ward_ws_message_from_frame(&heartbeat_frame))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        }
    }

    let removed = state.registry.remove_by_transport(connection_id);
    tracing::info!(%connection_id, removed = removed.len(), "websocket disconnected");
}
