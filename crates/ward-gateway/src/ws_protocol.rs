use std::str::FromStr;

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const WARD_WS_REQUEST_SCHEMA_VERSION: u32 = 1;
pub const WARD_WS_RESPONSE_SCHEMA_VERSION: u32 = 1;
pub const WARD_WS_PROTOCOL_VERSION: &str = "0.1.0";
pub const WARD_WS_HEARTBEAT_INTERVAL_SECONDS: u64 = 15;
pub const WARD_WS_HEARTBEAT_REQUEST_ID: &str = "ward-heartbeat";
pub const WARD_WS_PUSH_REQUEST_ID: &str = "ward-push";

const WARD_WS_COMPATIBLE_REQUEST_SCHEMA_VERSIONS: [u32; 1] = [WARD_WS_REQUEST_SCHEMA_VERSION];

pub const WARD_WS_ERROR_CODE_INVALID_JSON: &str = "invalid_json";
pub const WARD_WS_ERROR_CODE_UNSUPPORTED_SCHEMA: &str = "unsupported_schema";
pub const WARD_WS_ERROR_CODE_UNSUPPORTED_KIND: &str = "unsupported_kind";
pub const WARD_WS_ERROR_CODE_INVALID_REQUEST_ID: &str = "invalid_request_id";
pub const WARD_WS_ERROR_CODE_INVALID_PAYLOAD: &str = "invalid_payload";
pub const WARD_WS_ERROR_CODE_INTERNAL_ERROR: &str = "internal_error";

const WARD_WS_REQUEST_KINDS: &[&str] = &[
    "capabilities.request",
    "recipient.register",
    "call.accept",
    "call.reject",
    "call.cancel",
];

const WARD_WS_RESPONSE_KINDS: &[&str] = &[
    "capabilities.response",
    "recipient.register.response",
    "call.accept.response",
    "call.reject.response",
    "call.cancel.response",
    "ward.heartbeat",
    "error",
];

const WARD_WS_PUSH_KINDS: &[&str] = &["call.incoming", "call.status"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WardWsRequestKind {
    Capabilities,
    RecipientRegister,
    CallAccept,
    CallReject,
    CallCancel,
}

impl WardWsRequestKind {
    pub fn response_kind(self) -> &'static str {
        match self {
            Self::Capabilities => "capabilities.response",
            Self::RecipientRegister => "recipient.register.response",
            Self::CallAccept => "call.accept.response",
            Self::CallReject => "call.reject.response",
            Self::CallCancel => "call.cancel.response",
        }
    }
}

impl FromStr for WardWsRequestKind {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "capabilities.request" => Ok(Self::Capabilities),
            "recipient.register" => Ok(Self::RecipientRegister),
            "call.accept" => Ok(Self::CallAccept),
            "call.reject" => Ok(Self::CallReject),
            "call.cancel" => Ok(Self::CallCancel),
            other => bail!(
                "unsupported ward websocket frame kind '{}'; supported kinds are {}",
                other,
                WARD_WS_REQUEST_KINDS.join(", ")
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WardWsRequestFrame {
    pub request_id: String,
    pub kind: WardWsRequestKind,
    pub payload: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WardWsResponseFrame {
    pub schema_version: u32,
    pub request_id: String,
    pub kind: String,
    pub payload: Value,
}

#[derive(Debug, Clone, Deserialize)]
struct RawWardWsRequestFrame {
    schema_version: u32,
    request_id: String,
    kind: String,
    #[serde(default = "empty_payload")]
    payload: Value,
}

fn empty_payload() -> Value {
    json!({})
}

pub fn parse_ward_ws_request_frame(raw: &str) -> Result<WardWsRequestFrame> {
    let frame = serde_json::from_str::<RawWardWsRequestFrame>(raw)
        .context("failed to parse ward websocket frame JSON")?;
    if !WARD_WS_COMPATIBLE_REQUEST_SCHEMA_VERSIONS.contains(&frame.schema_version) {
        bail!(
            "unsupported ward websocket frame schema: supported request schema versions are {:?}, found {}",
            WARD_WS_COMPATIBLE_REQUEST_SCHEMA_VERSIONS,
            frame.schema_version
        );
    }
    let request_id = frame.request_id.trim();
    if request_id.is_empty() {
        bail!("ward websocket frame request_id must be non-empty");
    }
    let kind = WardWsRequestKind::from_str(frame.kind.trim())?;
    let payload = frame
        .payload
        .as_object()
        .ok_or_else(|| anyhow!("ward websocket frame payload must be a JSON object"))?
        .clone();

    Ok(WardWsRequestFrame {
        request_id: request_id.to_string(),
        kind,
        payload,
    })
}

pub fn best_effort_ward_ws_request_id(raw: &str) -> Option<String> {
    let value = serde_json::from_str::<Value>(raw).ok()?;
    let request_id = value
        .as_object()
        .and_then(|object| object.get("request_id"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())?;
    Some(request_id.to_string())
}

pub fn classify_ward_ws_parse_error(message: &str) -> &'static str {
    if message.contains("failed to parse ward websocket frame JSON") {
        WARD_WS_ERROR_CODE_INVALID_JSON
    } else if message.contains("unsupported ward websocket frame schema") {
        WARD_WS_ERROR_CODE_UNSUPPORTED_SCHEMA
    } else if message.contains("unsupported ward websocket frame kind") {
        WARD_WS_ERROR_CODE_UNSUPPORTED_KIND
    } else if message.contains("ward websocket frame request_id must be non-empty") {
        WARD_WS_ERROR_CODE_INVALID_REQUEST_ID
    } else if message.contains("ward websocket frame payload must be a JSON object")
        || message.contains("payload field '")
    {
        WARD_WS_ERROR_CODE_INVALID_PAYLOAD
    } else {
        WARD_WS_ERROR_CODE_INTERNAL_ERROR
    }
}

pub fn build_ward_ws_response_frame(
    request_id: &str,
    kind: &str,
    payload: Value,
) -> WardWsResponseFrame {
    WardWsResponseFrame {
        schema_version: WARD_WS_RESPONSE_SCHEMA_VERSION,
        request_id: request_id.to_string(),
        kind: kind.to_string(),
        payload,
    }
}

pub fn build_ward_ws_error_frame(request_id: &str, code: &str, message: &str) -> WardWsResponseFrame {
    build_ward_ws_response_frame(
        request_id,
        "error",
        json!({
            "code": code,
            "message": message,
        }),
    )
}

pub fn parse_required_string(payload: &serde_json::Map<String, Value>, field: &str) -> Result<String> {
    parse_optional_string(payload, field)?
        .ok_or_else(|| anyhow!("required payload field '{field}' is missing"))
}

pub fn parse_optional_string(
    payload: &serde_json::Map<String, Value>,
    field: &str,
) -> Result<Option<String>> {
    let Some(value) = payload.get(field) else {
        return Ok(None);
    };
    if value.is_null() {
        return Ok(None);
    }
    let raw = value
        .as_str()
        .ok_or_else(|| anyhow!("payload field '{field}' must be a string"))?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        bail!("payload field '{field}' must be non-empty when provided");
    }
    Ok(Some(trimmed.to_string()))
}

pub fn parse_optional_string_list(
    payload: &serde_json::Map<String, Value>,
    field: &str,
) -> Result<Option<Vec<String>>> {
    let Some(value) = payload.get(field) else {
        return Ok(None);
    };
    if value.is_null() {
        return Ok(None);
    }
    let items = value
        .as_array()
        .ok_or_else(|| anyhow!("payload field '{field}' must be an array of strings"))?;
    items
        .iter()
        .map(|item| {
            item.as_str()
                .map(|item| item.trim().to_string())
                .ok_or_else(|| anyhow!("payload field '{field}' must be an array of strings"))
        })
        .collect::<Result<Vec<_>>>()
        .map(Some)
}

pub fn ward_ws_capabilities_payload() -> Value {
    json!({
        "schema_version": WARD_WS_RESPONSE_SCHEMA_VERSION,
        "protocol_version": WARD_WS_PROTOCOL_VERSION,
        "supported_request_schema_versions": WARD_WS_COMPATIBLE_REQUEST_SCHEMA_VERSIONS,
        "request_kinds": WARD_WS_REQUEST_KINDS,
        "response_kinds": WARD_WS_RESPONSE_KINDS,
        "push_kinds": WARD_WS_PUSH_KINDS,
        "contracts": {
            "heartbeat": {
                "interval_seconds": WARD_WS_HEARTBEAT_INTERVAL_SECONDS,
                "transport_events": ["ws.ping", "ward.heartbeat"],
            },
            "registration": {
                "key_field": "key",
                "defaults_to": "principal_name",
            },
            "responses": {
                "recipient_field": "to_identifier",
                "defaults_to": "principal_name",
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::{
        best_effort_ward_ws_request_id, build_ward_ws_error_frame, classify_ward_ws_parse_error,
        parse_optional_string, parse_optional_string_list, parse_required_string,
        parse_ward_ws_request_frame, ward_ws_capabilities_payload, WardWsRequestKind,
        WARD_WS_ERROR_CODE_INVALID_JSON, WARD_WS_ERROR_CODE_INVALID_PAYLOAD,
        WARD_WS_ERROR_CODE_UNSUPPORTED_KIND, WARD_WS_ERROR_CODE_UNSUPPORTED_SCHEMA,
    };

    #[test]
    fn unit_parse_request_frame_accepts_supported_kinds() {
        let frame = parse_ward_ws_request_frame(
            r#"{"schema_version":1,"request_id":"req-1","kind":"call.accept","payload":{"call_id":"c-1"}}"#,
        )
        .expect("parse frame");
        assert_eq!(frame.request_id, "req-1");
        assert_eq!(frame.kind, WardWsRequestKind::CallAccept);
        assert_eq!(
            parse_required_string(&frame.payload, "call_id").expect("call id"),
            "c-1"
        );
        assert_eq!(frame.kind.response_kind(), "call.accept.response");

        let without_payload = parse_ward_ws_request_frame(
            r#"{"schema_version":1,"request_id":"req-2","kind":"recipient.register"}"#,
        )
        .expect("payload defaults to empty object");
        assert!(without_payload.payload.is_empty());
    }

    #[test]
    fn regression_parse_errors_classify_to_stable_codes() {
        let cases = [
            ("not-json", WARD_WS_ERROR_CODE_INVALID_JSON),
            (
                r#"{"schema_version":9,"request_id":"r","kind":"call.accept","payload":{}}"#,
                WARD_WS_ERROR_CODE_UNSUPPORTED_SCHEMA,
            ),
            (
                r#"{"schema_version":1,"request_id":"r","kind":"call.snooze","payload":{}}"#,
                WARD_WS_ERROR_CODE_UNSUPPORTED_KIND,
            ),
            (
                r#"{"schema_version":1,"request_id":"r","kind":"call.accept","payload":[]}"#,
                WARD_WS_ERROR_CODE_INVALID_PAYLOAD,
            ),
        ];
        for (raw, expected) in cases {
            let error = parse_ward_ws_request_frame(raw).expect_err("frame should fail");
            assert_eq!(classify_ward_ws_parse_error(&error.to_string()), expected, "{raw}");
        }
        assert_eq!(best_effort_ward_ws_request_id("not-json"), None);
        assert_eq!(
            best_effort_ward_ws_request_id(r#"{"request_id":" r-9 "}"#).as_deref(),
            Some("r-9")
        );
    }

    #[test]
    fn unit_payload_field_helpers_validate_types() {
        let payload = serde_json::json!({
            "key": "  FloorA ",
            "blank": " ",
            "targets": ["FloorA", "FloorB"],
            "bad_targets": [1],
            "nothing": null
        });
        let payload = payload.as_object().expect("object");

        assert_eq!(
            parse_optional_string(payload, "key").expect("key").as_deref(),
            Some("FloorA")
        );
        assert_eq!(parse_optional_string(payload, "nothing").expect("null"), None);
        let blank = parse_optional_string(payload, "blank").expect_err("blank");
        assert_eq!(
            classify_ward_ws_parse_error(&blank.to_string()),
            WARD_WS_ERROR_CODE_INVALID_PAYLOAD
        );
        assert_eq!(
            parse_optional_string_list(payload, "targets").expect("targets"),
            Some(vec!["FloorA".to_string(), "FloorB".to_string()])
        );
        assert!(parse_optional_string_list(payload, "bad_targets").is_err());
        assert!(parse_required_string(payload, "call_id").is_err());
    }

    #[test]
    fn functional_capabilities_payload_lists_every_kind() {
        let payload = ward_ws_capabilities_payload();
        assert_eq!(payload["protocol_version"], "0.1.0");
        assert_eq!(
            payload["request_kinds"].as_array().map(|kinds| kinds.len()),
            Some(5)
        );
        assert_eq!(
            payload["push_kinds"],
            serde_json::json!(["call.incoming", "call.status"])
        );

        let error = build_ward_ws_error_frame("unknown-request", "invalid_json", "bad");
        assert_eq!(error.kind, "error");
        assert_eq!(error.payload["code"], "invalid_json");
    }
}
