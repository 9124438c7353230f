use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use ward_bot::BotCallbackError;
use ward_call_runtime::CallError;

/// JSON error envelope returned by every HTTP route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct WardApiError {
    pub(crate) status: StatusCode,
    pub(crate) code: &'static str,
    pub(crate) message: String,
}

impl WardApiError {
    pub(crate) fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    pub(crate) fn bad_request(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, code, message)
    }

    pub(crate) fn unauthorized() -> Self {
        Self::new(
            StatusCode::UNAUTHORIZED,
            "unauthorized",
            "missing or invalid bearer token",
        )
    }

    pub(crate) fn forbidden(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, code, message)
    }

    pub(crate) fn not_found(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, code, message)
    }

    pub(crate) fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", message)
    }
}

impl From<CallError> for WardApiError {
    fn from(error: CallError) -> Self {
        let message = error.to_string();
        match error {
            CallError::InvalidArgument(_) => Self::bad_request("invalid_argument", message),
            CallError::Unauthorized(_) => Self::forbidden("not_permitted", message),
            CallError::NotFound(_) => Self::not_found("not_found", message),
            CallError::Store(_) => {
                tracing::error!(%message, "call store failure");
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "store_failure", message)
            }
            CallError::Identity(_) => {
                tracing::error!(%message, "identity resolution failure");
                Self::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "identity_failure",
                    message,
                )
            }
        }
    }
}

impl From<BotCallbackError> for WardApiError {
    fn from(error: BotCallbackError) -> Self {
        match error {
            BotCallbackError::Call(error) => error.into(),
            BotCallbackError::UnknownAction(_) => {
                Self::bad_request("unknown_callback_action", error.to_string())
            }
            BotCallbackError::UnlinkedChat(_) => {
                Self::forbidden("unlinked_chat", error.to_string())
            }
            BotCallbackError::Identity(_) => Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "identity_failure",
                error.to_string(),
            ),
        }
    }
}

impl IntoResponse for WardApiError {
    fn into_response(self) -> Response {
        let error_type = if self.status.is_client_error() {
            "invalid_request_error"
        } else {
            "server_error"
        };
        (
            self.status,
            Json(json!({
                "error": {
                    "type": error_type,
                    "code": self.code,
                    "message": self.message,
                }
            })),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::WardApiError;
    use axum::http::StatusCode;
    use ward_bot::BotCallbackError;
    use ward_call_runtime::CallError;

    #[test]
    fn unit_call_errors_map_to_http_statuses() {
        let cases = [
            (
                CallError::InvalidArgument("x".to_string()),
                StatusCode::BAD_REQUEST,
                "invalid_argument",
            ),
            (
                CallError::Unauthorized("x".to_string()),
                StatusCode::FORBIDDEN,
                "not_permitted",
            ),
            (
                CallError::NotFound("x".to_string()),
                StatusCode::NOT_FOUND,
                "not_found",
            ),
            (
                CallError::Identity(anyhow::anyhow!("directory offline")),
                StatusCode::INTERNAL_SERVER_ERROR,
                "identity_failure",
            ),
        ];
        for (error, status, code) in cases {
            let mapped = WardApiError::from(error);
            assert_eq!(mapped.status, status);
            assert_eq!(mapped.code, code);
        }

        let callback = WardApiError::from(BotCallbackError::UnlinkedChat("1".to_string()));
        assert_eq!(callback.status, StatusCode::FORBIDDEN);
        let nested = WardApiError::from(BotCallbackError::Call(CallError::NotFound(
            "c-1".to_string(),
        )));
        assert_eq!(nested.status, StatusCode::NOT_FOUND);
    }
}
