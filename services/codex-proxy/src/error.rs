//! HTTP error responses
//!
//! Every failure leaves the proxy as an OpenAI-style error envelope:
//!
//! ```json
//! {"error": {"message": "...", "type": "...", "code": "...", "param": null, "request_id": "..."}}
//! ```
//!
//! Messages come from the typed errors of the lower crates, none of which
//! ever carry token material.

use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use chat_translate::ValidationError;
use provider::InvokeError;
use serde_json::json;

/// Error rendered as an HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    pub status: StatusCode,
    /// OpenAI error `type`.
    pub kind: &'static str,
    pub code: Option<&'static str>,
    pub message: String,
    pub param: Option<String>,
    pub request_id: Option<String>,
    /// Seconds for a `Retry-After` header.
    pub retry_after: Option<u64>,
}

impl ApiError {
    pub fn new(status: StatusCode, kind: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            kind,
            code: None,
            message: message.into(),
            param: None,
            request_id: None,
            retry_after: None,
        }
    }

    pub fn with_code(mut self, code: &'static str) -> Self {
        self.code = Some(code);
        self
    }

    pub fn with_request_id(mut self, request_id: &str) -> Self {
        self.request_id = Some(request_id.to_owned());
        self
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "authentication_error", message)
            .with_code("invalid_api_key")
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "invalid_request_error", message)
            .with_code("not_found")
    }

    /// Envelope body, also used for in-band stream errors.
    pub fn body(&self) -> serde_json::Value {
        json!({
            "error": {
                "message": self.message,
                "type": self.kind,
                "code": self.code,
                "param": self.param,
                "request_id": self.request_id,
            }
        })
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response = (self.status, Json(self.body())).into_response();
        if let Some(secs) = self.retry_after
            && let Ok(value) = HeaderValue::from_str(&secs.to_string())
        {
            response.headers_mut().insert(header::RETRY_AFTER, value);
        }
        response
    }
}

impl From<ValidationError> for ApiError {
    fn from(err: ValidationError) -> Self {
        let code = match &err {
            ValidationError::UnsupportedModel(_) => "model_not_found",
            ValidationError::Malformed(_) => "invalid_json",
            _ => "invalid_request",
        };
        Self {
            param: err.param(),
            ..Self::new(StatusCode::BAD_REQUEST, "invalid_request_error", err.to_string())
                .with_code(code)
        }
    }
}

impl From<codex_auth::Error> for ApiError {
    fn from(err: codex_auth::Error) -> Self {
        use codex_auth::Error as E;

        let message = err.to_string();
        match err {
            E::NotAuthenticated | E::NotFound(_) => Self::new(
                StatusCode::UNAUTHORIZED,
                "authentication_error",
                "not authenticated; visit /auth/login to sign in",
            )
            .with_code("not_authenticated"),
            E::AuthExpired(_) | E::InvalidCredentials(_) => Self::new(
                StatusCode::UNAUTHORIZED,
                "authentication_error",
                format!("{message}; visit /auth/login to sign in again"),
            )
            .with_code("auth_expired"),
            E::Unavailable { .. } | E::Http(_) => {
                Self::new(StatusCode::SERVICE_UNAVAILABLE, "api_error", message)
                    .with_code("token_refresh_unavailable")
            }
            E::StateMismatch => {
                Self::new(StatusCode::BAD_REQUEST, "invalid_request_error", message)
                    .with_code("state_mismatch")
            }
            E::LoginExpired => {
                Self::new(StatusCode::BAD_REQUEST, "invalid_request_error", message)
                    .with_code("login_expired")
            }
            E::Superseded => Self::new(StatusCode::CONFLICT, "invalid_request_error", message)
                .with_code("login_superseded"),
            E::ConsentDenied(_) => {
                Self::new(StatusCode::BAD_REQUEST, "authentication_error", message)
                    .with_code("consent_denied")
            }
            E::TokenExchange(_) => Self::new(StatusCode::BAD_GATEWAY, "api_error", message)
                .with_code("token_exchange_failed"),
            E::CredentialParse(_) | E::Io(_) => {
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "api_error", message)
                    .with_code("credential_store_error")
            }
        }
    }
}

impl From<InvokeError> for ApiError {
    fn from(err: InvokeError) -> Self {
        let message = err.to_string();
        match err {
            InvokeError::Unavailable(_) => {
                Self::new(StatusCode::SERVICE_UNAVAILABLE, "api_error", message)
                    .with_code("backend_unavailable")
            }
            InvokeError::Timeout(_) => Self::new(StatusCode::GATEWAY_TIMEOUT, "api_error", message)
                .with_code("backend_timeout"),
            InvokeError::Unauthorized { .. } => Self::new(
                StatusCode::UNAUTHORIZED,
                "authentication_error",
                format!("{message}; visit /auth/login to sign in again"),
            )
            .with_code("backend_unauthorized"),
            InvokeError::RateLimited {
                quota_exhausted,
                retry_after_secs,
                ..
            } => Self {
                retry_after: retry_after_secs,
                ..Self::new(StatusCode::TOO_MANY_REQUESTS, "rate_limit_error", message).with_code(
                    if quota_exhausted {
                        "usage_limit_reached"
                    } else {
                        "rate_limited"
                    },
                )
            },
            InvokeError::Rejected { status, .. } if matches!(status, 400 | 404 | 422) => {
                Self::new(StatusCode::BAD_REQUEST, "invalid_request_error", message)
                    .with_code("backend_rejected")
            }
            InvokeError::Rejected { .. } => Self::new(StatusCode::BAD_GATEWAY, "api_error", message)
                .with_code("backend_rejected"),
            InvokeError::Failed(_) => Self::new(StatusCode::BAD_GATEWAY, "api_error", message)
                .with_code("backend_error"),
            InvokeError::Interrupted(_) | InvokeError::Malformed(_) => {
                Self::new(StatusCode::BAD_GATEWAY, "api_error", message)
                    .with_code("stream_interrupted")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_json(err: ApiError) -> (StatusCode, serde_json::Value) {
        let response = err.into_response();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), 64 * 1024)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn envelope_shape() {
        let err = ApiError::from(ValidationError::MissingField("messages")).with_request_id("req_1");
        let (status, body) = body_json(err).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["type"], "invalid_request_error");
        assert_eq!(body["error"]["code"], "invalid_request");
        assert_eq!(body["error"]["param"], "messages");
        assert_eq!(body["error"]["request_id"], "req_1");
        assert!(body["error"]["message"].as_str().unwrap().contains("messages"));
    }

    #[test]
    fn unsupported_model_code() {
        let err = ApiError::from(ValidationError::UnsupportedModel("llama".into()));
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.code, Some("model_not_found"));
    }

    #[test]
    fn auth_error_statuses() {
        use codex_auth::Error as E;

        let cases = [
            (E::NotAuthenticated, StatusCode::UNAUTHORIZED, "not_authenticated"),
            (E::AuthExpired("invalid_grant".into()), StatusCode::UNAUTHORIZED, "auth_expired"),
            (
                E::InvalidCredentials("revoked".into()),
                StatusCode::UNAUTHORIZED,
                "auth_expired",
            ),
            (
                E::Unavailable {
                    attempts: 3,
                    message: "503".into(),
                },
                StatusCode::SERVICE_UNAVAILABLE,
                "token_refresh_unavailable",
            ),
            (E::StateMismatch, StatusCode::BAD_REQUEST, "state_mismatch"),
            (E::LoginExpired, StatusCode::BAD_REQUEST, "login_expired"),
            (E::Superseded, StatusCode::CONFLICT, "login_superseded"),
            (
                E::ConsentDenied("access_denied".into()),
                StatusCode::BAD_REQUEST,
                "consent_denied",
            ),
            (
                E::TokenExchange("bad".into()),
                StatusCode::BAD_GATEWAY,
                "token_exchange_failed",
            ),
            (
                E::Io("disk full".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
                "credential_store_error",
            ),
        ];
        for (err, status, code) in cases {
            let api = ApiError::from(err);
            assert_eq!(api.status, status, "{code}");
            assert_eq!(api.code, Some(code));
        }
    }

    #[test]
    fn expired_session_is_not_reported_as_backend_unavailable() {
        let api = ApiError::from(codex_auth::Error::AuthExpired("invalid_grant".into()));
        assert_ne!(api.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_ne!(api.code, Some("backend_unavailable"));
    }

    #[test]
    fn invoke_error_statuses() {
        let cases = [
            (
                InvokeError::Unavailable("HTTP 503".into()),
                StatusCode::SERVICE_UNAVAILABLE,
                "backend_unavailable",
            ),
            (
                InvokeError::Timeout("idle".into()),
                StatusCode::GATEWAY_TIMEOUT,
                "backend_timeout",
            ),
            (
                InvokeError::Unauthorized { status: 401 },
                StatusCode::UNAUTHORIZED,
                "backend_unauthorized",
            ),
            (
                InvokeError::Rejected {
                    status: 400,
                    message: "Unsupported model".into(),
                },
                StatusCode::BAD_REQUEST,
                "backend_rejected",
            ),
            (
                InvokeError::Rejected {
                    status: 409,
                    message: "conflict".into(),
                },
                StatusCode::BAD_GATEWAY,
                "backend_rejected",
            ),
            (
                InvokeError::Failed("server_error".into()),
                StatusCode::BAD_GATEWAY,
                "backend_error",
            ),
            (
                InvokeError::Interrupted("eof".into()),
                StatusCode::BAD_GATEWAY,
                "stream_interrupted",
            ),
        ];
        for (err, status, code) in cases {
            let api = ApiError::from(err);
            assert_eq!(api.status, status, "{code}");
            assert_eq!(api.code, Some(code));
        }
    }

    #[tokio::test]
    async fn rate_limit_sets_retry_after() {
        let err = ApiError::from(InvokeError::RateLimited {
            quota_exhausted: true,
            retry_after_secs: Some(30),
            message: "The usage limit has been reached".into(),
        });
        assert_eq!(err.code, Some("usage_limit_reached"));

        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "30");
    }
}
