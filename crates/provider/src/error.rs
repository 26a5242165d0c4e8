//! Backend invocation errors

use crate::classify::ErrorClassification;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvokeError {
    /// Connection failure or 5xx.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// No response (or no stream data) within the configured time.
    #[error("backend timed out: {0}")]
    Timeout(String),

    #[error("backend rejected credentials (HTTP {status})")]
    Unauthorized { status: u16 },

    #[error("backend rate limited: {message}")]
    RateLimited {
        /// Plan usage limit rather than a short-term rate limit.
        quota_exhausted: bool,
        retry_after_secs: Option<u64>,
        message: String,
    },

    #[error("backend rejected request (HTTP {status}): {message}")]
    Rejected { status: u16, message: String },

    /// `response.failed` or an `error` event.
    #[error("backend response failed: {0}")]
    Failed(String),

    /// The event stream broke off before a terminal event.
    #[error("backend stream interrupted: {0}")]
    Interrupted(String),

    #[error("malformed backend event: {0}")]
    Malformed(String),
}

impl InvokeError {
    /// Build the error for a non-success status.
    pub fn from_status(status: u16, body: &str, retry_after_secs: Option<u64>) -> Self {
        let message = crate::classify::error_message(body);
        match crate::classify::classify_status(status, body) {
            ErrorClassification::Transient => {
                InvokeError::Unavailable(format!("HTTP {status}: {message}"))
            }
            ErrorClassification::RateLimited => InvokeError::RateLimited {
                quota_exhausted: false,
                retry_after_secs,
                message,
            },
            ErrorClassification::QuotaExceeded => InvokeError::RateLimited {
                quota_exhausted: true,
                retry_after_secs,
                message,
            },
            ErrorClassification::Unauthorized => InvokeError::Unauthorized { status },
            ErrorClassification::Rejected => InvokeError::Rejected { status, message },
        }
    }

    /// Whether another attempt could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            InvokeError::Unavailable(_) | InvokeError::Timeout(_) | InvokeError::Interrupted(_)
        )
    }

    /// Label for the upstream error metric.
    pub fn error_type(&self) -> &'static str {
        match self {
            InvokeError::Unavailable(_) => "unavailable",
            InvokeError::Timeout(_) => "timeout",
            InvokeError::Unauthorized { .. } => "unauthorized",
            InvokeError::RateLimited {
                quota_exhausted: true,
                ..
            } => "quota_exceeded",
            InvokeError::RateLimited { .. } => "rate_limited",
            InvokeError::Rejected { .. } => "rejected",
            InvokeError::Failed(_) => "failed",
            InvokeError::Interrupted(_) => "interrupted",
            InvokeError::Malformed(_) => "malformed",
        }
    }

    pub(crate) fn from_transport(err: reqwest::Error) -> Self {
        let err = err.without_url();
        if err.is_timeout() {
            InvokeError::Timeout(err.to_string())
        } else {
            InvokeError::Unavailable(err.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, InvokeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert!(matches!(
            InvokeError::from_status(503, "down", None),
            InvokeError::Unavailable(msg) if msg == "HTTP 503: down"
        ));
        assert_eq!(
            InvokeError::from_status(401, "", None),
            InvokeError::Unauthorized { status: 401 }
        );
        assert_eq!(
            InvokeError::from_status(429, r#"{"error":{"message":"slow down"}}"#, Some(7)),
            InvokeError::RateLimited {
                quota_exhausted: false,
                retry_after_secs: Some(7),
                message: "slow down".into()
            }
        );
        assert_eq!(
            InvokeError::from_status(400, r#"{"detail":"Unsupported model"}"#, None),
            InvokeError::Rejected {
                status: 400,
                message: "Unsupported model".into()
            }
        );
    }

    #[test]
    fn retryable_set() {
        assert!(InvokeError::Unavailable("x".into()).is_retryable());
        assert!(InvokeError::Timeout("x".into()).is_retryable());
        assert!(InvokeError::Interrupted("x".into()).is_retryable());
        assert!(!InvokeError::Unauthorized { status: 401 }.is_retryable());
        assert!(!InvokeError::Failed("x".into()).is_retryable());
        assert!(!InvokeError::Malformed("x".into()).is_retryable());
    }

    #[test]
    fn quota_label() {
        let err = InvokeError::from_status(429, "usage_limit_reached", None);
        assert_eq!(err.error_type(), "quota_exceeded");
    }
}
