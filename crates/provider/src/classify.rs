//! Upstream error classification for Codex backend responses
//!
//! Distinguishes transient rate limits from ChatGPT plan usage-limit
//! exhaustion, and maps every non-success status to a retry strategy.

/// How the proxy should react to a non-success backend status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClassification {
    /// Retryable: 408, 5xx.
    Transient,
    /// 429 without a usage-limit marker; surfaced to the client as-is.
    RateLimited,
    /// Plan usage limit reached; retrying will not help until it resets.
    QuotaExceeded,
    /// Credentials rejected (401/403).
    Unauthorized,
    /// Any other 4xx: the request itself was refused.
    Rejected,
}

/// Usage-limit message markers in Codex 429 bodies.
const QUOTA_PATTERNS: &[&str] = &[
    "usage_limit_reached",
    "usage_not_included",
    "usage limit",
    "you've hit your usage limit",
    "insufficient_quota",
];

/// Classify a 429 body as plan quota exhaustion or a transient rate limit.
pub fn classify_429(body: &str) -> ErrorClassification {
    let lower = body.to_lowercase();
    if QUOTA_PATTERNS.iter().any(|p| lower.contains(p)) {
        ErrorClassification::QuotaExceeded
    } else {
        ErrorClassification::RateLimited
    }
}

/// Classify a backend error by HTTP status and response body.
pub fn classify_status(status: u16, body: &str) -> ErrorClassification {
    match status {
        429 => classify_429(body),
        401 | 403 => ErrorClassification::Unauthorized,
        408 | 500..=599 => ErrorClassification::Transient,
        _ => ErrorClassification::Rejected,
    }
}

/// Pull a human-readable message out of a backend error body.
///
/// Understands `{"error":{"message"}}`, `{"detail"}` and `{"message"}`;
/// falls back to the raw text, truncated.
pub fn error_message(body: &str) -> String {
    const MAX_LEN: usize = 300;

    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        let candidates = [
            value.pointer("/error/message"),
            value.pointer("/detail/message"),
            value.get("detail"),
            value.get("message"),
        ];
        if let Some(msg) = candidates.into_iter().flatten().find_map(|v| v.as_str())
            && !msg.is_empty()
        {
            return msg.to_owned();
        }
    }

    let trimmed = body.trim();
    if trimmed.is_empty() {
        return "empty response body".to_owned();
    }
    match trimmed.char_indices().nth(MAX_LEN) {
        Some((cut, _)) => format!("{}…", &trimmed[..cut]),
        None => trimmed.to_owned(),
    }
}
