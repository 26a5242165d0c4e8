//! OAuth token endpoint client
//!
//! Handles the three token endpoint interactions:
//! 1. Authorization code exchange (login completion)
//! 2. Token refresh
//! 3. Id-token to API-key exchange (optional secondary credential)
//!
//! All three POST a form to `OAuthConfig::token_endpoint`. Failures are
//! classified so the refresher knows which ones are worth retrying:
//! transport errors, 429 and 5xx become `Error::Http`; a rejected grant
//! (400 `invalid_grant`, 401, 403) becomes `Error::InvalidCredentials`.

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::constants::{
    ID_TOKEN_TYPE, OAuthConfig, REQUESTED_API_KEY, TOKEN_EXCHANGE_GRANT,
};
use crate::error::{Error, Result};

/// Response from the token endpoint for code exchange and refresh.
///
/// A refresh response may omit `id_token` and `refresh_token`; the caller
/// keeps the previous values in that case.
#[derive(Deserialize, Serialize)]
pub struct TokenResponse {
    #[serde(default)]
    pub id_token: Option<String>,
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Seconds until the access token expires (delta, not absolute)
    #[serde(default)]
    pub expires_in: Option<u64>,
}

impl std::fmt::Debug for TokenResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenResponse")
            .field("has_id_token", &self.id_token.is_some())
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

#[derive(Deserialize)]
struct ApiKeyResponse {
    access_token: String,
}

/// Exchange an authorization code for tokens.
pub async fn exchange_code(
    client: &reqwest::Client,
    config: &OAuthConfig,
    code: &str,
    verifier: &str,
) -> Result<TokenResponse> {
    let response = client
        .post(&config.token_endpoint)
        .form(&[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("code_verifier", verifier),
            ("client_id", config.client_id.as_str()),
            ("redirect_uri", config.redirect_uri.as_str()),
        ])
        .send()
        .await
        .map_err(|e| Error::Http(format!("token exchange request failed: {}", e.without_url())))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        let detail = summarize_error_body(&body);
        if is_transient_status(status) {
            return Err(Error::Http(format!("token endpoint returned {status}{detail}")));
        }
        return Err(Error::TokenExchange(format!(
            "token endpoint returned {status}{detail}"
        )));
    }

    response
        .json::<TokenResponse>()
        .await
        .map_err(|_| Error::TokenExchange("invalid token response".into()))
}

/// Refresh an access token using a refresh token.
pub async fn refresh_token(
    client: &reqwest::Client,
    config: &OAuthConfig,
    refresh: &str,
) -> Result<TokenResponse> {
    let response = client
        .post(&config.token_endpoint)
        .form(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh),
            ("client_id", config.client_id.as_str()),
            ("scope", "openid profile email"),
        ])
        .send()
        .await
        .map_err(|e| Error::Http(format!("token refresh request failed: {}", e.without_url())))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        let detail = summarize_error_body(&body);

        if is_rejected_grant(status, &body) {
            return Err(Error::InvalidCredentials(format!(
                "refresh token rejected ({status}){detail}"
            )));
        }
        if is_transient_status(status) {
            return Err(Error::Http(format!("token refresh returned {status}{detail}")));
        }
        return Err(Error::TokenExchange(format!(
            "token refresh returned {status}{detail}"
        )));
    }

    response
        .json::<TokenResponse>()
        .await
        .map_err(|_| Error::TokenExchange("invalid refresh response".into()))
}

/// Exchange an id token for an OpenAI API key (RFC 8693 token exchange).
pub async fn exchange_api_key(
    client: &reqwest::Client,
    config: &OAuthConfig,
    id_token: &str,
) -> Result<String> {
    let response = client
        .post(&config.token_endpoint)
        .form(&[
            ("grant_type", TOKEN_EXCHANGE_GRANT),
            ("client_id", config.client_id.as_str()),
            ("requested_token", REQUESTED_API_KEY),
            ("subject_token", id_token),
            ("subject_token_type", ID_TOKEN_TYPE),
        ])
        .send()
        .await
        .map_err(|e| Error::Http(format!("API key exchange request failed: {}", e.without_url())))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(Error::TokenExchange(format!(
            "API key exchange returned {status}{}",
            summarize_error_body(&body)
        )));
    }

    let payload = response
        .json::<ApiKeyResponse>()
        .await
        .map_err(|_| Error::TokenExchange("invalid API key exchange response".into()))?;
    if payload.access_token.trim().is_empty() {
        return Err(Error::TokenExchange(
            "API key exchange returned an empty key".into(),
        ));
    }
    Ok(payload.access_token)
}

fn is_transient_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

fn is_rejected_grant(status: StatusCode, body: &str) -> bool {
    match status.as_u16() {
        401 | 403 => true,
        400 => error_code(body).is_some_and(|code| {
            matches!(
                code.as_str(),
                "invalid_grant" | "refresh_token_expired" | "refresh_token_reused"
                    | "refresh_token_invalidated"
            )
        }),
        _ => false,
    }
}

/// OAuth error code from a token endpoint body. Handles both the RFC 6749
/// shape (`{"error":"invalid_grant"}`) and the nested
/// `{"error":{"code":"..."}}` shape.
fn error_code(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    match value.get("error")? {
        Value::String(code) => Some(code.clone()),
        Value::Object(obj) => obj
            .get("code")
            .or_else(|| obj.get("type"))
            .and_then(Value::as_str)
            .map(str::to_owned),
        _ => None,
    }
}

/// Reduce an error body to `": <code> (<description>)"`.
///
/// Only the OAuth `error` / `error_description` fields are kept, so echoed
/// request parameters (codes, refresh tokens) can never leak into messages.
fn summarize_error_body(body: &str) -> String {
    let Some(code) = error_code(body) else {
        return String::new();
    };
    let description = serde_json::from_str::<Value>(body).ok().and_then(|v| {
        v.get("error_description")
            .or_else(|| v.get("error").and_then(|e| e.get("message")))
            .and_then(Value::as_str)
            .map(|s| s.chars().take(200).collect::<String>())
    });
    match description {
        Some(desc) => format!(": {code} ({desc})"),
        None => format!(": {code}"),
    }
}
