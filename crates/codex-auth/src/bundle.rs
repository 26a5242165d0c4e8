//! Persisted authentication bundle
//!
//! One `AuthBundle` per session. It is an immutable value: a refresh or a new
//! login builds a fresh bundle and the store swaps it in atomically.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::jwt;
use crate::token::TokenResponse;

/// Token set produced by a code exchange or a refresh. All fields non-empty.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenData {
    pub id_token: String,
    pub access_token: String,
    pub refresh_token: String,
    pub account_id: String,
}

impl std::fmt::Debug for TokenData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenData")
            .field("account_id", &self.account_id)
            .finish_non_exhaustive()
    }
}

/// The unit of persistence.
///
/// `last_refresh` and `expires_at` are unix timestamps in milliseconds.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthBundle {
    #[serde(rename = "OPENAI_API_KEY", default)]
    pub api_key: Option<String>,
    #[serde(rename = "tokens")]
    pub token_data: TokenData,
    pub last_refresh: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
}

impl std::fmt::Debug for AuthBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthBundle")
            .field("has_api_key", &self.api_key.is_some())
            .field("token_data", &self.token_data)
            .field("last_refresh", &self.last_refresh)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl AuthBundle {
    /// Build a bundle from a code-exchange response.
    ///
    /// Fails when the response lacks an id token, refresh token or an account id.
    pub fn from_login(tokens: TokenResponse, now_millis: u64) -> Result<Self> {
        let id_token = non_empty(tokens.id_token, "id_token")?;
        let refresh_token = non_empty(tokens.refresh_token, "refresh_token")?;
        let access_token = non_empty(Some(tokens.access_token), "access_token")?;
        let account_id = jwt::account_id(&id_token, &access_token).ok_or_else(|| {
            Error::TokenExchange("tokens carry no ChatGPT account id".into())
        })?;

        Ok(Self {
            api_key: None,
            token_data: TokenData {
                id_token,
                access_token,
                refresh_token,
                account_id,
            },
            last_refresh: now_millis,
            expires_at: tokens
                .expires_in
                .map(|secs| now_millis.saturating_add(secs.saturating_mul(1000))),
        })
    }

    /// Build the successor bundle after a refresh.
    ///
    /// The refresh response may omit the id and refresh tokens; the previous
    /// values carry over. An empty access token is rejected so a refresh can
    /// never produce an unusable bundle.
    pub fn refreshed(&self, tokens: TokenResponse, now_millis: u64) -> Result<Self> {
        if tokens.access_token.trim().is_empty() {
            return Err(Error::TokenExchange(
                "refresh returned an empty access token".into(),
            ));
        }
        let id_token = tokens
            .id_token
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| self.token_data.id_token.clone());
        let refresh_token = tokens
            .refresh_token
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| self.token_data.refresh_token.clone());
        let account_id = jwt::account_id(&id_token, &tokens.access_token)
            .unwrap_or_else(|| self.token_data.account_id.clone());

        Ok(Self {
            api_key: self.api_key.clone(),
            token_data: TokenData {
                id_token,
                access_token: tokens.access_token,
                refresh_token,
                account_id,
            },
            last_refresh: now_millis,
            expires_at: tokens
                .expires_in
                .map(|secs| now_millis.saturating_add(secs.saturating_mul(1000))),
        })
    }

    /// Absolute access-token expiry in unix milliseconds.
    ///
    /// Resolution order: explicit `expires_at`, then the access token's `exp`
    /// claim, then `last_refresh + assumed_lifetime`.
    pub fn expires_at_millis(&self, assumed_lifetime: Duration) -> u64 {
        self.expires_at
            .or_else(|| {
                jwt::parse_claims(&self.token_data.access_token)
                    .exp
                    .map(|secs| secs.saturating_mul(1000))
            })
            .unwrap_or_else(|| {
                self.last_refresh
                    .saturating_add(assumed_lifetime.as_millis() as u64)
            })
    }

    /// Time left before expiry, zero once expired.
    pub fn remaining(&self, now_millis: u64, assumed_lifetime: Duration) -> Duration {
        Duration::from_millis(
            self.expires_at_millis(assumed_lifetime)
                .saturating_sub(now_millis),
        )
    }

    /// Whether the access token has at most `margin` of life left.
    pub fn needs_refresh(&self, now_millis: u64, margin: Duration, assumed_lifetime: Duration) -> bool {
        self.remaining(now_millis, assumed_lifetime) <= margin
    }
}

fn non_empty(value: Option<String>, field: &str) -> Result<String> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(Error::TokenExchange(format!("token response missing {field}"))),
    }
}

/// Current wall-clock time as unix milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    const HOUR: Duration = Duration::from_secs(3600);

    fn login_response() -> TokenResponse {
        TokenResponse {
            id_token: Some(id_token("acct-login")),
            access_token: "at_login".into(),
            refresh_token: Some("rt_login".into()),
            expires_in: Some(3600),
        }
    }

    #[test]
    fn from_login_resolves_account_and_expiry() {
        let bundle = AuthBundle::from_login(login_response(), 1_000).unwrap();
        assert_eq!(bundle.token_data.account_id, "acct-login");
        assert_eq!(bundle.last_refresh, 1_000);
        assert_eq!(bundle.expires_at, Some(1_000 + 3_600_000));
    }

    #[test]
    fn from_login_requires_refresh_token_and_account() {
        let mut tokens = login_response();
        tokens.refresh_token = None;
        assert!(AuthBundle::from_login(tokens, 0).is_err());

        let mut tokens = login_response();
        tokens.id_token = Some("opaque".into());
        let err = AuthBundle::from_login(tokens, 0).unwrap_err();
        assert!(err.to_string().contains("account id"), "got {err}");
    }

    #[test]
    fn refreshed_keeps_previous_tokens_when_omitted() {
        let old = bundle("old", HOUR);
        let next = old
            .refreshed(
                TokenResponse {
                    id_token: None,
                    access_token: "at_new".into(),
                    refresh_token: None,
                    expires_in: Some(60),
                },
                5_000,
            )
            .unwrap();
        assert_eq!(next.token_data.access_token, "at_new");
        assert_eq!(next.token_data.refresh_token, "rt_old");
        assert_eq!(next.token_data.id_token, old.token_data.id_token);
        assert_eq!(next.token_data.account_id, "acct-1");
        assert_eq!(next.expires_at, Some(65_000));
    }

    #[test]
    fn refreshed_rejects_empty_access_token() {
        let old = bundle("old", HOUR);
        let result = old.refreshed(
            TokenResponse {
                id_token: None,
                access_token: "  ".into(),
                refresh_token: Some("rt_new".into()),
                expires_in: None,
            },
            0,
        );
        assert!(result.is_err());
    }

    #[test]
    fn expiry_falls_back_to_jwt_then_assumed_lifetime() {
        let mut b = bundle("x", HOUR);
        b.expires_at = None;
        b.last_refresh = 10_000;
        assert_eq!(b.expires_at_millis(HOUR), 10_000 + 3_600_000);

        b.token_data.access_token = jwt::encode_test_jwt(&serde_json::json!({ "exp": 2_000 }));
        assert_eq!(b.expires_at_millis(HOUR), 2_000_000);
    }

    #[test]
    fn needs_refresh_respects_margin() {
        let margin = Duration::from_secs(60);
        let fresh = bundle("fresh", HOUR);
        assert!(!fresh.needs_refresh(now_millis(), margin, HOUR));

        let stale = bundle("stale", Duration::from_secs(30));
        assert!(stale.needs_refresh(now_millis(), margin, HOUR));
    }

    #[test]
    fn serializes_in_codex_layout() {
        let b = bundle("ser", HOUR);
        let json = serde_json::to_value(&b).unwrap();
        assert!(json["OPENAI_API_KEY"].is_null());
        assert_eq!(json["tokens"]["access_token"], "at_ser");
        assert_eq!(json["tokens"]["account_id"], "acct-1");
        assert!(json["last_refresh"].is_u64());
    }

    #[test]
    fn debug_never_prints_tokens() {
        let debug = format!("{:?}", bundle("secret", HOUR));
        assert!(!debug.contains("at_secret"));
        assert!(!debug.contains("rt_secret"));
    }
}
