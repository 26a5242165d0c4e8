//! Unverified JWT claim extraction
//!
//! The id and access tokens issued by the token endpoint are JWTs. The proxy
//! is not the audience and never validates signatures; it only reads the
//! payload for the ChatGPT account id, the email and the `exp` timestamp.

use base64::Engine;
use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};
use serde_json::Value;

use crate::constants::AUTH_CLAIM;

/// Claims the proxy cares about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Claims {
    pub account_id: Option<String>,
    pub email: Option<String>,
    /// Expiry as unix seconds.
    pub exp: Option<u64>,
}

/// Decode the payload segment of a JWT into JSON.
///
/// Returns `None` for anything that is not three dot-separated segments with
/// a base64url JSON object in the middle.
pub fn decode_payload(token: &str) -> Option<Value> {
    let mut parts = token.split('.');
    let (_, payload, _) = (parts.next()?, parts.next()?, parts.next()?);
    if parts.next().is_some() {
        return None;
    }
    // Some issuers pad the segment, most do not.
    let bytes = URL_SAFE_NO_PAD
        .decode(payload)
        .or_else(|_| URL_SAFE.decode(payload))
        .ok()?;
    let value: Value = serde_json::from_slice(&bytes).ok()?;
    value.is_object().then_some(value)
}

/// Extract the claims from a JWT. Missing or malformed tokens yield empty claims.
pub fn parse_claims(token: &str) -> Claims {
    let Some(payload) = decode_payload(token) else {
        return Claims::default();
    };

    let account_id = payload
        .get(AUTH_CLAIM)
        .and_then(|auth| auth.get("chatgpt_account_id"))
        .and_then(Value::as_str)
        .or_else(|| payload.get("chatgpt_account_id").and_then(Value::as_str))
        .or_else(|| {
            payload
                .get("organizations")
                .and_then(Value::as_array)
                .and_then(|orgs| orgs.first())
                .and_then(|org| org.get("id"))
                .and_then(Value::as_str)
        })
        .filter(|id| !id.is_empty())
        .map(str::to_owned);

    Claims {
        account_id,
        email: payload
            .get("email")
            .and_then(Value::as_str)
            .map(str::to_owned),
        exp: payload.get("exp").and_then(Value::as_u64),
    }
}

/// Resolve the account id, preferring the id token and falling back to the
/// access token.
pub fn account_id(id_token: &str, access_token: &str) -> Option<String> {
    parse_claims(id_token)
        .account_id
        .or_else(|| parse_claims(access_token).account_id)
}

#[cfg(test)]
pub(crate) fn encode_test_jwt(payload: &Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
    let body = URL_SAFE_NO_PAD.encode(payload.to_string());
    format!("{header}.{body}.sig")
}
