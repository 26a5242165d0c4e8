//! ChatGPT OAuth constants
//!
//! Public OAuth client configuration matching the Codex CLI. These values
//! identify the public client application and are not secrets. The actual
//! secrets (access/refresh/id tokens) live in the token store.

/// OpenAI's public OAuth client ID (same as the Codex CLI)
pub const CLIENT_ID: &str = "app_EMoamEEZ73f0CkXaXp7hrann";

/// Loopback redirect URI registered for the public client
pub const REDIRECT_URI: &str = "http://localhost:1455/auth/callback";

/// Authorization endpoint the user's browser is sent to
pub const AUTHORIZE_ENDPOINT: &str = "https://auth.openai.com/oauth/authorize";

/// Token endpoint for code exchange, refresh and API-key exchange
pub const TOKEN_ENDPOINT: &str = "https://auth.openai.com/oauth/token";

/// `offline_access` is what makes the token endpoint issue a refresh token.
pub const SCOPES: &str = "openid profile email offline_access";

/// Value of the `originator` authorize parameter and backend header.
pub const ORIGINATOR: &str = "codex_cli_rs";

/// Claim namespace carrying ChatGPT account details inside OpenAI JWTs.
pub const AUTH_CLAIM: &str = "https://api.openai.com/auth";

/// Grant and token types for the id-token to API-key exchange (RFC 8693).
pub const TOKEN_EXCHANGE_GRANT: &str = "urn:ietf:params:oauth:grant-type:token-exchange";
pub const ID_TOKEN_TYPE: &str = "urn:ietf:params:oauth:token-type:id_token";
pub const REQUESTED_API_KEY: &str = "openai-api-key";

/// Endpoints and client identity used by the login and refresh flows.
///
/// Defaults to the public Codex CLI client. Tests point the endpoints at a
/// local mock server.
#[derive(Debug, Clone)]
pub struct OAuthConfig {
    pub client_id: String,
    pub redirect_uri: String,
    pub authorize_endpoint: String,
    pub token_endpoint: String,
    pub scopes: String,
    pub originator: String,
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            client_id: CLIENT_ID.into(),
            redirect_uri: REDIRECT_URI.into(),
            authorize_endpoint: AUTHORIZE_ENDPOINT.into(),
            token_endpoint: TOKEN_ENDPOINT.into(),
            scopes: SCOPES.into(),
            originator: ORIGINATOR.into(),
        }
    }
}
