//! Error types for OAuth authentication operations
//!
//! Messages never carry token material. Token endpoint failures are reduced
//! to the status plus the endpoint's `error` / `error_description` fields.

/// Errors from OAuth authentication operations.
///
/// `Clone` so a single refresh outcome can be handed to every waiter.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Transport failure, timeout or 5xx from the token endpoint.
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("token exchange failed: {0}")]
    TokenExchange(String),

    /// The token endpoint rejected the grant (revoked or invalid refresh token).
    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    /// Refresh was rejected or the session is otherwise unusable; the user
    /// must log in again.
    #[error("authentication expired: {0}")]
    AuthExpired(String),

    /// Retries against the token endpoint were exhausted.
    #[error("token endpoint unavailable after {attempts} attempts: {message}")]
    Unavailable { attempts: u32, message: String },

    #[error("OAuth state mismatch")]
    StateMismatch,

    #[error("login attempt expired")]
    LoginExpired,

    /// A newer login or a logout replaced this attempt while it was exchanging.
    #[error("login attempt superseded")]
    Superseded,

    #[error("authorization denied: {0}")]
    ConsentDenied(String),

    #[error("not authenticated")]
    NotAuthenticated,

    #[error("credential parse error: {0}")]
    CredentialParse(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl Error {
    /// Whether a retry against the token endpoint could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Http(_))
    }
}

/// Result alias for auth operations.
pub type Result<T> = std::result::Result<T, Error>;
