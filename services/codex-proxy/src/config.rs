//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! Every section is optional; an empty file yields a working local setup.
//! The client API key is loaded from CODEX_PROXY_API_KEY or api_key_file,
//! never stored in the TOML directly to avoid leaking secrets.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chat_translate::{
    ModelCatalog, ModelEntry, ReasoningCompat, ReasoningEffort, ReasoningSummary,
    TranslatorOptions,
};
use codex_auth::{FlowSettings, OAuthConfig, RefreshPolicy};
use common::Secret;
use provider::ClientConfig;
use serde::Deserialize;

/// Env var holding the client API key for `/v1/*`.
pub const API_KEY_ENV: &str = "CODEX_PROXY_API_KEY";

/// Root configuration
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub oauth: OAuthSection,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub refresh: RefreshConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub translation: TranslationConfig,
    /// Exposed models; the built-in catalog when empty.
    #[serde(default)]
    pub models: Vec<ModelEntry>,
}

/// HTTP listener settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Bearer key clients must present on `/v1/*`. None disables the check.
    #[serde(skip)]
    pub api_key: Option<Secret<String>>,
    /// Path to a file containing the API key (alternative to CODEX_PROXY_API_KEY)
    #[serde(default)]
    pub api_key_file: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            max_connections: default_max_connections(),
            api_key: None,
            api_key_file: None,
        }
    }
}

/// OAuth client identity and login flow settings
#[derive(Debug, Deserialize)]
pub struct OAuthSection {
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default = "default_redirect_uri")]
    pub redirect_uri: String,
    #[serde(default = "default_authorize_endpoint")]
    pub authorize_endpoint: String,
    #[serde(default = "default_token_endpoint")]
    pub token_endpoint: String,
    #[serde(default = "default_login_timeout")]
    pub login_timeout_secs: u64,
    #[serde(default)]
    pub exchange_api_key: bool,
    /// Extra listener for the OAuth redirect (the registered redirect URI
    /// points at port 1455). Skipped when equal to `server.listen_addr`.
    #[serde(default = "default_callback_listen_addr")]
    pub callback_listen_addr: Option<SocketAddr>,
}

impl Default for OAuthSection {
    fn default() -> Self {
        Self {
            client_id: default_client_id(),
            redirect_uri: default_redirect_uri(),
            authorize_endpoint: default_authorize_endpoint(),
            token_endpoint: default_token_endpoint(),
            login_timeout_secs: default_login_timeout(),
            exchange_api_key: false,
            callback_listen_addr: default_callback_listen_addr(),
        }
    }
}

impl OAuthSection {
    pub fn oauth_config(&self) -> OAuthConfig {
        OAuthConfig {
            client_id: self.client_id.clone(),
            redirect_uri: self.redirect_uri.clone(),
            authorize_endpoint: self.authorize_endpoint.clone(),
            token_endpoint: self.token_endpoint.clone(),
            ..OAuthConfig::default()
        }
    }

    pub fn flow_settings(&self) -> FlowSettings {
        FlowSettings {
            login_timeout: Duration::from_secs(self.login_timeout_secs),
            exchange_api_key: self.exchange_api_key,
        }
    }
}

/// Codex backend connection settings
#[derive(Debug, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_backend_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backend_backoff")]
    pub retry_backoff_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout_secs: default_backend_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            idle_timeout_secs: default_idle_timeout(),
            max_attempts: default_attempts(),
            retry_backoff_ms: default_backend_backoff(),
        }
    }
}

impl BackendConfig {
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            base_url: self.base_url.clone(),
            timeout: Duration::from_secs(self.timeout_secs),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            max_attempts: self.max_attempts,
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
            ..ClientConfig::default()
        }
    }
}

/// Token refresh tunables
#[derive(Debug, Deserialize)]
pub struct RefreshConfig {
    #[serde(default = "default_margin")]
    pub margin_secs: u64,
    #[serde(default = "default_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_refresh_backoff")]
    pub backoff_ms: u64,
    /// Background refresh check period; 0 disables the background task.
    #[serde(default = "default_refresh_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_assumed_lifetime")]
    pub assumed_lifetime_secs: u64,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            margin_secs: default_margin(),
            max_attempts: default_attempts(),
            backoff_ms: default_refresh_backoff(),
            interval_secs: default_refresh_interval(),
            assumed_lifetime_secs: default_assumed_lifetime(),
        }
    }
}

impl RefreshConfig {
    pub fn policy(&self) -> RefreshPolicy {
        RefreshPolicy {
            margin: Duration::from_secs(self.margin_secs),
            max_attempts: self.max_attempts,
            base_backoff: Duration::from_millis(self.backoff_ms),
            assumed_lifetime: Duration::from_secs(self.assumed_lifetime_secs),
        }
    }

    /// Background ticks refresh anything expiring before the next tick.
    pub fn background_threshold(&self) -> Duration {
        Duration::from_secs(self.interval_secs + self.margin_secs)
    }
}

/// Persistence settings
#[derive(Debug, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_auth_file")]
    pub auth_file: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            auth_file: default_auth_file(),
        }
    }
}

/// Request translation defaults
#[derive(Debug, Deserialize)]
pub struct TranslationConfig {
    /// File with the base instructions sent on every backend request.
    #[serde(default)]
    pub instructions_file: Option<PathBuf>,
    #[serde(skip)]
    pub instructions: Option<String>,
    #[serde(default = "default_effort")]
    pub default_reasoning_effort: String,
    #[serde(default = "default_summary")]
    pub default_reasoning_summary: String,
    #[serde(default = "default_compat")]
    pub default_reasoning_compat: String,
}

impl Default for TranslationConfig {
    fn default() -> Self {
        Self {
            instructions_file: None,
            instructions: None,
            default_reasoning_effort: default_effort(),
            default_reasoning_summary: default_summary(),
            default_reasoning_compat: default_compat(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

fn default_callback_listen_addr() -> Option<SocketAddr> {
    Some(SocketAddr::from(([127, 0, 0, 1], 1455)))
}

fn default_max_connections() -> usize {
    1000
}

fn default_client_id() -> String {
    codex_auth::constants::CLIENT_ID.to_owned()
}

fn default_redirect_uri() -> String {
    codex_auth::constants::REDIRECT_URI.to_owned()
}

fn default_authorize_endpoint() -> String {
    codex_auth::constants::AUTHORIZE_ENDPOINT.to_owned()
}

fn default_token_endpoint() -> String {
    codex_auth::constants::TOKEN_ENDPOINT.to_owned()
}

fn default_login_timeout() -> u64 {
    600
}

fn default_base_url() -> String {
    "https://chatgpt.com/backend-api/codex".to_owned()
}

fn default_backend_timeout() -> u64 {
    600
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_idle_timeout() -> u64 {
    120
}

fn default_attempts() -> u32 {
    3
}

fn default_backend_backoff() -> u64 {
    250
}

fn default_margin() -> u64 {
    60
}

fn default_refresh_backoff() -> u64 {
    500
}

fn default_refresh_interval() -> u64 {
    300
}

fn default_assumed_lifetime() -> u64 {
    3600
}

fn default_auth_file() -> PathBuf {
    PathBuf::from("auth.json")
}

fn default_effort() -> String {
    "medium".to_owned()
}

fn default_summary() -> String {
    "auto".to_owned()
}

fn default_compat() -> String {
    "think-tags".to_owned()
}

fn is_http_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.finish()
    }

    /// Like `load`, but a missing file yields the defaults.
    pub fn load_or_default(path: &Path) -> common::Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Config::default().finish()
        }
    }

    /// Validate, read referenced files and apply env overrides.
    fn finish(mut self) -> common::Result<Self> {
        for (name, url) in [
            ("backend.base_url", &self.backend.base_url),
            ("oauth.token_endpoint", &self.oauth.token_endpoint),
            ("oauth.authorize_endpoint", &self.oauth.authorize_endpoint),
            ("oauth.redirect_uri", &self.oauth.redirect_uri),
        ] {
            if !is_http_url(url) {
                return Err(common::Error::invalid(
                    name,
                    format!("must start with http:// or https://, got: {url}"),
                ));
            }
        }

        for (name, value) in [
            ("server.max_connections", self.server.max_connections as u64),
            ("backend.timeout_secs", self.backend.timeout_secs),
            ("backend.idle_timeout_secs", self.backend.idle_timeout_secs),
            ("backend.max_attempts", u64::from(self.backend.max_attempts)),
            ("refresh.max_attempts", u64::from(self.refresh.max_attempts)),
            ("oauth.login_timeout_secs", self.oauth.login_timeout_secs),
        ] {
            if value == 0 {
                return Err(common::Error::invalid(name, "must be greater than 0"));
            }
        }

        let t = &self.translation;
        if ReasoningEffort::parse(&t.default_reasoning_effort).is_none() {
            return Err(common::Error::invalid(
                "translation.default_reasoning_effort",
                format!(
                    "must be one of {}, got: {}",
                    ReasoningEffort::EXPECTED,
                    t.default_reasoning_effort
                ),
            ));
        }
        if ReasoningSummary::parse(&t.default_reasoning_summary).is_none() {
            return Err(common::Error::invalid(
                "translation.default_reasoning_summary",
                format!(
                    "must be one of {}, got: {}",
                    ReasoningSummary::EXPECTED,
                    t.default_reasoning_summary
                ),
            ));
        }
        if ReasoningCompat::parse(&t.default_reasoning_compat).is_none() {
            return Err(common::Error::invalid(
                "translation.default_reasoning_compat",
                format!(
                    "must be one of {}, got: {}",
                    ReasoningCompat::EXPECTED,
                    t.default_reasoning_compat
                ),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for model in &self.models {
            if model.id.trim().is_empty() {
                return Err(common::Error::invalid("models[].id", "must not be empty"));
            }
            if !seen.insert(model.id.to_ascii_lowercase()) {
                return Err(common::Error::invalid(
                    "models[].id",
                    format!("duplicate model id: {}", model.id),
                ));
            }
        }

        if let Some(ref file) = self.translation.instructions_file {
            let text = std::fs::read_to_string(file).map_err(|e| {
                common::Error::Config(format!(
                    "failed to read instructions_file {}: {e}",
                    file.display()
                ))
            })?;
            self.translation.instructions = Some(text);
        }

        // Resolve API key: env var takes precedence over file
        if let Ok(key) = std::env::var(API_KEY_ENV)
            && !key.trim().is_empty()
        {
            self.server.api_key = Some(Secret::new(key.trim().to_owned()));
        } else if let Some(ref key_file) = self.server.api_key_file {
            let key = std::fs::read_to_string(key_file).map_err(|e| {
                common::Error::Config(format!(
                    "failed to read api_key_file {}: {e}",
                    key_file.display()
                ))
            })?;
            let key = Secret::from(key.trim().to_owned());
            if !key.is_empty() {
                self.server.api_key = Some(key);
            }
        }

        Ok(self)
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    ///
    /// The flag is true when the path was given explicitly, in which case a
    /// missing file is an error rather than a fallback to defaults.
    pub fn resolve_path(cli_path: Option<&str>) -> (PathBuf, bool) {
        if let Some(p) = cli_path {
            return (PathBuf::from(p), true);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return (PathBuf::from(p), true);
        }
        (PathBuf::from("codex-proxy.toml"), false)
    }

    /// Options for the request translator. Values were validated on load.
    pub fn translator_options(&self) -> TranslatorOptions {
        let defaults = TranslatorOptions::default();
        let t = &self.translation;
        TranslatorOptions {
            instructions: t.instructions.clone().unwrap_or(defaults.instructions),
            models: if self.models.is_empty() {
                ModelCatalog::default()
            } else {
                ModelCatalog::new(self.models.clone())
            },
            default_effort: ReasoningEffort::parse(&t.default_reasoning_effort)
                .unwrap_or(defaults.default_effort),
            default_summary: ReasoningSummary::parse(&t.default_reasoning_summary)
                .unwrap_or(defaults.default_summary),
            default_compat: ReasoningCompat::parse(&t.default_reasoning_compat)
                .unwrap_or(defaults.default_compat),
        }
    }
}
