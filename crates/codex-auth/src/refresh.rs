//! Access-token refresh with single-flight coordination
//!
//! `TokenRefresher::ensure_valid` is called on every request path. When the
//! access token is inside the safety margin it starts (or joins) the one
//! outstanding refresh. The refresh itself runs on a spawned task, so a
//! request that gives up waiting never cancels the refresh other requests
//! are waiting on.
//!
//! Failure handling:
//! - rejected grant (400 `invalid_grant`, 401, 403) → `AuthExpired`, no retry;
//!   the dead refresh token is remembered so later calls fail without a
//!   network round trip
//! - transport / 5xx / 429 → bounded exponential backoff, then `Unavailable`
//!
//! `spawn_refresh_task` runs the same path proactively in the background.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::bundle::{AuthBundle, now_millis};
use crate::constants::OAuthConfig;
use crate::error::{Error, Result};
use crate::store::TokenStore;
use crate::token::{self, TokenResponse};

/// Refresh tunables.
#[derive(Debug, Clone)]
pub struct RefreshPolicy {
    /// Refresh once the access token has this much life or less left.
    pub margin: Duration,
    /// Total attempts against the token endpoint for transient failures.
    pub max_attempts: u32,
    /// Backoff before the second attempt; doubles for each one after.
    pub base_backoff: Duration,
    /// Lifetime assumed for tokens with no known expiry.
    pub assumed_lifetime: Duration,
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self {
            margin: Duration::from_secs(60),
            max_attempts: 3,
            base_backoff: Duration::from_millis(500),
            assumed_lifetime: Duration::from_secs(3600),
        }
    }
}

/// Snapshot of the session for status endpoints. Never carries tokens.
#[derive(Debug, Clone, Serialize)]
pub struct AuthStatus {
    pub authenticated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_in_secs: Option<u64>,
    /// True when the access token is outside the refresh margin.
    pub valid: bool,
    pub has_api_key: bool,
}

type SharedRefresh = Shared<BoxFuture<'static, Result<AuthBundle>>>;

struct Inner {
    client: reqwest::Client,
    config: OAuthConfig,
    store: Arc<TokenStore>,
    policy: RefreshPolicy,
    /// The outstanding refresh, if any. Only held briefly, never across an await.
    inflight: Mutex<Option<SharedRefresh>>,
    /// Refresh token the token endpoint has already rejected.
    rejected: Mutex<Option<String>>,
}

/// Keeps the stored access token valid. Cheap to clone.
#[derive(Clone)]
pub struct TokenRefresher {
    inner: Arc<Inner>,
}

impl TokenRefresher {
    pub fn new(
        client: reqwest::Client,
        config: OAuthConfig,
        store: Arc<TokenStore>,
        policy: RefreshPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                client,
                config,
                store,
                policy,
                inflight: Mutex::new(None),
                rejected: Mutex::new(None),
            }),
        }
    }

    pub fn policy(&self) -> &RefreshPolicy {
        &self.inner.policy
    }

    pub fn store(&self) -> &Arc<TokenStore> {
        &self.inner.store
    }

    /// Load the stored bundle and make sure its access token is usable.
    pub async fn current_valid(&self) -> Result<AuthBundle> {
        let bundle = self
            .inner
            .store
            .current()
            .await
            .ok_or(Error::NotAuthenticated)?;
        self.ensure_valid(&bundle).await
    }

    /// Return a bundle whose access token is outside the safety margin,
    /// refreshing if needed. Concurrent callers share one refresh.
    pub async fn ensure_valid(&self, bundle: &AuthBundle) -> Result<AuthBundle> {
        self.ensure_within(bundle, self.inner.policy.margin).await
    }

    /// Refresh the stored session regardless of how long its access token
    /// has left. Joins a refresh that is already in flight.
    pub async fn refresh_now(&self) -> Result<AuthBundle> {
        let bundle = self
            .inner
            .store
            .current()
            .await
            .ok_or(Error::NotAuthenticated)?;
        info!(account_id = %bundle.token_data.account_id, "manual token refresh requested");
        self.ensure_within(&bundle, Duration::MAX).await
    }

    async fn ensure_within(&self, bundle: &AuthBundle, margin: Duration) -> Result<AuthBundle> {
        let lifetime = self.inner.policy.assumed_lifetime;
        if !bundle.needs_refresh(now_millis(), margin, lifetime) {
            return Ok(bundle.clone());
        }

        // Another caller may already have refreshed and stored a newer bundle.
        let current = self
            .inner
            .store
            .current()
            .await
            .ok_or(Error::NotAuthenticated)?;
        if !current.needs_refresh(now_millis(), margin, lifetime) {
            return Ok(current);
        }

        let refresh = {
            let mut slot = lock(&self.inner.inflight);
            match slot.as_ref() {
                Some(shared) => {
                    debug!("joining in-flight token refresh");
                    shared.clone()
                }
                None => {
                    if lock(&self.inner.rejected).as_deref()
                        == Some(current.token_data.refresh_token.as_str())
                    {
                        return Err(Error::AuthExpired(
                            "refresh token was rejected; log in again".into(),
                        ));
                    }
                    // The slot lock is held until the future is installed, so
                    // the task's own cleanup always runs after this insert.
                    let inner = self.inner.clone();
                    let handle = tokio::spawn(run_refresh(inner, current));
                    let shared = async move {
                        handle
                            .await
                            .unwrap_or_else(|e| Err(Error::Http(format!("refresh task failed: {e}"))))
                    }
                    .boxed()
                    .shared();
                    *slot = Some(shared.clone());
                    shared
                }
            }
        };

        refresh.await
    }

    /// Session summary for `/auth/status` and `/health`.
    pub async fn status(&self) -> AuthStatus {
        let policy = &self.inner.policy;
        match self.inner.store.current().await {
            Some(bundle) => {
                let now = now_millis();
                AuthStatus {
                    authenticated: true,
                    account_id: Some(bundle.token_data.account_id.clone()),
                    expires_in_secs: Some(bundle.remaining(now, policy.assumed_lifetime).as_secs()),
                    valid: !bundle.needs_refresh(now, policy.margin, policy.assumed_lifetime),
                    has_api_key: bundle.api_key.is_some(),
                }
            }
            None => AuthStatus {
                authenticated: false,
                account_id: None,
                expires_in_secs: None,
                valid: false,
                has_api_key: false,
            },
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Body of the spawned refresh task. Always clears the in-flight slot.
async fn run_refresh(inner: Arc<Inner>, current: AuthBundle) -> Result<AuthBundle> {
    let outcome = refresh_and_store(&inner, &current).await;
    *lock(&inner.inflight) = None;

    let label = match &outcome {
        Ok(_) => "success",
        Err(Error::AuthExpired(_)) => "rejected",
        Err(_) => "failure",
    };
    metrics::counter!("codex_proxy_token_refresh_total", "outcome" => label).increment(1);
    outcome
}

async fn refresh_and_store(inner: &Inner, current: &AuthBundle) -> Result<AuthBundle> {
    let old_refresh = current.token_data.refresh_token.as_str();
    let tokens = match refresh_with_retry(inner, old_refresh).await {
        Ok(tokens) => tokens,
        Err(Error::InvalidCredentials(msg)) => {
            warn!(
                account_id = %current.token_data.account_id,
                error = %msg,
                "refresh token rejected, login required"
            );
            *lock(&inner.rejected) = Some(old_refresh.to_owned());
            return Err(Error::AuthExpired(msg));
        }
        Err(e) => return Err(e),
    };

    let next = current.refreshed(tokens, now_millis())?;
    if inner.store.replace_if_current(old_refresh, next.clone()).await? {
        info!(account_id = %next.token_data.account_id, "token refresh succeeded");
        return Ok(next);
    }

    // The session changed underneath us (logout or a new login); the
    // refreshed tokens belong to a session that no longer exists.
    inner
        .store
        .current()
        .await
        .ok_or(Error::NotAuthenticated)
}

async fn refresh_with_retry(inner: &Inner, refresh: &str) -> Result<TokenResponse> {
    let max_attempts = inner.policy.max_attempts.max(1);
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match token::refresh_token(&inner.client, &inner.config, refresh).await {
            Ok(tokens) => return Ok(tokens),
            Err(e) if e.is_transient() && attempt < max_attempts => {
                let delay = inner.policy.base_backoff * 2u32.saturating_pow(attempt - 1);
                warn!(
                    attempt,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %e,
                    "token refresh failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) if e.is_transient() => {
                warn!(attempts = attempt, error = %e, "token refresh failed after all retries");
                return Err(Error::Unavailable {
                    attempts: attempt,
                    message: e.to_string(),
                });
            }
            Err(e) => return Err(e),
        }
    }
}

/// Spawn a background task that refreshes the stored token once it is
/// within `threshold` of expiry.
///
/// Uses the same single-flight path as request-time refresh, so the two
/// never race each other. Failures are logged; the next tick retries.
pub fn spawn_refresh_task(
    refresher: TokenRefresher,
    interval: Duration,
    threshold: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Skip the immediate first tick, the token was just loaded
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let Some(bundle) = refresher.store().current().await else {
                continue;
            };
            match refresher.ensure_within(&bundle, threshold).await {
                Ok(_) => debug!("background refresh check complete"),
                Err(Error::AuthExpired(msg)) => {
                    warn!(error = %msg, "background refresh rejected, login required")
                }
                Err(e) => warn!(error = %e, "background refresh failed, will retry next cycle"),
            }
        }
    })
}
