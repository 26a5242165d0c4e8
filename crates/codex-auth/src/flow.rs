//! OAuth authorization-code + PKCE login flow
//!
//! ```text
//! Idle ──begin_login──▶ AwaitingCallback ──callback(ok)──▶ Exchanging ──▶ Authenticated
//!   ▲                        │                                 │
//!   │                        ├─ state mismatch / expired ──────┼──▶ Failed
//!   │                        └─ consent denied ────────────────┘
//!   └──────────────────────────── logout ◀──────────────────────── Authenticated
//! ```
//!
//! One pending login at a time; `begin_login` replaces any earlier attempt.
//! A state mismatch discards the pending login without touching the store.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::bundle::{AuthBundle, now_millis};
use crate::constants::OAuthConfig;
use crate::error::{Error, Result};
use crate::pkce::{self, PkceCodes};
use crate::store::TokenStore;
use crate::token;

/// Externally visible login state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LoginState {
    Idle,
    AwaitingCallback,
    Exchanging,
    Authenticated,
    Failed { reason: String },
}

/// Result of `begin_login`. The verifier stays inside the controller; the
/// copy here is for callers that drive the exchange themselves.
#[derive(Debug, Clone)]
pub struct LoginStart {
    pub authorization_url: String,
    pub state: String,
    pub pkce: PkceCodes,
}

/// Tunables for the login flow.
#[derive(Debug, Clone)]
pub struct FlowSettings {
    /// How long a pending login accepts its callback.
    pub login_timeout: Duration,
    /// Derive an API key from the id token after login.
    pub exchange_api_key: bool,
}

impl Default for FlowSettings {
    fn default() -> Self {
        Self {
            login_timeout: Duration::from_secs(600),
            exchange_api_key: false,
        }
    }
}

struct PendingLogin {
    state: String,
    pkce: PkceCodes,
    started_at: Instant,
}

enum Phase {
    Idle,
    AwaitingCallback(PendingLogin),
    Exchanging,
    Authenticated,
    Failed(String),
}

struct FlowState {
    phase: Phase,
    /// Bumped by every begin_login and logout so a slow exchange can tell
    /// it has been overtaken.
    generation: u64,
}

struct Inner {
    config: OAuthConfig,
    client: reqwest::Client,
    store: Arc<TokenStore>,
    settings: FlowSettings,
    state: Mutex<FlowState>,
}

/// Drives the login state machine and persists the resulting bundle.
pub struct OAuthFlowController {
    inner: Arc<Inner>,
}

impl OAuthFlowController {
    /// Create a controller. Starts `Authenticated` when the store already
    /// holds a bundle, `Idle` otherwise.
    pub async fn new(
        config: OAuthConfig,
        client: reqwest::Client,
        store: Arc<TokenStore>,
        settings: FlowSettings,
    ) -> Self {
        let phase = if store.current().await.is_some() {
            Phase::Authenticated
        } else {
            Phase::Idle
        };
        Self {
            inner: Arc::new(Inner {
                config,
                client,
                store,
                settings,
                state: Mutex::new(FlowState {
                    phase,
                    generation: 0,
                }),
            }),
        }
    }

    /// Start a login: generate PKCE codes and a state token, remember them,
    /// and return the authorization URL for the user's browser.
    pub async fn begin_login(&self) -> LoginStart {
        let pkce = PkceCodes::generate();
        let state = pkce::generate_state();
        let authorization_url =
            pkce::build_authorization_url(&self.inner.config, &state, &pkce.code_challenge);

        let mut flow = self.inner.state.lock().await;
        if matches!(flow.phase, Phase::AwaitingCallback(_)) {
            info!("replacing pending login with a new attempt");
        }
        flow.generation += 1;
        flow.phase = Phase::AwaitingCallback(PendingLogin {
            state: state.clone(),
            pkce: pkce.clone(),
            started_at: Instant::now(),
        });
        info!("login initiated, awaiting callback");

        LoginStart {
            authorization_url,
            state,
            pkce,
        }
    }

    /// Complete a login from the redirect callback.
    ///
    /// The state must match the pending login; otherwise the pending login
    /// is discarded and nothing is written to the store. The exchange runs
    /// on its own task, so a caller that goes away mid-exchange does not
    /// leave the flow stuck in `Exchanging`.
    pub async fn complete_callback(&self, code: &str, state: &str) -> Result<AuthBundle> {
        let (pending, generation) = {
            let mut flow = self.inner.state.lock().await;
            let pending = self.take_pending(&mut flow, state)?;
            (pending, flow.generation)
        };

        let inner = self.inner.clone();
        let code = code.to_owned();
        tokio::spawn(async move { inner.finish_login(&code, &pending.pkce, generation).await })
            .await
            .unwrap_or_else(|e| Err(Error::Http(format!("login exchange task failed: {e}"))))
    }

    /// Handle a callback carrying `?error=...` instead of a code.
    pub async fn deny_callback(&self, state: &str, error: &str) -> Error {
        let mut flow = self.inner.state.lock().await;
        match self.take_pending(&mut flow, state) {
            Ok(_) => {
                warn!(error, "authorization denied by provider");
                flow.phase = Phase::Failed(format!("authorization denied: {error}"));
                Error::ConsentDenied(error.to_owned())
            }
            Err(e) => e,
        }
    }

    /// Forget the session: clear the store and return to `Idle`.
    pub async fn logout(&self) -> Result<bool> {
        let mut flow = self.inner.state.lock().await;
        flow.generation += 1;
        flow.phase = Phase::Idle;
        let had_bundle = self.inner.store.clear().await?;
        info!(had_bundle, "logged out");
        Ok(had_bundle)
    }

    /// Current state. An expired pending login is reported (and recorded) as failed.
    pub async fn state(&self) -> LoginState {
        let mut flow = self.inner.state.lock().await;
        if let Phase::AwaitingCallback(pending) = &flow.phase
            && pending.started_at.elapsed() >= self.inner.settings.login_timeout
        {
            flow.phase = Phase::Failed("login expired".into());
        }
        match &flow.phase {
            Phase::Idle => LoginState::Idle,
            Phase::AwaitingCallback(_) => LoginState::AwaitingCallback,
            Phase::Exchanging => LoginState::Exchanging,
            Phase::Authenticated => LoginState::Authenticated,
            Phase::Failed(reason) => LoginState::Failed {
                reason: reason.clone(),
            },
        }
    }

    /// Validate the callback state against the pending login and take it,
    /// leaving the flow in `Exchanging`.
    fn take_pending(&self, flow: &mut FlowState, state: &str) -> Result<PendingLogin> {
        let Phase::AwaitingCallback(pending) = &flow.phase else {
            warn!("callback received with no pending login");
            return Err(Error::StateMismatch);
        };

        if pending.state != state {
            warn!("callback state does not match pending login, discarding it");
            flow.phase = Phase::Failed("state mismatch".into());
            return Err(Error::StateMismatch);
        }
        if pending.started_at.elapsed() >= self.inner.settings.login_timeout {
            warn!("callback arrived after the login window closed");
            flow.phase = Phase::Failed("login expired".into());
            return Err(Error::LoginExpired);
        }

        match std::mem::replace(&mut flow.phase, Phase::Exchanging) {
            Phase::AwaitingCallback(pending) => Ok(pending),
            _ => Err(Error::StateMismatch),
        }
    }
}

impl Inner {
    /// Exchange the code and record the outcome, unless a newer login or a
    /// logout happened in the meantime.
    async fn finish_login(&self, code: &str, pkce: &PkceCodes, generation: u64) -> Result<AuthBundle> {
        let outcome = self.exchange(code, pkce).await;

        let mut flow = self.state.lock().await;
        if flow.generation != generation {
            warn!("login superseded while exchanging, discarding tokens");
            return Err(Error::Superseded);
        }
        match outcome {
            Ok(bundle) => {
                // Saved under the flow lock so a concurrent logout cannot
                // interleave between the generation check and the write.
                if let Err(e) = self.store.save(bundle.clone()).await {
                    flow.phase = Phase::Failed(e.to_string());
                    return Err(e);
                }
                flow.phase = Phase::Authenticated;
                info!(account_id = %bundle.token_data.account_id, "login completed");
                Ok(bundle)
            }
            Err(e) => {
                warn!(error = %e, "authorization code exchange failed");
                flow.phase = Phase::Failed(e.to_string());
                Err(e)
            }
        }
    }

    async fn exchange(&self, code: &str, pkce: &PkceCodes) -> Result<AuthBundle> {
        let tokens =
            token::exchange_code(&self.client, &self.config, code, &pkce.code_verifier).await?;
        let mut bundle = AuthBundle::from_login(tokens, now_millis())?;

        if self.settings.exchange_api_key {
            match token::exchange_api_key(&self.client, &self.config, &bundle.token_data.id_token)
                .await
            {
                Ok(key) => bundle.api_key = Some(key),
                Err(e) => warn!(error = %e, "API key exchange failed, continuing without one"),
            }
        }
        Ok(bundle)
    }
}
