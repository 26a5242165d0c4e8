//! Login and session endpoints
//!
//! - GET  /auth/login     start a PKCE login; JSON with the authorization URL,
//!   or a 303 to it with `?redirect=true`
//! - GET  /auth/callback  OAuth redirect target; exchanges the code
//! - GET  /auth/status    session summary and login state (never tokens)
//! - POST /auth/refresh   refresh the access token now
//! - POST /auth/logout    forget the stored session
//!
//! The callback is also served on its own listener when the registered
//! redirect URI points at a different port than the API.

use std::sync::Arc;

use axum::Router;
use axum::extract::{Query, State};
use axum::response::{IntoResponse, Redirect, Response};
use axum::Json;
use axum::routing::{get, post};
use codex_auth::{AuthStatus, LoginState, OAuthFlowController, TokenRefresher};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::error::ApiError;

/// Shared state for the auth handlers.
#[derive(Clone)]
pub struct AuthState {
    pub flow: Arc<OAuthFlowController>,
    pub refresher: TokenRefresher,
}

/// All auth endpoints.
pub fn build_auth_router(state: AuthState) -> Router {
    Router::new()
        .route("/auth/login", get(login))
        .route("/auth/callback", get(callback))
        .route("/auth/status", get(status))
        .route("/auth/refresh", post(refresh))
        .route("/auth/logout", post(logout))
        .with_state(state)
}

/// Only the redirect target, for the dedicated callback listener.
pub fn build_callback_router(state: AuthState) -> Router {
    Router::new()
        .route("/auth/callback", get(callback))
        .with_state(state)
}

#[derive(Debug, Default, Deserialize)]
struct LoginParams {
    #[serde(default)]
    redirect: bool,
}

async fn login(State(state): State<AuthState>, Query(params): Query<LoginParams>) -> Response {
    let start = state.flow.begin_login().await;
    if params.redirect {
        return Redirect::to(&start.authorization_url).into_response();
    }
    Json(json!({
        "authorization_url": start.authorization_url,
        "state": start.state,
        "instructions": "Open the URL in a browser and sign in; the proxy completes the login on redirect",
    }))
    .into_response()
}

#[derive(Debug, Default, Deserialize)]
struct CallbackParams {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

async fn callback(
    State(state): State<AuthState>,
    Query(params): Query<CallbackParams>,
) -> Result<Response, ApiError> {
    // No state parameter can never match a pending login
    let Some(oauth_state) = params.state.as_deref() else {
        warn!("callback without state parameter");
        return Err(codex_auth::Error::StateMismatch.into());
    };

    if let Some(error) = params.error.as_deref() {
        let reason = match params.error_description.as_deref() {
            Some(description) => format!("{error}: {description}"),
            None => error.to_owned(),
        };
        return Err(state.flow.deny_callback(oauth_state, &reason).await.into());
    }

    let Some(code) = params.code.as_deref().filter(|c| !c.is_empty()) else {
        return Err(ApiError::new(
            axum::http::StatusCode::BAD_REQUEST,
            "invalid_request_error",
            "callback is missing the authorization code",
        )
        .with_code("missing_code"));
    };

    let bundle = state.flow.complete_callback(code, oauth_state).await?;
    info!(account_id = %bundle.token_data.account_id, "session established via callback");
    Ok(Json(json!({
        "status": "authenticated",
        "account_id": bundle.token_data.account_id,
        "message": "Login complete. You can close this window.",
    }))
    .into_response())
}

#[derive(Serialize)]
struct StatusBody {
    #[serde(flatten)]
    auth: AuthStatus,
    login_state: LoginState,
}

async fn status(State(state): State<AuthState>) -> impl IntoResponse {
    Json(StatusBody {
        auth: state.refresher.status().await,
        login_state: state.flow.state().await,
    })
}

async fn refresh(State(state): State<AuthState>) -> Result<impl IntoResponse, ApiError> {
    let bundle = state.refresher.refresh_now().await?;
    info!(account_id = %bundle.token_data.account_id, "session refreshed on request");
    Ok(Json(RefreshBody {
        refreshed: true,
        auth: state.refresher.status().await,
    }))
}

#[derive(Serialize)]
struct RefreshBody {
    refreshed: bool,
    #[serde(flatten)]
    auth: AuthStatus,
}

async fn logout(State(state): State<AuthState>) -> Result<impl IntoResponse, ApiError> {
    let had_session = state.flow.logout().await?;
    Ok(Json(json!({ "logged_out": had_session })))
}
