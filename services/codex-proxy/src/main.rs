//! Codex OAuth Proxy
//!
//! Single-binary Rust service that:
//! 1. Signs in to ChatGPT with the Codex OAuth client (PKCE, browser redirect)
//! 2. Keeps the session's access token fresh
//! 3. Accepts OpenAI Chat Completions (and legacy text completion) requests
//! 4. Translates them to the Codex Responses backend and translates the
//!    answer (JSON or SSE) back

mod auth_routes;
mod chat;
mod config;
mod error;
mod metrics;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use chat_translate::RequestTranslator;
use codex_auth::{OAuthFlowController, TokenRefresher, TokenStore, spawn_refresh_task};
use metrics_exporter_prometheus::PrometheusHandle;
use provider::CodexClient;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::auth_routes::AuthState;
use crate::chat::ChatState;
use crate::config::Config;
use crate::error::ApiError;
use crate::metrics::ServiceStats;

/// How long in-flight requests (including open streams) may take to finish
/// after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for calls to the OAuth token endpoint.
const OAUTH_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    chat: ChatState,
    auth: AuthState,
    prometheus: PrometheusHandle,
}

/// Build the axum router with all routes and shared state.
///
/// The concurrency limit covers every route, streams included, for as long
/// as the response body is open.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state.clone())
        .merge(auth_routes::build_auth_router(state.auth))
        .merge(chat::build_chat_router(state.chat))
        .fallback(|| async { ApiError::not_found("no such route").into_response() })
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting codex-proxy");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle = metrics::install_recorder()?;

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let (config_path, explicit) = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), explicit, "loading configuration");

    let config = if explicit {
        Config::load(&config_path)
    } else {
        Config::load_or_default(&config_path)
    }
    .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.server.listen_addr,
        backend_url = %config.backend.base_url,
        auth_file = %config.storage.auth_file.display(),
        models = config.models.len(),
        api_key_required = config.server.api_key.is_some(),
        "configuration loaded"
    );

    let oauth_http = reqwest::Client::builder()
        .timeout(OAUTH_HTTP_TIMEOUT)
        .build()
        .context("failed to build OAuth HTTP client")?;
    let oauth_config = config.oauth.oauth_config();

    let store = Arc::new(
        TokenStore::open(config.storage.auth_file.clone())
            .await
            .with_context(|| {
                format!(
                    "failed to open credential store {}",
                    config.storage.auth_file.display()
                )
            })?,
    );
    let refresher = TokenRefresher::new(
        oauth_http.clone(),
        oauth_config.clone(),
        store.clone(),
        config.refresh.policy(),
    );
    let flow = Arc::new(
        OAuthFlowController::new(
            oauth_config,
            oauth_http,
            store.clone(),
            config.oauth.flow_settings(),
        )
        .await,
    );

    let status = refresher.status().await;
    if status.authenticated {
        info!(
            account_id = status.account_id.as_deref().unwrap_or_default(),
            expires_in_secs = status.expires_in_secs.unwrap_or_default(),
            "loaded stored session"
        );
    } else {
        warn!(
            listen_addr = %config.server.listen_addr,
            "no stored session; visit /auth/login to sign in"
        );
    }

    let refresh_task = (config.refresh.interval_secs > 0).then(|| {
        spawn_refresh_task(
            refresher.clone(),
            Duration::from_secs(config.refresh.interval_secs),
            config.refresh.background_threshold(),
        )
    });

    let client = CodexClient::new(config.backend.client_config())
        .context("failed to build backend HTTP client")?;

    let stats = ServiceStats::new();
    let app_state = AppState {
        chat: ChatState {
            translator: Arc::new(RequestTranslator::new(config.translator_options())),
            invoker: Arc::new(client),
            refresher: refresher.clone(),
            stats: stats.clone(),
            api_key: config.server.api_key.clone(),
        },
        auth: AuthState { flow, refresher },
        prometheus: prometheus_handle,
    };

    let callback_server = match config.oauth.callback_listen_addr {
        Some(addr) if addr != config.server.listen_addr => {
            Some(spawn_callback_listener(addr, app_state.auth.clone()).await)
        }
        _ => None,
    };

    let listen_addr = config.server.listen_addr;
    let app = build_router(app_state, config.server.max_connections);

    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "accepting requests");

    // The drain timeout starts when the shutdown signal fires, not when the
    // server starts: notify the server to drain, then race it against the timer.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;

    if let Some(task) = refresh_task {
        task.abort();
    }
    if let Some(task) = callback_server {
        task.abort();
    }

    let _ = shutdown_tx.send(());

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => {
            info!("all in-flight requests drained");
        }
        Ok(Ok(Err(e))) => {
            error!(error = %e, "server error during shutdown");
        }
        Ok(Err(e)) => {
            error!(error = %e, "server task panicked");
        }
        Err(_) => {
            warn!(
                remaining = stats.in_flight(),
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }

    info!("shutdown complete");
    Ok(())
}

/// Serve `/auth/callback` on the port the registered redirect URI points at.
///
/// A bind failure is logged rather than fatal: the login can still be
/// completed through the main listener when the redirect is forwarded.
async fn spawn_callback_listener(
    addr: SocketAddr,
    state: AuthState,
) -> tokio::task::JoinHandle<()> {
    let app = auth_routes::build_callback_router(state);
    tokio::spawn(async move {
        let listener = match TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(e) => {
                warn!(addr = %addr, error = %e, "failed to bind OAuth callback listener");
                return;
            }
        };
        info!(addr = %addr, "OAuth callback listener ready");
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "OAuth callback listener failed");
        }
    })
}

/// Liveness plus session presence. Always 200; an unauthenticated proxy is
/// still healthy, it just needs a login.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let stats = &state.chat.stats;
    let auth = state.auth.refresher.status().await;

    axum::Json(serde_json::json!({
        "status": "healthy",
        "authenticated": auth.authenticated,
        "token_valid": auth.valid,
        "uptime_seconds": stats.uptime_secs(),
        "requests_served": stats.requests_total(),
        "errors_total": stats.errors_total(),
        "in_flight": stats.in_flight(),
    }))
}

/// Prometheus metrics endpoint, text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        axum::http::StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
