//! ChatGPT OAuth authentication library
//!
//! Provides the PKCE login flow, token exchange/refresh against the OpenAI
//! auth server, and crash-safe storage of the resulting session bundle. The
//! crate has no dependency on the proxy binary and can be tested on its own.
//!
//! Session lifecycle:
//! 1. `flow::OAuthFlowController::begin_login()` returns the authorization URL
//! 2. The browser redirects back; `complete_callback()` checks the state and
//!    exchanges the code via `token::exchange_code()`
//! 3. The bundle is persisted through `store::TokenStore::save()`
//! 4. Every request calls `refresh::TokenRefresher::ensure_valid()`, which
//!    refreshes inside the safety margin (single-flight)
//! 5. `refresh::spawn_refresh_task()` refreshes proactively in the background

pub mod bundle;
pub mod constants;
pub mod error;
pub mod flow;
pub mod jwt;
pub mod pkce;
pub mod refresh;
pub mod store;
pub mod token;

pub use bundle::{AuthBundle, TokenData};
pub use constants::OAuthConfig;
pub use error::{Error, Result};
pub use flow::{FlowSettings, LoginStart, LoginState, OAuthFlowController};
pub use pkce::PkceCodes;
pub use refresh::{AuthStatus, RefreshPolicy, TokenRefresher, spawn_refresh_task};
pub use store::TokenStore;
