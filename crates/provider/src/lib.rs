//! Backend invocation for the Codex Responses API
//!
//! Defines the `ProxyInvoker` trait that decouples the HTTP service from the
//! backend transport. `CodexClient` is the production implementation:
//! authenticated POSTs, SSE decoding, upstream error classification and
//! bounded retries.

pub mod classify;
pub mod client;
pub mod error;

pub use classify::{ErrorClassification, classify_status};
pub use client::{BackendEventStream, ClientConfig, CodexClient, Credentials, collect};
pub use error::{InvokeError, Result};

use chat_translate::response::BackendResponse;
use chat_translate::types::BackendRequest;
use std::future::Future;
use std::pin::Pin;

/// Authenticated call to the backend, unary or streaming.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility
/// (`Arc<dyn ProxyInvoker>`).
pub trait ProxyInvoker: Send + Sync {
    /// Call and fold the complete response. Retries cover the whole exchange.
    fn invoke<'a>(
        &'a self,
        request: &'a BackendRequest,
        credentials: &'a Credentials,
    ) -> Pin<Box<dyn Future<Output = Result<BackendResponse>> + Send + 'a>>;

    /// Open the event stream. Retries stop once response headers arrive.
    fn invoke_stream<'a>(
        &'a self,
        request: &'a BackendRequest,
        credentials: &'a Credentials,
    ) -> Pin<Box<dyn Future<Output = Result<BackendEventStream>> + Send + 'a>>;
}

impl ProxyInvoker for CodexClient {
    fn invoke<'a>(
        &'a self,
        request: &'a BackendRequest,
        credentials: &'a Credentials,
    ) -> Pin<Box<dyn Future<Output = Result<BackendResponse>> + Send + 'a>> {
        Box::pin(CodexClient::invoke(self, request, credentials))
    }

    fn invoke_stream<'a>(
        &'a self,
        request: &'a BackendRequest,
        credentials: &'a Credentials,
    ) -> Pin<Box<dyn Future<Output = Result<BackendEventStream>> + Send + 'a>> {
        Box::pin(CodexClient::invoke_stream(self, request, credentials))
    }
}
