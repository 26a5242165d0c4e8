//! HTTP client for the Codex Responses endpoint
//!
//! The backend only speaks SSE, so both invocation modes read an event
//! stream. `invoke_stream` hands the events to the caller as they arrive;
//! `invoke` folds them into a [`BackendResponse`] before returning.

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chat_translate::event::BackendEvent;
use chat_translate::response::{BackendResponse, CollectError, ResponseCollector};
use chat_translate::types::BackendRequest;
use eventsource_stream::{Event, EventStreamError, Eventsource};
use futures_util::{Stream, StreamExt};
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, RETRY_AFTER};
use tracing::{debug, instrument, warn};

use crate::error::{InvokeError, Result};

/// Stream of backend events. Ends after the terminal event, or with an error.
pub type BackendEventStream = Pin<Box<dyn Stream<Item = Result<BackendEvent>> + Send>>;

/// Access token and account id for one backend call.
#[derive(Clone)]
pub struct Credentials {
    pub access_token: String,
    pub account_id: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_token", &"[REDACTED]")
            .field("account_id", &self.account_id)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// e.g. `https://chatgpt.com/backend-api/codex`
    pub base_url: String,
    /// Overall deadline for one attempt, body included.
    pub timeout: Duration,
    pub connect_timeout: Duration,
    /// Longest gap allowed between two stream chunks.
    pub idle_timeout: Duration,
    pub max_attempts: u32,
    pub retry_backoff: Duration,
    pub originator: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "https://chatgpt.com/backend-api/codex".to_owned(),
            timeout: Duration::from_secs(600),
            connect_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(120),
            max_attempts: 3,
            retry_backoff: Duration::from_millis(250),
            originator: "codex_cli_rs".to_owned(),
        }
    }
}

/// Authenticated Responses API client. Cheap to clone.
#[derive(Clone)]
pub struct CodexClient {
    http: reqwest::Client,
    config: Arc<ClientConfig>,
}

impl CodexClient {
    pub fn new(config: ClientConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(InvokeError::from_transport)?;
        Ok(Self::with_client(http, config))
    }

    pub fn with_client(http: reqwest::Client, config: ClientConfig) -> Self {
        Self {
            http,
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn endpoint(&self) -> String {
        format!("{}/responses", self.config.base_url.trim_end_matches('/'))
    }

    /// One POST; a non-success status becomes a classified error.
    async fn send(
        &self,
        request: &BackendRequest,
        credentials: &Credentials,
    ) -> Result<reqwest::Response> {
        let response = self
            .http
            .post(self.endpoint())
            .header(AUTHORIZATION, format!("Bearer {}", credentials.access_token))
            .header("chatgpt-account-id", &credentials.account_id)
            .header("OpenAI-Beta", "responses=experimental")
            .header("originator", &self.config.originator)
            .header(ACCEPT, "text/event-stream")
            .header(CONTENT_TYPE, "application/json")
            .timeout(self.config.timeout)
            .json(request)
            .send()
            .await
            .map_err(InvokeError::from_transport)?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        let body = response.text().await.unwrap_or_default();
        let err = InvokeError::from_status(status.as_u16(), &body, retry_after);
        warn!(
            status = status.as_u16(),
            error_type = err.error_type(),
            "backend returned error status"
        );
        Err(err)
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.config.retry_backoff * 2u32.saturating_pow(attempt.saturating_sub(1))
    }

    /// Open an event stream, retrying until response headers arrive.
    ///
    /// Once events flow nothing is retried: the client may already have
    /// seen output.
    #[instrument(skip_all, fields(model = %request.model))]
    pub async fn invoke_stream(
        &self,
        request: &BackendRequest,
        credentials: &Credentials,
    ) -> Result<BackendEventStream> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.send(request, credentials).await {
                Ok(response) => {
                    debug!(attempt, "backend stream opened");
                    return Ok(event_stream(response, self.config.idle_timeout));
                }
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    warn!(attempt, error = %e, "backend call failed, retrying");
                    tokio::time::sleep(self.backoff(attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Call the backend and fold the whole event stream.
    ///
    /// Retries cover the send and the full collection, so a stream that
    /// breaks off mid-way is re-requested from scratch.
    #[instrument(skip_all, fields(model = %request.model))]
    pub async fn invoke(
        &self,
        request: &BackendRequest,
        credentials: &Credentials,
    ) -> Result<BackendResponse> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let result = match self.send(request, credentials).await {
                Ok(response) => collect(event_stream(response, self.config.idle_timeout)).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    warn!(attempt, error = %e, "backend call failed, retrying");
                    tokio::time::sleep(self.backoff(attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Fold an event stream into a complete response.
pub async fn collect(mut events: BackendEventStream) -> Result<BackendResponse> {
    let mut collector = ResponseCollector::new();
    while let Some(event) = events.next().await {
        collector.apply(&event?);
        if collector.is_finished() {
            break;
        }
    }
    collector.finish().map_err(|e| match e {
        CollectError::Failed(message) => InvokeError::Failed(message),
        CollectError::Truncated => InvokeError::Interrupted(CollectError::Truncated.to_string()),
    })
}

fn decode(event: &Event) -> Option<Result<BackendEvent>> {
    let data = event.data.trim();
    if data.is_empty() || data == "[DONE]" {
        return None;
    }
    Some(BackendEvent::parse(data).map_err(|e| InvokeError::Malformed(e.to_string())))
}

/// Turn a response body into parsed events.
///
/// Enforces the idle timeout between SSE events, stops after the first
/// terminal event, and reports a body that ends without one as `Interrupted`.
fn event_stream(response: reqwest::Response, idle_timeout: Duration) -> BackendEventStream {
    Box::pin(async_stream::stream! {
        let events = response.bytes_stream().eventsource();
        futures_util::pin_mut!(events);

        loop {
            let next = match tokio::time::timeout(idle_timeout, events.next()).await {
                Ok(next) => next,
                Err(_) => {
                    yield Err(InvokeError::Timeout(format!(
                        "no stream data for {}s",
                        idle_timeout.as_secs()
                    )));
                    return;
                }
            };

            let sse = match next {
                Some(Ok(sse)) => sse,
                Some(Err(EventStreamError::Transport(e))) => {
                    yield Err(InvokeError::Interrupted(e.without_url().to_string()));
                    return;
                }
                Some(Err(e)) => {
                    yield Err(InvokeError::Malformed(e.to_string()));
                    return;
                }
                None => {
                    yield Err(InvokeError::Interrupted(
                        "backend stream ended before completion".to_owned(),
                    ));
                    return;
                }
            };

            match decode(&sse) {
                Some(Ok(event)) => {
                    let terminal = event.is_terminal();
                    yield Ok(event);
                    if terminal {
                        return;
                    }
                }
                Some(Err(e)) => {
                    yield Err(e);
                    return;
                }
                None => {}
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::body::Body;
    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode, header};
    use axum::response::{IntoResponse, Response};
    use axum::routing::post;
    use chat_translate::response::Segment;
    use serde_json::{Value, json};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Clone, Default)]
    struct Backend {
        hits: Arc<AtomicU32>,
        last_headers: Arc<Mutex<Option<HeaderMap>>>,
        last_body: Arc<Mutex<Option<Value>>>,
    }

    async fn start_backend<F>(backend: Backend, respond: F) -> String
    where
        F: Fn(u32) -> Response + Clone + Send + Sync + 'static,
    {
        let app = Router::new()
            .route(
                "/backend-api/codex/responses",
                post(move |State(b): State<Backend>, headers: HeaderMap, body: String| {
                    let respond = respond.clone();
                    async move {
                        let n = b.hits.fetch_add(1, Ordering::SeqCst) + 1;
                        *b.last_headers.lock().unwrap() = Some(headers);
                        *b.last_body.lock().unwrap() = serde_json::from_str(&body).ok();
                        respond(n)
                    }
                }),
            )
            .with_state(backend);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{addr}/backend-api/codex")
    }

    fn sse_body(events: &[Value]) -> String {
        events
            .iter()
            .map(|e| format!("event: {}\ndata: {}\n\n", e["type"].as_str().unwrap(), e))
            .collect()
    }

    fn sse_response(events: &[Value]) -> Response {
        (
            [(header::CONTENT_TYPE, "text/event-stream")],
            sse_body(events),
        )
            .into_response()
    }

    fn hello_events() -> Vec<Value> {
        vec![
            json!({ "type": "response.created", "response": { "id": "resp_1" } }),
            json!({ "type": "response.output_text.delta", "delta": "Hel" }),
            json!({ "type": "response.output_text.delta", "delta": "lo" }),
            json!({ "type": "response.completed", "response": { "id": "resp_1", "usage": { "input_tokens": 4, "output_tokens": 2, "total_tokens": 6 } } }),
        ]
    }

    fn client(base_url: String) -> CodexClient {
        CodexClient::new(ClientConfig {
            base_url,
            idle_timeout: Duration::from_millis(300),
            retry_backoff: Duration::from_millis(1),
            ..ClientConfig::default()
        })
        .unwrap()
    }

    fn request() -> BackendRequest {
        BackendRequest {
            model: "gpt-5".into(),
            instructions: "base".into(),
            input: vec![],
            tools: vec![],
            tool_choice: json!("auto"),
            parallel_tool_calls: false,
            store: false,
            stream: true,
            include: vec![],
            reasoning: None,
            text: None,
        }
    }

    fn creds() -> Credentials {
        Credentials {
            access_token: "at_secret".into(),
            account_id: "acct-1".into(),
        }
    }

    #[tokio::test]
    async fn stream_sends_backend_headers_and_yields_events() {
        let backend = Backend::default();
        let url = start_backend(backend.clone(), |_| sse_response(&hello_events())).await;

        let events: Vec<_> = client(url)
            .invoke_stream(&request(), &creds())
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(events.len(), 4);
        assert!(events.iter().all(|e| e.is_ok()));
        assert!(matches!(events[3], Ok(BackendEvent::Completed { .. })));

        let headers = backend.last_headers.lock().unwrap().clone().unwrap();
        assert_eq!(headers["authorization"], "Bearer at_secret");
        assert_eq!(headers["chatgpt-account-id"], "acct-1");
        assert_eq!(headers["openai-beta"], "responses=experimental");
        assert_eq!(headers["originator"], "codex_cli_rs");
        assert_eq!(headers["accept"], "text/event-stream");

        let body = backend.last_body.lock().unwrap().clone().unwrap();
        assert_eq!(body["model"], "gpt-5");
        assert_eq!(body["stream"], true);
        assert_eq!(body["store"], false);
    }

    #[tokio::test]
    async fn invoke_folds_events() {
        let url = start_backend(Backend::default(), |_| sse_response(&hello_events())).await;
        let response = client(url).invoke(&request(), &creds()).await.unwrap();
        assert_eq!(response.segments, vec![Segment::Text("Hello".into())]);
        assert_eq!(response.usage.unwrap().total_tokens, 6);
    }

    #[tokio::test]
    async fn transient_errors_are_retried() {
        let backend = Backend::default();
        let url = start_backend(backend.clone(), |n| {
            if n < 3 {
                (StatusCode::SERVICE_UNAVAILABLE, "busy").into_response()
            } else {
                sse_response(&hello_events())
            }
        })
        .await;

        let response = client(url).invoke(&request(), &creds()).await.unwrap();
        assert_eq!(response.segments, vec![Segment::Text("Hello".into())]);
        assert_eq!(backend.hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn persistent_5xx_exhausts_attempts() {
        let backend = Backend::default();
        let url = start_backend(backend.clone(), |_| {
            (StatusCode::BAD_GATEWAY, "upstream down").into_response()
        })
        .await;

        let err = client(url).invoke_stream(&request(), &creds()).await.err().unwrap();
        assert!(matches!(err, InvokeError::Unavailable(ref m) if m.contains("502")));
        assert_eq!(backend.hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn unauthorized_is_not_retried() {
        let backend = Backend::default();
        let url = start_backend(backend.clone(), |_| {
            (StatusCode::UNAUTHORIZED, r#"{"detail":"token expired"}"#).into_response()
        })
        .await;

        let err = client(url).invoke(&request(), &creds()).await.unwrap_err();
        assert_eq!(err, InvokeError::Unauthorized { status: 401 });
        assert_eq!(backend.hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn usage_limit_429_is_quota() {
        let url = start_backend(Backend::default(), |_| {
            (
                StatusCode::TOO_MANY_REQUESTS,
                [(header::RETRY_AFTER, "120")],
                r#"{"error":{"type":"usage_limit_reached","message":"The usage limit has been reached"}}"#,
            )
                .into_response()
        })
        .await;

        let err = client(url).invoke(&request(), &creds()).await.unwrap_err();
        assert_eq!(
            err,
            InvokeError::RateLimited {
                quota_exhausted: true,
                retry_after_secs: Some(120),
                message: "The usage limit has been reached".into()
            }
        );
    }

    #[tokio::test]
    async fn truncated_stream_is_retried_then_interrupted() {
        let backend = Backend::default();
        let url = start_backend(backend.clone(), |_| sse_response(&hello_events()[..2])).await;

        let err = client(url).invoke(&request(), &creds()).await.unwrap_err();
        assert!(matches!(err, InvokeError::Interrupted(_)));
        assert_eq!(backend.hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn truncated_stream_ends_with_interrupted_item() {
        let url = start_backend(Backend::default(), |_| sse_response(&hello_events()[..2])).await;
        let events: Vec<_> = client(url)
            .invoke_stream(&request(), &creds())
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(events.len(), 3);
        assert!(matches!(events[2], Err(InvokeError::Interrupted(_))));
    }

    #[tokio::test]
    async fn chunked_body_with_keepalives_and_split_utf8() {
        let url = start_backend(Backend::default(), |_| {
            let events = [
                json!({ "type": "response.created", "response": { "id": "resp_2" } }),
                json!({ "type": "response.output_text.delta", "delta": "caf\u{e9}" }),
                json!({ "type": "response.completed", "response": { "id": "resp_2" } }),
            ];
            let text = format!(": keepalive\r\n\r\n{}data: [DONE]\n\n", sse_body(&events));
            let bytes = text.into_bytes();
            let split = bytes.iter().position(|&b| b == 0xc3).unwrap() + 1;
            let chunks = vec![
                Ok::<_, std::convert::Infallible>(bytes[..split].to_vec()),
                Ok(bytes[split..].to_vec()),
            ];
            (
                [(header::CONTENT_TYPE, "text/event-stream")],
                Body::from_stream(futures_util::stream::iter(chunks)),
            )
                .into_response()
        })
        .await;

        let response = client(url).invoke(&request(), &creds()).await.unwrap();
        assert_eq!(response.segments, vec![Segment::Text("caf\u{e9}".into())]);
    }

    #[tokio::test]
    async fn failed_response_is_not_retried() {
        let backend = Backend::default();
        let url = start_backend(backend.clone(), |_| {
            sse_response(&[json!({
                "type": "response.failed",
                "response": { "error": { "message": "model overloaded" } }
            })])
        })
        .await;

        let err = client(url).invoke(&request(), &creds()).await.unwrap_err();
        assert_eq!(err, InvokeError::Failed("model overloaded".into()));
        assert_eq!(backend.hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn malformed_event_ends_stream() {
        let url = start_backend(Backend::default(), |_| {
            (
                [(header::CONTENT_TYPE, "text/event-stream")],
                "data: {\"type\":\"response.created\"}\n\ndata: {oops\n\n",
            )
                .into_response()
        })
        .await;

        let events: Vec<_> = client(url)
            .invoke_stream(&request(), &creds())
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(events.len(), 2);
        assert!(matches!(events[1], Err(InvokeError::Malformed(_))));
    }

    #[tokio::test]
    async fn idle_stream_times_out() {
        let url = start_backend(Backend::default(), |_| {
            let first = sse_body(&hello_events()[..1]);
            let body = futures_util::stream::iter(vec![Ok::<_, std::convert::Infallible>(first)])
                .chain(futures_util::stream::pending());
            (
                [(header::CONTENT_TYPE, "text/event-stream")],
                Body::from_stream(body),
            )
                .into_response()
        })
        .await;

        let events: Vec<_> = client(url)
            .invoke_stream(&request(), &creds())
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(events.len(), 2);
        assert!(matches!(events[1], Err(InvokeError::Timeout(_))));
    }

    #[test]
    fn credentials_debug_redacts_token() {
        let rendered = format!("{:?}", creds());
        assert!(!rendered.contains("at_secret"));
        assert!(rendered.contains("acct-1"));
    }
}
