//! OpenAI-compatible API surface
//!
//! - POST /v1/chat/completions  translate, authenticate, invoke, translate back
//! - POST /v1/completions       legacy text completions over the same path
//! - GET  /v1/models            the configured model catalog
//! - GET  /v1/models/{id}
//!
//! Streaming responses are Server-Sent Events: one `data:` line per
//! chunk (`chat.completion.chunk` or `text_completion`), then `data: [DONE]`. Failures after the headers
//! went out are reported in-band as a final chunk carrying an `error`.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;

use axum::Json;
use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::{Path, Request, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use chat_translate::{
    ChatCompletionChunk, RequestTranslator, ResponseContext, ResponseTranslator, StreamTranslator,
    TextCompletion, TranslatedRequest,
};
use codex_auth::TokenRefresher;
use common::Secret;
use futures_util::StreamExt;
use provider::{BackendEventStream, Credentials, ProxyInvoker};
use serde_json::json;
use tracing::{Instrument, info, info_span, warn};

use crate::error::ApiError;
use crate::metrics::{self, InFlightGuard, ServiceStats};

/// Largest accepted request body. Long conversations with images get big.
const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

const DONE_FRAME: &[u8] = b"data: [DONE]\n\n";

/// Shared state for the `/v1` handlers.
#[derive(Clone)]
pub struct ChatState {
    pub translator: Arc<RequestTranslator>,
    pub invoker: Arc<dyn ProxyInvoker>,
    pub refresher: TokenRefresher,
    pub stats: ServiceStats,
    /// Key clients must present; None disables the check.
    pub api_key: Option<Secret<String>>,
}

pub fn build_chat_router(state: ChatState) -> Router {
    let api_key = state.api_key.clone();
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/completions", post(text_completions))
        .route("/v1/models", get(list_models))
        .route("/v1/models/{id}", get(get_model))
        .layer(axum::extract::DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(axum::middleware::from_fn_with_state(api_key, require_api_key))
        .with_state(state)
}

/// Reject `/v1` requests without the configured key. Accepts
/// `Authorization: Bearer <key>` or `x-api-key: <key>`.
async fn require_api_key(
    State(api_key): State<Option<Secret<String>>>,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = api_key else {
        return next.run(request).await;
    };

    if presented_key(request.headers()).is_some_and(|key| expected.eq_constant_time(key)) {
        next.run(request).await
    } else {
        warn!(path = %request.uri().path(), "rejected request with missing or invalid API key");
        ApiError::unauthorized("missing or invalid API key").into_response()
    }
}

fn presented_key(headers: &HeaderMap) -> Option<&str> {
    if let Some(value) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        && let Some(token) = value.strip_prefix("Bearer ")
    {
        return Some(token.trim());
    }
    headers.get("x-api-key").and_then(|v| v.to_str().ok()).map(str::trim)
}

/// Which OpenAI surface a request came in on. Both share translation and
/// invocation; only the request parser and the rendered objects differ.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Api {
    Chat,
    Text,
}

impl Api {
    fn translate(
        self,
        translator: &RequestTranslator,
        body: &[u8],
    ) -> Result<TranslatedRequest, ApiError> {
        let translated = match self {
            Api::Chat => translator.translate_json(body)?,
            Api::Text => translator.translate_completion_json(body)?,
        };
        Ok(translated)
    }

    fn encode(self, chunk: &ChatCompletionChunk) -> Option<Bytes> {
        match self {
            Api::Chat => encode_frame(chunk),
            Api::Text => TextCompletion::from_chunk(chunk).and_then(|text| encode_frame(&text)),
        }
    }
}

async fn chat_completions(State(state): State<ChatState>, body: Bytes) -> Response {
    handle(state, Api::Chat, body).await
}

async fn text_completions(State(state): State<ChatState>, body: Bytes) -> Response {
    handle(state, Api::Text, body).await
}

async fn handle(state: ChatState, api: Api, body: Bytes) -> Response {
    let request_id = format!("req_{}", uuid::Uuid::new_v4().simple());
    let started = Instant::now();
    let guard = state.stats.begin();
    let mut stream = false;

    let span = match api {
        Api::Chat => info_span!("chat_completion", request_id = %request_id),
        Api::Text => info_span!("text_completion", request_id = %request_id),
    };
    let result = process(&state, api, &request_id, &body, guard, &mut stream)
        .instrument(span)
        .await;

    let response = match result {
        Ok(response) => response,
        Err(err) => {
            state.stats.record_error();
            warn!(
                request_id,
                status = err.status.as_u16(),
                code = err.code.unwrap_or_default(),
                error = %err.message,
                ?api,
                "completion failed"
            );
            err.with_request_id(&request_id).into_response()
        }
    };

    // For streams this is the time to response headers
    metrics::record_request(
        response.status().as_u16(),
        stream,
        started.elapsed().as_secs_f64(),
    );
    response
}

async fn process(
    state: &ChatState,
    api: Api,
    request_id: &str,
    body: &[u8],
    guard: InFlightGuard,
    stream: &mut bool,
) -> Result<Response, ApiError> {
    let translated = api.translate(&state.translator, body)?;
    *stream = translated.stream;

    let bundle = state.refresher.current_valid().await?;
    let credentials = Credentials {
        access_token: bundle.token_data.access_token.clone(),
        account_id: bundle.token_data.account_id.clone(),
    };

    info!(
        model = %translated.model,
        backend_model = %translated.backend.model,
        stream = translated.stream,
        messages = translated.backend.input.len(),
        tools = translated.backend.tools.len(),
        ?api,
        "forwarding completion"
    );

    let ctx = ResponseContext::new(translated.model.clone(), translated.compat)
        .with_usage(translated.include_usage);

    if translated.stream {
        let events = state
            .invoker
            .invoke_stream(&translated.backend, &credentials)
            .await
            .inspect_err(|e| metrics::record_upstream_error(e.error_type()))?;
        let body = sse_body(api, events, StreamTranslator::new(ctx), guard, request_id.to_owned());
        return Ok((
            [
                (header::CONTENT_TYPE, "text/event-stream"),
                (header::CACHE_CONTROL, "no-cache"),
            ],
            body,
        )
            .into_response());
    }

    let response = state
        .invoker
        .invoke(&translated.backend, &credentials)
        .await
        .inspect_err(|e| metrics::record_upstream_error(e.error_type()))?;
    let completion = ResponseTranslator::translate(&response, &ctx);
    info!(
        finish_reason = ?response.finish_reason(),
        tool_calls = response.tool_calls.len(),
        "completion finished"
    );
    Ok(match api {
        Api::Chat => Json(completion).into_response(),
        Api::Text => Json(TextCompletion::from_chat(&completion)).into_response(),
    })
}

fn encode_frame<T: serde::Serialize>(chunk: &T) -> Option<Bytes> {
    match serde_json::to_string(chunk) {
        Ok(json) => Some(Bytes::from(format!("data: {json}\n\n"))),
        Err(e) => {
            warn!(error = %e, "failed to encode chunk");
            None
        }
    }
}

/// Relay backend events as chunks. Always ends with `data: [DONE]`.
fn sse_body(
    api: Api,
    mut events: BackendEventStream,
    mut translator: StreamTranslator,
    guard: InFlightGuard,
    request_id: String,
) -> Body {
    let frames = async_stream::stream! {
        let _guard = guard;
        while let Some(item) = events.next().await {
            let chunks = match item {
                Ok(event) => translator.on_event(&event),
                Err(e) => {
                    metrics::record_upstream_error(e.error_type());
                    warn!(request_id, error = %e, "backend stream failed");
                    translator.interrupt(e.to_string())
                }
            };
            for chunk in &chunks {
                if let Some(frame) = api.encode(chunk) {
                    yield Ok::<_, Infallible>(frame);
                }
            }
            if translator.is_done() {
                break;
            }
        }

        if !translator.is_done() {
            for chunk in &translator.interrupt("backend stream ended before completion") {
                if let Some(frame) = api.encode(chunk) {
                    yield Ok(frame);
                }
            }
        }
        info!(request_id, "stream finished");
        yield Ok(Bytes::from_static(DONE_FRAME));
    };
    Body::from_stream(frames)
}

fn model_object(id: &str) -> serde_json::Value {
    json!({
        "id": id,
        "object": "model",
        "created": 0,
        "owned_by": "openai",
    })
}

async fn list_models(State(state): State<ChatState>) -> impl IntoResponse {
    let data: Vec<_> = state
        .translator
        .options()
        .models
        .entries()
        .iter()
        .map(|entry| model_object(&entry.id))
        .collect();
    Json(json!({ "object": "list", "data": data }))
}

async fn get_model(
    State(state): State<ChatState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    match state.translator.options().models.resolve(&id) {
        Some(entry) => Ok((StatusCode::OK, Json(model_object(&entry.id)))),
        None => Err(ApiError::not_found(format!("model '{id}' does not exist"))),
    }
}
