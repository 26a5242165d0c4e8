//! Translation between OpenAI Chat Completions and the Codex Responses backend
//!
//! - [`RequestTranslator`] validates a chat request and builds the backend payload.
//! - [`ResponseCollector`] interprets the backend's SSE event sequence.
//! - [`ResponseTranslator`] renders a folded response as a `chat.completion`.
//! - [`StreamTranslator`] renders events incrementally as `chat.completion.chunk`s.
//! - [`TextCompletion`] re-renders either form for legacy `/v1/completions`.
//!
//! Nothing here performs I/O; the provider crate feeds parsed events in and
//! the service writes the results out.

pub mod completion;
pub mod error;
pub mod event;
pub mod request;
pub mod response;
pub mod stream;
pub mod types;

pub use completion::{TextChoice, TextCompletion};
pub use error::{Result, ValidationError};
pub use event::BackendEvent;
pub use request::{
    IGNORED_FIELDS, ModelCatalog, ModelEntry, RequestTranslator, TranslatedRequest,
    TranslatorOptions,
};
pub use response::{
    BackendResponse, CollectError, Completion, ResponseCollector, ResponseContext,
    ResponseTranslator,
};
pub use stream::{ChunkAccumulator, StreamTranslator};
pub use types::{
    BackendRequest, ChatCompletionChunk, ChatCompletionResponse, ChatRequest, FinishReason,
    ReasoningCompat, ReasoningEffort, ReasoningSummary, Usage,
};
