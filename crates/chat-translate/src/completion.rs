//! Legacy text completions (`/v1/completions`)
//!
//! A text completion is a chat completion with the prompt as the only user
//! message. Rendering reuses the chat output and keeps only the text.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{ChatCompletionChunk, ChatCompletionResponse, ChunkError, FinishReason, Usage};

const OBJECT: &str = "text_completion";

/// `text_completion` object, used for the full response and for each
/// streamed chunk alike.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextCompletion {
    pub id: String,
    pub object: String,
    pub created: u64,
    pub model: String,
    pub choices: Vec<TextChoice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ChunkError>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextChoice {
    pub index: u32,
    pub text: String,
    /// Never produced by the backend; always `null`.
    pub logprobs: Option<Value>,
    pub finish_reason: Option<FinishReason>,
}

fn completion_id(chat_id: &str) -> String {
    match chat_id.strip_prefix("chatcmpl-") {
        Some(rest) => format!("cmpl-{rest}"),
        None => chat_id.to_owned(),
    }
}

impl TextCompletion {
    pub fn from_chat(response: &ChatCompletionResponse) -> Self {
        Self {
            id: completion_id(&response.id),
            object: OBJECT.to_owned(),
            created: response.created,
            model: response.model.clone(),
            choices: response
                .choices
                .iter()
                .map(|choice| TextChoice {
                    index: choice.index,
                    text: choice.message.content.clone().unwrap_or_default(),
                    logprobs: None,
                    finish_reason: choice.finish_reason,
                })
                .collect(),
            usage: response.usage,
            error: None,
        }
    }

    /// Render one chat chunk. Chunks carrying nothing a text client can use
    /// (reasoning or tool deltas) yield `None`.
    pub fn from_chunk(chunk: &ChatCompletionChunk) -> Option<Self> {
        let choices: Vec<TextChoice> = chunk
            .choices
            .iter()
            .filter(|choice| choice.delta.content.is_some() || choice.finish_reason.is_some())
            .map(|choice| TextChoice {
                index: choice.index,
                text: choice.delta.content.clone().unwrap_or_default(),
                logprobs: None,
                finish_reason: choice.finish_reason,
            })
            .collect();

        if choices.is_empty() && chunk.usage.is_none() && chunk.error.is_none() {
            return None;
        }
        Some(Self {
            id: completion_id(&chunk.id),
            object: OBJECT.to_owned(),
            created: chunk.created,
            model: chunk.model.clone(),
            choices,
            usage: chunk.usage,
            error: chunk.error.clone(),
        })
    }

    /// Concatenated text of the first choice.
    pub fn text(&self) -> &str {
        self.choices.first().map_or("", |choice| choice.text.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::test_events::text_sequence;
    use crate::response::{ResponseCollector, ResponseContext, ResponseTranslator};
    use crate::stream::StreamTranslator;
    use crate::types::ReasoningCompat;

    fn ctx() -> ResponseContext {
        ResponseContext::new("gpt-5", ReasoningCompat::Current).with_usage(true)
    }

    #[test]
    fn full_response_keeps_text_and_usage() {
        let mut collector = ResponseCollector::new();
        for event in text_sequence(&["Once ", "upon"]) {
            collector.apply(&event);
        }
        let chat = ResponseTranslator::translate(&collector.finish().unwrap(), &ctx());

        let out = TextCompletion::from_chat(&chat);
        assert!(out.id.starts_with("cmpl-"), "{}", out.id);
        assert_eq!(out.object, "text_completion");
        assert_eq!(out.text(), "Once upon");
        assert_eq!(out.choices[0].finish_reason, Some(FinishReason::Stop));
        assert_eq!(out.usage.unwrap().total_tokens, 5);

        let json = serde_json::to_value(&out).unwrap();
        assert!(json["choices"][0]["logprobs"].is_null());
    }

    #[test]
    fn stream_chunks_carry_text_and_finish() {
        let mut translator = StreamTranslator::new(ctx());
        let rendered: Vec<TextCompletion> = text_sequence(&["Once ", "upon"])
            .iter()
            .flat_map(|event| translator.on_event(event))
            .filter_map(|chunk| TextCompletion::from_chunk(&chunk))
            .collect();

        let text: String = rendered.iter().map(TextCompletion::text).collect();
        assert_eq!(text, "Once upon");
        assert!(rendered.iter().all(|c| c.object == "text_completion"));
        assert!(
            rendered
                .iter()
                .any(|c| c.choices.iter().any(|ch| ch.finish_reason == Some(FinishReason::Stop)))
        );
        assert!(rendered.iter().any(|c| c.usage.is_some()));
    }

    #[test]
    fn interrupted_stream_keeps_error() {
        let mut translator = StreamTranslator::new(ctx());
        let chunks = translator.interrupt("backend went away");
        let rendered: Vec<_> = chunks.iter().filter_map(TextCompletion::from_chunk).collect();
        let last = rendered.last().unwrap();
        assert_eq!(last.error.as_ref().unwrap().message, "backend went away");
        assert_eq!(last.choices[0].finish_reason, Some(FinishReason::Error));
    }
}
