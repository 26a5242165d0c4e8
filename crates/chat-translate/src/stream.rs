//! Streaming translation: backend events → `chat.completion.chunk` objects

use crate::event::BackendEvent;
use crate::response::{
    Fragment, ResponseCollector, ResponseContext, THINK_CLOSE, THINK_OPEN, finish_reason,
};
use crate::types::{
    AssistantMessage, ChatCompletionChunk, ChatCompletionResponse, Choice, ChunkChoice, ChunkError,
    Delta, FinishReason, FunctionDelta, ReasoningCompat, ReasoningField,
    ReasoningPart, ToolCall, ToolCallDelta, Usage,
};

/// Stateful per-request translator. Feed events in backend order.
///
/// Once a terminal chunk has been produced (completion, failure or
/// [`interrupt`](Self::interrupt)) every later call returns nothing.
pub struct StreamTranslator {
    ctx: ResponseContext,
    collector: ResponseCollector,
    role_sent: bool,
    think_open: bool,
    done: bool,
}

impl StreamTranslator {
    pub fn new(ctx: ResponseContext) -> Self {
        Self {
            ctx,
            collector: ResponseCollector::new(),
            role_sent: false,
            think_open: false,
            done: false,
        }
    }

    pub fn context(&self) -> &ResponseContext {
        &self.ctx
    }

    /// Whether the terminal chunk has been emitted.
    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn on_event(&mut self, event: &BackendEvent) -> Vec<ChatCompletionChunk> {
        if self.done {
            return Vec::new();
        }

        let mut chunks = Vec::new();
        for fragment in self.collector.apply(event) {
            self.render(fragment, &mut chunks);
        }

        if let Some(outcome) = self.collector.outcome() {
            let outcome = outcome
                .map(|completion| finish_reason(self.collector.has_tool_calls(), completion))
                .map_err(str::to_owned);
            self.close_think(&mut chunks);
            match outcome {
                Ok(reason) => {
                    let usage = if self.ctx.include_usage {
                        self.collector.usage()
                    } else {
                        None
                    };
                    let chunk = self.chunk(Delta::default(), Some(reason), usage, None);
                    chunks.push(chunk);
                }
                Err(message) => {
                    let chunk = self.error_chunk(message, "backend_error");
                    chunks.push(chunk);
                }
            }
            self.done = true;
        }

        chunks
    }

    /// Terminate the stream after a transport failure, malformed event or
    /// premature end of input. Already-emitted chunks stand.
    pub fn interrupt(&mut self, message: impl Into<String>) -> Vec<ChatCompletionChunk> {
        if self.done {
            return Vec::new();
        }
        let mut chunks = Vec::new();
        self.close_think(&mut chunks);
        let chunk = self.error_chunk(message.into(), "stream_interrupted");
        chunks.push(chunk);
        self.done = true;
        chunks
    }

    fn render(&mut self, fragment: Fragment, out: &mut Vec<ChatCompletionChunk>) {
        match fragment {
            Fragment::Text(text) => {
                let content = if self.think_open {
                    self.think_open = false;
                    format!("{THINK_CLOSE}{text}")
                } else {
                    text
                };
                out.push(self.content_chunk(content));
            }
            Fragment::Reasoning(text) => {
                let delta = match self.ctx.compat {
                    ReasoningCompat::ThinkTags => {
                        let content = if self.think_open {
                            text
                        } else {
                            self.think_open = true;
                            format!("{THINK_OPEN}{text}")
                        };
                        Delta {
                            content: Some(content),
                            ..Delta::default()
                        }
                    }
                    ReasoningCompat::Current => Delta {
                        reasoning: Some(ReasoningField::Text(text)),
                        ..Delta::default()
                    },
                    ReasoningCompat::O3 => Delta {
                        reasoning: Some(ReasoningField::Structured {
                            content: vec![ReasoningPart::text(text)],
                        }),
                        ..Delta::default()
                    },
                    ReasoningCompat::Legacy => Delta {
                        reasoning_summary: Some(text),
                        ..Delta::default()
                    },
                };
                out.push(self.chunk(delta, None, None, None));
            }
            Fragment::ToolCallStart {
                index,
                call_id,
                name,
            } => {
                self.close_think(out);
                let delta = Delta {
                    tool_calls: Some(vec![ToolCallDelta {
                        index,
                        id: Some(call_id),
                        kind: Some("function".to_owned()),
                        function: FunctionDelta {
                            name: Some(name),
                            arguments: Some(String::new()),
                        },
                    }]),
                    ..Delta::default()
                };
                out.push(self.chunk(delta, None, None, None));
            }
            Fragment::ToolCallArgs { index, delta } => {
                let delta = Delta {
                    tool_calls: Some(vec![ToolCallDelta {
                        index,
                        id: None,
                        kind: None,
                        function: FunctionDelta {
                            name: None,
                            arguments: Some(delta),
                        },
                    }]),
                    ..Delta::default()
                };
                out.push(self.chunk(delta, None, None, None));
            }
        }
    }

    fn close_think(&mut self, out: &mut Vec<ChatCompletionChunk>) {
        if self.think_open {
            self.think_open = false;
            out.push(self.content_chunk(THINK_CLOSE.to_owned()));
        }
    }

    fn content_chunk(&mut self, content: String) -> ChatCompletionChunk {
        let delta = Delta {
            content: Some(content),
            ..Delta::default()
        };
        self.chunk(delta, None, None, None)
    }

    fn error_chunk(&mut self, message: String, kind: &str) -> ChatCompletionChunk {
        let error = ChunkError {
            message,
            kind: kind.to_owned(),
        };
        self.chunk(Delta::default(), Some(FinishReason::Error), None, Some(error))
    }

    fn chunk(
        &mut self,
        mut delta: Delta,
        finish_reason: Option<FinishReason>,
        usage: Option<Usage>,
        error: Option<ChunkError>,
    ) -> ChatCompletionChunk {
        if !self.role_sent {
            self.role_sent = true;
            delta.role = Some("assistant".to_owned());
        }
        ChatCompletionChunk {
            id: self.ctx.id.clone(),
            object: "chat.completion.chunk".to_owned(),
            created: self.ctx.created,
            model: self.ctx.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason,
            }],
            usage,
            error,
        }
    }
}

/// Reassembles a chunk sequence into the equivalent `chat.completion`.
#[derive(Debug, Default)]
pub struct ChunkAccumulator {
    id: String,
    created: u64,
    model: String,
    content: String,
    reasoning_text: Option<String>,
    reasoning_parts: Option<String>,
    reasoning_summary: Option<String>,
    tool_calls: Vec<ToolCall>,
    finish_reason: Option<FinishReason>,
    usage: Option<Usage>,
    error: Option<ChunkError>,
}

impl ChunkAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &ChatCompletionChunk) {
        if self.id.is_empty() {
            self.id = chunk.id.clone();
            self.created = chunk.created;
            self.model = chunk.model.clone();
        }
        if chunk.usage.is_some() {
            self.usage = chunk.usage;
        }
        if let Some(error) = &chunk.error {
            self.error = Some(error.clone());
        }

        for choice in &chunk.choices {
            let delta = &choice.delta;
            if let Some(content) = &delta.content {
                self.content.push_str(content);
            }
            match &delta.reasoning {
                Some(ReasoningField::Text(text)) => {
                    self.reasoning_text.get_or_insert_default().push_str(text)
                }
                Some(ReasoningField::Structured { content }) => {
                    let buf = self.reasoning_parts.get_or_insert_default();
                    for part in content {
                        buf.push_str(&part.text);
                    }
                }
                None => {}
            }
            if let Some(summary) = &delta.reasoning_summary {
                self.reasoning_summary.get_or_insert_default().push_str(summary);
            }
            for call in delta.tool_calls.iter().flatten() {
                let index = call.index as usize;
                while self.tool_calls.len() <= index {
                    self.tool_calls.push(ToolCall::function("", "", ""));
                }
                let slot = &mut self.tool_calls[index];
                if let Some(id) = &call.id {
                    slot.id = id.clone();
                }
                if let Some(name) = &call.function.name {
                    slot.function.name.push_str(name);
                }
                if let Some(args) = &call.function.arguments {
                    slot.function.arguments.push_str(args);
                }
            }
            if choice.finish_reason.is_some() {
                self.finish_reason = choice.finish_reason;
            }
        }
    }

    /// Error object from a terminal error chunk, if one was seen.
    pub fn error(&self) -> Option<&ChunkError> {
        self.error.as_ref()
    }

    pub fn finish(self) -> ChatCompletionResponse {
        let reasoning = match (self.reasoning_text, self.reasoning_parts) {
            (Some(text), _) => Some(ReasoningField::Text(text)),
            (None, Some(text)) => Some(ReasoningField::Structured {
                content: vec![ReasoningPart::text(text)],
            }),
            (None, None) => None,
        };
        ChatCompletionResponse {
            id: self.id,
            object: "chat.completion".to_owned(),
            created: self.created,
            model: self.model,
            choices: vec![Choice {
                index: 0,
                message: AssistantMessage {
                    role: "assistant".to_owned(),
                    content: (!self.content.is_empty()).then_some(self.content),
                    reasoning,
                    reasoning_summary: self.reasoning_summary,
                    tool_calls: (!self.tool_calls.is_empty()).then_some(self.tool_calls),
                },
                finish_reason: self.finish_reason,
            }],
            usage: self.usage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::test_events::{mixed_sequence, parse, text_sequence};
    use crate::response::ResponseTranslator;
    use serde_json::json;

    fn run(ctx: &ResponseContext, events: &[BackendEvent]) -> Vec<ChatCompletionChunk> {
        let mut translator = StreamTranslator::new(ctx.clone());
        events.iter().flat_map(|e| translator.on_event(e)).collect()
    }

    fn non_streaming(ctx: &ResponseContext, events: &[BackendEvent]) -> ChatCompletionResponse {
        let mut collector = ResponseCollector::new();
        for event in events {
            collector.apply(event);
        }
        ResponseTranslator::translate(&collector.finish().unwrap(), ctx)
    }

    #[test]
    fn streaming_and_non_streaming_agree_in_every_compat_mode() {
        for compat in [
            ReasoningCompat::ThinkTags,
            ReasoningCompat::Current,
            ReasoningCompat::O3,
            ReasoningCompat::Legacy,
        ] {
            let ctx = ResponseContext::new("gpt-4", compat).with_usage(true);
            for events in [mixed_sequence(), text_sequence(&["Hel", "lo", "!"])] {
                let mut acc = ChunkAccumulator::new();
                for chunk in run(&ctx, &events) {
                    acc.push(&chunk);
                }
                assert_eq!(acc.finish(), non_streaming(&ctx, &events), "{compat:?}");
            }
        }
    }

    #[test]
    fn text_chunks_preserve_order_and_first_carries_role() {
        let ctx = ResponseContext::new("gpt-5", ReasoningCompat::ThinkTags);
        let chunks = run(&ctx, &text_sequence(&["Hel", "lo"]));

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].choices[0].delta.role.as_deref(), Some("assistant"));
        assert_eq!(chunks[0].choices[0].delta.content.as_deref(), Some("Hel"));
        assert_eq!(chunks[1].choices[0].delta.role, None);
        assert_eq!(chunks[1].choices[0].delta.content.as_deref(), Some("lo"));
        assert_eq!(chunks[2].choices[0].finish_reason, Some(FinishReason::Stop));
        assert!(chunks.iter().all(|c| c.id == ctx.id && c.object == "chat.completion.chunk"));
        // usage only when requested
        assert!(chunks[2].usage.is_none());
    }

    #[test]
    fn think_tags_open_and_close_around_reasoning() {
        let ctx = ResponseContext::new("gpt-5", ReasoningCompat::ThinkTags);
        let chunks = run(&ctx, &mixed_sequence());
        let contents: Vec<_> = chunks
            .iter()
            .filter_map(|c| c.choices[0].delta.content.clone())
            .collect();
        assert_eq!(
            contents,
            vec![
                "<think>Thinking",
                " hard.",
                "\n\nDone.",
                "</think>Let me ",
                "check."
            ]
        );
    }

    #[test]
    fn tool_call_chunks_carry_index_id_and_argument_fragments() {
        let ctx = ResponseContext::new("gpt-5", ReasoningCompat::Current);
        let chunks = run(&ctx, &mixed_sequence());
        let calls: Vec<_> = chunks
            .iter()
            .filter_map(|c| c.choices[0].delta.tool_calls.clone())
            .flatten()
            .collect();

        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0].id.as_deref(), Some("call_1"));
        assert_eq!(calls[0].function.name.as_deref(), Some("lookup"));
        assert_eq!(calls[1].function.arguments.as_deref(), Some("{\"q\":"));
        assert_eq!(calls[2].function.arguments.as_deref(), Some("\"x\"}"));
        assert!(calls.iter().all(|c| c.index == 0));

        let last = chunks.last().unwrap();
        assert_eq!(last.choices[0].finish_reason, Some(FinishReason::ToolCalls));
    }

    #[test]
    fn failed_response_ends_with_error_chunk() {
        let ctx = ResponseContext::new("gpt-5", ReasoningCompat::ThinkTags);
        let events = vec![
            parse(json!({ "type": "response.output_text.delta", "delta": "partial" })),
            parse(json!({ "type": "response.failed", "response": { "error": { "message": "overloaded" } } })),
        ];
        let chunks = run(&ctx, &events);
        assert_eq!(chunks.len(), 2);
        let last = &chunks[1];
        assert_eq!(last.choices[0].finish_reason, Some(FinishReason::Error));
        assert_eq!(last.error.as_ref().unwrap().message, "overloaded");
    }

    #[test]
    fn interrupt_closes_think_and_is_terminal() {
        let ctx = ResponseContext::new("gpt-5", ReasoningCompat::ThinkTags);
        let mut translator = StreamTranslator::new(ctx);
        let first = translator.on_event(&parse(json!({
            "type": "response.reasoning_summary_text.delta", "delta": "hmm"
        })));
        assert_eq!(first[0].choices[0].delta.content.as_deref(), Some("<think>hmm"));

        let tail = translator.interrupt("connection reset");
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].choices[0].delta.content.as_deref(), Some("</think>"));
        assert_eq!(tail[1].error.as_ref().unwrap().kind, "stream_interrupted");
        assert!(translator.is_done());

        assert!(translator.interrupt("again").is_empty());
        assert!(
            translator
                .on_event(&parse(json!({ "type": "response.output_text.delta", "delta": "x" })))
                .is_empty()
        );
    }

    #[test]
    fn usage_attached_to_final_chunk_when_requested() {
        let ctx = ResponseContext::new("gpt-5", ReasoningCompat::ThinkTags).with_usage(true);
        let chunks = run(&ctx, &text_sequence(&["a"]));
        assert_eq!(chunks.last().unwrap().usage.unwrap().total_tokens, 5);
    }
}
