//! Backend event folding and non-streaming response translation
//!
//! [`ResponseCollector`] is the single interpretation of the backend event
//! sequence. It turns each event into output fragments, which the streaming
//! path renders as chunks and the non-streaming path folds into a
//! [`BackendResponse`]. Sharing it keeps both paths semantically identical.

use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};

use crate::event::{BackendEvent, OutputItem, ResponseInfo};
use crate::types::{
    AssistantMessage, ChatCompletionResponse, Choice, FinishReason,
    ReasoningCompat, ReasoningField, ReasoningPart, ToolCall, Usage,
};

/// Incremental output derived from one backend event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fragment {
    Text(String),
    Reasoning(String),
    ToolCallStart {
        index: u32,
        call_id: String,
        name: String,
    },
    ToolCallArgs {
        index: u32,
        delta: String,
    },
}

/// Ordered run of visible output. Adjacent runs of the same kind are merged
/// unless a tool call started between them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Reasoning(String),
    Text(String),
}

/// How the backend ended the response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    Completed,
    Incomplete { reason: Option<String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Status {
    Done(Completion),
    Failed(String),
}

/// Folded backend output for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendResponse {
    pub id: Option<String>,
    pub segments: Vec<Segment>,
    pub tool_calls: Vec<ToolCall>,
    pub completion: Completion,
    pub usage: Option<Usage>,
}

impl BackendResponse {
    pub fn finish_reason(&self) -> FinishReason {
        finish_reason(!self.tool_calls.is_empty(), &self.completion)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CollectError {
    /// `response.failed` or an `error` event.
    #[error("backend reported failure: {0}")]
    Failed(String),
    /// The stream ended before a terminal event.
    #[error("backend stream ended before completion")]
    Truncated,
}

#[derive(Debug, Clone)]
struct ToolState {
    item_id: Option<String>,
    output_index: Option<u32>,
    call_id: String,
    name: String,
    arguments: String,
}

/// Stateful interpreter of the backend event sequence.
#[derive(Debug, Default)]
pub struct ResponseCollector {
    id: Option<String>,
    segments: Vec<Segment>,
    boundary: bool,
    pending_separator: bool,
    tools: Vec<ToolState>,
    status: Option<Status>,
    usage: Option<Usage>,
}

impl ResponseCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a terminal event has been applied.
    pub fn is_finished(&self) -> bool {
        self.status.is_some()
    }

    pub fn usage(&self) -> Option<Usage> {
        self.usage
    }

    /// Terminal state once finished: `Ok` with the completion kind, or the
    /// failure message.
    pub fn outcome(&self) -> Option<Result<&Completion, &str>> {
        match &self.status {
            None => None,
            Some(Status::Done(completion)) => Some(Ok(completion)),
            Some(Status::Failed(message)) => Some(Err(message.as_str())),
        }
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tools.is_empty()
    }

    /// Apply one event. Events after a terminal event are ignored.
    pub fn apply(&mut self, event: &BackendEvent) -> Vec<Fragment> {
        if self.status.is_some() {
            return Vec::new();
        }

        match event {
            BackendEvent::Created { response } => {
                if let Some(id) = response.as_ref().and_then(|r| r.id.clone()) {
                    self.id = Some(id);
                }
                Vec::new()
            }
            BackendEvent::OutputTextDelta { delta, .. } => self.push_text(delta),
            BackendEvent::ReasoningSummaryDelta { delta }
            | BackendEvent::ReasoningTextDelta { delta } => self.push_reasoning(delta),
            BackendEvent::ReasoningSummaryPartAdded { .. } => {
                if matches!(self.segments.last(), Some(Segment::Reasoning(_))) && !self.boundary {
                    self.pending_separator = true;
                }
                Vec::new()
            }
            BackendEvent::OutputItemAdded { output_index, item } => match item {
                OutputItem::FunctionCall {
                    id,
                    call_id,
                    name,
                    arguments,
                } => {
                    let mut out = self.start_tool(id, call_id, name, *output_index);
                    if let Some(args) = arguments.as_deref().filter(|a| !a.is_empty()) {
                        let index = (self.tools.len() - 1) as u32;
                        out.extend(self.append_args(index, args));
                    }
                    out
                }
                OutputItem::Other => Vec::new(),
            },
            BackendEvent::FunctionCallArgumentsDelta {
                item_id,
                output_index,
                delta,
            } => match self.find_tool(item_id.as_deref(), *output_index) {
                Some(index) => self.append_args(index, delta),
                None => {
                    debug!(item_id = ?item_id, "arguments delta for unknown tool call");
                    Vec::new()
                }
            },
            BackendEvent::OutputItemDone { output_index, item } => match item {
                OutputItem::FunctionCall {
                    id,
                    call_id,
                    name,
                    arguments,
                } => {
                    let final_args = arguments.as_deref().unwrap_or_default();
                    match self.find_tool(id.as_deref(), *output_index) {
                        Some(index) => self.finalize_args(index, final_args),
                        None => {
                            let mut out = self.start_tool(id, call_id, name, *output_index);
                            let index = (self.tools.len() - 1) as u32;
                            out.extend(self.finalize_args(index, final_args));
                            out
                        }
                    }
                }
                OutputItem::Other => Vec::new(),
            },
            BackendEvent::Completed { response } => {
                self.finish_with(response, Completion::Completed);
                Vec::new()
            }
            BackendEvent::Incomplete { response } => {
                let reason = response
                    .incomplete_details
                    .as_ref()
                    .and_then(|d| d.reason.clone());
                self.finish_with(response, Completion::Incomplete { reason });
                Vec::new()
            }
            BackendEvent::Failed { response } => {
                let message = response
                    .error
                    .as_ref()
                    .and_then(|e| e.message.clone())
                    .unwrap_or_else(|| "response failed".to_owned());
                warn!(message = %message, "backend response failed");
                self.usage = response.usage.map(Usage::from);
                self.status = Some(Status::Failed(message));
                Vec::new()
            }
            BackendEvent::Error { message, code } => {
                let message = message
                    .clone()
                    .or_else(|| code.clone())
                    .unwrap_or_else(|| "backend error".to_owned());
                warn!(message = %message, "backend stream error event");
                self.status = Some(Status::Failed(message));
                Vec::new()
            }
            BackendEvent::Unknown => Vec::new(),
        }
    }

    /// Consume the collector into the folded response.
    pub fn finish(self) -> Result<BackendResponse, CollectError> {
        match self.status {
            None => Err(CollectError::Truncated),
            Some(Status::Failed(message)) => Err(CollectError::Failed(message)),
            Some(Status::Done(completion)) => Ok(BackendResponse {
                id: self.id,
                segments: self.segments,
                tool_calls: self
                    .tools
                    .into_iter()
                    .map(|t| ToolCall::function(t.call_id, t.name, t.arguments))
                    .collect(),
                completion,
                usage: self.usage,
            }),
        }
    }

    fn finish_with(&mut self, response: &ResponseInfo, completion: Completion) {
        if let Some(id) = &response.id {
            self.id = Some(id.clone());
        }
        self.usage = response.usage.map(Usage::from);
        self.status = Some(Status::Done(completion));
    }

    fn push_text(&mut self, delta: &str) -> Vec<Fragment> {
        if delta.is_empty() {
            return Vec::new();
        }
        match self.segments.last_mut() {
            Some(Segment::Text(text)) if !self.boundary => text.push_str(delta),
            _ => self.segments.push(Segment::Text(delta.to_owned())),
        }
        self.boundary = false;
        self.pending_separator = false;
        vec![Fragment::Text(delta.to_owned())]
    }

    fn push_reasoning(&mut self, delta: &str) -> Vec<Fragment> {
        if delta.is_empty() {
            return Vec::new();
        }
        let continuing = matches!(self.segments.last(), Some(Segment::Reasoning(_))) && !self.boundary;
        let piece = if continuing && self.pending_separator {
            format!("\n\n{delta}")
        } else {
            delta.to_owned()
        };
        match self.segments.last_mut() {
            Some(Segment::Reasoning(text)) if continuing => text.push_str(&piece),
            _ => self.segments.push(Segment::Reasoning(piece.clone())),
        }
        self.boundary = false;
        self.pending_separator = false;
        vec![Fragment::Reasoning(piece)]
    }

    fn start_tool(
        &mut self,
        item_id: &Option<String>,
        call_id: &Option<String>,
        name: &Option<String>,
        output_index: Option<u32>,
    ) -> Vec<Fragment> {
        let index = self.tools.len() as u32;
        let call_id = call_id
            .clone()
            .or_else(|| item_id.clone())
            .unwrap_or_else(|| format!("call_{}", uuid::Uuid::new_v4().simple()));
        let name = name.clone().unwrap_or_default();

        self.tools.push(ToolState {
            item_id: item_id.clone(),
            output_index,
            call_id: call_id.clone(),
            name: name.clone(),
            arguments: String::new(),
        });
        self.boundary = true;
        self.pending_separator = false;

        vec![Fragment::ToolCallStart {
            index,
            call_id,
            name,
        }]
    }

    fn find_tool(&self, item_id: Option<&str>, output_index: Option<u32>) -> Option<u32> {
        let by_id = item_id.and_then(|id| {
            self.tools
                .iter()
                .position(|t| t.item_id.as_deref() == Some(id))
        });
        let by_index = || {
            output_index.and_then(|oi| self.tools.iter().position(|t| t.output_index == Some(oi)))
        };
        by_id.or_else(by_index).map(|i| i as u32)
    }

    fn append_args(&mut self, index: u32, delta: &str) -> Vec<Fragment> {
        if delta.is_empty() {
            return Vec::new();
        }
        let Some(tool) = self.tools.get_mut(index as usize) else {
            return Vec::new();
        };
        tool.arguments.push_str(delta);
        vec![Fragment::ToolCallArgs {
            index,
            delta: delta.to_owned(),
        }]
    }

    /// Reconcile streamed arguments with the final ones from `output_item.done`.
    ///
    /// Emits whatever suffix was not streamed yet. If the streamed prefix
    /// disagrees with the final value the streamed text stands, since clients
    /// already consumed it.
    fn finalize_args(&mut self, index: u32, final_args: &str) -> Vec<Fragment> {
        let Some(tool) = self.tools.get(index as usize) else {
            return Vec::new();
        };
        match final_args.strip_prefix(tool.arguments.as_str()) {
            Some(rest) => {
                let rest = rest.to_owned();
                self.append_args(index, &rest)
            }
            None => {
                warn!(
                    call_id = %tool.call_id,
                    "final tool arguments diverge from streamed arguments"
                );
                Vec::new()
            }
        }
    }
}

pub(crate) fn finish_reason(has_tools: bool, completion: &Completion) -> FinishReason {
    match completion {
        Completion::Incomplete { reason } => match reason.as_deref() {
            Some("max_output_tokens") | Some("max_tokens") => FinishReason::Length,
            Some("content_filter") => FinishReason::ContentFilter,
            _ if has_tools => FinishReason::ToolCalls,
            _ => FinishReason::Length,
        },
        Completion::Completed if has_tools => FinishReason::ToolCalls,
        Completion::Completed => FinishReason::Stop,
    }
}

/// Per-request identity shared by all chunks or the single response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseContext {
    pub id: String,
    pub created: u64,
    /// Model name echoed back to the client.
    pub model: String,
    pub compat: ReasoningCompat,
    /// Attach usage to the final streamed chunk.
    pub include_usage: bool,
}

impl ResponseContext {
    pub fn new(model: impl Into<String>, compat: ReasoningCompat) -> Self {
        let created = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        Self {
            id: format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
            created,
            model: model.into(),
            compat,
            include_usage: false,
        }
    }

    pub fn with_usage(mut self, include_usage: bool) -> Self {
        self.include_usage = include_usage;
        self
    }
}

pub(crate) const THINK_OPEN: &str = "<think>";
pub(crate) const THINK_CLOSE: &str = "</think>";

/// Folded backend output → `chat.completion` object.
pub struct ResponseTranslator;

impl ResponseTranslator {
    pub fn translate(response: &BackendResponse, ctx: &ResponseContext) -> ChatCompletionResponse {
        let mut content = String::new();
        let mut reasoning = String::new();

        for segment in &response.segments {
            match segment {
                Segment::Text(text) => content.push_str(text),
                Segment::Reasoning(text) if ctx.compat == ReasoningCompat::ThinkTags => {
                    content.push_str(THINK_OPEN);
                    content.push_str(text);
                    content.push_str(THINK_CLOSE);
                }
                Segment::Reasoning(text) => reasoning.push_str(text),
            }
        }

        let mut message = AssistantMessage {
            role: "assistant".to_owned(),
            content: (!content.is_empty()).then_some(content),
            ..AssistantMessage::default()
        };
        if !reasoning.is_empty() {
            match ctx.compat {
                ReasoningCompat::Current => message.reasoning = Some(ReasoningField::Text(reasoning)),
                ReasoningCompat::O3 => {
                    message.reasoning = Some(ReasoningField::Structured {
                        content: vec![ReasoningPart::text(reasoning)],
                    })
                }
                ReasoningCompat::Legacy => message.reasoning_summary = Some(reasoning),
                ReasoningCompat::ThinkTags => {}
            }
        }
        if !response.tool_calls.is_empty() {
            message.tool_calls = Some(response.tool_calls.clone());
        }

        ChatCompletionResponse {
            id: ctx.id.clone(),
            object: "chat.completion".to_owned(),
            created: ctx.created,
            model: ctx.model.clone(),
            choices: vec![Choice {
                index: 0,
                message,
                finish_reason: Some(response.finish_reason()),
            }],
            usage: response.usage,
        }
    }
}

#[cfg(test)]
pub(crate) mod test_events {
    use super::*;

    pub fn parse(json: serde_json::Value) -> BackendEvent {
        serde_json::from_value(json).unwrap()
    }

    /// Reasoning, text, a streamed tool call whose final arguments add a
    /// suffix, then completion with usage.
    pub fn mixed_sequence() -> Vec<BackendEvent> {
        use serde_json::json;
        [
            json!({ "type": "response.created", "response": { "id": "resp_1" } }),
            json!({ "type": "response.output_item.added", "output_index": 0, "item": { "type": "reasoning", "id": "rs_1" } }),
            json!({ "type": "response.reasoning_summary_part.added", "summary_index": 0 }),
            json!({ "type": "response.reasoning_summary_text.delta", "delta": "Thinking" }),
            json!({ "type": "response.reasoning_summary_text.delta", "delta": " hard." }),
            json!({ "type": "response.reasoning_summary_part.added", "summary_index": 1 }),
            json!({ "type": "response.reasoning_summary_text.delta", "delta": "Done." }),
            json!({ "type": "response.output_text.delta", "delta": "Let me " }),
            json!({ "type": "response.output_text.delta", "delta": "check." }),
            json!({ "type": "response.output_item.added", "output_index": 2, "item": { "type": "function_call", "id": "fc_1", "call_id": "call_1", "name": "lookup", "arguments": "" } }),
            json!({ "type": "response.function_call_arguments.delta", "item_id": "fc_1", "output_index": 2, "delta": "{\"q\":" }),
            json!({ "type": "response.output_item.done", "output_index": 2, "item": { "type": "function_call", "id": "fc_1", "call_id": "call_1", "name": "lookup", "arguments": "{\"q\":\"x\"}" } }),
            json!({ "type": "response.completed", "response": { "id": "resp_1", "status": "completed", "usage": { "input_tokens": 12, "output_tokens": 30, "total_tokens": 42 } } }),
        ]
        .into_iter()
        .map(parse)
        .collect()
    }

    pub fn text_sequence(parts: &[&str]) -> Vec<BackendEvent> {
        use serde_json::json;
        let mut events = vec![parse(json!({ "type": "response.created", "response": { "id": "resp_t" } }))];
        for part in parts {
            events.push(parse(json!({ "type": "response.output_text.delta", "delta": part })));
        }
        events.push(parse(json!({
            "type": "response.completed",
            "response": { "usage": { "input_tokens": 3, "output_tokens": 2, "total_tokens": 5 } }
        })));
        events
    }
}

#[cfg(test)]
mod tests {
    use super::test_events::*;
    use super::*;
    use serde_json::json;

    fn collect(events: &[BackendEvent]) -> Result<BackendResponse, CollectError> {
        let mut collector = ResponseCollector::new();
        for event in events {
            collector.apply(event);
        }
        collector.finish()
    }

    fn ctx(compat: ReasoningCompat) -> ResponseContext {
        ResponseContext::new("gpt-4", compat)
    }

    #[test]
    fn collects_segments_tools_and_usage() {
        let response = collect(&mixed_sequence()).unwrap();
        assert_eq!(response.id.as_deref(), Some("resp_1"));
        assert_eq!(
            response.segments,
            vec![
                Segment::Reasoning("Thinking hard.\n\nDone.".into()),
                Segment::Text("Let me check.".into()),
            ]
        );
        assert_eq!(response.tool_calls.len(), 1);
        assert_eq!(response.tool_calls[0].id, "call_1");
        assert_eq!(response.tool_calls[0].function.arguments, "{\"q\":\"x\"}");
        assert_eq!(response.finish_reason(), FinishReason::ToolCalls);
        assert_eq!(response.usage.unwrap().total_tokens, 42);
    }

    #[test]
    fn done_without_streamed_arguments_supplies_them_all() {
        let events: Vec<_> = [
            json!({ "type": "response.output_item.done", "output_index": 0, "item": { "type": "function_call", "id": "fc_9", "call_id": "call_9", "name": "run", "arguments": "{\"a\":1}" } }),
            json!({ "type": "response.completed", "response": {} }),
        ]
        .into_iter()
        .map(parse)
        .collect();

        let mut collector = ResponseCollector::new();
        let fragments = collector.apply(&events[0]);
        assert_eq!(
            fragments,
            vec![
                Fragment::ToolCallStart {
                    index: 0,
                    call_id: "call_9".into(),
                    name: "run".into()
                },
                Fragment::ToolCallArgs {
                    index: 0,
                    delta: "{\"a\":1}".into()
                },
            ]
        );
        collector.apply(&events[1]);
        let response = collector.finish().unwrap();
        assert_eq!(response.tool_calls[0].function.arguments, "{\"a\":1}");
    }

    #[test]
    fn fully_streamed_arguments_are_not_repeated() {
        let mut collector = ResponseCollector::new();
        collector.apply(&parse(json!({ "type": "response.output_item.added", "output_index": 0, "item": { "type": "function_call", "id": "fc_1", "call_id": "c1", "name": "f" } })));
        collector.apply(&parse(json!({ "type": "response.function_call_arguments.delta", "item_id": "fc_1", "delta": "{}" })));
        let fragments = collector.apply(&parse(json!({ "type": "response.output_item.done", "output_index": 0, "item": { "type": "function_call", "id": "fc_1", "call_id": "c1", "name": "f", "arguments": "{}" } })));
        assert!(fragments.is_empty());
    }

    #[test]
    fn failed_and_truncated() {
        let err = collect(&[parse(json!({
            "type": "response.failed",
            "response": { "error": { "message": "model overloaded" } }
        }))])
        .unwrap_err();
        assert_eq!(err, CollectError::Failed("model overloaded".into()));

        let err = collect(&text_sequence(&["a"])[..2]).unwrap_err();
        assert_eq!(err, CollectError::Truncated);
    }

    #[test]
    fn events_after_terminal_are_ignored() {
        let mut events = text_sequence(&["a"]);
        events.push(parse(json!({ "type": "response.output_text.delta", "delta": "late" })));
        let response = collect(&events).unwrap();
        assert_eq!(response.segments, vec![Segment::Text("a".into())]);
    }

    #[test]
    fn incomplete_max_tokens_is_length() {
        let response = collect(&[parse(json!({
            "type": "response.incomplete",
            "response": { "incomplete_details": { "reason": "max_output_tokens" } }
        }))])
        .unwrap();
        assert_eq!(response.finish_reason(), FinishReason::Length);

        let response = collect(&[parse(json!({
            "type": "response.incomplete",
            "response": { "incomplete_details": { "reason": "content_filter" } }
        }))])
        .unwrap();
        assert_eq!(response.finish_reason(), FinishReason::ContentFilter);
    }

    #[test]
    fn think_tags_wrap_reasoning_in_content() {
        let response = collect(&mixed_sequence()).unwrap();
        let out = ResponseTranslator::translate(&response, &ctx(ReasoningCompat::ThinkTags));

        assert_eq!(out.object, "chat.completion");
        assert_eq!(out.model, "gpt-4");
        assert!(out.id.starts_with("chatcmpl-"));
        let message = &out.choices[0].message;
        assert_eq!(
            message.content.as_deref(),
            Some("<think>Thinking hard.\n\nDone.</think>Let me check.")
        );
        assert!(message.reasoning.is_none());
        assert_eq!(out.choices[0].finish_reason, Some(FinishReason::ToolCalls));
        assert_eq!(
            out.usage,
            Some(Usage {
                prompt_tokens: 12,
                completion_tokens: 30,
                total_tokens: 42
            })
        );
    }

    #[test]
    fn compat_modes_place_reasoning() {
        let response = collect(&mixed_sequence()).unwrap();

        let current = ResponseTranslator::translate(&response, &ctx(ReasoningCompat::Current));
        assert_eq!(
            current.choices[0].message.reasoning,
            Some(ReasoningField::Text("Thinking hard.\n\nDone.".into()))
        );
        assert_eq!(current.choices[0].message.content.as_deref(), Some("Let me check."));

        let o3 = ResponseTranslator::translate(&response, &ctx(ReasoningCompat::O3));
        assert_eq!(
            serde_json::to_value(&o3.choices[0].message.reasoning).unwrap(),
            json!({ "content": [{ "type": "text", "text": "Thinking hard.\n\nDone." }] })
        );

        let legacy = ResponseTranslator::translate(&response, &ctx(ReasoningCompat::Legacy));
        assert_eq!(
            legacy.choices[0].message.reasoning_summary.as_deref(),
            Some("Thinking hard.\n\nDone.")
        );
    }

    #[test]
    fn empty_output_has_null_content() {
        let response = collect(&text_sequence(&[])).unwrap();
        let out = ResponseTranslator::translate(&response, &ctx(ReasoningCompat::ThinkTags));
        assert_eq!(out.choices[0].message.content, None);
        assert_eq!(out.choices[0].finish_reason, Some(FinishReason::Stop));
    }
}
