//! Chat Completions request → Responses backend payload
//!
//! Translation is total and deterministic: every accepted field either maps
//! to a backend field or is validated and dropped. Out-of-set enum values and
//! out-of-range numbers are rejected, never clamped.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::debug;

use crate::error::{Result, ValidationError};
use crate::types::{
    BackendRequest, BackendTool, ChatMessage, ChatRequest, ContentPart, InputContent, InputItem,
    MessageContent, ReasoningCompat, ReasoningEffort, ReasoningParam, ReasoningSummary,
    StopSequences, TextControls, ToolDefinition,
};

/// Top-level request keys that are accepted and silently dropped.
pub const IGNORED_FIELDS: &[&str] = &["user", "metadata", "store", "service_tier", "seed"];

/// Chat request keys that make no sense for a text completion.
const CHAT_ONLY_FIELDS: &[&str] = &[
    "messages",
    "tools",
    "tool_choice",
    "parallel_tool_calls",
    "response_format",
];

const ENCRYPTED_REASONING: &str = "reasoning.encrypted_content";
const MAX_STOP_SEQUENCES: usize = 4;

/// One model exposed to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelEntry {
    /// Public id listed by `/v1/models`.
    pub id: String,
    /// Backend model slug; defaults to `id`.
    #[serde(default)]
    pub slug: Option<String>,
    /// Additional names accepted in requests.
    #[serde(default)]
    pub aliases: Vec<String>,
}

impl ModelEntry {
    pub fn new(id: &str, slug: &str, aliases: &[&str]) -> Self {
        Self {
            id: id.to_owned(),
            slug: Some(slug.to_owned()),
            aliases: aliases.iter().map(|a| (*a).to_owned()).collect(),
        }
    }

    pub fn backend_slug(&self) -> &str {
        self.slug.as_deref().unwrap_or(&self.id)
    }

    fn matches(&self, name: &str) -> bool {
        self.id.eq_ignore_ascii_case(name) || self.aliases.iter().any(|a| a.eq_ignore_ascii_case(name))
    }
}

/// Models the proxy accepts, and the backend slug each resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelCatalog {
    entries: Vec<ModelEntry>,
}

impl ModelCatalog {
    pub fn new(entries: Vec<ModelEntry>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[ModelEntry] {
        &self.entries
    }

    /// Resolve a requested model name (case-insensitive, aliases included).
    pub fn resolve(&self, name: &str) -> Option<&ModelEntry> {
        let name = name.trim();
        self.entries.iter().find(|entry| entry.matches(name))
    }
}

impl Default for ModelCatalog {
    fn default() -> Self {
        Self::new(vec![
            ModelEntry::new("gpt-5", "gpt-5", &["gpt-4o", "gpt-4", "gpt-3.5-turbo"]),
            ModelEntry::new("gpt-5-codex", "gpt-5-codex", &[]),
        ])
    }
}

/// Server-side translation settings.
#[derive(Debug, Clone)]
pub struct TranslatorOptions {
    /// Base instructions sent with every backend request.
    pub instructions: String,
    pub models: ModelCatalog,
    pub default_effort: ReasoningEffort,
    pub default_summary: ReasoningSummary,
    pub default_compat: ReasoningCompat,
}

impl Default for TranslatorOptions {
    fn default() -> Self {
        Self {
            instructions: DEFAULT_INSTRUCTIONS.to_owned(),
            models: ModelCatalog::default(),
            default_effort: ReasoningEffort::Medium,
            default_summary: ReasoningSummary::Auto,
            default_compat: ReasoningCompat::ThinkTags,
        }
    }
}

/// Fallback base instructions when no instructions file is configured.
pub const DEFAULT_INSTRUCTIONS: &str = "You are a helpful coding assistant. Follow the user's \
instructions carefully and answer concisely.";

/// A validated request ready for the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct TranslatedRequest {
    pub backend: BackendRequest,
    /// Client asked for an SSE response.
    pub stream: bool,
    /// Emit usage on the final streamed chunk.
    pub include_usage: bool,
    /// Model name as the client sent it; echoed back in responses.
    pub model: String,
    pub compat: ReasoningCompat,
}

#[derive(Debug, Clone)]
pub struct RequestTranslator {
    options: TranslatorOptions,
}

impl RequestTranslator {
    pub fn new(options: TranslatorOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &TranslatorOptions {
        &self.options
    }

    /// Parse and translate a raw JSON body.
    pub fn translate_json(&self, body: &[u8]) -> Result<TranslatedRequest> {
        let request: ChatRequest =
            serde_json::from_slice(body).map_err(|e| ValidationError::Malformed(e.to_string()))?;
        self.translate(request)
    }

    /// Parse a legacy `/v1/completions` body and translate it as a chat
    /// request whose only message is the prompt.
    ///
    /// Reasoning is kept out of the text unless the client asks for a
    /// `reasoning_compat` explicitly.
    pub fn translate_completion_json(&self, body: &[u8]) -> Result<TranslatedRequest> {
        let mut object: Map<String, Value> =
            serde_json::from_slice(body).map_err(|e| ValidationError::Malformed(e.to_string()))?;

        if let Some(key) = CHAT_ONLY_FIELDS.iter().find(|key| object.contains_key(**key)) {
            return Err(ValidationError::UnknownField((*key).to_owned()));
        }
        let prompt = completion_prompt(object.remove("prompt"))?;
        strip_completion_options(&mut object)?;
        let explicit_compat = object.get("reasoning_compat").is_some_and(|v| !v.is_null());

        object.insert(
            "messages".to_owned(),
            json!([{ "role": "user", "content": prompt }]),
        );
        let request: ChatRequest = serde_json::from_value(Value::Object(object))
            .map_err(|e| ValidationError::Malformed(e.to_string()))?;

        let mut translated = self.translate(request)?;
        if !explicit_compat {
            translated.compat = ReasoningCompat::Current;
        }
        Ok(translated)
    }

    pub fn translate(&self, request: ChatRequest) -> Result<TranslatedRequest> {
        if let Some(key) = request
            .extra
            .keys()
            .find(|key| !IGNORED_FIELDS.contains(&key.as_str()))
        {
            return Err(ValidationError::UnknownField(key.clone()));
        }

        let requested_model = request
            .model
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .ok_or(ValidationError::MissingField("model"))?;
        let entry = self
            .options
            .models
            .resolve(requested_model)
            .ok_or_else(|| ValidationError::UnsupportedModel(requested_model.to_owned()))?;

        let messages = request
            .messages
            .as_deref()
            .ok_or(ValidationError::MissingField("messages"))?;
        if messages.is_empty() {
            return Err(ValidationError::invalid("messages", "must contain at least one message"));
        }

        validate_sampling(&request)?;

        let tools = translate_tools(request.tools.as_deref().unwrap_or_default())?;
        let tool_choice = translate_tool_choice(request.tool_choice.as_ref(), &tools)?;
        let input = translate_messages(messages)?;
        let text = translate_response_format(request.response_format.as_ref())?;

        let overrides = request.reasoning.clone().unwrap_or_default();
        let effort = pick_enum(
            "reasoning_effort",
            request.reasoning_effort.as_deref().or(overrides.effort.as_deref()),
            ReasoningEffort::parse,
            ReasoningEffort::EXPECTED,
            self.options.default_effort,
        )?;
        let summary = pick_enum(
            "reasoning_summary",
            request.reasoning_summary.as_deref().or(overrides.summary.as_deref()),
            ReasoningSummary::parse,
            ReasoningSummary::EXPECTED,
            self.options.default_summary,
        )?;
        let compat = pick_enum(
            "reasoning_compat",
            request.reasoning_compat.as_deref(),
            ReasoningCompat::parse,
            ReasoningCompat::EXPECTED,
            self.options.default_compat,
        )?;

        let include = if effort == ReasoningEffort::None {
            Vec::new()
        } else {
            vec![ENCRYPTED_REASONING.to_owned()]
        };
        let reasoning = ReasoningParam {
            effort,
            summary: (summary != ReasoningSummary::None).then_some(summary),
        };

        let backend = BackendRequest {
            model: entry.backend_slug().to_owned(),
            instructions: self.options.instructions.clone(),
            input,
            tools,
            tool_choice,
            parallel_tool_calls: request.parallel_tool_calls.unwrap_or(false),
            store: false,
            stream: true,
            include,
            reasoning: Some(reasoning),
            text,
        };

        debug!(
            model = requested_model,
            backend_model = %backend.model,
            items = backend.input.len(),
            tools = backend.tools.len(),
            "translated chat request"
        );

        Ok(TranslatedRequest {
            backend,
            stream: request.stream.unwrap_or(false),
            include_usage: request
                .stream_options
                .as_ref()
                .is_some_and(|opts| opts.include_usage),
            model: requested_model.to_owned(),
            compat,
        })
    }
}

fn pick_enum<T: Copy>(
    field: &'static str,
    raw: Option<&str>,
    parse: fn(&str) -> Option<T>,
    expected: &'static str,
    default: T,
) -> Result<T> {
    match raw {
        None => Ok(default),
        Some(value) => parse(value).ok_or_else(|| ValidationError::InvalidEnum {
            field,
            value: value.to_owned(),
            expected,
        }),
    }
}

fn check_range(field: &'static str, value: Option<f64>, min: f64, max: f64) -> Result<()> {
    match value {
        Some(v) if !v.is_finite() || v < min || v > max => Err(ValidationError::OutOfRange {
            field,
            reason: format!("{v} is not within [{min}, {max}]"),
        }),
        _ => Ok(()),
    }
}

/// Validate the sampling parameters the backend does not accept.
fn validate_sampling(request: &ChatRequest) -> Result<()> {
    check_range("temperature", request.temperature, 0.0, 2.0)?;
    check_range("top_p", request.top_p, 0.0, 1.0)?;
    check_range("presence_penalty", request.presence_penalty, -2.0, 2.0)?;
    check_range("frequency_penalty", request.frequency_penalty, -2.0, 2.0)?;

    if let Some(n) = request.n
        && n != 1
    {
        return Err(ValidationError::OutOfRange {
            field: "n",
            reason: format!("only n=1 is supported, got {n}"),
        });
    }

    for (field, value) in [
        ("max_tokens", request.max_tokens),
        ("max_completion_tokens", request.max_completion_tokens),
    ] {
        if let Some(v) = value
            && v < 1
        {
            return Err(ValidationError::OutOfRange {
                field,
                reason: format!("must be at least 1, got {v}"),
            });
        }
    }

    if let Some(StopSequences::Many(stops)) = &request.stop
        && stops.len() > MAX_STOP_SEQUENCES
    {
        return Err(ValidationError::OutOfRange {
            field: "stop",
            reason: format!("at most {MAX_STOP_SEQUENCES} sequences, got {}", stops.len()),
        });
    }

    if let Some(bias) = &request.logit_bias {
        for (token, value) in bias {
            if !value.is_finite() || !(-100.0..=100.0).contains(value) {
                return Err(ValidationError::OutOfRange {
                    field: "logit_bias",
                    reason: format!("bias {value} for token {token} is not within [-100, 100]"),
                });
            }
        }
    }

    Ok(())
}

/// A string, or a list of strings that is joined.
fn completion_prompt(prompt: Option<Value>) -> Result<String> {
    let text = match prompt {
        None | Some(Value::Null) => return Err(ValidationError::MissingField("prompt")),
        Some(Value::String(text)) => text,
        Some(Value::Array(parts)) => {
            let mut text = String::new();
            for part in &parts {
                let Value::String(part) = part else {
                    return Err(ValidationError::invalid(
                        "prompt",
                        "token arrays are not supported, send text",
                    ));
                };
                text.push_str(part);
            }
            text
        }
        Some(_) => {
            return Err(ValidationError::invalid(
                "prompt",
                "must be a string or a list of strings",
            ));
        }
    };
    if text.trim().is_empty() {
        return Err(ValidationError::invalid("prompt", "must not be empty"));
    }
    Ok(text)
}

/// Remove completion-only options, rejecting the ones the backend cannot honour.
fn strip_completion_options(object: &mut Map<String, Value>) -> Result<()> {
    match object.remove("echo") {
        None | Some(Value::Null) | Some(Value::Bool(false)) => {}
        Some(Value::Bool(true)) => {
            return Err(ValidationError::invalid("echo", "echoing the prompt is not supported"));
        }
        Some(_) => return Err(ValidationError::invalid("echo", "must be a boolean")),
    }
    for field in ["suffix", "logprobs"] {
        if object.remove(field).is_some_and(|v| !v.is_null()) {
            return Err(ValidationError::invalid(field, "not supported by the backend"));
        }
    }
    if let Some(best_of) = object.remove("best_of")
        && !best_of.is_null()
        && best_of.as_i64() != Some(1)
    {
        return Err(ValidationError::OutOfRange {
            field: "best_of",
            reason: format!("only best_of=1 is supported, got {best_of}"),
        });
    }
    Ok(())
}

/// Nested objects have no ignorable keys; the first leftover is reported
/// with its full path.
fn reject_extra(path: impl FnOnce() -> String, extra: &Map<String, Value>) -> Result<()> {
    match extra.keys().next() {
        Some(key) => Err(ValidationError::UnknownField(format!("{}.{key}", path()))),
        None => Ok(()),
    }
}

fn translate_tools(tools: &[ToolDefinition]) -> Result<Vec<BackendTool>> {
    tools
        .iter()
        .enumerate()
        .map(|(i, tool)| {
            reject_extra(|| format!("tools[{i}]"), &tool.extra)?;
            if tool.kind != "function" {
                return Err(ValidationError::invalid(
                    format!("tools[{i}].type"),
                    format!("unsupported tool type {:?}", tool.kind),
                ));
            }
            let function = tool.function.as_ref().ok_or_else(|| {
                ValidationError::invalid(format!("tools[{i}].function"), "missing function definition")
            })?;
            reject_extra(|| format!("tools[{i}].function"), &function.extra)?;
            if function.name.trim().is_empty() {
                return Err(ValidationError::invalid(
                    format!("tools[{i}].function.name"),
                    "must not be empty",
                ));
            }
            Ok(BackendTool {
                kind: "function".to_owned(),
                name: function.name.clone(),
                description: function.description.clone().unwrap_or_default(),
                strict: function.strict.unwrap_or(false),
                parameters: function
                    .parameters
                    .clone()
                    .unwrap_or_else(|| json!({ "type": "object", "properties": {} })),
            })
        })
        .collect()
}

fn translate_tool_choice(choice: Option<&Value>, tools: &[BackendTool]) -> Result<Value> {
    let Some(choice) = choice else {
        return Ok(json!("auto"));
    };

    match choice {
        Value::String(mode) => match mode.as_str() {
            "auto" | "none" | "required" => Ok(Value::String(mode.clone())),
            other => Err(ValidationError::InvalidEnum {
                field: "tool_choice",
                value: other.to_owned(),
                expected: "auto, none, required, {type: function}",
            }),
        },
        Value::Object(obj) => {
            if obj.get("type").and_then(Value::as_str) != Some("function") {
                return Err(ValidationError::invalid(
                    "tool_choice",
                    "object form must have type \"function\"",
                ));
            }
            let name = obj
                .get("function")
                .and_then(|f| f.get("name"))
                .and_then(Value::as_str)
                .filter(|n| !n.is_empty())
                .ok_or_else(|| ValidationError::invalid("tool_choice", "missing function.name"))?;
            if !tools.iter().any(|t| t.name == name) {
                return Err(ValidationError::invalid(
                    "tool_choice",
                    format!("function {name:?} is not among the declared tools"),
                ));
            }
            Ok(json!({ "type": "function", "name": name }))
        }
        _ => Err(ValidationError::invalid(
            "tool_choice",
            "must be a string or an object",
        )),
    }
}

fn translate_response_format(format: Option<&Value>) -> Result<Option<TextControls>> {
    let Some(format) = format else {
        return Ok(None);
    };
    let kind = format
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| ValidationError::invalid("response_format", "missing type"))?;

    match kind {
        "text" => Ok(None),
        "json_object" => Ok(Some(TextControls {
            format: json!({ "type": "json_object" }),
        })),
        "json_schema" => {
            let spec = format.get("json_schema").ok_or_else(|| {
                ValidationError::invalid("response_format", "json_schema type requires a json_schema object")
            })?;
            let name = spec.get("name").and_then(Value::as_str).unwrap_or("response");
            let mut out = json!({
                "type": "json_schema",
                "name": name,
                "schema": spec.get("schema").cloned().unwrap_or_else(|| json!({})),
            });
            if let Some(strict) = spec.get("strict").and_then(Value::as_bool) {
                out["strict"] = Value::Bool(strict);
            }
            Ok(Some(TextControls { format: out }))
        }
        other => Err(ValidationError::InvalidEnum {
            field: "response_format",
            value: other.to_owned(),
            expected: "text, json_object, json_schema",
        }),
    }
}

fn translate_messages(messages: &[ChatMessage]) -> Result<Vec<InputItem>> {
    let mut items = Vec::with_capacity(messages.len());

    for (i, message) in messages.iter().enumerate() {
        reject_extra(|| format!("messages[{i}]"), &message.extra)?;
        if message.function_call.is_some() {
            return Err(ValidationError::invalid(
                format!("messages[{i}].function_call"),
                "legacy function_call is not supported, send tool_calls instead",
            ));
        }
        match message.role.as_str() {
            "system" | "developer" | "user" => {
                let content = user_content(i, message.content.as_ref())?;
                if content.is_empty() {
                    return Err(ValidationError::invalid(
                        format!("messages[{i}].content"),
                        "must not be empty",
                    ));
                }
                items.push(InputItem::Message {
                    role: "user".to_owned(),
                    content,
                });
            }
            "assistant" => {
                let text = plain_text(i, message.content.as_ref())?;
                let calls = message.tool_calls.as_deref().unwrap_or_default();
                if text.is_empty() && calls.is_empty() {
                    return Err(ValidationError::invalid(
                        format!("messages[{i}]"),
                        "assistant message needs content or tool_calls",
                    ));
                }
                if !text.is_empty() {
                    items.push(InputItem::Message {
                        role: "assistant".to_owned(),
                        content: vec![InputContent::OutputText { text }],
                    });
                }
                for (j, call) in calls.iter().enumerate() {
                    reject_extra(|| format!("messages[{i}].tool_calls[{j}]"), &call.extra)?;
                    reject_extra(
                        || format!("messages[{i}].tool_calls[{j}].function"),
                        &call.function.extra,
                    )?;
                    if call.kind != "function" {
                        return Err(ValidationError::invalid(
                            format!("messages[{i}].tool_calls[{j}].type"),
                            format!("unsupported tool call type {:?}", call.kind),
                        ));
                    }
                    if call.id.is_empty() || call.function.name.is_empty() {
                        return Err(ValidationError::invalid(
                            format!("messages[{i}].tool_calls[{j}]"),
                            "id and function.name are required",
                        ));
                    }
                    items.push(InputItem::FunctionCall {
                        call_id: call.id.clone(),
                        name: call.function.name.clone(),
                        arguments: call.function.arguments.clone(),
                    });
                }
            }
            "tool" => {
                let call_id = message
                    .tool_call_id
                    .as_deref()
                    .filter(|id| !id.is_empty())
                    .ok_or_else(|| {
                        ValidationError::invalid(
                            format!("messages[{i}].tool_call_id"),
                            "required for tool messages",
                        )
                    })?;
                items.push(InputItem::FunctionCallOutput {
                    call_id: call_id.to_owned(),
                    output: plain_text(i, message.content.as_ref())?,
                });
            }
            other => {
                return Err(ValidationError::invalid(
                    format!("messages[{i}].role"),
                    format!("unsupported role {other:?}"),
                ));
            }
        }
    }

    Ok(items)
}

fn user_content(index: usize, content: Option<&MessageContent>) -> Result<Vec<InputContent>> {
    match content {
        None => Ok(Vec::new()),
        Some(MessageContent::Text(text)) if text.is_empty() => Ok(Vec::new()),
        Some(MessageContent::Text(text)) => Ok(vec![InputContent::InputText { text: text.clone() }]),
        Some(MessageContent::Parts(parts)) => parts
            .iter()
            .enumerate()
            .map(|(j, part)| match part {
                ContentPart::Text { text } => Ok(InputContent::InputText { text: text.clone() }),
                ContentPart::ImageUrl { image_url } if image_url.url.is_empty() => {
                    Err(ValidationError::invalid(
                        format!("messages[{index}].content[{j}].image_url.url"),
                        "must not be empty",
                    ))
                }
                ContentPart::ImageUrl { image_url } => Ok(InputContent::InputImage {
                    image_url: image_url.url.clone(),
                }),
            })
            .collect(),
    }
}

/// Text-only content (assistant and tool messages); images are rejected.
fn plain_text(index: usize, content: Option<&MessageContent>) -> Result<String> {
    match content {
        None => Ok(String::new()),
        Some(MessageContent::Text(text)) => Ok(text.clone()),
        Some(MessageContent::Parts(parts)) => {
            let mut out = String::new();
            for (j, part) in parts.iter().enumerate() {
                match part {
                    ContentPart::Text { text } => out.push_str(text),
                    ContentPart::ImageUrl { .. } => {
                        return Err(ValidationError::invalid(
                            format!("messages[{index}].content[{j}]"),
                            "images are only allowed in user messages",
                        ));
                    }
                }
            }
            Ok(out)
        }
    }
}
