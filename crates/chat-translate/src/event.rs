//! Events emitted by the Responses backend stream
//!
//! Only the events that affect the translated output are modelled; anything
//! else deserializes to [`BackendEvent::Unknown`] and is skipped.

use serde::Deserialize;

use crate::types::Usage;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum BackendEvent {
    #[serde(rename = "response.created")]
    Created {
        #[serde(default)]
        response: Option<ResponseInfo>,
    },

    #[serde(rename = "response.output_text.delta")]
    OutputTextDelta {
        delta: String,
        #[serde(default)]
        item_id: Option<String>,
    },

    #[serde(rename = "response.reasoning_summary_text.delta")]
    ReasoningSummaryDelta { delta: String },

    #[serde(rename = "response.reasoning_text.delta")]
    ReasoningTextDelta { delta: String },

    #[serde(rename = "response.reasoning_summary_part.added")]
    ReasoningSummaryPartAdded {
        #[serde(default)]
        summary_index: Option<u32>,
    },

    #[serde(rename = "response.output_item.added")]
    OutputItemAdded {
        #[serde(default)]
        output_index: Option<u32>,
        item: OutputItem,
    },

    #[serde(rename = "response.function_call_arguments.delta")]
    FunctionCallArgumentsDelta {
        #[serde(default)]
        item_id: Option<String>,
        #[serde(default)]
        output_index: Option<u32>,
        delta: String,
    },

    #[serde(rename = "response.output_item.done")]
    OutputItemDone {
        #[serde(default)]
        output_index: Option<u32>,
        item: OutputItem,
    },

    #[serde(rename = "response.completed")]
    Completed { response: ResponseInfo },

    #[serde(rename = "response.incomplete")]
    Incomplete { response: ResponseInfo },

    #[serde(rename = "response.failed")]
    Failed { response: ResponseInfo },

    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        code: Option<String>,
    },

    #[serde(other)]
    Unknown,
}

impl BackendEvent {
    /// Parse one SSE `data:` payload.
    pub fn parse(data: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(data)
    }

    /// Whether this event ends the response.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BackendEvent::Completed { .. }
                | BackendEvent::Incomplete { .. }
                | BackendEvent::Failed { .. }
                | BackendEvent::Error { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum OutputItem {
    #[serde(rename = "function_call")]
    FunctionCall {
        #[serde(default)]
        id: Option<String>,
        #[serde(default)]
        call_id: Option<String>,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        arguments: Option<String>,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ResponseInfo {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub usage: Option<BackendUsage>,
    #[serde(default)]
    pub error: Option<ResponseError>,
    #[serde(default)]
    pub incomplete_details: Option<IncompleteDetails>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct BackendUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

impl From<BackendUsage> for Usage {
    fn from(usage: BackendUsage) -> Self {
        let total = if usage.total_tokens > 0 {
            usage.total_tokens
        } else {
            usage.input_tokens + usage.output_tokens
        };
        Usage {
            prompt_tokens: usage.input_tokens,
            completion_tokens: usage.output_tokens,
            total_tokens: total,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ResponseError {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct IncompleteDetails {
    #[serde(default)]
    pub reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_text_delta() {
        let event =
            BackendEvent::parse(r#"{"type":"response.output_text.delta","delta":"Hi","item_id":"msg_1","output_index":0}"#)
                .unwrap();
        assert_eq!(
            event,
            BackendEvent::OutputTextDelta {
                delta: "Hi".into(),
                item_id: Some("msg_1".into())
            }
        );
    }

    #[test]
    fn parses_function_call_item() {
        let event = BackendEvent::parse(
            r#"{"type":"response.output_item.done","output_index":1,"item":{"type":"function_call","id":"fc_1","call_id":"call_1","name":"lookup","arguments":"{}","status":"completed"}}"#,
        )
        .unwrap();
        match event {
            BackendEvent::OutputItemDone {
                item: OutputItem::FunctionCall { call_id, name, .. },
                ..
            } => {
                assert_eq!(call_id.as_deref(), Some("call_1"));
                assert_eq!(name.as_deref(), Some("lookup"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn non_function_items_and_unknown_events() {
        let event = BackendEvent::parse(
            r#"{"type":"response.output_item.added","item":{"type":"reasoning","id":"rs_1"}}"#,
        )
        .unwrap();
        assert!(matches!(
            event,
            BackendEvent::OutputItemAdded { item: OutputItem::Other, .. }
        ));

        let event = BackendEvent::parse(r#"{"type":"response.in_progress","response":{}}"#).unwrap();
        assert_eq!(event, BackendEvent::Unknown);
        assert!(!event.is_terminal());
    }

    #[test]
    fn completed_carries_usage() {
        let event = BackendEvent::parse(
            r#"{"type":"response.completed","response":{"id":"resp_1","status":"completed","usage":{"input_tokens":10,"output_tokens":5,"total_tokens":15}}}"#,
        )
        .unwrap();
        let BackendEvent::Completed { response } = event else {
            panic!("expected completed");
        };
        let usage: Usage = response.usage.unwrap().into();
        assert_eq!(
            usage,
            Usage {
                prompt_tokens: 10,
                completion_tokens: 5,
                total_tokens: 15
            }
        );
    }

    #[test]
    fn malformed_json_is_an_error() {
        assert!(BackendEvent::parse("{not json").is_err());
    }
}
