use crate::frame::Frame;
use crate::types::{RelayError, Result};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

/// The analysis API's event vocabulary, decoded from one SSE frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamEvent {
    Start {
        query: String,
        timestamp: Option<String>,
    },
    Thinking {
        content: String,
    },
    ToolCall {
        tool: String,
        input: String,
    },
    ToolResult {
        tool: String,
        output: String,
    },
    FinalAnswer {
        answer: String,
    },
    Error {
        error: String,
    },
    /// Unknown event type, or a known type whose payload lacks its key field.
    Ignored,
}

#[derive(Deserialize)]
struct StartPayload {
    #[serde(default)]
    query: Option<Value>,
    #[serde(default)]
    timestamp: Option<Value>,
}

#[derive(Deserialize)]
struct ThinkingPayload {
    #[serde(default)]
    content: Option<Value>,
}

#[derive(Deserialize)]
struct ToolCallPayload {
    #[serde(default)]
    tool: Option<Value>,
    #[serde(default)]
    input: Option<Value>,
}

#[derive(Deserialize)]
struct ToolResultPayload {
    #[serde(default)]
    tool: Option<Value>,
    #[serde(default)]
    output: Option<Value>,
}

#[derive(Deserialize)]
struct FinalAnswerPayload {
    #[serde(default)]
    answer: Option<Value>,
}

#[derive(Deserialize)]
struct ErrorPayload {
    #[serde(default)]
    error: Option<Value>,
}

impl UpstreamEvent {
    /// Decodes a frame. Malformed JSON, or JSON that is not an object, is a
    /// `StreamDecode` error the caller is expected to log and skip.
    pub fn decode(frame: &Frame) -> Result<Self> {
        let value: Value = serde_json::from_str(&frame.data).map_err(|e| {
            RelayError::StreamDecode(format!(
                "invalid JSON in '{}' frame: {}",
                frame.event_type(),
                e
            ))
        })?;
        if !value.is_object() {
            return Err(RelayError::StreamDecode(format!(
                "'{}' frame payload is not a JSON object",
                frame.event_type()
            ))
            .into());
        }

        let event = match frame.event_type() {
            "start" => {
                let p: StartPayload = payload(frame, value)?;
                match non_empty_text(p.query) {
                    Some(query) => UpstreamEvent::Start {
                        query,
                        timestamp: non_empty_text(p.timestamp),
                    },
                    None => UpstreamEvent::Ignored,
                }
            }
            "thinking" => {
                let p: ThinkingPayload = payload(frame, value)?;
                match non_empty_text(p.content) {
                    Some(content) => UpstreamEvent::Thinking { content },
                    None => UpstreamEvent::Ignored,
                }
            }
            "tool_call" => {
                let p: ToolCallPayload = payload(frame, value)?;
                match non_empty_text(p.tool) {
                    Some(tool) => UpstreamEvent::ToolCall {
                        tool,
                        input: non_empty_text(p.input).unwrap_or_default(),
                    },
                    None => UpstreamEvent::Ignored,
                }
            }
            "tool_result" => {
                let p: ToolResultPayload = payload(frame, value)?;
                match non_empty_text(p.tool) {
                    Some(tool) => UpstreamEvent::ToolResult {
                        tool,
                        output: non_empty_text(p.output).unwrap_or_default(),
                    },
                    None => UpstreamEvent::Ignored,
                }
            }
            "final_answer" => {
                let p: FinalAnswerPayload = payload(frame, value)?;
                match non_empty_text(p.answer) {
                    Some(answer) => UpstreamEvent::FinalAnswer { answer },
                    None => UpstreamEvent::Ignored,
                }
            }
            "error" => {
                let p: ErrorPayload = payload(frame, value)?;
                match non_empty_text(p.error) {
                    Some(error) => UpstreamEvent::Error { error },
                    None => UpstreamEvent::Ignored,
                }
            }
            _ => UpstreamEvent::Ignored,
        };
        Ok(event)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            UpstreamEvent::Start { .. } => "start",
            UpstreamEvent::Thinking { .. } => "thinking",
            UpstreamEvent::ToolCall { .. } => "tool_call",
            UpstreamEvent::ToolResult { .. } => "tool_result",
            UpstreamEvent::FinalAnswer { .. } => "final_answer",
            UpstreamEvent::Error { .. } => "error",
            UpstreamEvent::Ignored => "ignored",
        }
    }
}

fn payload<T: DeserializeOwned>(frame: &Frame, value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| {
        RelayError::StreamDecode(format!(
            "unexpected payload shape for '{}': {}",
            frame.event_type(),
            e
        ))
        .into()
    })
}

/// Renders a payload field as text. Strings pass through, `null`/`false`/empty
/// strings count as absent, anything else is rendered as compact JSON.
fn non_empty_text(value: Option<Value>) -> Option<String> {
    match value? {
        Value::Null | Value::Bool(false) => None,
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(s),
        other => Some(other.to_string()),
    }
}
