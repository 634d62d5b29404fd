//! Wire types shared between the bridge core and the HTTP surface.
//!
//! The Companion protocol is treated as immutable from our side: frames we
//! do not recognize are surfaced as [`CompanionFrame::Unknown`] and logged
//! by the consumer, never dropped silently.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod openai;

/// Token usage attached to assistant messages and terminal results.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn add(&mut self, other: TokenUsage) {
        self.input_tokens = self.input_tokens.saturating_add(other.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(other.output_tokens);
    }

    pub fn is_empty(&self) -> bool {
        self.input_tokens == 0 && self.output_tokens == 0
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionInitInfo {
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AssistantMessage {
    /// Raw content blocks; only `type == "text"` blocks are consumed.
    #[serde(default)]
    pub content: Vec<Value>,
    #[serde(default)]
    pub usage: Option<TokenUsage>,
    #[serde(default)]
    pub model: Option<String>,
}

impl AssistantMessage {
    /// Concatenated text of every `type == "text"` content block.
    pub fn text_blocks(&self) -> Vec<&str> {
        self.content
            .iter()
            .filter(|block| block.get("type").and_then(Value::as_str) == Some("text"))
            .filter_map(|block| block.get("text").and_then(Value::as_str))
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResultData {
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub errors: Vec<Value>,
    #[serde(default)]
    pub total_cost_usd: f64,
    #[serde(default)]
    pub num_turns: u32,
    #[serde(default)]
    pub usage: Option<TokenUsage>,
}

impl ResultData {
    /// Errors joined into a single human-readable line.
    pub fn joined_errors(&self) -> String {
        self.errors
            .iter()
            .map(|e| match e.as_str() {
                Some(s) => s.to_string(),
                None => e.to_string(),
            })
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// One frame received from the Companion WebSocket.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CompanionFrame {
    SessionInit {
        #[serde(default)]
        session: SessionInitInfo,
    },
    CliConnected,
    Assistant {
        #[serde(default)]
        parent_tool_use_id: Option<String>,
        #[serde(default)]
        message: AssistantMessage,
    },
    StreamEvent {
        #[serde(default)]
        event: Value,
    },
    PermissionRequest {
        request_id: String,
        tool_name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool_name: String,
        #[serde(default)]
        is_error: bool,
    },
    Result {
        data: ResultData,
    },
    CliDisconnected,
    Ping,
    Pong,
    Heartbeat,
    #[serde(skip)]
    Unknown { frame_type: String },
}

impl CompanionFrame {
    /// Parse one raw text frame. Anything that is valid JSON but not a
    /// recognized frame shape comes back as [`CompanionFrame::Unknown`].
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        let value: Value = serde_json::from_str(raw)?;
        let frame_type = value
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        Ok(serde_json::from_value(value)
            .unwrap_or(CompanionFrame::Unknown { frame_type }))
    }
}

/// One frame sent to the Companion WebSocket.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    UserMessage {
        content: String,
    },
    PermissionResponse {
        request_id: String,
        behavior: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        updated_input: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    ControlResponse {
        response: ControlResponsePayload,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct ControlResponsePayload {
    pub subtype: String,
    pub request_id: String,
    pub response: ControlDecision,
}

#[derive(Debug, Clone, Serialize)]
pub struct ControlDecision {
    pub behavior: String,
    #[serde(rename = "updatedInput", skip_serializing_if = "Option::is_none")]
    pub updated_input: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl OutboundFrame {
    pub fn control_allow(request_id: &str, updated_input: Value) -> Self {
        OutboundFrame::ControlResponse {
            response: ControlResponsePayload {
                subtype: "success".to_string(),
                request_id: request_id.to_string(),
                response: ControlDecision {
                    behavior: "allow".to_string(),
                    updated_input: Some(updated_input),
                    message: None,
                },
            },
        }
    }

    pub fn control_deny(request_id: &str, message: String) -> Self {
        OutboundFrame::ControlResponse {
            response: ControlResponsePayload {
                subtype: "success".to_string(),
                request_id: request_id.to_string(),
                response: ControlDecision {
                    behavior: "deny".to_string(),
                    updated_input: None,
                    message: Some(message),
                },
            },
        }
    }
}

/// Progress emitted by a session while a request is in flight. The SSE
/// fan-out is the only consumer; a detached sink drops events on the floor.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    TextDelta(String),
    ToolStart { tool: String, detail: String },
    ToolResult { tool: String, success: bool },
    Thinking(String),
    Turn(u32),
}

/// A tool-use request parked for the client to decide.
#[derive(Debug, Clone, Serialize)]
pub struct PendingToolCall {
    pub tool_call_id: String,
    pub tool_name: String,
    pub input: Value,
}

/// Terminal value of one prompt round-trip.
#[derive(Debug, Clone)]
pub struct SessionResponse {
    pub text: String,
    pub model: String,
    pub usage: TokenUsage,
    pub cost_usd: f64,
    pub turns: u32,
    pub pending_tool_calls: Vec<PendingToolCall>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_assistant_frame_and_extracts_text() {
        let raw = json!({
            "type": "assistant",
            "parent_tool_use_id": null,
            "message": {
                "content": [
                    {"type": "text", "text": "hello"},
                    {"type": "tool_use", "name": "Read"},
                    {"type": "text", "text": " world"}
                ],
                "usage": {"input_tokens": 12, "output_tokens": 3},
                "model": "claude-code"
            }
        })
        .to_string();

        match CompanionFrame::parse(&raw).expect("frame") {
            CompanionFrame::Assistant {
                parent_tool_use_id,
                message,
            } => {
                assert!(parent_tool_use_id.is_none());
                assert_eq!(message.text_blocks().join(""), "hello world");
                assert_eq!(message.usage.map(|u| u.input_tokens), Some(12));
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn unrecognized_frame_type_becomes_unknown() {
        let frame = CompanionFrame::parse(r#"{"type":"telemetry","data":{}}"#).expect("frame");
        match frame {
            CompanionFrame::Unknown { frame_type } => assert_eq!(frame_type, "telemetry"),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn result_frame_joins_structured_errors() {
        let raw = json!({
            "type": "result",
            "data": {
                "is_error": true,
                "errors": ["boom", {"code": 7}],
                "total_cost_usd": 0.5,
                "num_turns": 2
            }
        })
        .to_string();
        match CompanionFrame::parse(&raw).expect("frame") {
            CompanionFrame::Result { data } => {
                assert!(data.is_error);
                assert_eq!(data.joined_errors(), "boom; {\"code\":7}");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn control_allow_serializes_updated_input_camel_case() {
        let frame = OutboundFrame::control_allow("req-1", json!({"path": "a.rs"}));
        let value = serde_json::to_value(&frame).expect("serialize");
        assert_eq!(value["type"], "control_response");
        assert_eq!(value["response"]["subtype"], "success");
        assert_eq!(value["response"]["response"]["behavior"], "allow");
        assert_eq!(value["response"]["response"]["updatedInput"]["path"], "a.rs");
    }
}
