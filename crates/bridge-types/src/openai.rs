//! OpenAI chat-completions surface.
//!
//! Requests are parsed permissively (content may be a plain string or a
//! list of typed blocks); responses are fully typed so every handler and
//! the stream fan-out emit the same shapes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const OBJECT_COMPLETION: &str = "chat.completion";
pub const OBJECT_CHUNK: &str = "chat.completion.chunk";

#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionRequest {
    #[serde(default)]
    pub model: Option<String>,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: Option<bool>,
    #[serde(default)]
    pub tools: Option<Value>,
    #[serde(default)]
    pub max_tokens: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: Option<Value>,
    #[serde(default)]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn text(&self) -> String {
        self.content.as_ref().map(content_text).unwrap_or_default()
    }
}

/// Flatten an OpenAI content field into plain text: either the string
/// itself, or the concatenation of every `type == "text"` block.
pub fn content_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
            .filter_map(|b| b.get("text").and_then(Value::as_str))
            .collect(),
        _ => String::new(),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CompletionUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl CompletionUsage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FunctionCall {
    pub name: String,
    pub arguments: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: String,
    pub function: FunctionCall,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResponseMessage {
    pub role: String,
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompletionChoice {
    pub index: u32,
    pub message: ResponseMessage,
    pub finish_reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletion {
    pub id: String,
    pub object: String,
    pub created: u64,
    pub model: String,
    pub choices: Vec<CompletionChoice>,
    pub usage: CompletionUsage,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ChunkDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChunkChoice {
    pub index: u32,
    pub delta: ChunkDelta,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: String,
    pub created: u64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<CompletionUsage>,
}

impl ChatCompletionChunk {
    pub fn content(id: &str, created: u64, model: &str, text: &str, first: bool) -> Self {
        Self {
            id: id.to_string(),
            object: OBJECT_CHUNK.to_string(),
            created,
            model: model.to_string(),
            choices: vec![ChunkChoice {
                index: 0,
                delta: ChunkDelta {
                    role: first.then(|| "assistant".to_string()),
                    content: Some(text.to_string()),
                },
                finish_reason: None,
            }],
            usage: None,
        }
    }

    pub fn finish(id: &str, created: u64, model: &str, usage: CompletionUsage) -> Self {
        Self {
            id: id.to_string(),
            object: OBJECT_CHUNK.to_string(),
            created,
            model: model.to_string(),
            choices: vec![ChunkChoice {
                index: 0,
                delta: ChunkDelta::default(),
                finish_reason: Some("stop".to_string()),
            }],
            usage: Some(usage),
        }
    }
}

/// OpenAI-shaped error body.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorDetail {
    pub message: String,
    #[serde(rename = "type")]
    pub error_type: String,
}

impl ErrorBody {
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self {
            error: ErrorDetail {
                message: message.into(),
                error_type: "invalid_request_error".to_string(),
            },
        }
    }

    pub fn server_error(message: impl Into<String>) -> Self {
        Self {
            error: ErrorDetail {
                message: message.into(),
                error_type: "server_error".to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn content_text_handles_string_and_blocks() {
        assert_eq!(content_text(&json!("plain")), "plain");
        let blocks = json!([
            {"type": "text", "text": "a"},
            {"type": "image_url", "image_url": {"url": "x"}},
            {"type": "text", "text": "b"}
        ]);
        assert_eq!(content_text(&blocks), "ab");
        assert_eq!(content_text(&json!(42)), "");
    }

    #[test]
    fn first_content_chunk_carries_role() {
        let chunk = ChatCompletionChunk::content("chatcmpl-1", 1, "m", "hi", true);
        let value = serde_json::to_value(&chunk).expect("serialize");
        assert_eq!(value["choices"][0]["delta"]["role"], "assistant");
        assert_eq!(value["choices"][0]["delta"]["content"], "hi");

        let chunk = ChatCompletionChunk::content("chatcmpl-1", 1, "m", "there", false);
        let value = serde_json::to_value(&chunk).expect("serialize");
        assert!(value["choices"][0]["delta"].get("role").is_none());
    }

    #[test]
    fn finish_chunk_has_stop_reason_and_usage() {
        let chunk =
            ChatCompletionChunk::finish("chatcmpl-1", 1, "m", CompletionUsage::new(10, 5));
        let value = serde_json::to_value(&chunk).expect("serialize");
        assert_eq!(value["choices"][0]["finish_reason"], "stop");
        assert_eq!(value["usage"]["total_tokens"], 15);
    }
}
