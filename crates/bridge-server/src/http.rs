//! Request dispatcher for the OpenAI-compatible endpoint.
//!
//! Validates the request, derives the pool key, and routes to one of three
//! paths: `!bridge` command interception, tool-result resumption, or a
//! fresh prompt. The pool key deliberately ignores per-request ids and
//! system prompts — front-ends embed timestamps and token counts in both,
//! and keying on them would break session reuse every single turn.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::info;
use uuid::Uuid;

use bridge_core::{now_ms, BridgeError, Session, SessionState, ToolDecision};
use bridge_types::openai::{
    ChatCompletion, ChatCompletionRequest, ChatMessage, CompletionChoice, CompletionUsage,
    ErrorBody, FunctionCall, ResponseMessage, ToolCall, OBJECT_COMPLETION,
};
use bridge_types::SessionResponse;

use crate::stream::{self, StreamWork};
use crate::{commands, AppState};

const BUSY_POLL_INTERVAL: Duration = Duration::from_millis(500);
const VALID_ROLES: [&str; 4] = ["system", "user", "assistant", "tool"];
const APPROVAL_WORDS: [&str; 9] = [
    "approved", "allow", "allowed", "yes", "true", "ok", "accept", "permit", "granted",
];

pub(crate) async fn chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<ChatCompletionRequest>, JsonRejection>,
) -> Response {
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => return invalid_request(rejection.body_text()),
    };
    if let Err(message) = validate(&request) {
        return invalid_request(message);
    }

    let key = derive_session_key(&headers, &request);
    let request_id = headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-")
        .to_string();
    let streaming = request.stream.unwrap_or(false);
    info!(key = %key, request_id = %request_id, streaming, "chat completion request");

    let prompt = match latest_user_text(&request.messages) {
        Some(prompt) if !prompt.trim().is_empty() => prompt,
        _ => return invalid_request("no user message with text content"),
    };

    if commands::is_bridge_command(&prompt) {
        let text = commands::execute(&state, &key, &prompt).await;
        return if streaming {
            stream::command_response(&state, &text)
        } else {
            let response = SessionResponse {
                text,
                model: state.config.model_name.clone(),
                usage: Default::default(),
                cost_usd: 0.0,
                turns: 0,
                pending_tool_calls: Vec::new(),
            };
            Json(build_completion(&state.config.model_name, &response)).into_response()
        };
    }

    let decisions = tool_decisions(&request.messages);
    if !decisions.is_empty() {
        if let Some(session) = state.pool.peek(&key).await {
            if session.state() == SessionState::WaitingToolDecision {
                if streaming {
                    return stream::respond(state, key, StreamWork::Resume(decisions), None);
                }
                return match state.pool.resume_with_tool_results(&session, &decisions).await {
                    Ok(response) => completion_response(&state, response),
                    Err(error) => error_response(error),
                };
            }
        }
    }

    if streaming {
        let prefix = match state.pool.peek(&key).await {
            Some(session) if session.state().is_working() => Some(
                "_⏳ Previous task still running; waiting for the session to free up…_\n\n"
                    .to_string(),
            ),
            _ => None,
        };
        return stream::respond(state, key, StreamWork::Prompt(prompt), prefix);
    }

    match run_prompt(&state, &key, &prompt).await {
        Ok(response) => completion_response(&state, response),
        Err(error) => error_response(error),
    }
}

/// Get the keyed session into `Ready`, waiting out a previous request and
/// recreating the session if it dies underneath the wait. The session
/// handle is re-bound after recreation; the old one is gone.
pub(crate) async fn acquire_ready_session(
    state: &AppState,
    key: &str,
) -> Result<Arc<Session>, BridgeError> {
    let mut session = state.pool.get_or_create(key).await?;
    let deadline = Instant::now() + Duration::from_millis(state.config.response_timeout_ms);
    loop {
        match session.state() {
            SessionState::Ready => return Ok(session),
            SessionState::Dead => {
                state.pool.destroy(key, "found dead while waiting").await;
                session = state.pool.get_or_create(key).await?;
            }
            _ => {
                if Instant::now() >= deadline {
                    return Err(BridgeError::SessionBusy);
                }
                tokio::time::sleep(BUSY_POLL_INTERVAL).await;
            }
        }
    }
}

/// Full non-streaming round-trip: settle the session, enrich the prompt,
/// send, await the terminal result.
pub(crate) async fn run_prompt(
    state: &AppState,
    key: &str,
    prompt: &str,
) -> Result<SessionResponse, BridgeError> {
    let session = acquire_ready_session(state, key).await?;
    let enrichment = state.context.enrich(prompt, session.tracking()).await;
    session.apply_enrichment(&enrichment);
    state.pool.send_prompt(&session, enrichment.prompt).await
}

pub(crate) fn derive_session_key(headers: &HeaderMap, request: &ChatCompletionRequest) -> String {
    if let Some(value) = headers.get("x-session-key").and_then(|v| v.to_str().ok()) {
        let value = value.trim();
        if !value.is_empty() {
            return format!("key:{value}");
        }
    }
    if let Some(model) = request.model.as_deref() {
        let model = model.trim();
        if !model.is_empty() {
            return format!("model:{model}");
        }
    }
    "default".to_string()
}

fn validate(request: &ChatCompletionRequest) -> Result<(), String> {
    if request.messages.is_empty() {
        return Err("messages must be a non-empty array".to_string());
    }
    for message in &request.messages {
        if !VALID_ROLES.contains(&message.role.as_str()) {
            return Err(format!("invalid message role: {}", message.role));
        }
    }
    Ok(())
}

fn latest_user_text(messages: &[ChatMessage]) -> Option<String> {
    messages
        .iter()
        .rev()
        .find(|m| m.role == "user")
        .map(|m| m.text())
}

fn tool_decisions(messages: &[ChatMessage]) -> Vec<ToolDecision> {
    messages
        .iter()
        .filter(|m| m.role == "tool")
        .filter_map(|m| {
            let tool_call_id = m.tool_call_id.clone()?;
            let content = m.text();
            Some(ToolDecision {
                tool_call_id,
                approved: is_approval(&content),
                message: content,
            })
        })
        .collect()
}

/// A tool-result body means approval when, stripped of everything but
/// letters and lowercased, it is one of the approval words. Anything else
/// is a denial whose text is forwarded as the reason.
pub(crate) fn is_approval(content: &str) -> bool {
    let normalized: String = content
        .chars()
        .filter(|c| c.is_alphabetic())
        .collect::<String>()
        .to_lowercase();
    APPROVAL_WORDS.contains(&normalized.as_str())
}

fn completion_response(state: &AppState, response: SessionResponse) -> Response {
    let model = if response.model.is_empty() {
        state.config.model_name.as_str()
    } else {
        response.model.as_str()
    };
    Json(build_completion(model, &response)).into_response()
}

pub(crate) fn build_completion(model: &str, response: &SessionResponse) -> ChatCompletion {
    let (message, finish_reason) = if response.pending_tool_calls.is_empty() {
        (
            ResponseMessage {
                role: "assistant".to_string(),
                content: Some(response.text.clone()),
                tool_calls: None,
            },
            "stop",
        )
    } else {
        let tool_calls = response
            .pending_tool_calls
            .iter()
            .map(|call| ToolCall {
                id: call.tool_call_id.clone(),
                call_type: "function".to_string(),
                function: FunctionCall {
                    name: format!("cc_{}", call.tool_name.to_lowercase()),
                    arguments: call.input.to_string(),
                },
            })
            .collect();
        (
            ResponseMessage {
                role: "assistant".to_string(),
                content: (!response.text.is_empty()).then(|| response.text.clone()),
                tool_calls: Some(tool_calls),
            },
            "tool_calls",
        )
    };
    ChatCompletion {
        id: format!("chatcmpl-{}", Uuid::new_v4().simple()),
        object: OBJECT_COMPLETION.to_string(),
        created: now_ms() / 1000,
        model: model.to_string(),
        choices: vec![CompletionChoice {
            index: 0,
            message,
            finish_reason: finish_reason.to_string(),
        }],
        usage: CompletionUsage::new(response.usage.input_tokens, response.usage.output_tokens),
    }
}

fn invalid_request(message: impl Into<String>) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorBody::invalid_request(message)),
    )
        .into_response()
}

pub(crate) fn error_response(error: BridgeError) -> Response {
    let status = match &error {
        BridgeError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        BridgeError::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
        BridgeError::SessionBusy | BridgeError::ResponseTimeout(_) => {
            StatusCode::TOO_MANY_REQUESTS
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let body = if status == StatusCode::BAD_REQUEST {
        ErrorBody::invalid_request(error.to_string())
    } else {
        ErrorBody::server_error(error.to_string())
    };
    (status, Json(body)).into_response()
}
