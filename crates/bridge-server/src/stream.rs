//! SSE fan-out: one stream per streaming request.
//!
//! The worker attaches itself as the session's progress sink for the
//! duration of the call and detaches in every exit path (the guard's Drop
//! is the finally). Once the stream has started, failures become visible
//! error text followed by a clean `[DONE]`; the HTTP status never changes
//! after the first byte. Writes after a client disconnect are dropped on
//! the floor by the closed channel.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;
use uuid::Uuid;

use bridge_core::{now_ms, tool_icon, BridgeError, Session, ToolDecision};
use bridge_types::openai::{ChatCompletionChunk, CompletionUsage, OBJECT_CHUNK};
use bridge_types::{PendingToolCall, ProgressEvent, SessionResponse};

use crate::http::acquire_ready_session;
use crate::AppState;

/// Low heartbeat so HTTP clients survive long silent tool chains.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

pub(crate) enum StreamWork {
    Prompt(String),
    Resume(Vec<ToolDecision>),
}

#[derive(Clone)]
struct ChunkMeta {
    id: String,
    created: u64,
    model: String,
}

impl ChunkMeta {
    fn new(model: &str) -> Self {
        Self {
            id: format!("chatcmpl-{}", Uuid::new_v4().simple()),
            created: now_ms() / 1000,
            model: model.to_string(),
        }
    }
}

/// Detaches the progress sink no matter how the worker exits.
struct ProgressGuard(Arc<Session>);

impl Drop for ProgressGuard {
    fn drop(&mut self) {
        self.0.detach_progress();
    }
}

pub(crate) fn respond(
    state: AppState,
    key: String,
    work: StreamWork,
    prefix: Option<String>,
) -> Response {
    let (tx, rx) = mpsc::unbounded_channel::<Event>();
    let meta = ChunkMeta::new(&state.config.model_name);
    tokio::spawn(run_stream(state, key, work, prefix, meta, tx));
    sse_from(rx)
}

/// Synthesized `!bridge` output: one content delta, a finish chunk, done.
pub(crate) fn command_response(state: &AppState, text: &str) -> Response {
    let (tx, rx) = mpsc::unbounded_channel::<Event>();
    let meta = ChunkMeta::new(&state.config.model_name);
    send_json(
        &tx,
        &ChatCompletionChunk::content(&meta.id, meta.created, &meta.model, text, true),
    );
    send_json(
        &tx,
        &ChatCompletionChunk::finish(&meta.id, meta.created, &meta.model, CompletionUsage::new(0, 0)),
    );
    send_done(&tx);
    sse_from(rx)
}

fn sse_from(rx: mpsc::UnboundedReceiver<Event>) -> Response {
    Sse::new(UnboundedReceiverStream::new(rx).map(Ok::<_, Infallible>))
        .keep_alive(
            KeepAlive::new()
                .interval(HEARTBEAT_INTERVAL)
                .text("heartbeat"),
        )
        .into_response()
}

async fn run_stream(
    state: AppState,
    key: String,
    work: StreamWork,
    prefix: Option<String>,
    meta: ChunkMeta,
    tx: mpsc::UnboundedSender<Event>,
) {
    let mut first = true;
    let mut emitted_delta = false;

    if let Some(notice) = prefix {
        send_json(
            &tx,
            &ChatCompletionChunk::content(&meta.id, meta.created, &meta.model, &notice, first),
        );
        first = false;
    }

    let result = drive(&state, &key, work, &meta, &tx, &mut first, &mut emitted_delta).await;

    match result {
        Ok(response) => {
            if !emitted_delta && !response.text.is_empty() {
                send_json(
                    &tx,
                    &ChatCompletionChunk::content(
                        &meta.id,
                        meta.created,
                        &meta.model,
                        &response.text,
                        first,
                    ),
                );
            }
            if response.pending_tool_calls.is_empty() {
                let usage = CompletionUsage::new(
                    response.usage.input_tokens,
                    response.usage.output_tokens,
                );
                send_json(
                    &tx,
                    &ChatCompletionChunk::finish(&meta.id, meta.created, &meta.model, usage),
                );
            } else {
                send_json(&tx, &tool_calls_chunk(&meta, &response.pending_tool_calls));
            }
        }
        Err(error) => {
            send_json(
                &tx,
                &ChatCompletionChunk::content(
                    &meta.id,
                    meta.created,
                    &meta.model,
                    &format!("\n\n❌ Error: {error}"),
                    first,
                ),
            );
        }
    }
    send_done(&tx);
}

async fn drive(
    state: &AppState,
    key: &str,
    work: StreamWork,
    meta: &ChunkMeta,
    tx: &mpsc::UnboundedSender<Event>,
    first: &mut bool,
    emitted_delta: &mut bool,
) -> Result<SessionResponse, BridgeError> {
    match work {
        StreamWork::Prompt(prompt) => {
            let session = acquire_ready_session(state, key).await?;
            let enrichment = state.context.enrich(&prompt, session.tracking()).await;
            session.apply_enrichment(&enrichment);

            let (progress_tx, progress_rx) = mpsc::unbounded_channel();
            session.attach_progress(progress_tx);
            let _guard = ProgressGuard(Arc::clone(&session));

            let rx = session.begin_request(enrichment.prompt)?;
            pump(rx, progress_rx, meta, tx, first, emitted_delta).await
        }
        StreamWork::Resume(decisions) => {
            let session = state.pool.peek(key).await.ok_or_else(|| {
                BridgeError::InvalidRequest("no session awaiting a tool decision".to_string())
            })?;

            let (progress_tx, progress_rx) = mpsc::unbounded_channel();
            session.attach_progress(progress_tx);
            let _guard = ProgressGuard(Arc::clone(&session));

            let rx = session.resume_with_decisions(&decisions)?;
            pump(rx, progress_rx, meta, tx, first, emitted_delta).await
        }
    }
}

async fn pump(
    mut rx: bridge_core::ResponseReceiver,
    mut progress: mpsc::UnboundedReceiver<ProgressEvent>,
    meta: &ChunkMeta,
    tx: &mpsc::UnboundedSender<Event>,
    first: &mut bool,
    emitted_delta: &mut bool,
) -> Result<SessionResponse, BridgeError> {
    loop {
        tokio::select! {
            result = &mut rx => {
                // The frame handler emits progress before resolving, so the
                // channel already holds every delta that belongs in order.
                while let Ok(event) = progress.try_recv() {
                    emit_progress(meta, tx, event, first, emitted_delta);
                }
                return result.map_err(|_| BridgeError::UpstreamDisconnected)?;
            }
            event = progress.recv() => match event {
                Some(event) => emit_progress(meta, tx, event, first, emitted_delta),
                None => {
                    let result = (&mut rx).await;
                    return result.map_err(|_| BridgeError::UpstreamDisconnected)?;
                }
            }
        }
    }
}

fn emit_progress(
    meta: &ChunkMeta,
    tx: &mpsc::UnboundedSender<Event>,
    event: ProgressEvent,
    first: &mut bool,
    emitted_delta: &mut bool,
) {
    if matches!(event, ProgressEvent::TextDelta(_)) {
        *emitted_delta = true;
    }
    let Some(text) = render_progress(&event) else {
        return;
    };
    send_json(
        tx,
        &ChatCompletionChunk::content(&meta.id, meta.created, &meta.model, &text, *first),
    );
    *first = false;
}

/// Chunk text for one progress event: deltas verbatim, everything else as
/// an italicized decoration line. `Turn` is bookkeeping only.
fn render_progress(event: &ProgressEvent) -> Option<String> {
    match event {
        ProgressEvent::TextDelta(text) => Some(text.clone()),
        ProgressEvent::ToolStart { tool, detail } => {
            Some(format!("\n\n_{} {}_\n\n", tool_icon(tool), detail))
        }
        ProgressEvent::ToolResult { tool, success } => Some(format!(
            "_{} {tool} done_\n",
            if *success { "✅" } else { "❌" }
        )),
        ProgressEvent::Thinking(status) => Some(format!("\n_🧠 {status}_\n")),
        ProgressEvent::Turn(_) => None,
    }
}

fn tool_calls_chunk(meta: &ChunkMeta, calls: &[PendingToolCall]) -> Value {
    let tool_calls: Vec<Value> = calls
        .iter()
        .enumerate()
        .map(|(index, call)| {
            json!({
                "index": index,
                "id": call.tool_call_id,
                "type": "function",
                "function": {
                    "name": format!("cc_{}", call.tool_name.to_lowercase()),
                    "arguments": call.input.to_string(),
                },
            })
        })
        .collect();
    json!({
        "id": meta.id,
        "object": OBJECT_CHUNK,
        "created": meta.created,
        "model": meta.model,
        "choices": [{
            "index": 0,
            "delta": { "tool_calls": tool_calls },
            "finish_reason": "tool_calls",
        }],
    })
}

fn send_json<T: Serialize>(tx: &mpsc::UnboundedSender<Event>, value: &T) {
    if let Ok(data) = serde_json::to_string(value) {
        // A closed channel means the client went away; drop silently.
        let _ = tx.send(Event::default().data(data));
    }
}

fn send_done(tx: &mpsc::UnboundedSender<Event>) {
    let _ = tx.send(Event::default().data("[DONE]"));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::test_state;
    use axum::body::to_bytes;
    use serde_json::json;

    #[test]
    fn deltas_render_verbatim_and_decorations_are_italicized() {
        let events = [
            ProgressEvent::Thinking("Processing…".to_string()),
            ProgressEvent::TextDelta("hello ".to_string()),
            ProgressEvent::ToolStart {
                tool: "Bash".to_string(),
                detail: "Running: ls".to_string(),
            },
            ProgressEvent::ToolResult {
                tool: "Bash".to_string(),
                success: true,
            },
            ProgressEvent::TextDelta("world".to_string()),
        ];
        let rendered: Vec<String> = events.iter().filter_map(render_progress).collect();
        assert_eq!(rendered[0], "\n_🧠 Processing…_\n");
        assert_eq!(rendered[1], "hello ");
        assert_eq!(rendered[2], "\n\n_💻 Running: ls_\n\n");
        assert_eq!(rendered[3], "_✅ Bash done_\n");
        assert_eq!(rendered[4], "world");

        // Excluding decorations, deltas concatenate to the final text.
        let concatenated: String = events
            .iter()
            .filter_map(|e| match e {
                ProgressEvent::TextDelta(text) => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(concatenated, "hello world");
    }

    #[test]
    fn turn_events_render_nothing() {
        assert!(render_progress(&ProgressEvent::Turn(3)).is_none());
    }

    #[test]
    fn failed_tool_result_uses_cross_mark() {
        let rendered = render_progress(&ProgressEvent::ToolResult {
            tool: "Edit".to_string(),
            success: false,
        })
        .expect("rendered");
        assert_eq!(rendered, "_❌ Edit done_\n");
    }

    #[test]
    fn tool_calls_chunk_names_functions_with_cc_prefix() {
        let meta = ChunkMeta::new("m");
        let chunk = tool_calls_chunk(
            &meta,
            &[PendingToolCall {
                tool_call_id: "0011aabbccdd".to_string(),
                tool_name: "WebFetch".to_string(),
                input: json!({"url": "https://example.com"}),
            }],
        );
        assert_eq!(chunk["choices"][0]["finish_reason"], "tool_calls");
        let call = &chunk["choices"][0]["delta"]["tool_calls"][0];
        assert_eq!(call["function"]["name"], "cc_webfetch");
        assert_eq!(call["id"], "0011aabbccdd");
    }

    #[tokio::test]
    async fn command_response_is_one_delta_then_finish_then_done() {
        let state = test_state();
        let response = command_response(&state, "strategy set");
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        let text = String::from_utf8(body.to_vec()).expect("utf8");
        assert!(text.contains("strategy set"));
        assert!(text.contains("\"finish_reason\":\"stop\""));
        assert!(text.ends_with("data: [DONE]\n\n"));
    }
}
