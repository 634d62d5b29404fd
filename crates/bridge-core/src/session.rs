//! One upstream conversation: connection lifecycle, request progress, and
//! the cooperative tool-permission interrupt protocol.
//!
//! The session owns its WebSocket exclusively through the reader/writer
//! tasks the pool spawns for it; everything else goes through the methods
//! here. Frame handling is fully synchronous — the interior lock is never
//! held across an await — so frames are applied in receive order and the
//! in-flight request is resolved exactly once.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use bridge_types::{
    CompanionFrame, OutboundFrame, PendingToolCall, ProgressEvent, ResultData, SessionResponse,
    TokenUsage,
};

use crate::context::{ContextTracking, PromptEnrichment};
use crate::error::BridgeError;
use crate::now_ms;
use crate::policy::{PolicyDecision, ToolPolicy};

/// Context-usage percentages that fire a warning, each at most once.
const WARNING_THRESHOLDS: [u8; 4] = [50, 70, 85, 95];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Connecting,
    Ready,
    Busy,
    WaitingToolDecision,
    Dead,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Connecting => "connecting",
            SessionState::Ready => "ready",
            SessionState::Busy => "busy",
            SessionState::WaitingToolDecision => "waiting_tool_decision",
            SessionState::Dead => "dead",
        }
    }

    pub fn is_working(self) -> bool {
        matches!(self, SessionState::Busy | SessionState::WaitingToolDecision)
    }
}

#[derive(Debug, Clone)]
struct PendingPermission {
    request_id: String,
    tool_name: String,
    input: Value,
}

/// A client verdict on one surfaced tool call.
#[derive(Debug, Clone)]
pub struct ToolDecision {
    pub tool_call_id: String,
    pub approved: bool,
    pub message: String,
}

type ResponseSender = oneshot::Sender<Result<SessionResponse, BridgeError>>;
pub type ResponseReceiver = oneshot::Receiver<Result<SessionResponse, BridgeError>>;

struct SessionInner {
    state: SessionState,
    model: String,
    last_activity_at_ms: u64,

    // Per-request accumulators, reset at each new prompt.
    current_text: String,
    current_usage: TokenUsage,
    current_turns: u32,
    saw_message_usage: bool,

    // Lifetime counters, monotone until the session is destroyed.
    total_usage: TokenUsage,
    total_turns: u64,
    total_cost_usd: f64,

    tracking: ContextTracking,

    pending: Option<ResponseSender>,
    pending_permissions: HashMap<String, PendingPermission>,
    progress: Option<mpsc::UnboundedSender<ProgressEvent>>,
    timeout_task: Option<JoinHandle<()>>,
    idle_task: Option<JoinHandle<()>>,
    connect_tx: Option<oneshot::Sender<()>>,
}

pub struct Session {
    pub pool_key: String,
    pub upstream_id: String,
    pub created_at_ms: u64,
    response_timeout_ms: u64,
    token_budget: u64,
    policy: Arc<ToolPolicy>,
    outbound: mpsc::UnboundedSender<OutboundFrame>,
    cancel: CancellationToken,
    /// Self-reference for the timeout task; never upgraded while locked.
    weak_self: Weak<Session>,
    inner: Mutex<SessionInner>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub key: String,
    pub upstream_id: String,
    pub state: &'static str,
    pub model: String,
    pub created_at_ms: u64,
    pub last_activity_at_ms: u64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_turns: u64,
    pub total_cost_usd: f64,
    pub context_pct: u8,
    pub user_turns: u64,
    pub pending_tool_calls: usize,
}

impl Session {
    /// Returns the session plus a receiver that completes when the agent
    /// reports `cli_connected`. Dropping the session's socket before that
    /// drops the sender, which the creator observes as a failed connect.
    pub fn new(
        pool_key: &str,
        upstream_id: &str,
        model_hint: &str,
        outbound: mpsc::UnboundedSender<OutboundFrame>,
        policy: Arc<ToolPolicy>,
        response_timeout_ms: u64,
        token_budget: u64,
    ) -> (Arc<Self>, oneshot::Receiver<()>) {
        let (connect_tx, connect_rx) = oneshot::channel();
        let now = now_ms();
        let session = Arc::new_cyclic(|weak_self| Self {
            pool_key: pool_key.to_string(),
            upstream_id: upstream_id.to_string(),
            created_at_ms: now,
            response_timeout_ms,
            token_budget,
            policy,
            outbound,
            cancel: CancellationToken::new(),
            weak_self: weak_self.clone(),
            inner: Mutex::new(SessionInner {
                state: SessionState::Connecting,
                model: model_hint.to_string(),
                last_activity_at_ms: now,
                current_text: String::new(),
                current_usage: TokenUsage::default(),
                current_turns: 0,
                saw_message_usage: false,
                total_usage: TokenUsage::default(),
                total_turns: 0,
                total_cost_usd: 0.0,
                tracking: ContextTracking::default(),
                pending: None,
                pending_permissions: HashMap::new(),
                progress: None,
                timeout_task: None,
                idle_task: None,
                connect_tx: Some(connect_tx),
            }),
        });
        (session, connect_rx)
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    pub fn model(&self) -> String {
        self.inner.lock().model.clone()
    }

    pub fn last_activity_at_ms(&self) -> u64 {
        self.inner.lock().last_activity_at_ms
    }

    pub fn tracking(&self) -> ContextTracking {
        self.inner.lock().tracking
    }

    pub fn total_cost_usd(&self) -> f64 {
        self.inner.lock().total_cost_usd
    }

    pub fn touch(&self) {
        self.inner.lock().last_activity_at_ms = now_ms();
    }

    /// Flag the next terminal result as an internal-only turn so it is
    /// skipped by user-turn accounting.
    pub fn mark_synthetic_turn(&self) {
        self.inner.lock().tracking.synthetic_turn = true;
    }

    /// Apply the context manager's verdict for the prompt that is about to
    /// be sent.
    pub fn apply_enrichment(&self, enrichment: &PromptEnrichment) {
        let mut inner = self.inner.lock();
        inner.tracking.recovery_done = enrichment.recovery_done;
        if let Some(pct) = enrichment.summary_pct {
            inner.tracking.last_summary_pct = pct;
        }
    }

    /// `!bridge compact`: make the very next prompt carry the compaction
    /// instruction regardless of real context usage.
    pub fn force_compaction(&self, trigger_pct: u8) {
        let mut inner = self.inner.lock();
        inner.tracking.last_summary_pct = 0;
        inner.tracking.last_known_context_pct = trigger_pct;
    }

    pub fn attach_progress(&self, sink: mpsc::UnboundedSender<ProgressEvent>) {
        self.inner.lock().progress = Some(sink);
    }

    pub fn detach_progress(&self) {
        self.inner.lock().progress = None;
    }

    pub fn set_idle_task(&self, handle: JoinHandle<()>) {
        let mut inner = self.inner.lock();
        if let Some(previous) = inner.idle_task.replace(handle) {
            previous.abort();
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let inner = self.inner.lock();
        SessionSnapshot {
            key: self.pool_key.clone(),
            upstream_id: self.upstream_id.clone(),
            state: inner.state.as_str(),
            model: inner.model.clone(),
            created_at_ms: self.created_at_ms,
            last_activity_at_ms: inner.last_activity_at_ms,
            total_input_tokens: inner.total_usage.input_tokens,
            total_output_tokens: inner.total_usage.output_tokens,
            total_turns: inner.total_turns,
            total_cost_usd: inner.total_cost_usd,
            context_pct: inner.tracking.last_known_context_pct,
            user_turns: inner.tracking.user_turn_count,
            pending_tool_calls: inner.pending_permissions.len(),
        }
    }

    /// Start a new prompt round-trip. Resets the per-request accumulators,
    /// arms the response timeout, and sends the prompt upstream.
    pub fn begin_request(&self, prompt: String) -> Result<ResponseReceiver, BridgeError> {
        let rx = {
            let mut inner = self.inner.lock();
            match inner.state {
                SessionState::Ready => {}
                SessionState::Dead => {
                    return Err(BridgeError::SessionClosed("session is dead".to_string()))
                }
                _ => return Err(BridgeError::SessionBusy),
            }
            inner.current_text.clear();
            inner.current_usage = TokenUsage::default();
            inner.current_turns = 0;
            inner.saw_message_usage = false;
            let (tx, rx) = oneshot::channel();
            inner.pending = Some(tx);
            inner.state = SessionState::Busy;
            inner.last_activity_at_ms = now_ms();
            self.arm_timeout(&mut inner);
            rx
        };

        if self
            .outbound
            .send(OutboundFrame::UserMessage { content: prompt })
            .is_err()
        {
            self.fail_send();
            return Err(BridgeError::UpstreamDisconnected);
        }
        Ok(rx)
    }

    /// Forward client verdicts for surfaced tool calls and resume the turn.
    pub fn resume_with_decisions(
        &self,
        decisions: &[ToolDecision],
    ) -> Result<ResponseReceiver, BridgeError> {
        let (frames, rx) = {
            let mut inner = self.inner.lock();
            if inner.state != SessionState::WaitingToolDecision {
                return Err(BridgeError::InvalidRequest(
                    "session has no pending tool decision".to_string(),
                ));
            }
            let mut frames = Vec::with_capacity(decisions.len());
            for decision in decisions {
                let Some(permission) = inner.pending_permissions.remove(&decision.tool_call_id)
                else {
                    warn!(
                        tool_call_id = %decision.tool_call_id,
                        "tool result for unknown pending permission"
                    );
                    continue;
                };
                let frame = if decision.approved {
                    OutboundFrame::control_allow(&permission.request_id, permission.input)
                } else {
                    OutboundFrame::control_deny(&permission.request_id, decision.message.clone())
                };
                info!(
                    tool = %permission.tool_name,
                    approved = decision.approved,
                    "forwarding tool permission decision"
                );
                frames.push(frame);
            }
            if frames.is_empty() {
                return Err(BridgeError::InvalidRequest(
                    "no tool results matched a pending tool call".to_string(),
                ));
            }
            let (tx, rx) = oneshot::channel();
            inner.pending = Some(tx);
            inner.state = SessionState::Busy;
            inner.last_activity_at_ms = now_ms();
            self.arm_timeout(&mut inner);
            (frames, rx)
        };

        for frame in frames {
            if self.outbound.send(frame).is_err() {
                self.fail_send();
                return Err(BridgeError::UpstreamDisconnected);
            }
        }
        Ok(rx)
    }

    /// Apply one upstream frame. Called only from the reader task.
    pub fn handle_frame(&self, frame: CompanionFrame) {
        match frame {
            CompanionFrame::SessionInit { session } => {
                if let Some(model) = session.model {
                    self.inner.lock().model = model;
                }
            }
            CompanionFrame::CliConnected => {
                let mut inner = self.inner.lock();
                if inner.state == SessionState::Connecting {
                    inner.state = SessionState::Ready;
                }
                if let Some(tx) = inner.connect_tx.take() {
                    let _ = tx.send(());
                }
                inner.last_activity_at_ms = now_ms();
            }
            CompanionFrame::Assistant {
                parent_tool_use_id,
                message,
            } => {
                if parent_tool_use_id.is_some() {
                    // Sub-agent chatter, not part of the top-level reply.
                    return;
                }
                let mut inner = self.inner.lock();
                for text in message.text_blocks() {
                    inner.current_text.push_str(text);
                    emit_progress(&mut inner, ProgressEvent::TextDelta(text.to_string()));
                }
                if let Some(usage) = message.usage {
                    inner.current_usage.add(usage);
                    inner.saw_message_usage = true;
                }
                inner.current_turns += 1;
                let turn = inner.current_turns;
                emit_progress(&mut inner, ProgressEvent::Turn(turn));
                inner.last_activity_at_ms = now_ms();
            }
            CompanionFrame::StreamEvent { event } => self.on_stream_event(&event),
            CompanionFrame::PermissionRequest {
                request_id,
                tool_name,
                input,
            } => self.on_permission_request(request_id, tool_name, input),
            CompanionFrame::ToolResult {
                tool_name,
                is_error,
            } => {
                let mut inner = self.inner.lock();
                emit_progress(
                    &mut inner,
                    ProgressEvent::ToolResult {
                        tool: tool_name,
                        success: !is_error,
                    },
                );
                inner.last_activity_at_ms = now_ms();
            }
            CompanionFrame::Result { data } => self.on_result(data),
            CompanionFrame::CliDisconnected => {
                let mut inner = self.inner.lock();
                if inner.state.is_working() {
                    warn!(key = %self.pool_key, "agent disconnected mid-request");
                    self.die_locked(&mut inner, BridgeError::UpstreamDisconnected);
                } else {
                    info!(key = %self.pool_key, "agent disconnected while idle");
                }
            }
            CompanionFrame::Ping | CompanionFrame::Pong | CompanionFrame::Heartbeat => {}
            CompanionFrame::Unknown { frame_type } => {
                info!(key = %self.pool_key, frame_type = %frame_type, "unrecognized companion frame");
            }
        }
    }

    /// Socket closed or errored under the reader task.
    pub fn on_socket_closed(&self) {
        let mut inner = self.inner.lock();
        if inner.state == SessionState::Dead {
            return;
        }
        if let Some(tx) = inner.connect_tx.take() {
            drop(tx);
        }
        if inner.state.is_working() {
            warn!(key = %self.pool_key, "companion socket closed mid-request");
            self.die_locked(&mut inner, BridgeError::UpstreamDisconnected);
        } else {
            info!(
                key = %self.pool_key,
                state = inner.state.as_str(),
                "companion socket closed"
            );
            inner.state = SessionState::Dead;
        }
    }

    /// Tear the session down: cancel IO tasks, reject anything pending,
    /// clear the progress sink.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        let mut inner = self.inner.lock();
        if let Some(handle) = inner.timeout_task.take() {
            handle.abort();
        }
        if let Some(handle) = inner.idle_task.take() {
            handle.abort();
        }
        inner.progress = None;
        if let Some(tx) = inner.pending.take() {
            let _ = tx.send(Err(BridgeError::SessionClosed(
                "session destroyed".to_string(),
            )));
        }
        inner.state = SessionState::Dead;
    }

    fn on_permission_request(&self, request_id: String, tool_name: String, input: Value) {
        match self.policy.decide(&tool_name, &input) {
            PolicyDecision::Allow => {
                debug!(tool = %tool_name, "tool auto-allowed by policy");
                {
                    let mut inner = self.inner.lock();
                    let detail = crate::detail::tool_detail(&tool_name, &input);
                    emit_progress(
                        &mut inner,
                        ProgressEvent::ToolStart {
                            tool: tool_name.clone(),
                            detail,
                        },
                    );
                    inner.last_activity_at_ms = now_ms();
                }
                let _ = self.outbound.send(OutboundFrame::PermissionResponse {
                    request_id,
                    behavior: "allow".to_string(),
                    updated_input: Some(input),
                    message: None,
                });
            }
            PolicyDecision::Deny => {
                info!(tool = %tool_name, "tool auto-denied by policy");
                let _ = self.outbound.send(OutboundFrame::PermissionResponse {
                    request_id,
                    behavior: "deny".to_string(),
                    updated_input: None,
                    message: Some("denied by bridge tool policy".to_string()),
                });
            }
            PolicyDecision::Passthrough => {
                let mut inner = self.inner.lock();
                let tool_call_id = Uuid::new_v4().simple().to_string()[..12].to_string();
                info!(tool = %tool_name, tool_call_id = %tool_call_id, "surfacing tool call to client");
                inner.pending_permissions.insert(
                    tool_call_id,
                    PendingPermission {
                        request_id,
                        tool_name,
                        input,
                    },
                );
                if let Some(handle) = inner.timeout_task.take() {
                    handle.abort();
                }
                inner.state = SessionState::WaitingToolDecision;
                inner.last_activity_at_ms = now_ms();
                let pending_tool_calls = inner
                    .pending_permissions
                    .iter()
                    .map(|(id, permission)| PendingToolCall {
                        tool_call_id: id.clone(),
                        tool_name: permission.tool_name.clone(),
                        input: permission.input.clone(),
                    })
                    .collect();
                let response = SessionResponse {
                    text: inner.current_text.clone(),
                    model: inner.model.clone(),
                    usage: inner.current_usage,
                    cost_usd: 0.0,
                    turns: inner.current_turns,
                    pending_tool_calls,
                };
                if let Some(tx) = inner.pending.take() {
                    let _ = tx.send(Ok(response));
                }
            }
        }
    }

    fn on_stream_event(&self, event: &Value) {
        let event_type = event.get("type").and_then(Value::as_str).unwrap_or("");
        match event_type {
            "message_start" => {
                let mut inner = self.inner.lock();
                emit_progress(&mut inner, ProgressEvent::Thinking("Processing…".to_string()));
            }
            "content_block_start" => {
                let block = event.get("content_block");
                let block_type = block
                    .and_then(|b| b.get("type"))
                    .and_then(Value::as_str)
                    .unwrap_or("");
                let status = match block_type {
                    "thinking" => Some("Thinking…".to_string()),
                    "text" => Some("Writing response…".to_string()),
                    "tool_use" => {
                        let name = block
                            .and_then(|b| b.get("name"))
                            .and_then(Value::as_str)
                            .unwrap_or("tool");
                        Some(format!("Preparing {name}…"))
                    }
                    _ => None,
                };
                if let Some(status) = status {
                    let mut inner = self.inner.lock();
                    emit_progress(&mut inner, ProgressEvent::Thinking(status));
                }
            }
            "content_block_delta" => {
                // Thinking deltas are logged only, never surfaced as text.
                if event
                    .get("delta")
                    .and_then(|d| d.get("type"))
                    .and_then(Value::as_str)
                    == Some("thinking_delta")
                {
                    debug!(key = %self.pool_key, "thinking delta");
                }
            }
            _ => {}
        }
    }

    fn on_result(&self, data: ResultData) {
        let mut inner = self.inner.lock();
        if let Some(handle) = inner.timeout_task.take() {
            handle.abort();
        }

        if !inner.saw_message_usage {
            if let Some(usage) = data.usage {
                inner.current_usage = usage;
            }
        }
        let turns = if data.num_turns > 0 {
            data.num_turns
        } else {
            inner.current_turns
        };

        let current_usage = inner.current_usage;
        inner.total_usage.add(current_usage);
        inner.total_turns += u64::from(turns);
        inner.total_cost_usd += data.total_cost_usd;

        let pct = context_percent(current_usage.input_tokens, self.token_budget);
        inner.tracking.last_known_context_pct = pct;
        for threshold in WARNING_THRESHOLDS {
            if pct >= threshold && inner.tracking.last_warning_pct < threshold {
                inner.tracking.last_warning_pct = threshold;
                warn!(
                    key = %self.pool_key,
                    context_pct = pct,
                    threshold,
                    "context window filling up"
                );
            }
        }

        if inner.tracking.synthetic_turn {
            inner.tracking.synthetic_turn = false;
        } else {
            inner.tracking.user_turn_count += 1;
        }

        let mut text = inner.current_text.clone();
        if text.is_empty() {
            if data.is_error && !data.errors.is_empty() {
                text = data.joined_errors();
            } else if let Some(result) = &data.result {
                text = result.clone();
            }
        }

        inner.state = SessionState::Ready;
        inner.last_activity_at_ms = now_ms();
        let response = SessionResponse {
            text,
            model: inner.model.clone(),
            usage: current_usage,
            cost_usd: data.total_cost_usd,
            turns,
            pending_tool_calls: Vec::new(),
        };
        match inner.pending.take() {
            Some(tx) => {
                let _ = tx.send(Ok(response));
            }
            None => warn!(key = %self.pool_key, "terminal result with no pending request"),
        }
    }

    fn arm_timeout(&self, inner: &mut SessionInner) {
        if let Some(handle) = inner.timeout_task.take() {
            handle.abort();
        }
        let weak = self.weak_self.clone();
        let timeout_ms = self.response_timeout_ms;
        inner.timeout_task = Some(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(timeout_ms)).await;
            if let Some(session) = weak.upgrade() {
                session.on_response_timeout();
            }
        }));
    }

    fn on_response_timeout(&self) {
        let mut inner = self.inner.lock();
        inner.timeout_task = None;
        if let Some(tx) = inner.pending.take() {
            warn!(
                key = %self.pool_key,
                timeout_ms = self.response_timeout_ms,
                "response timed out, returning session to ready"
            );
            inner.state = SessionState::Ready;
            let _ = tx.send(Err(BridgeError::ResponseTimeout(self.response_timeout_ms)));
        }
    }

    /// The writer task is gone; nothing can reach the upstream any more.
    fn fail_send(&self) {
        let mut inner = self.inner.lock();
        self.die_locked(&mut inner, BridgeError::UpstreamDisconnected);
    }

    fn die_locked(&self, inner: &mut SessionInner, error: BridgeError) {
        if let Some(handle) = inner.timeout_task.take() {
            handle.abort();
        }
        inner.state = SessionState::Dead;
        if let Some(tx) = inner.pending.take() {
            let _ = tx.send(Err(error));
        }
    }
}

fn emit_progress(inner: &mut SessionInner, event: ProgressEvent) {
    if let Some(sink) = &inner.progress {
        if sink.send(event).is_err() {
            inner.progress = None;
        }
    }
}

fn context_percent(input_tokens: u64, budget: u64) -> u8 {
    if budget == 0 {
        return 0;
    }
    let pct = (input_tokens as f64 / budget as f64 * 100.0).round();
    pct.clamp(0.0, 255.0) as u8
}
