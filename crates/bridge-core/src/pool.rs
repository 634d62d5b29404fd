//! Keyed pool of upstream sessions.
//!
//! One session per pool key, at most `max_sessions` total. Creation sweeps
//! dead entries first, then evicts the least-recently-active session that
//! is safe to evict; a working session is never removed, the pool just
//! runs over its cap until one settles.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use bridge_types::{CompanionFrame, OutboundFrame, SessionResponse};

use crate::companion::{CompanionClient, CompanionSocket};
use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::now_ms;
use crate::policy::ToolPolicy;
use crate::session::{Session, SessionSnapshot, SessionState, ToolDecision};

#[derive(Clone)]
pub struct SessionPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    companion: CompanionClient,
    policy: Arc<ToolPolicy>,
    config: BridgeConfig,
}

impl SessionPool {
    pub fn new(config: BridgeConfig, policy: Arc<ToolPolicy>) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                sessions: RwLock::new(HashMap::new()),
                companion: CompanionClient::new(&config.companion_url),
                policy,
                config,
            }),
        }
    }

    /// Look up a session without creating one.
    pub async fn peek(&self, key: &str) -> Option<Arc<Session>> {
        self.inner.sessions.read().await.get(key).cloned()
    }

    pub async fn list(&self) -> Vec<SessionSnapshot> {
        let sessions = self.inner.sessions.read().await;
        let mut snapshots: Vec<_> = sessions.values().map(|s| s.snapshot()).collect();
        snapshots.sort_by(|a, b| a.key.cmp(&b.key));
        snapshots
    }

    /// Return the live session for `key`, creating one upstream if needed.
    pub async fn get_or_create(&self, key: &str) -> Result<Arc<Session>> {
        {
            let sessions = self.inner.sessions.read().await;
            if let Some(session) = sessions.get(key) {
                if session.state() != SessionState::Dead {
                    session.touch();
                    return Ok(Arc::clone(session));
                }
            }
        }

        let (session, connected) = {
            let mut sessions = self.inner.sessions.write().await;
            if let Some(session) = sessions.get(key) {
                if session.state() != SessionState::Dead {
                    session.touch();
                    return Ok(Arc::clone(session));
                }
            }
            self.ensure_room(&mut sessions);

            let upstream_id = self
                .inner
                .companion
                .create_session(
                    &self.inner.config.permission_mode,
                    &self.inner.config.session_cwd,
                )
                .await?;
            let socket = match self.inner.companion.connect(&upstream_id).await {
                Ok(socket) => socket,
                Err(error) => {
                    self.inner.companion.kill_session(&upstream_id);
                    return Err(error);
                }
            };

            let (out_tx, out_rx) = mpsc::unbounded_channel();
            let (session, connected) = Session::new(
                key,
                &upstream_id,
                &self.inner.config.model_name,
                out_tx,
                Arc::clone(&self.inner.policy),
                self.inner.config.response_timeout_ms,
                self.inner.config.context_token_budget,
            );
            spawn_socket_tasks(&session, socket, out_rx);
            self.spawn_idle_task(&session);
            sessions.insert(key.to_string(), Arc::clone(&session));
            info!(key, upstream_id = %session.upstream_id, "session created, waiting for agent");
            (session, connected)
        };

        let connect_timeout = Duration::from_millis(self.inner.config.response_timeout_ms);
        match tokio::time::timeout(connect_timeout, connected).await {
            Ok(Ok(())) => {
                info!(key, upstream_id = %session.upstream_id, "agent connected");
                Ok(session)
            }
            Ok(Err(_)) => {
                self.destroy(key, "socket failed before agent connected").await;
                Err(BridgeError::UpstreamUnavailable(
                    "companion socket closed during connect".to_string(),
                ))
            }
            Err(_) => {
                self.destroy(key, "agent never connected").await;
                Err(BridgeError::UpstreamUnavailable(
                    "timed out waiting for the agent to connect".to_string(),
                ))
            }
        }
    }

    /// Send one prompt and wait for its terminal resolution.
    pub async fn send_prompt(
        &self,
        session: &Arc<Session>,
        prompt: String,
    ) -> Result<SessionResponse> {
        let rx = session.begin_request(prompt)?;
        rx.await.map_err(|_| BridgeError::UpstreamDisconnected)?
    }

    /// Forward client tool verdicts and wait for the next terminal result.
    pub async fn resume_with_tool_results(
        &self,
        session: &Arc<Session>,
        decisions: &[ToolDecision],
    ) -> Result<SessionResponse> {
        let rx = session.resume_with_decisions(decisions)?;
        rx.await.map_err(|_| BridgeError::UpstreamDisconnected)?
    }

    pub async fn destroy(&self, key: &str, reason: &str) -> bool {
        let removed = self.inner.sessions.write().await.remove(key);
        match removed {
            Some(session) => {
                self.teardown(key, &session, reason);
                true
            }
            None => false,
        }
    }

    pub async fn destroy_all(&self, reason: &str) {
        let drained: Vec<_> = self.inner.sessions.write().await.drain().collect();
        for (key, session) in drained {
            self.teardown(&key, &session, reason);
        }
    }

    fn teardown(&self, key: &str, session: &Arc<Session>, reason: &str) {
        let idle_secs = now_ms().saturating_sub(session.last_activity_at_ms()) / 1000;
        info!(
            key,
            upstream_id = %session.upstream_id,
            reason,
            idle_secs,
            "destroying session"
        );
        session.shutdown();
        self.inner.companion.kill_session(&session.upstream_id);
    }

    /// Sweep dead entries, then evict the oldest evictable session while
    /// the pool is at capacity. Working sessions are never candidates.
    fn ensure_room(&self, sessions: &mut HashMap<String, Arc<Session>>) {
        let dead_keys: Vec<String> = sessions
            .iter()
            .filter(|(_, s)| s.state() == SessionState::Dead)
            .map(|(k, _)| k.clone())
            .collect();
        for key in dead_keys {
            if let Some(session) = sessions.remove(&key) {
                self.teardown(&key, &session, "swept while dead");
            }
        }

        while sessions.len() >= self.inner.config.max_sessions {
            let candidate = sessions
                .iter()
                .filter(|(_, s)| {
                    matches!(s.state(), SessionState::Ready | SessionState::Dead)
                })
                .min_by_key(|(_, s)| s.last_activity_at_ms())
                .map(|(k, _)| k.clone());
            match candidate {
                Some(key) => {
                    if let Some(session) = sessions.remove(&key) {
                        self.teardown(&key, &session, "evicted for capacity");
                    }
                }
                None => {
                    warn!(
                        size = sessions.len(),
                        cap = self.inner.config.max_sessions,
                        "pool over capacity but every session is working"
                    );
                    break;
                }
            }
        }
    }

    fn spawn_idle_task(&self, session: &Arc<Session>) {
        let pool = self.clone();
        let key = session.pool_key.clone();
        let cancel = session.cancel_token();
        let idle_ms = self.inner.config.session_idle_timeout_ms;
        let weak = Arc::downgrade(session);
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_millis(idle_ms)) => {}
                }
                let Some(session) = weak.upgrade() else { break };
                match session.state() {
                    SessionState::Ready => {
                        let idle = now_ms().saturating_sub(session.last_activity_at_ms());
                        if idle >= idle_ms {
                            pool.destroy(&key, "idle timeout").await;
                            break;
                        }
                        // Activity happened since the timer was armed.
                    }
                    SessionState::Dead => break,
                    // Working or connecting: reschedule, never evict.
                    _ => {}
                }
            }
        });
        session.set_idle_task(handle);
    }
}

/// Spawn the reader/writer pair that gives the session exclusive ownership
/// of its socket.
fn spawn_socket_tasks(
    session: &Arc<Session>,
    socket: CompanionSocket,
    mut out_rx: mpsc::UnboundedReceiver<OutboundFrame>,
) {
    let (mut sink, mut stream) = socket.split();
    let cancel = session.cancel_token();

    let writer_cancel = cancel.clone();
    let writer_key = session.pool_key.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = writer_cancel.cancelled() => {
                    let _ = sink.close().await;
                    break;
                }
                frame = out_rx.recv() => {
                    let Some(frame) = frame else { break };
                    let text = match serde_json::to_string(&frame) {
                        Ok(text) => text,
                        Err(error) => {
                            warn!(key = %writer_key, "failed to encode outbound frame: {error}");
                            continue;
                        }
                    };
                    if sink.send(Message::Text(text)).await.is_err() {
                        debug!(key = %writer_key, "companion socket rejected write");
                        break;
                    }
                }
            }
        }
    });

    let reader_session = Arc::clone(session);
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                message = stream.next() => match message {
                    Some(Ok(Message::Text(text))) => match CompanionFrame::parse(&text) {
                        Ok(frame) => reader_session.handle_frame(frame),
                        Err(error) => {
                            warn!(
                                key = %reader_session.pool_key,
                                "companion sent unparseable frame: {error}"
                            );
                        }
                    },
                    Some(Ok(Message::Close(_))) | None => {
                        reader_session.on_socket_closed();
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(error)) => {
                        warn!(key = %reader_session.pool_key, "companion socket error: {error}");
                        reader_session.on_socket_closed();
                        break;
                    }
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ToolMode;

    fn test_pool(max_sessions: usize) -> SessionPool {
        let config = BridgeConfig {
            max_sessions,
            companion_url: "http://127.0.0.1:1".to_string(),
            ..BridgeConfig::default()
        };
        let policy = Arc::new(ToolPolicy::defaults(ToolMode::Auto));
        SessionPool::new(config, policy)
    }

    fn detached_session(key: &str) -> (Arc<Session>, mpsc::UnboundedReceiver<OutboundFrame>) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let policy = Arc::new(ToolPolicy::defaults(ToolMode::Auto));
        let (session, _connected) =
            Session::new(key, &format!("up-{key}"), "m", out_tx, policy, 60_000, 200_000);
        session.handle_frame(CompanionFrame::CliConnected);
        (session, out_rx)
    }

    #[tokio::test]
    async fn eviction_prefers_oldest_ready_session() {
        let pool = test_pool(2);
        let (older, _o1) = detached_session("a");
        let (newer, _o2) = detached_session("b");
        older.touch();
        tokio::time::sleep(Duration::from_millis(5)).await;
        newer.touch();

        {
            let mut sessions = pool.inner.sessions.write().await;
            sessions.insert("a".to_string(), Arc::clone(&older));
            sessions.insert("b".to_string(), Arc::clone(&newer));
            pool.ensure_room(&mut sessions);
            assert!(!sessions.contains_key("a"));
            assert!(sessions.contains_key("b"));
        }
        assert_eq!(older.state(), SessionState::Dead);
    }

    #[tokio::test]
    async fn working_sessions_are_never_evicted() {
        let pool = test_pool(1);
        let (busy, _out) = detached_session("busy");
        let _rx = busy.begin_request("working".to_string()).expect("begin");

        let mut sessions = pool.inner.sessions.write().await;
        sessions.insert("busy".to_string(), Arc::clone(&busy));
        pool.ensure_room(&mut sessions);
        assert!(sessions.contains_key("busy"));
        assert_eq!(busy.state(), SessionState::Busy);
    }

    #[tokio::test]
    async fn dead_sessions_are_swept_before_eviction() {
        let pool = test_pool(10);
        let (dead, _o1) = detached_session("dead");
        dead.on_socket_closed();
        let (live, _o2) = detached_session("live");

        let mut sessions = pool.inner.sessions.write().await;
        sessions.insert("dead".to_string(), dead);
        sessions.insert("live".to_string(), live);
        pool.ensure_room(&mut sessions);
        assert!(!sessions.contains_key("dead"));
        assert!(sessions.contains_key("live"));
    }

    #[tokio::test]
    async fn destroy_reports_whether_a_session_existed() {
        let pool = test_pool(10);
        let (session, _out) = detached_session("gone");
        pool.inner
            .sessions
            .write()
            .await
            .insert("gone".to_string(), session);
        assert!(pool.destroy("gone", "test teardown").await);
        assert!(!pool.destroy("gone", "test teardown").await);
        assert!(pool.peek("gone").await.is_none());
    }

    #[tokio::test]
    async fn list_snapshots_are_sorted_by_key() {
        let pool = test_pool(10);
        let (s1, _o1) = detached_session("zz");
        let (s2, _o2) = detached_session("aa");
        {
            let mut sessions = pool.inner.sessions.write().await;
            sessions.insert("zz".to_string(), s1);
            sessions.insert("aa".to_string(), s2);
        }
        let listed = pool.list().await;
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].key, "aa");
        assert_eq!(listed[1].key, "zz");
    }

    #[tokio::test]
    async fn get_or_create_fails_fast_when_companion_is_down() {
        let pool = test_pool(10);
        let result = pool.get_or_create("model:x").await;
        assert!(matches!(result, Err(BridgeError::UpstreamUnavailable(_))));
        assert!(pool.peek("model:x").await.is_none());
    }
}
