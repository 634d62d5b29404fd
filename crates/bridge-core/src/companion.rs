//! HTTP + WebSocket client for the upstream Companion server.

use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpStream;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::error::{BridgeError, Result};

pub type CompanionSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Deserialize)]
struct CreateSessionResponse {
    #[serde(rename = "sessionId")]
    session_id: String,
}

#[derive(Clone)]
pub struct CompanionClient {
    http: Client,
    base_url: String,
}

impl CompanionClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn create_session(&self, permission_mode: &str, cwd: &str) -> Result<String> {
        let response = self
            .http
            .post(format!("{}/api/sessions/create", self.base_url))
            .json(&json!({ "permissionMode": permission_mode, "cwd": cwd }))
            .send()
            .await
            .map_err(|e| BridgeError::UpstreamUnavailable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(BridgeError::UpstreamUnavailable(format!(
                "session create returned {}",
                response.status()
            )));
        }
        let body: CreateSessionResponse = response
            .json()
            .await
            .map_err(|e| BridgeError::UpstreamUnavailable(e.to_string()))?;
        Ok(body.session_id)
    }

    /// Fire-and-forget kill; the Companion reaps its own orphans anyway.
    pub fn kill_session(&self, session_id: &str) {
        let url = format!("{}/api/sessions/{}/kill", self.base_url, session_id);
        let http = self.http.clone();
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            if let Err(error) = http.post(url).send().await {
                debug!(%session_id, "session kill request failed: {error}");
            }
        });
    }

    pub fn ws_url(&self, session_id: &str) -> String {
        let base = self
            .base_url
            .replacen("https://", "wss://", 1)
            .replacen("http://", "ws://", 1);
        format!("{base}/ws/browser/{session_id}")
    }

    pub async fn connect(&self, session_id: &str) -> Result<CompanionSocket> {
        let url = self.ws_url(session_id);
        let (socket, _) = tokio_tungstenite::connect_async(&url)
            .await
            .map_err(|e| BridgeError::UpstreamUnavailable(format!("{url}: {e}")))?;
        Ok(socket)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ws_url_swaps_scheme_and_appends_browser_path() {
        let client = CompanionClient::new("http://127.0.0.1:3000/");
        assert_eq!(
            client.ws_url("abc123"),
            "ws://127.0.0.1:3000/ws/browser/abc123"
        );
        let client = CompanionClient::new("https://companion.example.com");
        assert_eq!(
            client.ws_url("abc"),
            "wss://companion.example.com/ws/browser/abc"
        );
    }
}
