//! HTTP surface of the bridge: the OpenAI-compatible endpoint plus the
//! small diagnostic API around it.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, Request, State};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tracing::info;

use bridge_core::{now_ms, BridgeConfig, ContextManager, SessionPool, ToolPolicy};

mod commands;
mod http;
mod stream;

#[derive(Clone)]
pub struct AppState {
    pub pool: SessionPool,
    pub context: ContextManager,
    pub config: Arc<BridgeConfig>,
}

impl AppState {
    pub fn new(config: BridgeConfig) -> Self {
        let policy = Arc::new(ToolPolicy::load(
            config.tool_mode,
            config.tool_policy_json.as_deref(),
        ));
        let context = ContextManager::new(&config);
        let pool = SessionPool::new(config.clone(), policy);
        Self {
            pool,
            context,
            config: Arc::new(config),
        }
    }
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/models", get(models))
        .route("/v1/chat/completions", post(http::chat_completions))
        .route("/sessions", get(list_sessions))
        .route("/sessions/:key", delete(delete_session))
        .layer(middleware::from_fn(cors))
        .with_state(state)
}

pub async fn serve(config: BridgeConfig) -> anyhow::Result<()> {
    let state = AppState::new(config);
    let addr = SocketAddr::from(([0, 0, 0, 0], state.config.port));
    let app = app_router(state);
    let listener = TcpListener::bind(addr).await?;
    info!("companion bridge listening on {addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "companion": state.config.companion_url,
        "cwd": state.config.session_cwd,
        "toolMode": state.config.tool_mode.as_str(),
        "permissionMode": state.config.permission_mode,
        "model": state.config.model_name,
        "sessions": state.pool.list().await,
    }))
}

async fn models(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "object": "list",
        "data": [{
            "id": state.config.model_name,
            "object": "model",
            "created": now_ms() / 1000,
            "owned_by": "companion-bridge",
        }],
    }))
}

async fn list_sessions(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "sessions": state.pool.list().await }))
}

async fn delete_session(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Json<Value> {
    state.pool.destroy(&key, "deleted via api").await;
    Json(json!({ "ok": true }))
}

async fn cors(request: Request, next: Next) -> Response {
    if request.method() == Method::OPTIONS {
        let mut response = StatusCode::NO_CONTENT.into_response();
        apply_cors_headers(&mut response);
        return response;
    }
    let mut response = next.run(request).await;
    apply_cors_headers(&mut response);
    response
}

fn apply_cors_headers(response: &mut Response) {
    let headers = response.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, DELETE, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type, Authorization, X-Session-Key, X-Request-Id"),
    );
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;
    use uuid::Uuid;

    pub(crate) fn test_state() -> AppState {
        let dir = std::env::temp_dir().join(format!("bridge-server-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).expect("temp dir");
        let config = BridgeConfig {
            // Nothing listens here; tests must never reach a companion.
            companion_url: "http://127.0.0.1:1".to_string(),
            context_dir: dir,
            ..BridgeConfig::default()
        };
        AppState::new(config)
    }

    #[tokio::test]
    async fn health_reports_config_and_empty_pool() {
        let app = app_router(test_state());
        let req = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .expect("request");
        let resp = app.oneshot(req).await.expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
        let body = to_bytes(resp.into_body(), usize::MAX).await.expect("body");
        let payload: Value = serde_json::from_slice(&body).expect("json");
        assert_eq!(payload["status"], "ok");
        assert_eq!(payload["model"], "claude-code-companion");
        assert_eq!(payload["toolMode"], "auto");
        assert!(payload["sessions"].as_array().expect("array").is_empty());
    }

    #[tokio::test]
    async fn models_lists_the_configured_model() {
        let app = app_router(test_state());
        let req = Request::builder()
            .uri("/v1/models")
            .body(Body::empty())
            .expect("request");
        let resp = app.oneshot(req).await.expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
        let body = to_bytes(resp.into_body(), usize::MAX).await.expect("body");
        let payload: Value = serde_json::from_slice(&body).expect("json");
        assert_eq!(payload["data"][0]["id"], "claude-code-companion");
    }

    #[tokio::test]
    async fn delete_session_is_ok_even_without_a_session() {
        let app = app_router(test_state());
        let req = Request::builder()
            .method("DELETE")
            .uri("/sessions/model:claude-code-companion")
            .body(Body::empty())
            .expect("request");
        let resp = app.oneshot(req).await.expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
        let body = to_bytes(resp.into_body(), usize::MAX).await.expect("body");
        let payload: Value = serde_json::from_slice(&body).expect("json");
        assert_eq!(payload["ok"], true);
    }

    #[tokio::test]
    async fn options_preflight_gets_cors_headers() {
        let app = app_router(test_state());
        let req = Request::builder()
            .method("OPTIONS")
            .uri("/v1/chat/completions")
            .body(Body::empty())
            .expect("request");
        let resp = app.oneshot(req).await.expect("response");
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        assert_eq!(
            resp.headers()
                .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
                .and_then(|v| v.to_str().ok()),
            Some("*")
        );
        assert!(resp
            .headers()
            .get(header::ACCESS_CONTROL_ALLOW_HEADERS)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.contains("X-Session-Key"))
            .unwrap_or(false));
    }
}
