// Web服务器模块

pub mod handlers;
pub mod state;

pub use state::AppState;

use axum::{
    http::HeaderValue,
    routing::{get, post},
    Router,
};
use tower::ServiceBuilder;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::warn;

/// 按配置构建 CORS 层，包含 "*" 时允许任意来源
fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.is_empty() || origins.iter().any(|o| o.trim() == "*") {
        return layer.allow_origin(Any);
    }

    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o.trim()) {
            Ok(v) => Some(v),
            Err(_) => {
                warn!("忽略无效的 CORS 源: {}", o);
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(parsed))
}

/// 构建完整路由
pub fn build_router(state: AppState) -> Router {
    let middleware = ServiceBuilder::new()
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(&state.config.server.cors_origins));

    let api_routes = Router::new()
        .route("/status", get(handlers::get_status))
        .route("/tasks/active", get(handlers::get_active_tasks))
        .route("/accounts/:id/start", post(handlers::start_account))
        .route("/accounts/:id/stop", post(handlers::stop_account));

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/health", get(handlers::health_check))
        .with_state(state)
        .layer(middleware)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::notifier::RecordingNotifier;
    use crate::persistence::{Account, NewTask, TaskStore};
    use crate::platform::mock::MockFactory;
    use crate::supervisor::{SupervisorContext, SupervisorManager};
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use serde_json::Value;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn test_state() -> AppState {
        let store = Arc::new(TaskStore::open_in_memory().unwrap());
        let config = Arc::new(AppConfig::default());
        let supervisors = Arc::new(SupervisorManager::new(SupervisorContext {
            store: store.clone(),
            factory: Arc::new(MockFactory::default()),
            notifier: Arc::new(RecordingNotifier::default()),
            config: config.clone(),
        }));
        AppState::new(store, supervisors, config)
    }

    async fn call(state: &AppState, method: &str, uri: &str) -> (StatusCode, Value) {
        let response = build_router(state.clone())
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_health() {
        let state = test_state();
        let (status, body) = call(&state, "GET", "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_status_lists_accounts() {
        let state = test_state();
        state
            .store
            .add_account(&Account {
                id: 0,
                name: "main".into(),
                api_id: 1,
                api_hash: "h".into(),
                bot_token: None,
                session_name: "main".into(),
            })
            .unwrap();

        let (status, body) = call(&state, "GET", "/api/v1/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["code"], 0);
        assert_eq!(body["data"][0]["name"], "main");
        assert_eq!(body["data"][0]["status"], "stopped");
        assert_eq!(body["data"][0]["running"], false);
    }

    #[tokio::test]
    async fn test_active_tasks() {
        let state = test_state();
        let id = state
            .store
            .add_task(&NewTask {
                account_id: 1,
                channel_id: None,
                source_chat_id: -100,
                source_message_id: 7,
                file_name: "a.mp4".into(),
                file_path: "downloads/a.mp4".into(),
            })
            .unwrap();

        let (_, body) = call(&state, "GET", "/api/v1/tasks/active").await;
        let tasks = body["data"].as_array().unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0]["id"], id);
        assert_eq!(tasks[0]["status"], "waiting");
    }

    #[tokio::test]
    async fn test_start_unknown_account_and_stop_idle() {
        let state = test_state();
        let (status, body) = call(&state, "POST", "/api/v1/accounts/42/start").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["code"], 404);

        let (_, body) = call(&state, "POST", "/api/v1/accounts/42/stop").await;
        assert_eq!(body["data"]["stopped"], false);
    }

    #[test]
    fn test_cors_layer_accepts_lists() {
        let _ = cors_layer(&["*".to_string()]);
        let _ = cors_layer(&["http://localhost:5173".to_string(), "bad\norigin".to_string()]);
    }
}
