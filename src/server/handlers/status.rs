// 状态查询API处理器

use crate::persistence::Task;
use crate::server::AppState;
use crate::supervisor::AccountSnapshot;
use axum::{extract::State, http::StatusCode, response::Json};
use serde::Serialize;
use tracing::error;

use super::ApiResponse;

/// 健康检查响应
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
}

/// GET /health
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: "tg-media-downloader".to_string(),
    })
}

/// 所有账号的运行状态与下载进度
///
/// GET /api/v1/status
pub async fn get_status(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<Vec<AccountSnapshot>>>, StatusCode> {
    match state.supervisors.status_snapshot() {
        Ok(snapshot) => Ok(Json(ApiResponse::success(snapshot))),
        Err(e) => {
            error!("获取账号状态失败: {:#}", e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// 活跃任务（下载中 + 等待中）
///
/// GET /api/v1/tasks/active
pub async fn get_active_tasks(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<Vec<Task>>>, StatusCode> {
    match state.store.get_active_tasks() {
        Ok(tasks) => Ok(Json(ApiResponse::success(tasks))),
        Err(e) => {
            error!("获取活跃任务失败: {:#}", e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}
