// 账号启停API处理器

use crate::server::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use serde::Serialize;
use tracing::{error, info};

use super::ApiResponse;

#[derive(Debug, Serialize)]
pub struct StopResult {
    /// 是否停止了正在运行的实例
    pub stopped: bool,
}

/// 启动（或重启）账号
///
/// POST /api/v1/accounts/:id/start
pub async fn start_account(
    State(state): State<AppState>,
    Path(account_id): Path<i64>,
) -> Result<Json<ApiResponse<()>>, StatusCode> {
    info!("API: 启动账号 {}", account_id);

    match state.store.get_account(account_id) {
        Ok(Some(_)) => {}
        Ok(None) => {
            return Ok(Json(ApiResponse::error(
                404,
                format!("账号不存在: {}", account_id),
            )))
        }
        Err(e) => {
            error!("读取账号失败: {:#}", e);
            return Err(StatusCode::INTERNAL_SERVER_ERROR);
        }
    }

    match state.supervisors.start_account(account_id).await {
        Ok(()) => Ok(Json(ApiResponse::success(()))),
        Err(e) => {
            error!("启动账号 {} 失败: {:#}", account_id, e);
            Ok(Json(ApiResponse::error(500, format!("{:#}", e))))
        }
    }
}

/// 停止账号
///
/// POST /api/v1/accounts/:id/stop
pub async fn stop_account(
    State(state): State<AppState>,
    Path(account_id): Path<i64>,
) -> Json<ApiResponse<StopResult>> {
    info!("API: 停止账号 {}", account_id);
    let stopped = state.supervisors.stop_account(account_id).await;
    Json(ApiResponse::success(StopResult { stopped }))
}
