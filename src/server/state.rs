// 应用状态

use crate::config::AppConfig;
use crate::persistence::TaskStore;
use crate::supervisor::SharedSupervisorManager;
use std::sync::Arc;

/// 应用全局状态
#[derive(Clone)]
pub struct AppState {
    /// 任务存储
    pub store: Arc<TaskStore>,
    /// 账号监管管理器
    pub supervisors: SharedSupervisorManager,
    /// 应用配置（启动后只读）
    pub config: Arc<AppConfig>,
}

impl AppState {
    pub fn new(
        store: Arc<TaskStore>,
        supervisors: SharedSupervisorManager,
        config: Arc<AppConfig>,
    ) -> Self {
        Self {
            store,
            supervisors,
            config,
        }
    }
}
