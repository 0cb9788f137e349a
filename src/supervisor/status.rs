//! 账号运行状态

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Serialize, Serializer};
use thiserror::Error;

use crate::platform::PlatformError;

/// 监管状态
///
/// `stopped -> starting -> connecting -> running -> stopped`，
/// `error` 可由 connecting / running 进入，最终总会回到 `stopped`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorState {
    Stopped,
    Starting,
    Connecting,
    Running,
    Error(String),
}

impl SupervisorState {
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SupervisorState::Starting | SupervisorState::Connecting | SupervisorState::Running
        )
    }
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SupervisorState::Stopped => f.write_str("stopped"),
            SupervisorState::Starting => f.write_str("starting"),
            SupervisorState::Connecting => f.write_str("connecting"),
            SupervisorState::Running => f.write_str("running"),
            SupervisorState::Error(msg) => write!(f, "error: {}", msg),
        }
    }
}

impl Serialize for SupervisorState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// 连接错误
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("connection timeout ({0}s)")]
    Timeout(u64),
    #[error("会话文件不存在，请提供机器人令牌或先完成交互式登录")]
    NoSession,
    #[error(transparent)]
    Platform(#[from] PlatformError),
    #[error("连接被取消")]
    Cancelled,
}

/// 账号状态（状态文本 + 最近一次错误）
#[derive(Debug, Clone, Serialize)]
pub struct AccountStatus {
    pub state: SupervisorState,
    pub last_error: Option<String>,
}

impl Default for AccountStatus {
    fn default() -> Self {
        Self {
            state: SupervisorState::Stopped,
            last_error: None,
        }
    }
}

/// 监管任务与外部共享的状态句柄
#[derive(Debug, Clone, Default)]
pub struct StatusHandle {
    inner: Arc<RwLock<AccountStatus>>,
}

impl StatusHandle {
    pub fn set(&self, state: SupervisorState) {
        let mut status = self.inner.write();
        if let SupervisorState::Error(msg) = &state {
            status.last_error = Some(msg.clone());
        }
        status.state = state;
    }

    /// 进入启动流程时清除上次的错误
    pub fn reset(&self) {
        let mut status = self.inner.write();
        status.state = SupervisorState::Starting;
        status.last_error = None;
    }

    pub fn get(&self) -> AccountStatus {
        self.inner.read().clone()
    }

    pub fn state(&self) -> SupervisorState {
        self.inner.read().state.clone()
    }
}
