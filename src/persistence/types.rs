//! 持久化数据类型
//!
//! 账号、频道、下载任务与通知渠道的记录结构，以及任务状态机。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// 平台账号
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    /// 账号ID
    pub id: i64,
    /// 显示名称
    pub name: String,
    /// 平台 API ID
    pub api_id: i64,
    /// 平台 API Hash
    pub api_hash: String,
    /// 机器人令牌（为空时使用已有会话登录）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bot_token: Option<String>,
    /// 会话名称（会话文件的引用名）
    pub session_name: String,
}

/// 监听频道
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    /// 频道记录ID
    pub id: i64,
    /// 所属账号ID
    pub account_id: i64,
    /// 频道标识（数字ID、@用户名 或 完整链接，原样保存）
    pub channel_id: String,
    /// 显示名称
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_name: Option<String>,
    /// 是否启用
    pub enabled: bool,
    /// 自定义存储子目录
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_path: Option<String>,
}

/// 频道及其所属账号
#[derive(Debug, Clone, Serialize)]
pub struct ChannelWithAccount {
    pub channel: Channel,
    pub account: Account,
}

/// 下载任务状态
///
/// 状态只能按 `waiting < downloading < {completed, failed} < file_expired` 单调推进
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// 排队等待
    Waiting,
    /// 下载中
    Downloading,
    /// 已完成
    Completed,
    /// 失败
    Failed,
    /// 文件已被保留策略清理
    FileExpired,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Waiting => "waiting",
            TaskStatus::Downloading => "downloading",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::FileExpired => "file_expired",
        }
    }

    /// 允许迁移到当前状态的前置状态
    ///
    /// `downloading -> downloading` 用于恢复后重新开始传输（刷新开始时间）
    pub fn allowed_predecessors(&self) -> &'static [TaskStatus] {
        match self {
            TaskStatus::Waiting => &[],
            TaskStatus::Downloading => &[TaskStatus::Waiting, TaskStatus::Downloading],
            TaskStatus::Completed => &[TaskStatus::Downloading],
            TaskStatus::Failed => &[TaskStatus::Waiting, TaskStatus::Downloading],
            TaskStatus::FileExpired => &[TaskStatus::Completed],
        }
    }

    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        next.allowed_predecessors().contains(self)
    }

    /// 是否为未完成状态（恢复时需要重新入队）
    pub fn is_unfinished(&self) -> bool {
        matches!(self, TaskStatus::Waiting | TaskStatus::Downloading)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(TaskStatus::Waiting),
            "downloading" => Ok(TaskStatus::Downloading),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "file_expired" => Ok(TaskStatus::FileExpired),
            other => Err(anyhow::anyhow!("未知的任务状态: {}", other)),
        }
    }
}

/// 下载任务记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// 任务ID
    pub id: i64,
    /// 所属账号ID
    pub account_id: i64,
    /// 匹配到的频道记录ID（未匹配时为 None）
    pub channel_id: Option<i64>,
    /// 源消息ID
    pub source_message_id: i64,
    /// 源会话ID
    pub source_chat_id: i64,
    /// 状态消息ID（用于编辑进度）
    pub status_message_id: Option<i64>,
    /// 文件名
    pub file_name: String,
    /// 本地文件路径
    pub file_path: PathBuf,
    /// 文件大小（完成后写入）
    pub file_size: u64,
    /// 任务状态
    pub status: TaskStatus,
    /// 开始时间 (Unix timestamp)
    pub start_time: Option<i64>,
    /// 结束时间 (Unix timestamp)
    pub end_time: Option<i64>,
    /// 错误信息
    pub error_msg: Option<String>,
}

/// 新建任务所需字段
#[derive(Debug, Clone)]
pub struct NewTask {
    pub account_id: i64,
    pub channel_id: Option<i64>,
    pub source_chat_id: i64,
    pub source_message_id: i64,
    pub file_name: String,
    pub file_path: PathBuf,
}

/// 通知渠道
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationChannel {
    pub id: i64,
    pub name: String,
    /// 渠道类型，如 "bark"
    #[serde(rename = "type")]
    pub kind: String,
    /// 渠道配置（JSON）
    pub config: serde_json::Value,
    pub enabled: bool,
}
