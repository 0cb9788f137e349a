//! 消息平台客户端接口
//!
//! 连接、加密、会话持久化等协议细节由外部客户端负责，
//! 这里只定义下载流水线需要的高层命令与回调数据：
//! - 连接（机器人令牌 / 已有会话）
//! - 订阅新消息（按会话过滤）
//! - 按 ID 获取消息、分块读取媒体内容
//! - 发送 / 编辑消息、断开连接

pub mod bridge;
#[cfg(test)]
pub mod mock;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::persistence::Account;

pub use bridge::{BridgeClient, BridgeClientFactory};

/// 平台客户端错误
#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("会话文件不存在，请先在交互式环境中完成登录")]
    NoSession,
    #[error("凭证无效: {0}")]
    InvalidCredentials(String),
    #[error("客户端未连接")]
    NotConnected,
    #[error("消息不存在: chat={chat_id}, message={message_id}")]
    MessageNotFound { chat_id: i64, message_id: i64 },
    #[error("网络错误: {0}")]
    Network(String),
    #[error("平台返回错误: {0}")]
    Remote(String),
}

impl From<reqwest::Error> for PlatformError {
    fn from(e: reqwest::Error) -> Self {
        PlatformError::Network(e.to_string())
    }
}

/// 会话引用：数字ID 或 用户名
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChatRef {
    Id(i64),
    Username(String),
}

impl ChatRef {
    /// 判断运行时会话是否命中该过滤项
    pub fn matches(&self, chat_id: i64, username: Option<&str>) -> bool {
        match self {
            ChatRef::Id(id) => ids_match(&id.to_string(), chat_id),
            ChatRef::Username(name) => username.is_some_and(|u| u.eq_ignore_ascii_case(name)),
        }
    }
}

/// 比较保存的数字标识与运行时会话ID，任意一侧缺少 `-100` 前缀都视为相同
pub fn ids_match(stored: &str, chat_id: i64) -> bool {
    let real = chat_id.to_string();
    stored == real || real == format!("-100{}", stored) || stored == format!("-100{}", real)
}

impl std::fmt::Display for ChatRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChatRef::Id(id) => write!(f, "{}", id),
            ChatRef::Username(name) => write!(f, "@{}", name),
        }
    }
}

/// 媒体类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Video,
    Document,
    Photo,
    Audio,
    Other,
}

/// 消息携带的媒体
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaInfo {
    pub kind: MediaKind,
    /// 原始文件名
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
    /// 平台报告的总大小
    pub size: u64,
    /// 客户端用来定位媒体内容的不透明句柄
    pub location: String,
}

impl MediaInfo {
    /// 是否为可播放的视频
    pub fn is_playable(&self) -> bool {
        self.kind == MediaKind::Video
            || self
                .mime_type
                .as_deref()
                .is_some_and(|m| m.starts_with("video/"))
    }
}

/// 平台消息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomingMessage {
    pub id: i64,
    pub chat_id: i64,
    /// 会话用户名（公开频道才有）
    #[serde(default)]
    pub chat_username: Option<String>,
    /// 文本或媒体说明
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub media: Option<MediaInfo>,
    #[serde(default)]
    pub is_reply: bool,
    pub date: DateTime<Utc>,
}

/// 平台客户端
///
/// 每个账号一个实例，会话存储由客户端独占
#[async_trait]
pub trait PlatformClient: Send + Sync {
    /// 使用机器人令牌连接
    async fn connect_with_bot_token(&self, bot_token: &str) -> Result<(), PlatformError>;

    /// 使用已有会话连接
    async fn connect_with_session(&self) -> Result<(), PlatformError>;

    /// 是否存在可用的已登录会话
    async fn has_session(&self) -> bool;

    /// 订阅指定会话的新消息
    async fn subscribe(
        &self,
        chats: Vec<ChatRef>,
    ) -> Result<mpsc::Receiver<IncomingMessage>, PlatformError>;

    /// 按 ID 获取消息，不存在时返回 None
    async fn get_message(
        &self,
        chat_id: i64,
        message_id: i64,
    ) -> Result<Option<IncomingMessage>, PlatformError>;

    /// 从 offset 开始分块读取媒体内容
    fn iter_download(
        &self,
        media: &MediaInfo,
        offset: u64,
        chunk_size: usize,
    ) -> BoxStream<'static, Result<Bytes, PlatformError>>;

    /// 发送消息，返回新消息ID
    async fn send_message(
        &self,
        chat: &ChatRef,
        text: &str,
        reply_to: Option<i64>,
    ) -> Result<i64, PlatformError>;

    /// 编辑消息
    async fn edit_message(
        &self,
        chat_id: i64,
        message_id: i64,
        text: &str,
    ) -> Result<(), PlatformError>;

    /// 断开连接
    async fn disconnect(&self);

    fn is_connected(&self) -> bool;

    /// 阻塞直到连接断开
    async fn run_until_disconnected(&self);
}

/// 按账号构建平台客户端
pub trait PlatformClientFactory: Send + Sync {
    fn build(&self, account: &Account) -> anyhow::Result<Arc<dyn PlatformClient>>;
}
