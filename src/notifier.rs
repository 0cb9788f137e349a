//! 推送通知
//!
//! 通知渠道保存在数据库中，发送失败只记录日志，不影响下载流程。

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, error};

use crate::persistence::{NotificationChannel, TaskStore};

/// 推送标题
pub const PUSH_TITLE: &str = "TG-Downloader";

const PUSH_TIMEOUT: Duration = Duration::from_secs(10);

/// 通知发送者
#[async_trait]
pub trait Notifier: Send + Sync {
    /// 尽力发送，错误只记录日志
    async fn push(&self, text: &str);
}

/// 拼接 Bark 推送地址：`{barkUrl}/{title}/{content}`
pub fn bark_url(base: &str, title: &str, content: &str) -> String {
    format!(
        "{}/{}/{}",
        base.trim_end_matches('/'),
        urlencoding::encode(title),
        urlencoding::encode(content)
    )
}

/// 从数据库读取启用的通知渠道并逐个发送
pub struct StoreNotifier {
    store: Arc<TaskStore>,
    http: Client,
}

impl StoreNotifier {
    pub fn new(store: Arc<TaskStore>) -> Result<Self> {
        let http = Client::builder()
            .timeout(PUSH_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self { store, http })
    }

    async fn send(&self, channel: &NotificationChannel, text: &str) -> Result<()> {
        match channel.kind.as_str() {
            "bark" => {
                let Some(base) = channel
                    .config
                    .get("barkUrl")
                    .and_then(|v| v.as_str())
                    .filter(|s| !s.trim().is_empty())
                else {
                    debug!("通知渠道 [{}] 未配置 barkUrl，跳过", channel.name);
                    return Ok(());
                };
                self.http
                    .get(bark_url(base, PUSH_TITLE, text))
                    .send()
                    .await?
                    .error_for_status()?;
                Ok(())
            }
            other => {
                debug!("不支持的通知渠道类型: {}", other);
                Ok(())
            }
        }
    }
}

#[async_trait]
impl Notifier for StoreNotifier {
    async fn push(&self, text: &str) {
        let channels = match self.store.get_notifications() {
            Ok(channels) => channels,
            Err(e) => {
                error!("读取通知渠道失败: {}", e);
                return;
            }
        };

        for channel in channels.iter().filter(|c| c.enabled) {
            if let Err(e) = self.send(channel, text).await {
                error!("发送通知 [{}] 失败: {}", channel.name, e);
            }
        }
    }
}

/// 记录所有推送内容（测试用）
#[cfg(test)]
#[derive(Default)]
pub struct RecordingNotifier {
    messages: parking_lot::Mutex<Vec<String>>,
}

#[cfg(test)]
impl RecordingNotifier {
    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().clone()
    }
}

#[cfg(test)]
#[async_trait]
impl Notifier for RecordingNotifier {
    async fn push(&self, text: &str) {
        self.messages.lock().push(text.to_string());
    }
}
