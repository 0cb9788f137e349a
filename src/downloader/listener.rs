//! 频道消息监听
//!
//! 收到符合条件的消息（可播放媒体、非回复）后尽快完成：
//! 解析文件名 -> 写入 waiting 任务 -> 回复确认 -> 入队。
//! 解析或写库失败时仍然入队（不带任务ID），由下载器补建任务。

use std::sync::Arc;

use anyhow::{anyhow, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::queue::{MessageRef, QueueSender};
use super::resolver::ChannelResolver;
use super::worker::preparing_text;
use crate::persistence::{Account, NewTask, TaskStore};
use crate::platform::{ChatRef, IncomingMessage, PlatformClient};

/// 是否需要下载
pub fn is_qualifying(message: &IncomingMessage) -> bool {
    !message.is_reply && message.media.as_ref().is_some_and(|m| m.is_playable())
}

pub struct ChannelListener {
    account: Account,
    client: Arc<dyn PlatformClient>,
    store: Arc<TaskStore>,
    resolver: ChannelResolver,
    queue: QueueSender,
}

impl ChannelListener {
    pub fn new(
        account: Account,
        client: Arc<dyn PlatformClient>,
        store: Arc<TaskStore>,
        resolver: ChannelResolver,
        queue: QueueSender,
    ) -> Self {
        Self {
            account,
            client,
            store,
            resolver,
            queue,
        }
    }

    /// 处理订阅事件，直到事件流结束、队列关闭或收到停止信号
    pub async fn run(&self, mut events: mpsc::Receiver<IncomingMessage>, cancel: CancellationToken) {
        info!("频道监听已启动: account={}", self.account.name);
        loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => break,
                message = events.recv() => message,
            };
            let Some(message) = message else {
                debug!("事件流已结束: account={}", self.account.name);
                break;
            };
            if let Err(e) = self.handle(message).await {
                warn!("处理新消息失败: account={}, 错误: {}", self.account.name, e);
                break;
            }
        }
        info!("频道监听已停止: account={}", self.account.name);
    }

    /// 处理一条新消息；只有队列关闭时才返回错误
    pub async fn handle(&self, message: IncomingMessage) -> Result<()> {
        if !is_qualifying(&message) {
            return Ok(());
        }

        let task_id = match self.register(&message).await {
            Ok((task_id, file_name)) => {
                self.acknowledge(&message, task_id, &file_name).await;
                Some(task_id)
            }
            Err(e) => {
                warn!(
                    "预登记任务失败，交由下载器处理: chat={}, message={}, 错误: {:#}",
                    message.chat_id, message.id, e
                );
                None
            }
        };

        debug!(
            "消息入队: chat={}, message={}, task={:?}",
            message.chat_id, message.id, task_id
        );
        self.queue
            .send(MessageRef::Live { message, task_id })
            .await
            .map_err(|_| anyhow!("下载队列已关闭"))
    }

    /// 解析路径并写入 waiting 任务
    async fn register(&self, message: &IncomingMessage) -> Result<(i64, String)> {
        let resolution = self.resolver.resolve(message).await?;
        let task_id = self.store.add_task(&NewTask {
            account_id: self.account.id,
            channel_id: resolution.channel_id,
            source_chat_id: message.chat_id,
            source_message_id: message.id,
            file_name: resolution.file_name.clone(),
            file_path: resolution.file_path,
        })?;
        Ok((task_id, resolution.file_name))
    }

    /// 回复源消息，该回复随后作为任务的状态消息
    async fn acknowledge(&self, message: &IncomingMessage, task_id: i64, file_name: &str) {
        let reply = self
            .client
            .send_message(
                &ChatRef::Id(message.chat_id),
                &preparing_text(file_name),
                Some(message.id),
            )
            .await;
        match reply {
            Ok(status_id) => {
                if let Err(e) = self.store.set_task_status_message(task_id, status_id) {
                    warn!("保存状态消息ID失败: task={}, 错误: {}", task_id, e);
                }
            }
            Err(e) => debug!("确认回复失败（忽略）: task={}, 错误: {}", task_id, e),
        }
    }
}
