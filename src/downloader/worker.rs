//! 下载工作器
//!
//! 每个账号一个，串行消费下载队列：
//! 1. 出队前等待全局并发准入
//! 2. 恢复项或缺少媒体的项按 (会话ID, 消息ID) 重新获取
//! 3. 以本地已有文件长度为偏移量断点续传，追加写入
//! 4. 进度定期编辑到状态消息，结束时写入终态并推送通知
//!
//! 单个任务失败不会终止循环，也不会自动重试。

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::StreamExt;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::admission::AdmissionController;
use super::progress::ProgressTracker;
use super::queue::{MessageRef, QueueReceiver};
use super::resolver::ChannelResolver;
use crate::notifier::Notifier;
use crate::persistence::{Account, NewTask, Task, TaskStore};
use crate::platform::{ChatRef, IncomingMessage, MediaInfo, PlatformClient};

/// 默认分块大小 1MB
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

/// 准备下载时的状态消息
pub fn preparing_text(file_name: &str) -> String {
    format!("**准备下载**\n\n**文件名**: `{}`", file_name)
}

fn completed_text(file_name: &str, size: u64) -> String {
    format!(
        "✅ **下载完成**\n\n**文件名**: `{}`\n**大小**: `{:.2} MB`",
        file_name,
        size as f64 / 1024.0 / 1024.0
    )
}

fn failed_text(reason: &str) -> String {
    format!("❌ **下载失败**\n\n原因: `{}`", reason)
}

pub struct DownloadWorker {
    account: Account,
    client: Arc<dyn PlatformClient>,
    store: Arc<TaskStore>,
    resolver: ChannelResolver,
    admission: Arc<AdmissionController>,
    progress: ProgressTracker,
    notifier: Arc<dyn Notifier>,
    chunk_size: usize,
}

impl DownloadWorker {
    pub fn new(
        account: Account,
        client: Arc<dyn PlatformClient>,
        store: Arc<TaskStore>,
        resolver: ChannelResolver,
        admission: Arc<AdmissionController>,
        progress: ProgressTracker,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            account,
            client,
            store,
            resolver,
            admission,
            progress,
            notifier,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// 消费队列直到发送端全部关闭或收到停止信号
    pub async fn run(&self, mut rx: QueueReceiver, cancel: CancellationToken) {
        info!("下载工作器已启动: account={}", self.account.name);

        loop {
            if !self.admission.wait_for_slot(&cancel).await {
                break;
            }

            let item = tokio::select! {
                _ = cancel.cancelled() => break,
                item = rx.recv() => item,
            };
            let Some(item) = item else {
                debug!("下载队列已关闭: account={}", self.account.name);
                break;
            };

            if let Err(e) = self.process(item).await {
                error!("处理下载项失败: account={}, 错误: {:#}", self.account.name, e);
            }
        }

        info!("下载工作器已停止: account={}", self.account.name);
    }

    /// 处理队列中的一项
    pub async fn process(&self, item: MessageRef) -> Result<()> {
        let (chat_id, message_id) = item.source();
        if let Some(id) = item.task_id() {
            self.admission.release(id);
        }

        let (message, task_id) = match item {
            MessageRef::Live { message, task_id } if message.media.is_some() => (message, task_id),
            other => {
                let task_id = other.task_id();
                match self.client.get_message(chat_id, message_id).await {
                    Ok(Some(message)) if message.media.is_some() => (message, task_id),
                    Ok(_) => {
                        self.fail_unstarted(task_id, "源消息已不存在或不再包含媒体");
                        return Ok(());
                    }
                    Err(e) => {
                        self.fail_unstarted(task_id, &format!("重新获取源消息失败: {}", e));
                        return Ok(());
                    }
                }
            }
        };

        let Some(task) = self.prepare(&message, task_id).await? else {
            return Ok(());
        };

        self.download(task, &message).await
    }

    /// 重新获取失败：没有状态消息可编辑，只记录终态
    fn fail_unstarted(&self, task_id: Option<i64>, reason: &str) {
        match task_id {
            Some(id) => {
                warn!("任务 {} 无法继续: {}", id, reason);
                if let Err(e) = self.store.mark_failed(id, reason, now_ts()) {
                    error!("更新任务 {} 状态失败: {}", id, e);
                }
            }
            None => warn!("丢弃下载项: {}", reason),
        }
    }

    /// 取得（或创建）任务记录
    ///
    /// 返回 None 表示任务已处于终态，无需下载
    async fn prepare(&self, message: &IncomingMessage, task_id: Option<i64>) -> Result<Option<Task>> {
        if let Some(id) = task_id {
            match self.store.get_task(id)? {
                Some(task) if task.status.is_unfinished() => return Ok(Some(task)),
                Some(task) => {
                    debug!("任务 {} 已是 {} 状态，跳过", id, task.status);
                    return Ok(None);
                }
                None => warn!("任务 {} 不存在，重新创建", id),
            }
        }

        let resolution = self.resolver.resolve(message).await?;
        let id = self.store.add_task(&NewTask {
            account_id: self.account.id,
            channel_id: resolution.channel_id,
            source_chat_id: message.chat_id,
            source_message_id: message.id,
            file_name: resolution.file_name,
            file_path: resolution.file_path,
        })?;
        let task = self
            .store
            .get_task(id)?
            .with_context(|| format!("新建的任务 {} 读取失败", id))?;
        Ok(Some(task))
    }

    async fn download(&self, task: Task, message: &IncomingMessage) -> Result<()> {
        let media = message.media.as_ref().context("消息不包含媒体")?;

        let status_message_id = match task.status_message_id {
            Some(id) => Some(id),
            None => self.post_status_message(&task, message).await,
        };

        if !self.store.mark_downloading(task.id, now_ts())? {
            warn!("任务 {} 无法进入下载状态，跳过", task.id);
            return Ok(());
        }

        info!(
            "开始下载: task={}, file={}, size={}",
            task.id, task.file_name, media.size
        );
        self.notifier
            .push(&format!("🚀 [{}] 开始下载: {}", self.account.name, task.file_name))
            .await;

        let progress_key = status_message_id.unwrap_or(message.id);
        match self
            .transfer(&task, media, message.chat_id, status_message_id, progress_key)
            .await
        {
            Ok(size) => {
                // 总大小未知时进度条目不会自行结束
                self.progress.remove(progress_key);
                self.edit_status(message.chat_id, status_message_id, &completed_text(&task.file_name, size))
                    .await;
                self.store.mark_completed(task.id, size, now_ts())?;
                info!("下载完成: task={}, file={}, size={}", task.id, task.file_name, size);
                self.notifier
                    .push(&format!("✅ [{}] 下载完成: {}", self.account.name, task.file_name))
                    .await;
            }
            Err(e) => {
                let reason = format!("{:#}", e);
                self.progress.remove(progress_key);
                self.edit_status(message.chat_id, status_message_id, &failed_text(&reason))
                    .await;
                self.store.mark_failed(task.id, &reason, now_ts())?;
                error!("下载失败: task={}, file={}, 错误: {}", task.id, task.file_name, reason);
                self.notifier
                    .push(&format!(
                        "❌ [{}] 下载失败: {}\n原因: {}",
                        self.account.name, task.file_name, reason
                    ))
                    .await;
            }
        }

        Ok(())
    }

    /// 回复源消息作为状态消息，失败时返回 None
    async fn post_status_message(&self, task: &Task, message: &IncomingMessage) -> Option<i64> {
        let chat = ChatRef::Id(message.chat_id);
        match self
            .client
            .send_message(&chat, &preparing_text(&task.file_name), Some(message.id))
            .await
        {
            Ok(id) => {
                if let Err(e) = self.store.set_task_status_message(task.id, id) {
                    warn!("保存状态消息ID失败: task={}, 错误: {}", task.id, e);
                }
                Some(id)
            }
            Err(e) => {
                warn!("发送状态消息失败: task={}, 错误: {}", task.id, e);
                None
            }
        }
    }

    async fn edit_status(&self, chat_id: i64, message_id: Option<i64>, text: &str) {
        let Some(message_id) = message_id else {
            return;
        };
        if let Err(e) = self.client.edit_message(chat_id, message_id, text).await {
            debug!("编辑状态消息失败（忽略）: {}", e);
        }
    }

    /// 断点续传到任务路径，返回最终文件大小
    async fn transfer(
        &self,
        task: &Task,
        media: &MediaInfo,
        chat_id: i64,
        status_message_id: Option<i64>,
        progress_key: i64,
    ) -> Result<u64> {
        let path = task.file_path.as_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("创建目录失败: {:?}", parent))?;
        }

        let total = media.size;
        let mut offset = existing_len(path).await?;
        if total > 0 && offset > total {
            warn!(
                "本地文件大于源文件，重新下载: path={:?}, local={}, remote={}",
                path, offset, total
            );
            fs::remove_file(path).await?;
            offset = 0;
        }
        if offset > 0 {
            info!("断点续传: task={}, offset={}", task.id, offset);
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .with_context(|| format!("打开文件失败: {:?}", path))?;

        if total == 0 || offset < total {
            let mut stream = self.client.iter_download(media, offset, self.chunk_size);
            let mut current = offset;

            while let Some(chunk) = stream.next().await {
                let chunk = chunk?;
                file.write_all(&chunk).await?;
                current += chunk.len() as u64;

                if let Some(text) =
                    self.progress
                        .on_progress(progress_key, &task.file_name, current, total)
                {
                    self.edit_status(chat_id, status_message_id, &text).await;
                }
            }
        }

        file.flush().await?;
        drop(file);

        let size = fs::metadata(path).await?.len();
        if total > 0 && size != total {
            anyhow::bail!("文件大小不匹配: 期望 {} 字节, 实际 {} 字节", total, size);
        }
        Ok(size)
    }
}

async fn existing_len(path: &Path) -> Result<u64> {
    match fs::metadata(path).await {
        Ok(meta) => Ok(meta.len()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e).with_context(|| format!("读取文件信息失败: {:?}", path)),
    }
}
