//! 单账号监管
//!
//! 一个账号对应一个 tokio 任务：建立客户端、连接、订阅频道，
//! 在同一任务内并发驱动下载器和（恢复 -> 监听），
//! 直到连接断开、收到停止信号或流水线退出。任何退出路径都会断开客户端并回到 stopped。

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Local;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::status::{ConnectError, StatusHandle, SupervisorState};
use crate::config::AppConfig;
use crate::downloader::resolver::normalize_identifier;
use crate::downloader::{
    download_queue, AdmissionController, ChannelListener, ChannelResolver, DownloadWorker,
    ProgressTracker, RecoveryManager,
};
use crate::notifier::Notifier;
use crate::persistence::{Account, TaskStore};
use crate::platform::{ChatRef, PlatformClient, PlatformClientFactory, PlatformError};

/// 数据库中"上线时向频道发送消息"开关的键
pub const SEND_CHANNEL_LOGIN_MSG_KEY: &str = "SEND_CHANNEL_LOGIN_MSG";

/// 所有账号共享的依赖
#[derive(Clone)]
pub struct SupervisorContext {
    pub store: Arc<TaskStore>,
    pub factory: Arc<dyn PlatformClientFactory>,
    pub notifier: Arc<dyn Notifier>,
    pub config: Arc<AppConfig>,
}

pub struct AccountSupervisor {
    ctx: SupervisorContext,
    account: Account,
    status: StatusHandle,
    progress: ProgressTracker,
}

impl AccountSupervisor {
    pub fn new(
        ctx: SupervisorContext,
        account: Account,
        status: StatusHandle,
        progress: ProgressTracker,
    ) -> Self {
        Self {
            ctx,
            account,
            status,
            progress,
        }
    }

    /// 运行到结束，返回时状态一定是 stopped
    pub async fn run(self, cancel: CancellationToken) {
        self.status.reset();

        if let Err(e) = self.run_inner(&cancel).await {
            error!("账号 [{}] 运行出错: {:#}", self.account.name, e);
            self.status.set(SupervisorState::Error(format!("{:#}", e)));
        }

        self.progress.clear();
        self.status.set(SupervisorState::Stopped);
        info!("账号 [{}] 实例已彻底停止", self.account.name);
    }

    /// 已启用频道的订阅过滤项（去重，保持顺序）
    fn enabled_chats(&self) -> Result<Vec<ChatRef>> {
        let channels = self.ctx.store.get_channels(Some(self.account.id))?;
        let mut chats: Vec<ChatRef> = Vec::new();
        for channel in channels.iter().filter(|c| c.enabled) {
            match normalize_identifier(&channel.channel_id) {
                Some(chat) => {
                    info!(
                        "账号 [{}] 添加监听频道: {} ({})",
                        self.account.name,
                        channel.channel_name.as_deref().unwrap_or(&channel.channel_id),
                        chat
                    );
                    if !chats.contains(&chat) {
                        chats.push(chat);
                    }
                }
                None => warn!("频道标识为空，跳过: channel_id={}", channel.id),
            }
        }
        Ok(chats)
    }

    async fn run_inner(&self, cancel: &CancellationToken) -> Result<()> {
        let chats = self.enabled_chats()?;
        if chats.is_empty() {
            warn!("账号 [{}] 没有启用任何频道，不启动", self.account.name);
            return Ok(());
        }

        let client = self
            .ctx
            .factory
            .build(&self.account)
            .context("创建平台客户端失败")?;

        self.status.set(SupervisorState::Connecting);
        info!(
            "账号 [{}] 正在连接 (API_ID: {})...",
            self.account.name, self.account.api_id
        );

        match self.connect(client.as_ref(), cancel).await {
            Ok(()) => {}
            Err(ConnectError::Cancelled) => {
                info!("账号 [{}] 连接过程中收到停止信号", self.account.name);
                client.disconnect().await;
                return Ok(());
            }
            Err(e) => {
                error!("账号 [{}] 连接失败: {}", self.account.name, e);
                self.status.set(SupervisorState::Error(e.to_string()));
                client.disconnect().await;
                return Ok(());
            }
        }

        let result = self.serve(client.clone(), chats, cancel).await;
        if client.is_connected() {
            client.disconnect().await;
        }
        result
    }

    /// 有机器人令牌时用令牌登录，否则必须已有会话
    async fn connect(
        &self,
        client: &dyn PlatformClient,
        cancel: &CancellationToken,
    ) -> Result<(), ConnectError> {
        let timeout = self.ctx.config.supervisor.connect_timeout();
        let bot_token = self
            .account
            .bot_token
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty());

        let attempt = async {
            match bot_token {
                Some(token) => client.connect_with_bot_token(token).await,
                None => {
                    if !client.has_session().await {
                        return Err(PlatformError::NoSession);
                    }
                    client.connect_with_session().await
                }
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => Err(ConnectError::Cancelled),
            result = tokio::time::timeout(timeout, attempt) => match result {
                Err(_) => Err(ConnectError::Timeout(timeout.as_secs())),
                Ok(Err(PlatformError::NoSession)) => Err(ConnectError::NoSession),
                Ok(Err(e)) => Err(ConnectError::Platform(e)),
                Ok(Ok(())) => Ok(()),
            },
        }
    }

    /// 已连接：订阅并运行流水线
    async fn serve(
        &self,
        client: Arc<dyn PlatformClient>,
        chats: Vec<ChatRef>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let events = client
            .subscribe(chats.clone())
            .await
            .context("订阅频道消息失败")?;

        self.status.set(SupervisorState::Running);
        info!(
            "账号 [{}] 启动成功，正在监听 {} 个频道",
            self.account.name,
            chats.len()
        );
        self.announce_online(client.as_ref(), &chats).await;

        let config = &self.ctx.config;
        let store = self.ctx.store.clone();
        let resolver = ChannelResolver::new(
            store.clone(),
            self.account.id,
            config.download.download_dir.clone(),
        );
        let admission = Arc::new(AdmissionController::new(
            store.clone(),
            config.admission.default_max,
            config.admission.poll_interval(),
        ));
        let (tx, rx) = download_queue(config.download.queue_capacity);

        let worker = DownloadWorker::new(
            self.account.clone(),
            client.clone(),
            store.clone(),
            resolver.clone(),
            admission.clone(),
            self.progress.clone(),
            self.ctx.notifier.clone(),
        )
        .with_chunk_size(config.download.chunk_size);
        let listener = ChannelListener::new(
            self.account.clone(),
            client.clone(),
            store.clone(),
            resolver,
            tx.clone(),
        );
        let recovery = RecoveryManager::new(store, self.account.id).with_admission(admission);

        let pipeline_cancel = cancel.child_token();
        let intake = async {
            // 恢复项先于实时消息入队
            match recovery.recover(&tx).await {
                Ok(0) => {}
                Ok(n) => info!("账号 [{}] 已恢复 {} 个未完成任务", self.account.name, n),
                Err(e) => warn!("账号 [{}] 恢复未完成任务失败: {:#}", self.account.name, e),
            }
            drop(tx);
            listener.run(events, pipeline_cancel.clone()).await;
        };
        let pipeline = async {
            tokio::join!(worker.run(rx, pipeline_cancel.clone()), intake);
        };

        tokio::select! {
            _ = client.run_until_disconnected() => {
                if !cancel.is_cancelled() {
                    warn!("账号 [{}] 连接已断开", self.account.name);
                    self.status.set(SupervisorState::Error("connection lost".to_string()));
                }
            }
            _ = cancel.cancelled() => {
                info!("账号 [{}] 收到停止信号", self.account.name);
            }
            _ = pipeline => {
                warn!("账号 [{}] 下载流水线已退出", self.account.name);
            }
        }
        pipeline_cancel.cancel();

        Ok(())
    }

    /// 上线通知：推送一条，开关打开时再向每个频道发送一条
    async fn announce_online(&self, client: &dyn PlatformClient, chats: &[ChatRef]) {
        self.ctx
            .notifier
            .push(&format!(
                "🤖 机器人上线: {}\n监听频道: {} 个",
                self.account.name,
                chats.len()
            ))
            .await;

        let send_to_channels = match self.ctx.store.get_setting_flag(SEND_CHANNEL_LOGIN_MSG_KEY) {
            Ok(flag) => flag,
            Err(e) => {
                warn!("读取上线消息设置失败: {}", e);
                false
            }
        };
        if !send_to_channels {
            return;
        }

        info!("账号 [{}] 正在向频道发送上线通知...", self.account.name);
        let text = format!(
            "🤖 **机器人已上线**\n\n**账号**: `{}`\n**时间**: `{}`",
            self.account.name,
            Local::now().format("%Y-%m-%d %H:%M:%S")
        );
        for chat in chats {
            if let Err(e) = client.send_message(chat, &text, None).await {
                error!("向频道 [{}] 发送上线消息失败: {}", chat, e);
            }
        }
    }
}
