//! 平台桥接客户端
//!
//! 协议层运行在独立的边车进程中（负责加密、会话文件、更新推送），
//! 这里通过 HTTP 与其交互：
//! - `POST {base}/accounts/{session}/connect` 登录
//! - `POST {base}/accounts/{session}/updates` 长轮询新消息
//! - `GET  {base}/accounts/{session}/messages/{chat}/{id}` 获取消息（404 表示不存在）
//! - `GET  {base}/accounts/{session}/media/{location}?offset=&chunk_size=` 流式读取媒体
//! - `POST / PATCH {base}/accounts/{session}/messages` 发送 / 编辑消息
//! - `GET  {base}/accounts/{session}/status` 连接状态

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, Stream, StreamExt, TryStreamExt};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ChatRef, IncomingMessage, MediaInfo, PlatformClient, PlatformClientFactory, PlatformError};
use crate::config::PlatformConfig;
use crate::persistence::Account;

/// 更新队列容量
const UPDATE_BUFFER: usize = 256;

/// 轮询出错后的退避时间
const POLL_BACKOFF: Duration = Duration::from_secs(3);

#[derive(Debug, Deserialize)]
struct SentResponse {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    connected: bool,
}

/// 通过 HTTP 桥接到协议边车的平台客户端
pub struct BridgeClient {
    http: Client,
    /// `{bridge_url}/accounts/{session_name}`
    base: String,
    account: Account,
    session_file: PathBuf,
    /// JSON 请求的总超时，也是媒体流相邻两块之间的最长间隔
    request_timeout: Duration,
    poll_timeout: Duration,
    connected: Arc<AtomicBool>,
    disconnected: Arc<Notify>,
    poll_cancel: CancellationToken,
}

impl BridgeClient {
    pub fn new(http: Client, config: &PlatformConfig, account: &Account) -> Self {
        let base = format!(
            "{}/accounts/{}",
            config.bridge_url.trim_end_matches('/'),
            urlencoding::encode(&account.session_name)
        );
        let session_file = config
            .session_dir
            .join(format!("{}.session", account.session_name));

        Self {
            http,
            base,
            account: account.clone(),
            session_file,
            request_timeout: Duration::from_secs(config.request_timeout_secs),
            poll_timeout: Duration::from_secs(config.poll_timeout_secs),
            connected: Arc::new(AtomicBool::new(false)),
            disconnected: Arc::new(Notify::new()),
            poll_cancel: CancellationToken::new(),
        }
    }

    async fn connect(&self, bot_token: Option<&str>) -> Result<(), PlatformError> {
        let body = json!({
            "api_id": self.account.api_id,
            "api_hash": self.account.api_hash,
            "bot_token": bot_token,
            "session_path": self.session_file,
        });

        let resp = self
            .http
            .post(format!("{}/connect", self.base))
            .json(&body)
            .timeout(self.request_timeout)
            .send()
            .await?;

        match resp.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                let text = resp.text().await.unwrap_or_default();
                return Err(PlatformError::InvalidCredentials(text));
            }
            StatusCode::PRECONDITION_FAILED => return Err(PlatformError::NoSession),
            _ => {}
        }
        check_status(resp).await?;

        self.connected.store(true, Ordering::SeqCst);
        info!("桥接客户端已连接: session={}", self.account.session_name);
        Ok(())
    }

    fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.poll_cancel.cancel();
        self.disconnected.notify_waiters();
    }

    async fn fetch_status(&self) -> Result<bool, PlatformError> {
        let resp = self
            .http
            .get(format!("{}/status", self.base))
            .timeout(self.request_timeout)
            .send()
            .await?;
        let status: StatusResponse = check_status(resp).await?.json().await?;
        Ok(status.connected)
    }
}

/// 相邻两块数据间隔超过 `idle` 时以错误结束流
fn with_idle_timeout<S>(
    inner: S,
    idle: Duration,
) -> impl Stream<Item = Result<Bytes, PlatformError>> + Send + 'static
where
    S: Stream<Item = Result<Bytes, PlatformError>> + Send + Unpin + 'static,
{
    stream::unfold(Some(inner), move |state| async move {
        let mut inner = state?;
        match tokio::time::timeout(idle, inner.next()).await {
            Ok(Some(item)) => Some((item, Some(inner))),
            Ok(None) => None,
            Err(_) => Some((
                Err(PlatformError::Network(format!(
                    "媒体流 {}s 内没有新数据",
                    idle.as_secs()
                ))),
                None,
            )),
        }
    })
}

/// 将非 2xx 响应转换为错误
async fn check_status(resp: Response) -> Result<Response, PlatformError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let text = resp.text().await.unwrap_or_default();
    Err(PlatformError::Remote(format!("HTTP {}: {}", status.as_u16(), text)))
}

#[async_trait]
impl PlatformClient for BridgeClient {
    async fn connect_with_bot_token(&self, bot_token: &str) -> Result<(), PlatformError> {
        self.connect(Some(bot_token)).await
    }

    async fn connect_with_session(&self) -> Result<(), PlatformError> {
        if !self.has_session().await {
            return Err(PlatformError::NoSession);
        }
        self.connect(None).await
    }

    async fn has_session(&self) -> bool {
        tokio::fs::try_exists(&self.session_file)
            .await
            .unwrap_or(false)
    }

    async fn subscribe(
        &self,
        chats: Vec<ChatRef>,
    ) -> Result<mpsc::Receiver<IncomingMessage>, PlatformError> {
        if !self.is_connected() {
            return Err(PlatformError::NotConnected);
        }

        let (tx, rx) = mpsc::channel(UPDATE_BUFFER);
        let http = self.http.clone();
        let url = format!("{}/updates", self.base);
        let poll_timeout = self.poll_timeout;
        let cancel = self.poll_cancel.clone();

        tokio::spawn(async move {
            let body = json!({ "chats": chats, "timeout": poll_timeout.as_secs() });
            loop {
                let request = http
                    .post(&url)
                    .json(&body)
                    .timeout(poll_timeout + Duration::from_secs(10))
                    .send();

                let result = tokio::select! {
                    _ = cancel.cancelled() => break,
                    r = request => r,
                };

                let batch = match result {
                    Ok(resp) => match check_status(resp).await {
                        Ok(resp) => resp.json::<Vec<IncomingMessage>>().await.map_err(PlatformError::from),
                        Err(e) => Err(e),
                    },
                    Err(e) => Err(PlatformError::from(e)),
                };

                match batch {
                    Ok(messages) => {
                        for message in messages {
                            if tx.send(message).await.is_err() {
                                debug!("更新接收端已关闭，停止轮询");
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        warn!("拉取更新失败: {}", e);
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(POLL_BACKOFF) => {}
                        }
                    }
                }
            }
            debug!("更新轮询已停止");
        });

        Ok(rx)
    }

    async fn get_message(
        &self,
        chat_id: i64,
        message_id: i64,
    ) -> Result<Option<IncomingMessage>, PlatformError> {
        let resp = self
            .http
            .get(format!("{}/messages/{}/{}", self.base, chat_id, message_id))
            .timeout(self.request_timeout)
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let message = check_status(resp).await?.json().await?;
        Ok(Some(message))
    }

    fn iter_download(
        &self,
        media: &MediaInfo,
        offset: u64,
        chunk_size: usize,
    ) -> BoxStream<'static, Result<Bytes, PlatformError>> {
        let request = self
            .http
            .get(format!(
                "{}/media/{}",
                self.base,
                urlencoding::encode(&media.location)
            ))
            .query(&[
                ("offset", offset.to_string()),
                ("chunk_size", chunk_size.to_string()),
            ]);

        // 媒体流不设总超时，只限制等待响应头和相邻两块数据的间隔
        let idle = self.request_timeout;
        let body = async move {
            let resp = tokio::time::timeout(idle, request.send())
                .await
                .map_err(|_| {
                    PlatformError::Network(format!("等待媒体响应超时 ({}s)", idle.as_secs()))
                })??;
            let resp = check_status(resp).await?;
            Ok::<_, PlatformError>(with_idle_timeout(
                resp.bytes_stream().map_err(PlatformError::from).boxed(),
                idle,
            ))
        };

        stream::once(body).try_flatten().boxed()
    }

    async fn send_message(
        &self,
        chat: &ChatRef,
        text: &str,
        reply_to: Option<i64>,
    ) -> Result<i64, PlatformError> {
        let resp = self
            .http
            .post(format!("{}/messages", self.base))
            .json(&json!({ "chat": chat, "text": text, "reply_to": reply_to }))
            .timeout(self.request_timeout)
            .send()
            .await?;
        let sent: SentResponse = check_status(resp).await?.json().await?;
        Ok(sent.id)
    }

    async fn edit_message(
        &self,
        chat_id: i64,
        message_id: i64,
        text: &str,
    ) -> Result<(), PlatformError> {
        let resp = self
            .http
            .patch(format!("{}/messages/{}/{}", self.base, chat_id, message_id))
            .json(&json!({ "text": text }))
            .timeout(self.request_timeout)
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(PlatformError::MessageNotFound {
                chat_id,
                message_id,
            });
        }
        check_status(resp).await?;
        Ok(())
    }

    async fn disconnect(&self) {
        if let Err(e) = self
            .http
            .post(format!("{}/disconnect", self.base))
            .timeout(self.request_timeout)
            .send()
            .await
        {
            warn!("通知桥接端断开失败: {}", e);
        }
        self.mark_disconnected();
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn run_until_disconnected(&self) {
        // 本地断开立即返回，远端断开靠定期查询状态发现
        let interval = Duration::from_secs(15);
        loop {
            let notified = self.disconnected.notified();
            if !self.is_connected() {
                return;
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(interval) => {
                    match self.fetch_status().await {
                        Ok(true) => {}
                        Ok(false) => {
                            warn!("桥接端报告连接已断开: session={}", self.account.session_name);
                            self.mark_disconnected();
                        }
                        Err(e) => debug!("查询连接状态失败: {}", e),
                    }
                }
            }
        }
    }
}

/// 为每个账号创建共享同一 HTTP 连接池的桥接客户端
pub struct BridgeClientFactory {
    http: Client,
    config: PlatformConfig,
}

impl BridgeClientFactory {
    pub fn new(config: PlatformConfig) -> anyhow::Result<Self> {
        use anyhow::Context;

        // 不设总超时：媒体流可能持续很久，JSON 请求各自设置超时
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self { http, config })
    }
}

impl PlatformClientFactory for BridgeClientFactory {
    fn build(&self, account: &Account) -> anyhow::Result<Arc<dyn PlatformClient>> {
        Ok(Arc::new(BridgeClient::new(
            self.http.clone(),
            &self.config,
            account,
        )))
    }
}
