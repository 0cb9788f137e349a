//! 测试用内存平台客户端

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};

use super::{
    ChatRef, IncomingMessage, MediaInfo, MediaKind, PlatformClient, PlatformClientFactory,
    PlatformError,
};
use crate::persistence::Account;

/// 已发送的消息
#[derive(Debug, Clone)]
pub struct SentMessage {
    pub id: i64,
    pub chat: ChatRef,
    pub text: String,
    pub reply_to: Option<i64>,
}

#[derive(Default)]
struct MockState {
    messages: HashMap<(i64, i64), IncomingMessage>,
    media: HashMap<String, Bytes>,
    fail_at: HashMap<String, usize>,
    sent: Vec<SentMessage>,
    edits: Vec<(i64, i64, String)>,
    subscriber: Option<mpsc::Sender<IncomingMessage>>,
    subscribed_chats: Vec<ChatRef>,
    chunk_delay: Option<Duration>,
    connect_delay: Option<Duration>,
    connect_error: Option<String>,
    next_message_id: i64,
    fail_edits: bool,
}

/// 脚本化的平台客户端
pub struct MockPlatform {
    state: Mutex<MockState>,
    connected: AtomicBool,
    session_exists: AtomicBool,
    disconnected: Notify,
    connects: AtomicUsize,
}

impl Default for MockPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl MockPlatform {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                next_message_id: 10_000,
                ..Default::default()
            }),
            connected: AtomicBool::new(false),
            session_exists: AtomicBool::new(false),
            disconnected: Notify::new(),
            connects: AtomicUsize::new(0),
        }
    }

    pub fn with_session(self) -> Self {
        self.session_exists.store(true, Ordering::SeqCst);
        self
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        self.state.lock().connect_delay = Some(delay);
    }

    pub fn set_connect_error(&self, message: &str) {
        self.state.lock().connect_error = Some(message.to_string());
    }

    /// 每个分片之间的延迟（模拟慢速下载）
    pub fn set_chunk_delay(&self, delay: Duration) {
        self.state.lock().chunk_delay = Some(delay);
    }

    pub fn set_fail_edits(&self, fail: bool) {
        self.state.lock().fail_edits = fail;
    }

    pub fn add_media(&self, location: &str, data: Vec<u8>) {
        self.state
            .lock()
            .media
            .insert(location.to_string(), Bytes::from(data));
    }

    /// 读到 `offset` 字节时中断传输
    pub fn fail_media_at(&self, location: &str, offset: usize) {
        self.state.lock().fail_at.insert(location.to_string(), offset);
    }

    pub fn clear_media_failure(&self, location: &str) {
        self.state.lock().fail_at.remove(location);
    }

    /// 只保存消息（可被 get_message 获取），不推送事件
    pub fn store_message(&self, message: IncomingMessage) {
        self.state
            .lock()
            .messages
            .insert((message.chat_id, message.id), message);
    }

    pub fn delete_message(&self, chat_id: i64, message_id: i64) {
        self.state.lock().messages.remove(&(chat_id, message_id));
    }

    /// 保存并向订阅者推送新消息
    pub async fn post(&self, message: IncomingMessage) {
        let sender = {
            let mut state = self.state.lock();
            state
                .messages
                .insert((message.chat_id, message.id), message.clone());
            let subscribed = state
                .subscribed_chats
                .iter()
                .any(|c| c.matches(message.chat_id, message.chat_username.as_deref()));
            if subscribed {
                state.subscriber.clone()
            } else {
                None
            }
        };
        if let Some(sender) = sender {
            let _ = sender.send(message).await;
        }
    }

    /// 模拟服务端断开
    pub fn drop_connection(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.disconnected.notify_waiters();
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.state.lock().sent.clone()
    }

    pub fn edits(&self) -> Vec<(i64, i64, String)> {
        self.state.lock().edits.clone()
    }

    pub fn subscribed_chats(&self) -> Vec<ChatRef> {
        self.state.lock().subscribed_chats.clone()
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    async fn do_connect(&self) -> Result<(), PlatformError> {
        let (delay, error) = {
            let state = self.state.lock();
            (state.connect_delay, state.connect_error.clone())
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = error {
            return Err(PlatformError::InvalidCredentials(error));
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl PlatformClient for MockPlatform {
    async fn connect_with_bot_token(&self, _bot_token: &str) -> Result<(), PlatformError> {
        self.do_connect().await
    }

    async fn connect_with_session(&self) -> Result<(), PlatformError> {
        if !self.session_exists.load(Ordering::SeqCst) {
            return Err(PlatformError::NoSession);
        }
        self.do_connect().await
    }

    async fn has_session(&self) -> bool {
        self.session_exists.load(Ordering::SeqCst)
    }

    async fn subscribe(
        &self,
        chats: Vec<ChatRef>,
    ) -> Result<mpsc::Receiver<IncomingMessage>, PlatformError> {
        let (tx, rx) = mpsc::channel(64);
        let mut state = self.state.lock();
        state.subscriber = Some(tx);
        state.subscribed_chats = chats;
        Ok(rx)
    }

    async fn get_message(
        &self,
        chat_id: i64,
        message_id: i64,
    ) -> Result<Option<IncomingMessage>, PlatformError> {
        if !self.is_connected() {
            return Err(PlatformError::NotConnected);
        }
        Ok(self
            .state
            .lock()
            .messages
            .get(&(chat_id, message_id))
            .cloned())
    }

    fn iter_download(
        &self,
        media: &MediaInfo,
        offset: u64,
        chunk_size: usize,
    ) -> BoxStream<'static, Result<Bytes, PlatformError>> {
        let (data, fail_at, delay) = {
            let state = self.state.lock();
            (
                state.media.get(&media.location).cloned(),
                state.fail_at.get(&media.location).copied(),
                state.chunk_delay,
            )
        };
        let Some(data) = data else {
            return stream::once(async { Err(PlatformError::Remote("媒体不存在".to_string())) })
                .boxed();
        };

        stream::unfold((offset as usize, false), move |(pos, done)| {
            let data = data.clone();
            async move {
                if done || pos >= data.len() {
                    return None;
                }
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                if let Some(limit) = fail_at {
                    if pos >= limit {
                        let err = PlatformError::Network("connection reset by peer".to_string());
                        return Some((Err(err), (pos, true)));
                    }
                }
                let mut end = (pos + chunk_size).min(data.len());
                if let Some(limit) = fail_at {
                    end = end.min(limit.max(pos + 1));
                }
                Some((Ok(data.slice(pos..end)), (end, false)))
            }
        })
        .boxed()
    }

    async fn send_message(
        &self,
        chat: &ChatRef,
        text: &str,
        reply_to: Option<i64>,
    ) -> Result<i64, PlatformError> {
        let mut state = self.state.lock();
        state.next_message_id += 1;
        let id = state.next_message_id;
        state.sent.push(SentMessage {
            id,
            chat: chat.clone(),
            text: text.to_string(),
            reply_to,
        });
        Ok(id)
    }

    async fn edit_message(
        &self,
        chat_id: i64,
        message_id: i64,
        text: &str,
    ) -> Result<(), PlatformError> {
        let mut state = self.state.lock();
        if state.fail_edits {
            return Err(PlatformError::Remote("MESSAGE_NOT_MODIFIED".to_string()));
        }
        state.edits.push((chat_id, message_id, text.to_string()));
        Ok(())
    }

    async fn disconnect(&self) {
        self.drop_connection();
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn run_until_disconnected(&self) {
        loop {
            let notified = self.disconnected.notified();
            if !self.is_connected() {
                return;
            }
            notified.await;
        }
    }
}

/// 按账号ID返回预先注册的客户端
#[derive(Default)]
pub struct MockFactory {
    clients: Mutex<HashMap<i64, Arc<MockPlatform>>>,
    builds: AtomicUsize,
}

impl MockFactory {
    pub fn register(&self, account_id: i64, client: Arc<MockPlatform>) {
        self.clients.lock().insert(account_id, client);
    }

    pub fn build_count(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }
}

impl PlatformClientFactory for MockFactory {
    fn build(&self, account: &Account) -> anyhow::Result<Arc<dyn PlatformClient>> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        let client = self
            .clients
            .lock()
            .get(&account.id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("未注册的测试账号: {}", account.id))?;
        Ok(client)
    }
}

/// 构造一条视频消息
pub fn video_message(
    chat_id: i64,
    id: i64,
    caption: &str,
    location: &str,
    size: u64,
) -> IncomingMessage {
    IncomingMessage {
        id,
        chat_id,
        chat_username: None,
        text: caption.to_string(),
        media: Some(MediaInfo {
            kind: MediaKind::Video,
            file_name: Some(format!("{}.mp4", location)),
            mime_type: Some("video/mp4".to_string()),
            size,
            location: location.to_string(),
        }),
        is_reply: false,
        date: chrono::Utc::now(),
    }
}

/// 生成确定性的测试数据
pub fn test_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}
