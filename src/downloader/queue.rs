//! 账号内下载队列（监听器 / 恢复 -> 下载器）

use tokio::sync::mpsc;

use crate::platform::IncomingMessage;

/// 默认队列容量
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// 队列中的一项
#[derive(Debug, Clone)]
pub enum MessageRef {
    /// 实时收到的消息，task_id 为空表示监听器未能创建任务
    Live {
        message: IncomingMessage,
        task_id: Option<i64>,
    },
    /// 需要重新获取的消息（崩溃恢复）
    Pending {
        chat_id: i64,
        message_id: i64,
        task_id: i64,
    },
}

impl MessageRef {
    pub fn task_id(&self) -> Option<i64> {
        match self {
            MessageRef::Live { task_id, .. } => *task_id,
            MessageRef::Pending { task_id, .. } => Some(*task_id),
        }
    }

    /// 源消息的 (会话ID, 消息ID)
    pub fn source(&self) -> (i64, i64) {
        match self {
            MessageRef::Live { message, .. } => (message.chat_id, message.id),
            MessageRef::Pending {
                chat_id,
                message_id,
                ..
            } => (*chat_id, *message_id),
        }
    }
}

pub type QueueSender = mpsc::Sender<MessageRef>;
pub type QueueReceiver = mpsc::Receiver<MessageRef>;

pub fn download_queue(capacity: usize) -> (QueueSender, QueueReceiver) {
    mpsc::channel(capacity.max(1))
}
