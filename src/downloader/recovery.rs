//! 启动恢复
//!
//! 账号启动时把上次异常退出遗留的 waiting / downloading 任务按ID顺序重新入队，
//! 下载器会重新获取源消息并从已有文件长度继续。

use std::sync::Arc;

use anyhow::{anyhow, Result};
use tracing::info;

use super::admission::AdmissionController;
use super::queue::{MessageRef, QueueSender};
use crate::persistence::{TaskStatus, TaskStore};

pub struct RecoveryManager {
    store: Arc<TaskStore>,
    account_id: i64,
    admission: Option<Arc<AdmissionController>>,
}

impl RecoveryManager {
    pub fn new(store: Arc<TaskStore>, account_id: i64) -> Self {
        Self {
            store,
            account_id,
            admission: None,
        }
    }

    /// 遗留的 downloading 任务在重新取出前不占用并发名额
    pub fn with_admission(mut self, admission: Arc<AdmissionController>) -> Self {
        self.admission = Some(admission);
        self
    }

    /// 重新入队未完成任务，返回入队数量
    pub async fn recover(&self, queue: &QueueSender) -> Result<usize> {
        let tasks = self.store.get_unfinished_tasks(self.account_id)?;
        if tasks.is_empty() {
            return Ok(0);
        }

        info!(
            "发现 {} 个未完成任务，重新入队: account_id={}",
            tasks.len(),
            self.account_id
        );

        if let Some(admission) = &self.admission {
            admission.exempt(
                tasks
                    .iter()
                    .filter(|t| t.status == TaskStatus::Downloading)
                    .map(|t| t.id),
            );
        }

        for task in &tasks {
            queue
                .send(MessageRef::Pending {
                    chat_id: task.source_chat_id,
                    message_id: task.source_message_id,
                    task_id: task.id,
                })
                .await
                .map_err(|_| anyhow!("下载队列已关闭"))?;
        }

        Ok(tasks.len())
    }
}
