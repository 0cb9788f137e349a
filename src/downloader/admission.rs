//! 全局并发准入
//!
//! 所有账号共享同一个上限：以数据库中 `downloading` 状态的任务数为准，
//! 满载时按固定间隔轮询，直到有空位或收到停止信号。
//!
//! 检查与开始下载之间没有加锁，多个账号同时通过检查时可能短暂超过上限。
//!
//! 上次异常退出遗留的 downloading 任务在被本账号重新取出前不占用名额，
//! 否则上限为 1 时恢复任务会永远等待自己。

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::persistence::TaskStore;

/// 数据库中保存并发上限的键
pub const MAX_CONCURRENT_KEY: &str = "MAX_CONCURRENT_DOWNLOADS";

pub struct AdmissionController {
    store: Arc<TaskStore>,
    default_max: usize,
    poll_interval: Duration,
    /// 待恢复的遗留 downloading 任务
    stale: Mutex<HashSet<i64>>,
}

impl AdmissionController {
    pub fn new(store: Arc<TaskStore>, default_max: usize, poll_interval: Duration) -> Self {
        Self {
            store,
            default_max: default_max.max(1),
            poll_interval,
            stale: Mutex::new(HashSet::new()),
        }
    }

    /// 当前并发上限，缺失、无法解析或小于 1 时使用默认值
    pub fn max_concurrent(&self) -> usize {
        match self.store.get_setting(MAX_CONCURRENT_KEY) {
            Ok(Some(value)) => match value.trim().parse::<usize>() {
                Ok(n) if n >= 1 => n,
                _ => {
                    debug!("并发上限设置无效: {:?}，使用默认值 {}", value, self.default_max);
                    self.default_max
                }
            },
            Ok(None) => self.default_max,
            Err(e) => {
                warn!("读取并发上限失败，使用默认值: {}", e);
                self.default_max
            }
        }
    }

    /// 登记遗留的 downloading 任务，取出前不计入并发数
    pub fn exempt(&self, task_ids: impl IntoIterator<Item = i64>) {
        self.stale.lock().extend(task_ids);
    }

    /// 任务已被取出，恢复正常计数
    pub fn release(&self, task_id: i64) {
        self.stale.lock().remove(&task_id);
    }

    /// 是否还有空位
    pub fn has_capacity(&self) -> Result<bool> {
        let max = self.max_concurrent();
        let active = self
            .store
            .get_active_task_count()?
            .saturating_sub(self.stale.lock().len());
        Ok(active < max)
    }

    /// 等待空位
    ///
    /// 返回 false 表示等待期间收到停止信号
    pub async fn wait_for_slot(&self, cancel: &CancellationToken) -> bool {
        loop {
            if cancel.is_cancelled() {
                return false;
            }

            match self.has_capacity() {
                Ok(true) => return true,
                Ok(false) => debug!("并发数已满 ({})，等待中...", self.max_concurrent()),
                Err(e) => warn!("查询活跃任务数失败，稍后重试: {}", e),
            }

            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }
}
