//! 下载进度跟踪
//!
//! 每个账号一份，仅保存在内存中。每次收到数据都记录最新数值，
//! 但只有距离上次编辑超过间隔、或传输刚完成时才返回需要推送的文本。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Serialize;

const MIB: f64 = 1024.0 * 1024.0;

/// 进度条格数
const BAR_BLOCKS: usize = 10;

#[derive(Debug, Clone)]
struct ProgressEntry {
    file_name: String,
    started_at: Instant,
    /// 本次传输开始时已有的字节数（断点续传）
    start_bytes: u64,
    last_edit: Option<Instant>,
    downloaded: u64,
    total: u64,
}

impl ProgressEntry {
    fn percentage(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            (self.downloaded as f64 * 100.0 / self.total as f64).min(100.0)
        }
    }

    /// 本次传输的平均速度（MB/s）
    fn speed(&self) -> f64 {
        let elapsed = self.started_at.elapsed().as_secs_f64();
        if elapsed <= 0.0 {
            return 0.0;
        }
        self.downloaded.saturating_sub(self.start_bytes) as f64 / elapsed / MIB
    }

    fn snapshot(&self, key: i64) -> ProgressSnapshot {
        ProgressSnapshot {
            message_id: key,
            file_name: self.file_name.clone(),
            percentage: round_to(self.percentage(), 1),
            downloaded_mb: round_to(self.downloaded as f64 / MIB, 2),
            total_mb: round_to(self.total as f64 / MIB, 2),
            speed: format!("{:.2} MB/s", self.speed()),
        }
    }
}

fn round_to(value: f64, digits: i32) -> f64 {
    let factor = 10f64.powi(digits);
    (value * factor).round() / factor
}

/// 进度快照（对外只读）
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ProgressSnapshot {
    /// 状态消息ID
    pub message_id: i64,
    pub file_name: String,
    pub percentage: f64,
    pub downloaded_mb: f64,
    pub total_mb: f64,
    pub speed: String,
}

/// 渲染进度消息文本
pub fn render_progress(snapshot: &ProgressSnapshot) -> String {
    let filled = ((snapshot.percentage / 10.0).round() as usize).min(BAR_BLOCKS);
    let bar = format!("{}{}", "█".repeat(filled), "░".repeat(BAR_BLOCKS - filled));
    format!(
        "**正在下载**: `{}`\n\n**进度**: `[{}] {:.1}%`\n\n**大小**: `{:.2}MB / {:.2}MB`",
        snapshot.file_name, bar, snapshot.percentage, snapshot.downloaded_mb, snapshot.total_mb
    )
}

/// 单账号的进度跟踪器
///
/// 以状态消息ID为键；克隆后共享同一份数据
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    entries: Arc<RwLock<HashMap<i64, ProgressEntry>>>,
    edit_interval: Duration,
}

impl ProgressTracker {
    pub fn new(edit_interval: Duration) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            edit_interval,
        }
    }

    /// 记录进度
    ///
    /// 返回 `Some(text)` 表示应当编辑状态消息；传输完成时总会返回并删除条目
    pub fn on_progress(&self, key: i64, file_name: &str, current: u64, total: u64) -> Option<String> {
        let now = Instant::now();
        let mut entries = self.entries.write();

        let entry = entries.entry(key).or_insert_with(|| ProgressEntry {
            file_name: file_name.to_string(),
            started_at: now,
            start_bytes: current,
            last_edit: None,
            downloaded: current,
            total,
        });
        entry.downloaded = current;
        entry.total = total;

        let finished = total > 0 && current >= total;
        if finished {
            let text = render_progress(&entry.snapshot(key));
            entries.remove(&key);
            return Some(text);
        }

        let due = entry
            .last_edit
            .map_or(true, |last| now.duration_since(last) >= self.edit_interval);
        if !due {
            return None;
        }
        entry.last_edit = Some(now);
        Some(render_progress(&entry.snapshot(key)))
    }

    /// 删除条目（失败或中断时）
    pub fn remove(&self, key: i64) {
        self.entries.write().remove(&key);
    }

    /// 账号停止时清空
    pub fn clear(&self) {
        self.entries.write().clear();
    }

    pub fn contains(&self, key: i64) -> bool {
        self.entries.read().contains_key(&key)
    }

    /// 当前所有进度的快照，按键排序
    pub fn snapshot(&self) -> Vec<ProgressSnapshot> {
        let entries = self.entries.read();
        let mut list: Vec<_> = entries.iter().map(|(k, e)| e.snapshot(*k)).collect();
        list.sort_by_key(|s| s.message_id);
        list
    }
}
