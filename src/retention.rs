//! 已完成文件的保留策略
//!
//! 完成超过 `FILE_RETENTION_DAYS` 天的任务会删除本地文件并标记为 file_expired。

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::persistence::TaskStore;

/// 保留天数设置的键，0 表示不清理
pub const FILE_RETENTION_DAYS_KEY: &str = "FILE_RETENTION_DAYS";

pub const DEFAULT_RETENTION_DAYS: i64 = 3;

const SECONDS_PER_DAY: i64 = 86_400;

fn retention_days(store: &TaskStore) -> Result<i64> {
    let raw = store.get_setting(FILE_RETENTION_DAYS_KEY)?;
    Ok(match raw.as_deref().map(str::trim) {
        None | Some("") => DEFAULT_RETENTION_DAYS,
        Some(value) => match value.parse::<i64>() {
            Ok(days) if days >= 0 => days,
            _ => {
                warn!("无效的保留天数设置: {}，使用默认值 {}", value, DEFAULT_RETENTION_DAYS);
                DEFAULT_RETENTION_DAYS
            }
        },
    })
}

/// 执行一次清理，返回标记为过期的任务数
pub fn sweep_expired_files(store: &TaskStore) -> Result<usize> {
    let days = retention_days(store)?;
    if days == 0 {
        debug!("文件保留策略已关闭");
        return Ok(0);
    }

    // 天数过大时截止时间早于可表示范围，没有任何文件过期
    let Some(cutoff) = Utc::now()
        .timestamp()
        .checked_sub(days.saturating_mul(SECONDS_PER_DAY))
    else {
        return Ok(0);
    };
    let expired = store.get_expired_tasks(cutoff)?;

    let mut count = 0;
    for task in expired {
        match std::fs::remove_file(&task.file_path) {
            Ok(()) => info!("已删除过期文件: {:?}", task.file_path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("过期文件已不存在: {:?}", task.file_path)
            }
            Err(e) => {
                // 删除失败时保留 completed，下次再试
                warn!("删除过期文件失败: {:?}, 错误: {}", task.file_path, e);
                continue;
            }
        }
        if store.mark_file_expired(task.id)? {
            count += 1;
        }
    }

    if count > 0 {
        info!("保留策略清理完成: {} 个文件已过期", count);
    }
    Ok(count)
}

/// 后台清理循环，首次立即执行
pub async fn run_retention_loop(
    store: Arc<TaskStore>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = sweep_expired_files(&store) {
                    warn!("保留策略清理失败: {:#}", e);
                }
            }
            _ = cancel.cancelled() => break,
        }
    }

    info!("保留策略清理循环已退出");
}
