//! 账号监管管理器
//!
//! 保证每个账号同一时刻至多一个监管任务：启动前先停止并等待旧实例退出
//! （有上限的等待 + 短暂宽限，让客户端释放会话存储）。

use std::sync::Arc;

use anyhow::{anyhow, Result};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::account::{AccountSupervisor, SupervisorContext};
use super::status::{StatusHandle, SupervisorState};
use crate::downloader::{ProgressSnapshot, ProgressTracker};

struct RunningSupervisor {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// 账号的状态与进度，跨重启保留
#[derive(Clone)]
struct AccountSlot {
    status: StatusHandle,
    progress: ProgressTracker,
}

/// 单个账号的状态快照
#[derive(Debug, Clone, Serialize)]
pub struct AccountSnapshot {
    pub account_id: i64,
    pub name: String,
    /// 状态文本，如 "running"、"error: connection timeout (60s)"
    pub status: String,
    pub last_error: Option<String>,
    pub running: bool,
    pub progress: Vec<ProgressSnapshot>,
}

pub struct SupervisorManager {
    ctx: SupervisorContext,
    running: DashMap<i64, RunningSupervisor>,
    slots: DashMap<i64, AccountSlot>,
    /// 串行化启动/停止
    lifecycle: Mutex<()>,
}

impl SupervisorManager {
    pub fn new(ctx: SupervisorContext) -> Self {
        Self {
            ctx,
            running: DashMap::new(),
            slots: DashMap::new(),
            lifecycle: Mutex::new(()),
        }
    }

    fn slot(&self, account_id: i64) -> AccountSlot {
        self.slots
            .entry(account_id)
            .or_insert_with(|| AccountSlot {
                status: StatusHandle::default(),
                progress: ProgressTracker::new(self.ctx.config.progress.edit_interval()),
            })
            .clone()
    }

    /// 启动（或重启）账号
    pub async fn start_account(&self, account_id: i64) -> Result<()> {
        let _guard = self.lifecycle.lock().await;

        let account = self
            .ctx
            .store
            .get_account(account_id)?
            .ok_or_else(|| anyhow!("账号不存在: {}", account_id))?;

        self.stop_locked(account_id).await;

        let slot = self.slot(account_id);
        slot.status.reset();

        let cancel = CancellationToken::new();
        let supervisor =
            AccountSupervisor::new(self.ctx.clone(), account.clone(), slot.status, slot.progress);
        let handle = tokio::spawn(supervisor.run(cancel.clone()));

        self.running
            .insert(account_id, RunningSupervisor { cancel, handle });
        info!("账号 [{}] 已启动监管任务", account.name);
        Ok(())
    }

    /// 停止账号，返回是否有正在运行的实例
    pub async fn stop_account(&self, account_id: i64) -> bool {
        let _guard = self.lifecycle.lock().await;
        self.stop_locked(account_id).await
    }

    async fn stop_locked(&self, account_id: i64) -> bool {
        let Some((_, running)) = self.running.remove(&account_id) else {
            return false;
        };

        let supervisor = &self.ctx.config.supervisor;
        running.cancel.cancel();

        let mut handle = running.handle;
        if tokio::time::timeout(supervisor.stop_join_timeout(), &mut handle)
            .await
            .is_err()
        {
            warn!(
                "账号 {} 的监管任务未在 {:?} 内退出，强制中止",
                account_id,
                supervisor.stop_join_timeout()
            );
            handle.abort();
            let _ = handle.await;
            if let Some(slot) = self.slots.get(&account_id) {
                slot.progress.clear();
                slot.status.set(SupervisorState::Stopped);
            }
        }

        tokio::time::sleep(supervisor.restart_grace()).await;
        info!("账号 {} 已停止", account_id);
        true
    }

    /// 停止所有账号
    pub async fn stop_all(&self) {
        let _guard = self.lifecycle.lock().await;
        let ids: Vec<i64> = self.running.iter().map(|e| *e.key()).collect();
        for id in ids {
            self.stop_locked(id).await;
        }
    }

    /// 启动所有至少有一个启用频道的账号，返回启动数量
    pub async fn start_all_enabled(&self) -> Result<usize> {
        let accounts = self.ctx.store.get_accounts()?;
        let mut started = 0;
        for account in accounts {
            let has_enabled = self
                .ctx
                .store
                .get_channels(Some(account.id))?
                .iter()
                .any(|c| c.enabled);
            if !has_enabled {
                continue;
            }
            match self.start_account(account.id).await {
                Ok(()) => started += 1,
                Err(e) => warn!("启动账号 [{}] 失败: {:#}", account.name, e),
            }
        }
        Ok(started)
    }

    /// 监管任务是否仍在运行
    pub fn is_running(&self, account_id: i64) -> bool {
        self.running
            .get(&account_id)
            .is_some_and(|r| !r.handle.is_finished())
    }

    pub fn account_status(&self, account_id: i64) -> Option<SupervisorState> {
        self.slots.get(&account_id).map(|s| s.status.state())
    }

    /// 所有账号的状态与进度快照
    pub fn status_snapshot(&self) -> Result<Vec<AccountSnapshot>> {
        let accounts = self.ctx.store.get_accounts()?;
        Ok(accounts
            .into_iter()
            .map(|account| {
                let (status, last_error, progress) = match self.slots.get(&account.id) {
                    Some(slot) => {
                        let status = slot.status.get();
                        (status.state.to_string(), status.last_error, slot.progress.snapshot())
                    }
                    None => (SupervisorState::Stopped.to_string(), None, Vec::new()),
                };
                AccountSnapshot {
                    account_id: account.id,
                    name: account.name,
                    status,
                    last_error,
                    running: self.is_running(account.id),
                    progress,
                }
            })
            .collect())
    }

    pub fn context(&self) -> &SupervisorContext {
        &self.ctx
    }
}

/// 便于在 axum 状态中共享
pub type SharedSupervisorManager = Arc<SupervisorManager>;
