//! 任务存储（SQLite）
//!
//! 所有账号共享的唯一可变资源：
//! - accounts / channels: 账号与监听频道配置（由外部配置界面维护）
//! - settings: 运行时设置（JSON 文本）
//! - tasks: 下载任务生命周期记录
//! - notifications: 推送通知渠道
//!
//! 使用 WAL 日志模式 + busy_timeout，多个存储句柄（包括多个进程）可以并发读写，
//! 写入由 SQLite 串行化。

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{anyhow, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::types::{
    Account, Channel, ChannelWithAccount, NewTask, NotificationChannel, Task, TaskStatus,
};

/// 数据库忙等待超时
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const TASK_COLUMNS: &str = "id, account_id, channel_id, source_message_id, source_chat_id, \
     message_id, file_name, file_path, file_size, status, start_time, end_time, error_msg";

const ACCOUNT_COLUMNS: &str = "id, name, api_id, api_hash, bot_token, session_name";

const CHANNEL_COLUMNS: &str = "id, account_id, channel_id, channel_name, enabled, custom_path";

/// 任务存储
pub struct TaskStore {
    /// SQLite 连接
    conn: Mutex<Connection>,
}

impl TaskStore {
    /// 打开（或创建）数据库文件
    pub fn open(db_path: &Path) -> Result<Self> {
        // 确保父目录存在
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(BUSY_TIMEOUT)?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_tables()?;

        info!("任务数据库已打开: {:?}", db_path);
        Ok(store)
    }

    /// 内存数据库（测试用）
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_tables()?;
        Ok(store)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow!("获取数据库锁失败: {}", e))
    }

    /// 初始化数据库表
    fn init_tables(&self) -> Result<()> {
        let conn = self.conn()?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT
            );

            CREATE TABLE IF NOT EXISTS accounts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                api_id INTEGER NOT NULL DEFAULT 0,
                api_hash TEXT NOT NULL DEFAULT '',
                bot_token TEXT,
                session_name TEXT NOT NULL,
                created_at INTEGER
            );

            CREATE TABLE IF NOT EXISTS channels (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id INTEGER NOT NULL REFERENCES accounts (id) ON DELETE CASCADE,
                channel_id TEXT NOT NULL,
                channel_name TEXT,
                enabled INTEGER NOT NULL DEFAULT 1,
                custom_path TEXT
            );

            CREATE TABLE IF NOT EXISTS notifications (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                type TEXT NOT NULL,
                config TEXT NOT NULL DEFAULT '{}',
                enabled INTEGER NOT NULL DEFAULT 1
            );

            CREATE TABLE IF NOT EXISTS tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id INTEGER NOT NULL,
                channel_id INTEGER,
                source_message_id INTEGER NOT NULL,
                source_chat_id INTEGER NOT NULL,
                message_id INTEGER,
                file_name TEXT NOT NULL,
                file_path TEXT NOT NULL,
                file_size INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL,
                start_time INTEGER,
                end_time INTEGER,
                error_msg TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
            CREATE INDEX IF NOT EXISTS idx_tasks_account_status ON tasks(account_id, status);
            CREATE INDEX IF NOT EXISTS idx_tasks_file_path ON tasks(file_path);
            "#,
        )?;

        debug!("任务数据库表初始化完成");
        Ok(())
    }

    // ========================================================================
    // settings
    // ========================================================================

    /// 读取设置
    ///
    /// 设置值以 JSON 文本保存；字符串值返回其内容，其余 JSON 值返回其文本表示，
    /// 非 JSON 文本原样返回
    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn()?;
        let raw: Option<Option<String>> = conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;

        Ok(raw.flatten().and_then(|raw| decode_setting(&raw)))
    }

    /// 读取设置，缺失时返回默认值
    pub fn get_setting_or(&self, key: &str, default: &str) -> Result<String> {
        Ok(self
            .get_setting(key)?
            .unwrap_or_else(|| default.to_string()))
    }

    /// 读取布尔设置（"1"/"true"/"yes"/"on" 视为真）
    pub fn get_setting_flag(&self, key: &str) -> Result<bool> {
        Ok(self
            .get_setting(key)?
            .map(|v| {
                matches!(
                    v.trim().to_ascii_lowercase().as_str(),
                    "1" | "true" | "yes" | "on"
                )
            })
            .unwrap_or(false))
    }

    /// 写入设置
    pub fn set_setting<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        let encoded = serde_json::to_string(value)?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
            params![key, encoded],
        )?;
        debug!("设置已更新: {} = {}", key, encoded);
        Ok(())
    }

    // ========================================================================
    // accounts / channels
    // ========================================================================

    /// 添加账号，返回新账号ID（忽略 `account.id`）
    pub fn add_account(&self, account: &Account) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO accounts (name, api_id, api_hash, bot_token, session_name, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                account.name,
                account.api_id,
                account.api_hash,
                account.bot_token,
                account.session_name,
                chrono::Utc::now().timestamp(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_accounts(&self) -> Result<Vec<Account>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM accounts ORDER BY id ASC",
            ACCOUNT_COLUMNS
        ))?;
        let rows = stmt.query_map([], account_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn get_account(&self, account_id: i64) -> Result<Option<Account>> {
        let conn = self.conn()?;
        let account = conn
            .query_row(
                &format!("SELECT {} FROM accounts WHERE id = ?1", ACCOUNT_COLUMNS),
                params![account_id],
                account_from_row,
            )
            .optional()?;
        Ok(account)
    }

    /// 添加频道，返回新频道记录ID（忽略 `channel.id`）
    pub fn add_channel(&self, channel: &Channel) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO channels (account_id, channel_id, channel_name, enabled, custom_path)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                channel.account_id,
                channel.channel_id,
                channel.channel_name,
                channel.enabled as i64,
                channel.custom_path,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// 获取频道列表，可选按账号筛选（按记录ID排序）
    pub fn get_channels(&self, account_id: Option<i64>) -> Result<Vec<Channel>> {
        let conn = self.conn()?;
        let channels = match account_id {
            Some(account_id) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM channels WHERE account_id = ?1 ORDER BY id ASC",
                    CHANNEL_COLUMNS
                ))?;
                let rows = stmt.query_map(params![account_id], channel_from_row)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM channels ORDER BY id ASC",
                    CHANNEL_COLUMNS
                ))?;
                let rows = stmt.query_map([], channel_from_row)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
        };
        Ok(channels)
    }

    /// 获取频道及其所属账号
    pub fn get_channel_with_account(&self, channel_id: i64) -> Result<Option<ChannelWithAccount>> {
        let conn = self.conn()?;
        let found = conn
            .query_row(
                r#"
                SELECT c.id, c.account_id, c.channel_id, c.channel_name, c.enabled, c.custom_path,
                       a.id, a.name, a.api_id, a.api_hash, a.bot_token, a.session_name
                FROM channels c
                JOIN accounts a ON c.account_id = a.id
                WHERE c.id = ?1
                "#,
                params![channel_id],
                |row| {
                    Ok(ChannelWithAccount {
                        channel: channel_from_row(row)?,
                        account: Account {
                            id: row.get(6)?,
                            name: row.get(7)?,
                            api_id: row.get(8)?,
                            api_hash: row.get(9)?,
                            bot_token: non_empty(row.get(10)?),
                            session_name: row.get(11)?,
                        },
                    })
                },
            )
            .optional()?;
        Ok(found)
    }

    // ========================================================================
    // tasks
    // ========================================================================

    /// 新建任务（状态为 waiting），返回任务ID
    pub fn add_task(&self, task: &NewTask) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO tasks (
                account_id, channel_id, source_message_id, source_chat_id,
                file_name, file_path, file_size, status
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7)
            "#,
            params![
                task.account_id,
                task.channel_id,
                task.source_message_id,
                task.source_chat_id,
                task.file_name,
                task.file_path.to_string_lossy().to_string(),
                TaskStatus::Waiting.as_str(),
            ],
        )?;
        let id = conn.last_insert_rowid();
        debug!("已创建任务: id={}, file={}", id, task.file_name);
        Ok(id)
    }

    pub fn get_task(&self, task_id: i64) -> Result<Option<Task>> {
        let conn = self.conn()?;
        let task = conn
            .query_row(
                &format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS),
                params![task_id],
                task_from_row,
            )
            .optional()?;
        Ok(task)
    }

    /// 更新任务状态
    ///
    /// 仅当当前状态是目标状态的合法前置状态时才会更新；
    /// 返回 false 表示迁移被拒绝（任务不存在或会违反单调顺序）
    pub fn update_task_status(
        &self,
        task_id: i64,
        status: TaskStatus,
        start_time: Option<i64>,
        end_time: Option<i64>,
        error_msg: Option<&str>,
    ) -> Result<bool> {
        self.transition(task_id, status, start_time, end_time, error_msg, None)
    }

    /// 标记为下载中（刷新开始时间）
    pub fn mark_downloading(&self, task_id: i64, start_time: i64) -> Result<bool> {
        self.transition(
            task_id,
            TaskStatus::Downloading,
            Some(start_time),
            None,
            None,
            None,
        )
    }

    /// 标记为已完成
    pub fn mark_completed(&self, task_id: i64, file_size: u64, end_time: i64) -> Result<bool> {
        self.transition(
            task_id,
            TaskStatus::Completed,
            None,
            Some(end_time),
            None,
            Some(file_size),
        )
    }

    /// 标记为失败
    pub fn mark_failed(&self, task_id: i64, error_msg: &str, end_time: i64) -> Result<bool> {
        self.transition(
            task_id,
            TaskStatus::Failed,
            None,
            Some(end_time),
            Some(error_msg),
            None,
        )
    }

    /// 标记文件已被保留策略清理
    pub fn mark_file_expired(&self, task_id: i64) -> Result<bool> {
        self.transition(
            task_id,
            TaskStatus::FileExpired,
            None,
            None,
            Some("File cleaned up by retention policy"),
            None,
        )
    }

    fn transition(
        &self,
        task_id: i64,
        next: TaskStatus,
        start_time: Option<i64>,
        end_time: Option<i64>,
        error_msg: Option<&str>,
        file_size: Option<u64>,
    ) -> Result<bool> {
        let predecessors = next
            .allowed_predecessors()
            .iter()
            .map(|s| format!("'{}'", s.as_str()))
            .collect::<Vec<_>>();
        if predecessors.is_empty() {
            warn!("任务 {} 不允许迁移到 {}", task_id, next);
            return Ok(false);
        }

        let sql = format!(
            r#"
            UPDATE tasks SET
                status = ?1,
                start_time = COALESCE(?2, start_time),
                end_time = COALESCE(?3, end_time),
                error_msg = COALESCE(?4, error_msg),
                file_size = COALESCE(?5, file_size)
            WHERE id = ?6 AND status IN ({})
            "#,
            predecessors.join(", ")
        );

        let conn = self.conn()?;
        let updated = conn.execute(
            &sql,
            params![
                next.as_str(),
                start_time,
                end_time,
                error_msg,
                file_size.map(|s| s as i64),
                task_id,
            ],
        )?;

        if updated == 0 {
            warn!("任务状态迁移被拒绝: task_id={}, 目标状态={}", task_id, next);
        } else {
            debug!("任务状态已更新: task_id={}, status={}", task_id, next);
        }
        Ok(updated > 0)
    }

    /// 记录任务的状态消息ID
    pub fn set_task_status_message(&self, task_id: i64, message_id: i64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE tasks SET message_id = ?1 WHERE id = ?2",
            params![message_id, task_id],
        )?;
        Ok(())
    }

    /// 全局下载中的任务数（用于并发准入）
    pub fn get_active_task_count(&self) -> Result<usize> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM tasks WHERE status = ?1",
            params![TaskStatus::Downloading.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// 某个账号下所有未完成（等待中或下载中）的任务，按ID升序
    pub fn get_unfinished_tasks(&self, account_id: i64) -> Result<Vec<Task>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM tasks WHERE account_id = ?1 AND status IN (?2, ?3) ORDER BY id ASC",
            TASK_COLUMNS
        ))?;
        let rows = stmt.query_map(
            params![
                account_id,
                TaskStatus::Waiting.as_str(),
                TaskStatus::Downloading.as_str()
            ],
            task_from_row,
        )?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// 所有活跃任务（下载中优先，其次等待中）
    pub fn get_active_tasks(&self) -> Result<Vec<Task>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            r#"
            SELECT {} FROM tasks
            WHERE status IN (?1, ?2)
            ORDER BY CASE WHEN status = ?1 THEN 0 ELSE 1 END, id ASC
            "#,
            TASK_COLUMNS
        ))?;
        let rows = stmt.query_map(
            params![
                TaskStatus::Downloading.as_str(),
                TaskStatus::Waiting.as_str()
            ],
            task_from_row,
        )?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// 路径是否已被未完成任务占用
    ///
    /// 监听器在文件落盘之前就分配了文件名，判重时需要把这些路径也视为已占用
    pub fn is_path_reserved(&self, path: &Path) -> Result<bool> {
        let conn = self.conn()?;
        let found: Option<i64> = conn
            .query_row(
                "SELECT id FROM tasks WHERE file_path = ?1 AND status IN (?2, ?3) LIMIT 1",
                params![
                    path.to_string_lossy().to_string(),
                    TaskStatus::Waiting.as_str(),
                    TaskStatus::Downloading.as_str()
                ],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// 早于 cutoff 完成的任务
    pub fn get_expired_tasks(&self, cutoff: i64) -> Result<Vec<Task>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            r#"
            SELECT {} FROM tasks
            WHERE status = ?1 AND end_time IS NOT NULL AND end_time < ?2
            ORDER BY id ASC
            "#,
            TASK_COLUMNS
        ))?;
        let rows = stmt.query_map(
            params![TaskStatus::Completed.as_str(), cutoff],
            task_from_row,
        )?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // ========================================================================
    // notifications
    // ========================================================================

    pub fn add_notification(
        &self,
        name: &str,
        kind: &str,
        config: &serde_json::Value,
        enabled: bool,
    ) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO notifications (name, type, config, enabled) VALUES (?1, ?2, ?3, ?4)",
            params![name, kind, config.to_string(), enabled as i64],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_notifications(&self) -> Result<Vec<NotificationChannel>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT id, name, type, config, enabled FROM notifications ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            let raw: String = row.get(3)?;
            Ok(NotificationChannel {
                id: row.get(0)?,
                name: row.get(1)?,
                kind: row.get(2)?,
                config: serde_json::from_str(&raw).unwrap_or(serde_json::Value::Null),
                enabled: row.get::<_, i64>(4)? != 0,
            })
        })?;

        let mut channels = Vec::new();
        for row in rows {
            match row {
                Ok(channel) => channels.push(channel),
                Err(e) => warn!("读取通知渠道失败: {}", e),
            }
        }
        Ok(channels)
    }
}

fn decode_setting(raw: &str) -> Option<String> {
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(serde_json::Value::Null) => None,
        Ok(serde_json::Value::String(s)) => Some(s),
        Ok(other) => Some(other.to_string()),
        Err(_) => Some(raw.to_string()),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn account_from_row(row: &Row<'_>) -> rusqlite::Result<Account> {
    Ok(Account {
        id: row.get(0)?,
        name: row.get(1)?,
        api_id: row.get(2)?,
        api_hash: row.get(3)?,
        bot_token: non_empty(row.get(4)?),
        session_name: row.get(5)?,
    })
}

fn channel_from_row(row: &Row<'_>) -> rusqlite::Result<Channel> {
    let custom_path: Option<String> = row.get(5)?;
    Ok(Channel {
        id: row.get(0)?,
        account_id: row.get(1)?,
        channel_id: row.get(2)?,
        channel_name: row.get(3)?,
        enabled: row.get::<_, i64>(4)? != 0,
        custom_path: non_empty(custom_path),
    })
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    let status: String = row.get(9)?;
    let status = status.parse::<TaskStatus>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(9, rusqlite::types::Type::Text, e.into())
    })?;
    let file_path: String = row.get(7)?;
    Ok(Task {
        id: row.get(0)?,
        account_id: row.get(1)?,
        channel_id: row.get(2)?,
        source_message_id: row.get(3)?,
        source_chat_id: row.get(4)?,
        status_message_id: row.get(5)?,
        file_name: row.get(6)?,
        file_path: PathBuf::from(file_path),
        file_size: row.get::<_, i64>(8)?.max(0) as u64,
        status,
        start_time: row.get(10)?,
        end_time: row.get(11)?,
        error_msg: row.get(12)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_account(name: &str) -> Account {
        Account {
            id: 0,
            name: name.to_string(),
            api_id: 12345,
            api_hash: "hash".to_string(),
            bot_token: Some("bot:token".to_string()),
            session_name: format!("session_{}", name),
        }
    }

    fn sample_task(account_id: i64, path: &str) -> NewTask {
        NewTask {
            account_id,
            channel_id: None,
            source_chat_id: -100123,
            source_message_id: 7,
            file_name: "movie.mp4".to_string(),
            file_path: PathBuf::from(path),
        }
    }

    #[test]
    fn test_settings_json_encoding() {
        let store = TaskStore::open_in_memory().unwrap();
        assert_eq!(store.get_setting("MISSING").unwrap(), None);

        store.set_setting("DOWNLOAD_DIR", "/data/downloads").unwrap();
        assert_eq!(
            store.get_setting("DOWNLOAD_DIR").unwrap().as_deref(),
            Some("/data/downloads")
        );

        store.set_setting("MAX_CONCURRENT_DOWNLOADS", &2).unwrap();
        assert_eq!(
            store.get_setting("MAX_CONCURRENT_DOWNLOADS").unwrap().as_deref(),
            Some("2")
        );

        store.set_setting("SEND_CHANNEL_LOGIN_MSG", &true).unwrap();
        assert!(store.get_setting_flag("SEND_CHANNEL_LOGIN_MSG").unwrap());
        assert!(!store.get_setting_flag("UNSET_FLAG").unwrap());
    }

    #[test]
    fn test_accounts_and_channels() {
        let store = TaskStore::open_in_memory().unwrap();
        let account_id = store.add_account(&sample_account("alpha")).unwrap();

        let channel_id = store
            .add_channel(&Channel {
                id: 0,
                account_id,
                channel_id: "@news".to_string(),
                channel_name: Some("News".to_string()),
                enabled: true,
                custom_path: Some("  ".to_string()),
            })
            .unwrap();

        let channels = store.get_channels(Some(account_id)).unwrap();
        assert_eq!(channels.len(), 1);
        assert!(channels[0].enabled);
        assert_eq!(channels[0].custom_path, None);
        assert!(store.get_channels(Some(account_id + 1)).unwrap().is_empty());

        let joined = store.get_channel_with_account(channel_id).unwrap().unwrap();
        assert_eq!(joined.account.name, "alpha");
        assert_eq!(joined.channel.channel_id, "@news");
    }

    #[test]
    fn test_task_lifecycle_and_active_count() {
        let store = TaskStore::open_in_memory().unwrap();
        let id = store.add_task(&sample_task(1, "/d/movie.mp4")).unwrap();

        let task = store.get_task(id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Waiting);
        assert_eq!(store.get_active_task_count().unwrap(), 0);

        assert!(store.mark_downloading(id, 100).unwrap());
        assert_eq!(store.get_active_task_count().unwrap(), 1);

        assert!(store.mark_completed(id, 4096, 200).unwrap());
        let task = store.get_task(id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.file_size, 4096);
        assert_eq!(task.start_time, Some(100));
        assert_eq!(task.end_time, Some(200));
        assert_eq!(store.get_active_task_count().unwrap(), 0);
    }

    #[test]
    fn test_terminal_states_never_revert() {
        let store = TaskStore::open_in_memory().unwrap();
        let id = store.add_task(&sample_task(1, "/d/a.mp4")).unwrap();

        assert!(store.mark_failed(id, "boom", 10).unwrap());
        assert!(!store.mark_downloading(id, 20).unwrap());
        assert!(!store.mark_completed(id, 1, 30).unwrap());
        assert!(!store.mark_file_expired(id).unwrap());

        let task = store.get_task(id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error_msg.as_deref(), Some("boom"));

        let done = store.add_task(&sample_task(1, "/d/b.mp4")).unwrap();
        store.mark_downloading(done, 1).unwrap();
        store.mark_completed(done, 1, 2).unwrap();
        assert!(store.mark_file_expired(done).unwrap());
        assert!(!store
            .update_task_status(done, TaskStatus::Completed, None, Some(3), None)
            .unwrap());
    }

    #[test]
    fn test_unfinished_tasks_and_reserved_paths() {
        let store = TaskStore::open_in_memory().unwrap();
        let waiting = store.add_task(&sample_task(1, "/d/w.mp4")).unwrap();
        let downloading = store.add_task(&sample_task(1, "/d/x.mp4")).unwrap();
        let finished = store.add_task(&sample_task(1, "/d/y.mp4")).unwrap();
        let other_account = store.add_task(&sample_task(2, "/d/z.mp4")).unwrap();

        store.mark_downloading(downloading, 1).unwrap();
        store.mark_downloading(finished, 1).unwrap();
        store.mark_completed(finished, 10, 2).unwrap();
        store.mark_downloading(other_account, 1).unwrap();

        let ids: Vec<i64> = store
            .get_unfinished_tasks(1)
            .unwrap()
            .iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(ids, vec![waiting, downloading]);

        assert!(store.is_path_reserved(Path::new("/d/w.mp4")).unwrap());
        assert!(!store.is_path_reserved(Path::new("/d/y.mp4")).unwrap());

        let active = store.get_active_tasks().unwrap();
        assert_eq!(active[0].status, TaskStatus::Downloading);
        assert_eq!(active.last().unwrap().id, waiting);
    }

    #[test]
    fn test_two_handles_share_wal_database() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data").join("tasks.db");
        let a = TaskStore::open(&path).unwrap();
        let b = TaskStore::open(&path).unwrap();

        let id = a.add_task(&sample_task(1, "/d/shared.mp4")).unwrap();
        assert!(b.mark_downloading(id, 5).unwrap());
        assert_eq!(a.get_active_task_count().unwrap(), 1);
    }

    #[test]
    fn test_notifications() {
        let store = TaskStore::open_in_memory().unwrap();
        store
            .add_notification(
                "phone",
                "bark",
                &serde_json::json!({"barkUrl": "https://bark.example/key"}),
                true,
            )
            .unwrap();
        let notifications = store.get_notifications().unwrap();
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].kind, "bark");
        assert_eq!(
            notifications[0].config["barkUrl"],
            "https://bark.example/key"
        );
    }
}
