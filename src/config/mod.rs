// 配置管理模块

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;

/// 应用配置
///
/// 运行时可调整的值（下载目录、并发上限等）保存在数据库 settings 表中，
/// 这里只放启动时确定的参数
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 服务器配置
    #[serde(default)]
    pub server: ServerConfig,
    /// 数据库配置
    #[serde(default)]
    pub database: DatabaseConfig,
    /// 下载配置
    #[serde(default)]
    pub download: DownloadConfig,
    /// 账号监管配置
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    /// 并发准入配置
    #[serde(default)]
    pub admission: AdmissionConfig,
    /// 进度消息配置
    #[serde(default)]
    pub progress: ProgressConfig,
    /// 平台桥接配置
    #[serde(default)]
    pub platform: PlatformConfig,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否写入日志文件
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            level: default_log_level(),
        }
    }
}

/// 服务器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// 监听地址
    #[serde(default = "default_host")]
    pub host: String,
    /// 监听端口
    #[serde(default = "default_port")]
    pub port: u16,
    /// CORS允许的源
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    18889
}

fn default_cors_origins() -> Vec<String> {
    vec!["*".to_string()]
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origins: default_cors_origins(),
        }
    }
}

/// 数据库配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite 数据库文件路径
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("data/downloader.db")
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// 下载配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// 数据库未设置 DOWNLOAD_DIR 时使用的下载根目录
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    /// 每次读取的分块大小（字节）
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// 每个账号的下载队列容量
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// 保留策略扫描间隔（秒）
    #[serde(default = "default_retention_interval_secs")]
    pub retention_interval_secs: u64,
}

fn default_download_dir() -> PathBuf {
    PathBuf::from("downloads")
}

fn default_chunk_size() -> usize {
    1024 * 1024 // 1MB
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_retention_interval_secs() -> u64 {
    3600
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            download_dir: default_download_dir(),
            chunk_size: default_chunk_size(),
            queue_capacity: default_queue_capacity(),
            retention_interval_secs: default_retention_interval_secs(),
        }
    }
}

/// 账号监管配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// 连接超时（秒）
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// 停止时等待监管任务退出的时间（秒）
    #[serde(default = "default_stop_join_timeout_secs")]
    pub stop_join_timeout_secs: u64,
    /// 强制中止后的宽限时间（毫秒），让客户端释放会话存储
    #[serde(default = "default_restart_grace_ms")]
    pub restart_grace_ms: u64,
}

fn default_connect_timeout_secs() -> u64 {
    60
}

fn default_stop_join_timeout_secs() -> u64 {
    10
}

fn default_restart_grace_ms() -> u64 {
    1000
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout_secs(),
            stop_join_timeout_secs: default_stop_join_timeout_secs(),
            restart_grace_ms: default_restart_grace_ms(),
        }
    }
}

impl SupervisorConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn stop_join_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_join_timeout_secs)
    }

    pub fn restart_grace(&self) -> Duration {
        Duration::from_millis(self.restart_grace_ms)
    }
}

/// 并发准入配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// MAX_CONCURRENT_DOWNLOADS 未设置或无效时的上限
    #[serde(default = "default_max_concurrent")]
    pub default_max: usize,
    /// 满载时的轮询间隔（毫秒）
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_max_concurrent() -> usize {
    3
}

fn default_poll_interval_ms() -> u64 {
    5000
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            default_max: default_max_concurrent(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl AdmissionConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// 进度消息配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressConfig {
    /// 两次编辑进度消息的最小间隔（毫秒）
    #[serde(default = "default_edit_interval_ms")]
    pub edit_interval_ms: u64,
}

fn default_edit_interval_ms() -> u64 {
    2500
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            edit_interval_ms: default_edit_interval_ms(),
        }
    }
}

impl ProgressConfig {
    pub fn edit_interval(&self) -> Duration {
        Duration::from_millis(self.edit_interval_ms)
    }
}

/// 平台桥接配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformConfig {
    /// 协议边车地址
    #[serde(default = "default_bridge_url")]
    pub bridge_url: String,
    /// 会话文件目录
    #[serde(default = "default_session_dir")]
    pub session_dir: PathBuf,
    /// 普通请求超时（秒）
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// 更新长轮询超时（秒）
    #[serde(default = "default_poll_timeout_secs")]
    pub poll_timeout_secs: u64,
}

fn default_bridge_url() -> String {
    "http://127.0.0.1:18890".to_string()
}

fn default_session_dir() -> PathBuf {
    PathBuf::from("sessions")
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_poll_timeout_secs() -> u64 {
    25
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            bridge_url: default_bridge_url(),
            session_dir: default_session_dir(),
            request_timeout_secs: default_request_timeout_secs(),
            poll_timeout_secs: default_poll_timeout_secs(),
        }
    }
}

impl AppConfig {
    /// 从文件加载配置
    pub async fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;

        let config: AppConfig = toml::from_str(&content).context("Failed to parse config file")?;

        if config.download.chunk_size == 0 {
            anyhow::bail!("配置错误：download.chunk_size 必须大于 0");
        }

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: &str) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        // 确保父目录存在
        if let Some(parent) = std::path::Path::new(path).parent() {
            fs::create_dir_all(parent)
                .await
                .context("Failed to create config directory")?;
        }

        fs::write(path, content)
            .await
            .context("Failed to write config file")?;

        tracing::info!("✓ 配置已保存: {}", path);
        Ok(())
    }

    /// 加载或创建默认配置
    pub async fn load_or_default(path: &str) -> Self {
        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {}", path);
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {}", e);
                let default_config = Self::default();

                if let Err(e) = default_config.save_to_file(path).await {
                    tracing::error!("保存默认配置失败: {}", e);
                }

                default_config
            }
        }
    }
}
