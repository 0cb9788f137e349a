// Telegram 频道媒体下载器核心库
// 每个账号独立监听频道、排队下载视频，所有账号共享一个任务数据库

// 配置管理模块
pub mod config;

// 日志模块
pub mod logging;

// 持久化模块
pub mod persistence;

// 平台客户端抽象
pub mod platform;

// 下载流水线（解析、准入、进度、监听、恢复、下载）
pub mod downloader;

// 推送通知
pub mod notifier;

// 账号生命周期监管
pub mod supervisor;

// 已完成文件的保留策略
pub mod retention;

// Web服务器模块
pub mod server;

// 导出常用类型
pub use config::AppConfig;
pub use downloader::{DownloadWorker, MessageRef, ProgressTracker};
pub use notifier::{Notifier, StoreNotifier};
pub use persistence::{Account, Channel, Task, TaskStatus, TaskStore};
pub use platform::{BridgeClientFactory, PlatformClient, PlatformClientFactory, PlatformError};
pub use server::AppState;
pub use supervisor::{SupervisorManager, SupervisorState};
