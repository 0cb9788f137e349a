use std::sync::Arc;
use std::time::Duration;

use tg_media_downloader::{
    config::AppConfig,
    downloader::DOWNLOAD_DIR_KEY,
    logging, retention,
    server::{self, AppState},
    supervisor::{SupervisorContext, SupervisorManager},
    BridgeClientFactory, StoreNotifier, TaskStore,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const CONFIG_PATH: &str = "config/app.toml";

/// 首次运行时把配置中的下载目录写入数据库
fn seed_download_dir(store: &TaskStore, config: &AppConfig) -> anyhow::Result<()> {
    if store.get_setting(DOWNLOAD_DIR_KEY)?.is_none() {
        store.set_setting(DOWNLOAD_DIR_KEY, &config.download.download_dir)?;
        info!("已初始化下载目录: {:?}", config.download.download_dir);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load_or_default(CONFIG_PATH).await;

    // 初始化日志系统（必须保持 _log_guard 存活）
    let _log_guard = logging::init_logging(&config.log);

    info!("TG Media Downloader v{} 启动中...", env!("CARGO_PKG_VERSION"));

    let config = Arc::new(config);
    let store = Arc::new(TaskStore::open(&config.database.path)?);
    seed_download_dir(&store, &config)?;

    let factory = Arc::new(BridgeClientFactory::new(config.platform.clone())?);
    let notifier = Arc::new(StoreNotifier::new(store.clone())?);
    let supervisors = Arc::new(SupervisorManager::new(SupervisorContext {
        store: store.clone(),
        factory,
        notifier,
        config: config.clone(),
    }));

    match supervisors.start_all_enabled().await {
        Ok(n) => info!("已启动 {} 个账号", n),
        Err(e) => error!("启动账号失败: {:#}", e),
    }

    let background = CancellationToken::new();
    let retention_task = tokio::spawn(retention::run_retention_loop(
        store.clone(),
        Duration::from_secs(config.download.retention_interval_secs.max(1)),
        background.clone(),
    ));

    let app = server::build_router(AppState::new(
        store.clone(),
        supervisors.clone(),
        config.clone(),
    ));

    let addr = format!("{}:{}", config.server.host, config.server.port);
    info!("服务器启动在: http://{}", addr);
    info!("API 基础路径: http://{}/api/v1", addr);
    info!("健康检查: http://{}/health", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let server = axum::serve(listener, app);

    tokio::select! {
        result = server => {
            if let Err(e) = result {
                error!("服务器错误: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("收到 Ctrl+C，开始优雅关闭...");
        }
    }

    info!("正在停止所有账号...");
    supervisors.stop_all().await;

    background.cancel();
    if let Err(e) = retention_task.await {
        warn!("保留策略任务退出异常: {}", e);
    }

    info!("应用已安全退出");
    Ok(())
}
