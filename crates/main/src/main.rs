//! 主应用程序入口
//!
//! 加载配置、建立 Redis 连接并创建资源注册表，收到 Ctrl-C 后有序关闭。

use std::path::PathBuf;
use std::{env, sync::Arc};

use application::{Clock, ResourceRegistry, SystemClock};
use config::AppConfig;
use infrastructure::RedisConnection;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // 可选的 YAML 配置文件
    let config_path = env::var("RADAR_CONFIG").ok().map(PathBuf::from);
    let config = AppConfig::load(config_path.as_deref())?;

    let infra = RedisConnection::connect(&config.redis).await?;
    infra.health_check().await?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let registry = ResourceRegistry::new(infra.connection(), clock, config);

    tracing::info!("Radar 服务已启动");
    tokio::signal::ctrl_c().await?;

    tracing::info!("收到退出信号，正在关闭");
    registry.shutdown().await;
    infra.disconnect().await;

    Ok(())
}
