//! 进程级存储连接
//!
//! 一次性建立命令连接与订阅连接，打包成 `StoreConnection` 交给各组件。

use std::sync::Arc;

use application::{StoreConnection, StoreGateway};
use config::RedisConfig;
use redis::{Client, IntoConnectionInfo};
use tracing::info;

use crate::redis::{RedisError, RedisPubSub, RedisResult, RedisStore};

#[derive(Clone)]
pub struct RedisConnection {
    pub store: Arc<RedisStore>,
    pub pubsub: Arc<RedisPubSub>,
}

impl RedisConnection {
    pub async fn connect(config: &RedisConfig) -> RedisResult<Self> {
        let client = open_client(config)?;
        let store = Arc::new(RedisStore::connect(&client).await?);
        let pubsub = Arc::new(RedisPubSub::connect(client, config).await?);

        info!(db = ?config.db, "Redis 连接已建立");
        Ok(Self { store, pubsub })
    }

    pub fn connection(&self) -> StoreConnection {
        StoreConnection::new(self.store.clone(), self.pubsub.clone())
    }

    /// 检查命令连接可用
    pub async fn health_check(&self) -> RedisResult<()> {
        self.store
            .ping()
            .await
            .map_err(|e| RedisError::ConnectionError {
                message: e.to_string(),
            })
    }

    /// 关闭订阅连接；命令连接随最后一个引用释放
    pub async fn disconnect(&self) {
        self.pubsub.disconnect().await;
        info!("Redis 连接已关闭");
    }
}

/// 按配置创建客户端，`db` 覆盖 URL 中的数据库编号
pub fn open_client(config: &RedisConfig) -> RedisResult<Client> {
    let mut info = config
        .url
        .as_str()
        .into_connection_info()
        .map_err(|e| RedisError::ConfigError {
            message: format!("无效的 Redis URL: {}", e),
        })?;
    if let Some(db) = config.db {
        info.redis.db = db;
    }

    Client::open(info).map_err(|e| RedisError::ConfigError {
        message: format!("创建 Redis 客户端失败: {}", e),
    })
}
