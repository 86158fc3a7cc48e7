//! 统一配置中心
//!
//! 提供进程的全局配置管理，包括：
//! - Redis 连接
//! - 在线状态的宽限期与过期窗口
//! - 事件流默认保留策略
//! - 分布式锁
//!
//! 加载顺序：内置默认值 → 可选 YAML 文件 → `RADAR_` 前缀的环境变量
//! （嵌套字段用 `__` 分隔，例如 `RADAR_REDIS__URL`）。

use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// 环境变量前缀
pub const ENV_PREFIX: &str = "RADAR_";

/// 全局应用配置
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Redis配置
    pub redis: RedisConfig,
    /// 在线状态配置
    pub presence: PresenceConfig,
    /// 事件流配置
    pub stream: StreamConfig,
    /// 分布式锁配置
    pub lock: LockConfig,
}

/// Redis配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,
    /// 可选的数据库编号
    pub db: Option<i64>,
    /// 订阅连接断开后的重连间隔（毫秒），按指数退避放大
    pub reconnect_interval_ms: u64,
    /// 订阅连接最大重连次数
    pub max_reconnect_attempts: u32,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            db: None,
            reconnect_interval_ms: 1000,
            max_reconnect_attempts: 5,
        }
    }
}

/// 在线状态配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    /// 软断开后的宽限期
    pub grace_period_ms: u64,
    /// 全量读取时忽略早于该窗口的记录
    pub snapshot_staleness_ms: u64,
    /// 跨实例转发时忽略早于该窗口的记录
    pub relay_staleness_ms: u64,
    /// 在线作用域键的 TTL（秒）
    pub max_persistence_secs: Option<u64>,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: 15_000,
            snapshot_staleness_ms: 50_000,
            relay_staleness_ms: 45_000,
            max_persistence_secs: Some(12 * 60 * 60),
        }
    }
}

/// 事件流配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// 事件流键的 TTL（秒），默认一周
    pub max_persistence_secs: u64,
    /// 列表最大长度
    pub max_length: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            max_persistence_secs: 7 * 24 * 60 * 60,
            max_length: 100_000,
        }
    }
}

/// 分布式锁配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// 锁记录的过期时间（毫秒）
    pub ttl_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self { ttl_ms: 1000 }
    }
}

impl AppConfig {
    /// 构建配置来源，便于测试时单独检查
    pub fn figment(path: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()));
        if let Some(path) = path {
            figment = figment.merge(Yaml::file(path));
        }
        figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// 加载并验证配置
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config: AppConfig = Self::figment(path)
            .extract()
            .map_err(|e| ConfigError::Load(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// 验证配置有效性
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.redis.url.trim().is_empty() {
            return Err(ConfigError::InvalidRedisConfig(
                "Redis URL cannot be empty".to_string(),
            ));
        }

        if self.presence.grace_period_ms == 0 {
            return Err(ConfigError::InvalidPresenceConfig(
                "grace period must be greater than 0".to_string(),
            ));
        }

        if self.presence.relay_staleness_ms == 0 || self.presence.snapshot_staleness_ms == 0 {
            return Err(ConfigError::InvalidPresenceConfig(
                "staleness windows must be greater than 0".to_string(),
            ));
        }

        // 转发窗口不大于全量读取窗口
        if self.presence.relay_staleness_ms > self.presence.snapshot_staleness_ms {
            return Err(ConfigError::InvalidPresenceConfig(
                "relay staleness window cannot exceed snapshot staleness window".to_string(),
            ));
        }

        if self.stream.max_length == 0 {
            return Err(ConfigError::InvalidStreamConfig(
                "max length must be greater than 0".to_string(),
            ));
        }

        if self.lock.ttl_ms == 0 {
            return Err(ConfigError::InvalidLockConfig(
                "lock ttl must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

/// 配置错误类型
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(String),
    #[error("Invalid redis configuration: {0}")]
    InvalidRedisConfig(String),
    #[error("Invalid presence configuration: {0}")]
    InvalidPresenceConfig(String),
    #[error("Invalid stream configuration: {0}")]
    InvalidStreamConfig(String),
    #[error("Invalid lock configuration: {0}")]
    InvalidLockConfig(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.presence.grace_period_ms, 15_000);
        assert_eq!(config.presence.relay_staleness_ms, 45_000);
        assert_eq!(config.presence.snapshot_staleness_ms, 50_000);
        assert_eq!(config.stream.max_persistence_secs, 604_800);
    }

    #[test]
    fn test_env_overrides_defaults() {
        Jail::expect_with(|jail| {
            jail.set_env("RADAR_REDIS__URL", "redis://prod-redis:6379");
            jail.set_env("RADAR_PRESENCE__GRACE_PERIOD_MS", "5000");

            let config = AppConfig::load(None).expect("config should load");
            assert_eq!(config.redis.url, "redis://prod-redis:6379");
            assert_eq!(config.presence.grace_period_ms, 5000);
            assert_eq!(config.lock.ttl_ms, 1000);
            Ok(())
        });
    }

    #[test]
    fn test_yaml_file_is_merged_before_env() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "radar.yaml",
                r#"
redis:
  url: redis://file-redis:6379
stream:
  max_length: 500
"#,
            )?;
            jail.set_env("RADAR_STREAM__MAX_LENGTH", "250");

            let config = AppConfig::load(Some(Path::new("radar.yaml"))).expect("config should load");
            assert_eq!(config.redis.url, "redis://file-redis:6379");
            assert_eq!(config.stream.max_length, 250);
            Ok(())
        });
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();

        config.redis.url = "".to_string();
        assert!(config.validate().is_err());
        config.redis.url = "redis://127.0.0.1:6379".to_string();

        config.presence.relay_staleness_ms = 60_000;
        let result = config.validate();
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("relay staleness window"));
        config.presence.relay_staleness_ms = 45_000;

        config.lock.ttl_ms = 0;
        assert!(config.validate().is_err());
    }
}
