//! Redis 错误类型定义

use application::StoreError;
use thiserror::Error;

/// Redis 操作错误
#[derive(Error, Debug)]
pub enum RedisError {
    /// 连接错误
    #[error("Redis 连接错误: {message}")]
    ConnectionError { message: String },

    /// 命令执行错误
    #[error("Redis 命令错误: {message}")]
    CommandError { message: String },

    /// 订阅错误
    #[error("Redis 订阅错误: {message}")]
    SubscribeError { message: String },

    /// 序列化错误
    #[error("序列化错误: {message}")]
    SerializationError { message: String },

    /// 配置错误
    #[error("配置错误: {message}")]
    ConfigError { message: String },

    /// 重连错误
    #[error("重连失败: {message}")]
    ReconnectError { message: String },

    /// 连接已关闭
    #[error("Redis 连接已关闭")]
    Closed,
}

/// Redis 结果类型
pub type RedisResult<T> = Result<T, RedisError>;

impl From<redis::RedisError> for RedisError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
            return RedisError::ConnectionError {
                message: err.to_string(),
            };
        }
        match err.kind() {
            redis::ErrorKind::InvalidClientConfig => RedisError::ConfigError {
                message: err.to_string(),
            },
            redis::ErrorKind::TypeError => RedisError::SerializationError {
                message: err.to_string(),
            },
            _ => RedisError::CommandError {
                message: err.to_string(),
            },
        }
    }
}

impl From<serde_json::Error> for RedisError {
    fn from(err: serde_json::Error) -> Self {
        RedisError::SerializationError {
            message: err.to_string(),
        }
    }
}

impl From<RedisError> for StoreError {
    fn from(err: RedisError) -> Self {
        match err {
            RedisError::ConnectionError { .. }
            | RedisError::ReconnectError { .. }
            | RedisError::ConfigError { .. } => StoreError::Connection(err.to_string()),
            RedisError::SerializationError { message } => StoreError::Serialization(message),
            RedisError::Closed => StoreError::Closed,
            RedisError::CommandError { .. } | RedisError::SubscribeError { .. } => {
                StoreError::Command(err.to_string())
            }
        }
    }
}
