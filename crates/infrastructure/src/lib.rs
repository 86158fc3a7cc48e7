//! 基础设施层实现。
//!
//! 基于 Redis 的存储网关：命令连接、带自动重连的订阅连接，以及进程级连接的建立与关闭。

pub mod connection;
pub mod redis;

pub use connection::{open_client, RedisConnection};
pub use self::redis::{RedisError, RedisPubSub, RedisResult, RedisStore};
