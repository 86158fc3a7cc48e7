//! 后端存储网关
//!
//! 所有跨实例协调都经过共享存储完成。网关分为两条相互独立的连接：
//! - 命令连接（`StoreGateway`）：哈希、有序集合、列表、过期、原子自增、发布
//! - 订阅连接（`PubSubGateway`）：按频道订阅消息
//!
//! `StoreConnection` 把两者打包成一个显式构造、显式管理生命周期的句柄，
//! 由进程入口创建并传入各个组件。

pub mod memory;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use domain::RetentionPolicy;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::mpsc;

/// 有序集合读取时最多返回的成员数（从最新开始）
pub const ORDERED_READ_LIMIT: usize = 100;

/// 存储网关错误
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store connection error: {0}")]
    Connection(String),
    #[error("store command failed: {0}")]
    Command(String),
    #[error("store serialization error: {0}")]
    Serialization(String),
    #[error("store connection closed")]
    Closed,
}

impl StoreError {
    pub fn connection(message: impl Into<String>) -> Self {
        StoreError::Connection(message.into())
    }

    pub fn command(message: impl Into<String>) -> Self {
        StoreError::Command(message.into())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// 命令连接
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StoreGateway: Send + Sync {
    async fn ping(&self) -> StoreResult<()>;

    /// 读取整个哈希（字段 → 原始字符串值）
    async fn read_hash_all(&self, key: &str) -> StoreResult<HashMap<String, String>>;

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> StoreResult<()>;

    async fn hash_delete(&self, key: &str, field: &str) -> StoreResult<()>;

    async fn expire(&self, key: &str, seconds: u64) -> StoreResult<()>;

    /// 剩余秒数；键不存在返回 -2，无过期时间返回 -1
    async fn ttl(&self, key: &str) -> StoreResult<i64>;

    /// 剩余毫秒数；键不存在或没有过期时间时返回 `None`
    async fn pttl(&self, key: &str) -> StoreResult<Option<u64>>;

    async fn delete(&self, key: &str) -> StoreResult<()>;

    async fn keys(&self, pattern: &str) -> StoreResult<Vec<String>>;

    /// 删除所有匹配通配符的键，返回删除数量
    async fn delete_wildcard(&self, pattern: &str) -> StoreResult<usize>;

    async fn sorted_add(&self, key: &str, score: i64, member: &str) -> StoreResult<()>;

    /// 先按策略裁剪（`max_count` 按排名、`max_age_seconds` 按分数），
    /// 再返回最新的至多 100 个成员及其分数，按分数升序
    async fn read_ordered_with_scores(
        &self,
        key: &str,
        policy: Option<RetentionPolicy>,
    ) -> StoreResult<Vec<(String, i64)>>;

    /// 追加到列表末尾，返回追加后的长度
    async fn list_push(&self, key: &str, value: &str) -> StoreResult<u64>;

    async fn list_range(&self, key: &str) -> StoreResult<Vec<String>>;

    /// 只保留最新的 `keep` 个元素
    async fn list_trim_to_newest(&self, key: &str, keep: u64) -> StoreResult<()>;

    async fn increment(&self, key: &str, by: i64) -> StoreResult<i64>;

    /// 仅当键不存在时写入，并设置毫秒级过期时间
    async fn set_if_absent(&self, key: &str, value: &str, ttl_ms: u64) -> StoreResult<bool>;

    /// 仅当当前值等于 `value` 时删除
    async fn delete_if_equals(&self, key: &str, value: &str) -> StoreResult<bool>;

    async fn publish(&self, channel: &str, payload: &str) -> StoreResult<()>;
}

/// 订阅连接
#[async_trait]
pub trait PubSubGateway: Send + Sync {
    /// 订阅频道，返回该频道后续消息的接收端
    async fn subscribe(&self, channel: &str) -> StoreResult<mpsc::UnboundedReceiver<String>>;

    async fn unsubscribe(&self, channel: &str) -> StoreResult<()>;
}

/// 存储连接句柄
#[derive(Clone)]
pub struct StoreConnection {
    pub commands: Arc<dyn StoreGateway>,
    pub pubsub: Arc<dyn PubSubGateway>,
}

impl StoreConnection {
    pub fn new(commands: Arc<dyn StoreGateway>, pubsub: Arc<dyn PubSubGateway>) -> Self {
        Self { commands, pubsub }
    }
}

/// 读取哈希并逐字段反序列化。
///
/// 无法解析的字段单独丢弃并记录日志，不影响其他字段。
pub async fn read_hash_json<T: DeserializeOwned>(
    store: &dyn StoreGateway,
    key: &str,
) -> StoreResult<Vec<(String, T)>> {
    let raw = store.read_hash_all(key).await?;
    let mut decoded = Vec::with_capacity(raw.len());

    for (field, value) in raw {
        match serde_json::from_str::<T>(&value) {
            Ok(parsed) => decoded.push((field, parsed)),
            Err(e) => {
                tracing::error!(
                    key = %key,
                    field = %field,
                    error = %e,
                    "Corrupted value in store, field dropped"
                );
            }
        }
    }

    Ok(decoded)
}

/// 按 `max_age_seconds` 裁剪时的分数上限，不超过该值的成员被删除
pub fn max_age_cutoff(now_ms: i64, max_age_seconds: u64) -> i64 {
    let max_age_ms = i64::try_from(max_age_seconds)
        .unwrap_or(i64::MAX)
        .saturating_mul(1000);
    now_ms.saturating_sub(max_age_ms)
}

/// 简单的通配符匹配，支持 `*` 与 `?`
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();

    let (mut p, mut t) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some((p, t));
            p += 1;
        } else if let Some((star_p, star_t)) = star {
            p = star_p + 1;
            t = star_t + 1;
            star = Some((star_p, star_t + 1));
        } else {
            return false;
        }
    }

    while p < pattern.len() && pattern[p] == '*' {
        p += 1;
    }

    p == pattern.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    #[test]
    fn test_glob_match() {
        assert!(glob_match("presence:/*", "presence:/dev/test"));
        assert!(glob_match("stream_counter:/?", "stream_counter:/a"));
        assert!(!glob_match("stream_counter:/?", "stream_counter:/ab"));
        assert!(glob_match("*", ""));
        assert!(!glob_match("presence:/*", "stream:/dev"));
        assert!(glob_match("a*b*c", "axxbyyc"));
    }

    #[test]
    fn test_max_age_cutoff_saturates() {
        assert_eq!(max_age_cutoff(100_000, 5), 95_000);
        assert_eq!(max_age_cutoff(100_000, u64::MAX), 100_000 - i64::MAX);
        assert_eq!(max_age_cutoff(100_000, i64::MAX as u64 / 10), 100_000 - i64::MAX);
    }

    #[tokio::test]
    async fn test_corrupted_field_is_dropped_individually() {
        let store = MemoryStore::new();
        store.hash_set("scope", "u1.c1", r#"{"n": 1}"#).await.unwrap();
        store.hash_set("scope", "u2.c2", "{not json").await.unwrap();
        store.hash_set("scope", "u3.c3", r#"{"n": 3}"#).await.unwrap();

        let mut decoded: Vec<(String, serde_json::Value)> =
            read_hash_json(&store, "scope").await.unwrap();
        decoded.sort_by(|a, b| a.0.cmp(&b.0));

        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].0, "u1.c1");
        assert_eq!(decoded[1].0, "u3.c3");
    }
}
