//! Redis 命令连接
//!
//! 基于 `ConnectionManager`，断线后自动重连；所有命令经同一个多路复用连接发送。

use std::collections::HashMap;
use std::sync::Arc;

use application::store::{max_age_cutoff, ORDERED_READ_LIMIT};
use application::{Clock, StoreGateway, StoreResult, SystemClock};
use async_trait::async_trait;
use domain::RetentionPolicy;
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use tracing::{debug, info};

use super::error::{RedisError, RedisResult};

/// 仅当值匹配时删除键
const DELETE_IF_EQUALS: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
end
return 0
"#;

/// Redis 命令网关
#[derive(Clone)]
pub struct RedisStore {
    manager: ConnectionManager,
    clock: Arc<dyn Clock>,
    delete_script: Script,
}

impl RedisStore {
    pub async fn connect(client: &Client) -> RedisResult<Self> {
        let manager = client
            .get_connection_manager()
            .await
            .map_err(|e| RedisError::ConnectionError {
                message: format!("创建连接管理器失败: {}", e),
            })?;
        Ok(Self::new(manager, Arc::new(SystemClock)))
    }

    pub fn new(manager: ConnectionManager, clock: Arc<dyn Clock>) -> Self {
        Self {
            manager,
            clock,
            delete_script: Script::new(DELETE_IF_EQUALS),
        }
    }

    fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }
}

#[async_trait]
impl StoreGateway for RedisStore {
    async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.conn();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(RedisError::from)?;
        Ok(())
    }

    async fn read_hash_all(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        let mut conn = self.conn();
        let values: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(RedisError::from)?;
        Ok(values)
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> StoreResult<()> {
        let mut conn = self.conn();
        let _: () = redis::cmd("HSET")
            .arg(key)
            .arg(field)
            .arg(value)
            .query_async(&mut conn)
            .await
            .map_err(RedisError::from)?;
        Ok(())
    }

    async fn hash_delete(&self, key: &str, field: &str) -> StoreResult<()> {
        let mut conn = self.conn();
        let _: () = redis::cmd("HDEL")
            .arg(key)
            .arg(field)
            .query_async(&mut conn)
            .await
            .map_err(RedisError::from)?;
        Ok(())
    }

    async fn expire(&self, key: &str, seconds: u64) -> StoreResult<()> {
        let mut conn = self.conn();
        let _: () = redis::cmd("EXPIRE")
            .arg(key)
            .arg(seconds)
            .query_async(&mut conn)
            .await
            .map_err(RedisError::from)?;
        Ok(())
    }

    async fn ttl(&self, key: &str) -> StoreResult<i64> {
        let mut conn = self.conn();
        let ttl: i64 = redis::cmd("TTL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(RedisError::from)?;
        Ok(ttl)
    }

    async fn pttl(&self, key: &str) -> StoreResult<Option<u64>> {
        let mut conn = self.conn();
        let pttl: i64 = redis::cmd("PTTL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(RedisError::from)?;
        // -2 键不存在，-1 没有过期时间
        Ok((pttl >= 0).then_some(pttl as u64))
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let mut conn = self.conn();
        let _: () = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(RedisError::from)?;
        Ok(())
    }

    async fn keys(&self, pattern: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.conn();
        let keys: Vec<String> = redis::cmd("KEYS")
            .arg(pattern)
            .query_async(&mut conn)
            .await
            .map_err(RedisError::from)?;
        Ok(keys)
    }

    async fn delete_wildcard(&self, pattern: &str) -> StoreResult<usize> {
        let keys = self.keys(pattern).await?;
        if keys.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn();
        let removed: usize = redis::cmd("DEL")
            .arg(&keys)
            .query_async(&mut conn)
            .await
            .map_err(RedisError::from)?;
        info!(pattern = %pattern, removed, "Wildcard delete");
        Ok(removed)
    }

    async fn sorted_add(&self, key: &str, score: i64, member: &str) -> StoreResult<()> {
        let mut conn = self.conn();
        let _: () = redis::cmd("ZADD")
            .arg(key)
            .arg(score)
            .arg(member)
            .query_async(&mut conn)
            .await
            .map_err(RedisError::from)?;
        Ok(())
    }

    async fn read_ordered_with_scores(
        &self,
        key: &str,
        policy: Option<RetentionPolicy>,
    ) -> StoreResult<Vec<(String, i64)>> {
        let mut pipe = redis::pipe();
        pipe.atomic();

        if let Some(policy) = &policy {
            if let Some(max_count) = policy.max_count {
                pipe.cmd("ZREMRANGEBYRANK")
                    .arg(key)
                    .arg(0)
                    .arg(-(max_count as i64) - 1)
                    .ignore();
            }
            if let Some(max_age) = policy.max_age_seconds {
                let max_score = max_age_cutoff(self.clock.now_millis(), max_age);
                pipe.cmd("ZREMRANGEBYSCORE")
                    .arg(key)
                    .arg("-inf")
                    .arg(max_score)
                    .ignore();
            }
        }

        pipe.cmd("ZRANGE")
            .arg(key)
            .arg(-(ORDERED_READ_LIMIT as i64))
            .arg(-1)
            .arg("WITHSCORES");

        let mut conn = self.conn();
        let (members,): (Vec<(String, f64)>,) = pipe
            .query_async(&mut conn)
            .await
            .map_err(RedisError::from)?;
        debug!(key = %key, count = members.len(), "Ordered read");

        Ok(members
            .into_iter()
            .map(|(member, score)| (member, score as i64))
            .collect())
    }

    async fn list_push(&self, key: &str, value: &str) -> StoreResult<u64> {
        let mut conn = self.conn();
        let len: u64 = redis::cmd("RPUSH")
            .arg(key)
            .arg(value)
            .query_async(&mut conn)
            .await
            .map_err(RedisError::from)?;
        Ok(len)
    }

    async fn list_range(&self, key: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.conn();
        let values: Vec<String> = redis::cmd("LRANGE")
            .arg(key)
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await
            .map_err(RedisError::from)?;
        Ok(values)
    }

    async fn list_trim_to_newest(&self, key: &str, keep: u64) -> StoreResult<()> {
        if keep == 0 {
            return self.delete(key).await;
        }
        let mut conn = self.conn();
        let _: () = redis::cmd("LTRIM")
            .arg(key)
            .arg(-(keep as i64))
            .arg(-1)
            .query_async(&mut conn)
            .await
            .map_err(RedisError::from)?;
        Ok(())
    }

    async fn increment(&self, key: &str, by: i64) -> StoreResult<i64> {
        let mut conn = self.conn();
        let value: i64 = redis::cmd("INCRBY")
            .arg(key)
            .arg(by)
            .query_async(&mut conn)
            .await
            .map_err(RedisError::from)?;
        Ok(value)
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl_ms: u64) -> StoreResult<bool> {
        let mut conn = self.conn();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await
            .map_err(RedisError::from)?;
        Ok(reply.is_some())
    }

    async fn delete_if_equals(&self, key: &str, value: &str) -> StoreResult<bool> {
        let mut conn = self.conn();
        let removed: i64 = self
            .delete_script
            .key(key)
            .arg(value)
            .invoke_async(&mut conn)
            .await
            .map_err(RedisError::from)?;
        Ok(removed == 1)
    }

    async fn publish(&self, channel: &str, payload: &str) -> StoreResult<()> {
        let mut conn = self.conn();
        let receivers: i64 = redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async(&mut conn)
            .await
            .map_err(RedisError::from)?;
        debug!(channel = %channel, receivers, "Published");
        Ok(())
    }
}
