//! 存储中的事件流列表

use std::sync::Arc;

use domain::{RetentionPolicy, ScopeName, ServerMessage, ServerOp, StreamLogEntry};

use crate::error::ApplicationError;
use crate::store::StoreGateway;

pub struct StreamLog {
    scope: ScopeName,
    store: Arc<dyn StoreGateway>,
    policy: RetentionPolicy,
}

impl StreamLog {
    pub fn new(scope: ScopeName, store: Arc<dyn StoreGateway>, policy: RetentionPolicy) -> Self {
        Self {
            scope,
            store,
            policy,
        }
    }

    /// 追加记录，执行保留策略，然后发布推送消息。
    ///
    /// 返回已发布的消息。
    pub async fn push(&self, entry: &StreamLogEntry) -> Result<ServerMessage, ApplicationError> {
        let key = self.scope.as_str();
        let length = self.store.list_push(key, &serde_json::to_string(entry)?).await?;
        tracing::debug!(scope = %self.scope, length, action = %entry.action, "push");

        if let Some(max_length) = self.policy.max_length {
            if length > max_length {
                self.store.list_trim_to_newest(key, max_length).await?;
                tracing::info!(scope = %self.scope, max_length, "Stream trimmed");
            }
        }

        match self.policy.max_persistence {
            Some(seconds) => self.store.expire(key, seconds).await?,
            None => {
                tracing::warn!(scope = %self.scope, policy = ?self.policy, "Stream created without ttl");
            }
        }

        let message = ServerMessage::new(ServerOp::Push, key, serde_json::to_value(entry)?);
        self.store
            .publish(key, &serde_json::to_string(&message)?)
            .await?;
        Ok(message)
    }

    /// 按追加顺序读取全部记录，跳过损坏的记录
    pub async fn get(&self) -> Result<Vec<StreamLogEntry>, ApplicationError> {
        let raw = self.store.list_range(self.scope.as_str()).await?;
        let entries = raw
            .into_iter()
            .filter_map(|item| match serde_json::from_str::<StreamLogEntry>(&item) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    tracing::warn!(scope = %self.scope, error = %e, "Skipping corrupted stream entry");
                    None
                }
            })
            .collect();
        Ok(entries)
    }
}
