//! 跨实例事件桥
//!
//! 订阅作用域的发布频道，把其他实例发布的在线记录转换为本地状态机输入。
//! 以下记录会被丢弃：
//! - 无法解析的记录
//! - 超过转发时效窗口的记录
//! - 来自本实例所持有连接的记录（本地事件已直接处理过）
//! - 时间戳不晚于该 (userId, clientId) 已见过记录的迟到回声

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use domain::{ClientId, Millis, PresenceRecord, ScopeName, UserData, UserId, UserType};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::PresenceInput;
use crate::clock::Clock;
use crate::store::{PubSubGateway, StoreResult};

/// 水位表超过该大小时清理过期项
const WATERMARK_PRUNE_THRESHOLD: usize = 1024;

/// 每个 (userId, clientId) 最近一次写入或见过的记录时间戳
#[derive(Debug)]
pub struct RecordWatermarks {
    retention_ms: Millis,
    seen: Mutex<HashMap<String, Millis>>,
}

impl RecordWatermarks {
    pub fn new(retention_ms: Millis) -> Self {
        Self {
            retention_ms,
            seen: Mutex::new(HashMap::new()),
        }
    }

    fn seen(&self) -> MutexGuard<'_, HashMap<String, Millis>> {
        self.seen.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 为本地写入分配时间戳，保证同一字段严格递增
    pub fn next_at(&self, field_key: &str, now: Millis) -> Millis {
        let mut seen = self.seen();
        let at = match seen.get(field_key) {
            Some(&last) if last >= now => last + 1,
            _ => now,
        };
        seen.insert(field_key.to_string(), at);
        self.prune(&mut seen, now);
        at
    }

    /// 记录远端时间戳；不晚于已知水位时返回 false
    pub fn observe(&self, field_key: &str, at: Millis, now: Millis) -> bool {
        let mut seen = self.seen();
        if let Some(&last) = seen.get(field_key) {
            if at <= last {
                return false;
            }
        }
        seen.insert(field_key.to_string(), at);
        self.prune(&mut seen, now);
        true
    }

    fn prune(&self, seen: &mut HashMap<String, Millis>, now: Millis) {
        if seen.len() > WATERMARK_PRUNE_THRESHOLD {
            let horizon = now - self.retention_ms;
            seen.retain(|_, last| *last > horizon);
        }
    }

    pub fn len(&self) -> usize {
        self.seen().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

type LocalUsers = BTreeMap<UserId, (UserType, UserData)>;

/// 本实例持有的连接及其设置为在线的用户
#[derive(Debug, Default)]
pub struct LocalClients {
    clients: Mutex<HashMap<ClientId, LocalUsers>>,
}

impl LocalClients {
    pub fn new() -> Self {
        Self::default()
    }

    fn clients(&self) -> MutexGuard<'_, HashMap<ClientId, LocalUsers>> {
        self.clients
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn register(
        &self,
        client_id: &ClientId,
        user_id: &UserId,
        user_type: UserType,
        user_data: UserData,
    ) {
        self.clients()
            .entry(client_id.clone())
            .or_default()
            .insert(user_id.clone(), (user_type, user_data));
    }

    pub fn forget_user(&self, client_id: &ClientId, user_id: &UserId) -> Option<(UserType, UserData)> {
        let mut clients = self.clients();
        let users = clients.get_mut(client_id)?;
        let removed = users.remove(user_id);
        if users.is_empty() {
            clients.remove(client_id);
        }
        removed
    }

    /// 移除连接，返回它曾设置为在线的所有用户
    pub fn remove_client(&self, client_id: &ClientId) -> Vec<(UserId, UserType, UserData)> {
        self.clients()
            .remove(client_id)
            .map(|users| {
                users
                    .into_iter()
                    .map(|(user_id, (user_type, user_data))| (user_id, user_type, user_data))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn contains(&self, client_id: &ClientId) -> bool {
        self.clients().contains_key(client_id)
    }
}

pub struct PresenceBridge {
    scope: ScopeName,
    clock: Arc<dyn Clock>,
    relay_staleness_ms: Millis,
    local: Arc<LocalClients>,
    watermarks: Arc<RecordWatermarks>,
}

impl PresenceBridge {
    pub fn new(
        scope: ScopeName,
        clock: Arc<dyn Clock>,
        relay_staleness_ms: Millis,
        local: Arc<LocalClients>,
        watermarks: Arc<RecordWatermarks>,
    ) -> Self {
        Self {
            scope,
            clock,
            relay_staleness_ms,
            local,
            watermarks,
        }
    }

    /// 把一条发布的记录转换为状态机输入
    pub fn translate(&self, payload: &str) -> Option<PresenceInput> {
        let record: PresenceRecord = match serde_json::from_str(payload) {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(scope = %self.scope, error = %e, "Dropping unparseable presence record");
                return None;
            }
        };

        let now = self.clock.now_millis();
        if record.is_stale(now, self.relay_staleness_ms) {
            tracing::warn!(
                scope = %self.scope,
                user_id = %record.user_id,
                client_id = %record.client_id,
                at = record.at,
                "Dropping stale presence record"
            );
            return None;
        }

        if self.local.contains(&record.client_id) {
            return None;
        }

        if !self.watermarks.observe(&record.field_key(), record.at, now) {
            tracing::debug!(
                scope = %self.scope,
                user_id = %record.user_id,
                client_id = %record.client_id,
                "Dropping out-of-date presence record"
            );
            return None;
        }

        Some(record.into())
    }

    /// 订阅作用域频道并持续转发，返回转发任务句柄
    pub async fn attach(
        self,
        pubsub: &dyn PubSubGateway,
        inputs: mpsc::UnboundedSender<PresenceInput>,
    ) -> StoreResult<JoinHandle<()>> {
        let mut messages = pubsub.subscribe(self.scope.as_str()).await?;
        tracing::info!(scope = %self.scope, "Presence bridge attached");

        Ok(tokio::spawn(async move {
            while let Some(payload) = messages.recv().await {
                if let Some(input) = self.translate(&payload) {
                    if inputs.send(input).is_err() {
                        break;
                    }
                }
            }
            tracing::debug!(scope = %self.scope, "Presence bridge detached");
        }))
    }
}
