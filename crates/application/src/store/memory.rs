//! 内存实现的存储网关（用于测试与单进程运行）
//!
//! 同一个 `MemoryStore` 可被多个组件共享，从而在一个进程内模拟多个服务实例
//! 共用同一个后端存储。发布的消息会投递给所有订阅者，包括发布者自己。

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use domain::RetentionPolicy;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::{
    glob_match, max_age_cutoff, PubSubGateway, StoreConnection, StoreError, StoreGateway, StoreResult,
    ORDERED_READ_LIMIT,
};
use crate::clock::{Clock, SystemClock};

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Hash(HashMap<String, String>),
    List(VecDeque<String>),
    Sorted(Vec<(i64, String)>),
}

#[derive(Debug, Clone)]
struct Slot {
    value: Value,
    expires_at: Option<Instant>,
}

#[derive(Default)]
struct MemoryState {
    slots: HashMap<String, Slot>,
}

impl MemoryState {
    /// 读取前先清理已过期的键
    fn live(&mut self, key: &str) -> Option<&mut Slot> {
        let expired = self
            .slots
            .get(key)
            .and_then(|slot| slot.expires_at)
            .map(|deadline| deadline <= Instant::now())
            .unwrap_or(false);
        if expired {
            self.slots.remove(key);
        }
        self.slots.get_mut(key)
    }

    fn purge_expired(&mut self) {
        let now = Instant::now();
        self.slots
            .retain(|_, slot| slot.expires_at.map(|deadline| deadline > now).unwrap_or(true));
    }

    fn hash_mut(&mut self, key: &str) -> StoreResult<&mut HashMap<String, String>> {
        if self.live(key).is_none() {
            self.slots.insert(
                key.to_string(),
                Slot {
                    value: Value::Hash(HashMap::new()),
                    expires_at: None,
                },
            );
        }
        match self.slots.get_mut(key).map(|slot| &mut slot.value) {
            Some(Value::Hash(hash)) => Ok(hash),
            _ => Err(wrong_type(key)),
        }
    }

    fn list_mut(&mut self, key: &str) -> StoreResult<&mut VecDeque<String>> {
        if self.live(key).is_none() {
            self.slots.insert(
                key.to_string(),
                Slot {
                    value: Value::List(VecDeque::new()),
                    expires_at: None,
                },
            );
        }
        match self.slots.get_mut(key).map(|slot| &mut slot.value) {
            Some(Value::List(list)) => Ok(list),
            _ => Err(wrong_type(key)),
        }
    }

    fn sorted_mut(&mut self, key: &str) -> StoreResult<&mut Vec<(i64, String)>> {
        if self.live(key).is_none() {
            self.slots.insert(
                key.to_string(),
                Slot {
                    value: Value::Sorted(Vec::new()),
                    expires_at: None,
                },
            );
        }
        match self.slots.get_mut(key).map(|slot| &mut slot.value) {
            Some(Value::Sorted(set)) => Ok(set),
            _ => Err(wrong_type(key)),
        }
    }

    /// 集合类型被清空后删除键，与 Redis 行为一致
    fn drop_if_empty(&mut self, key: &str) {
        let empty = match self.slots.get(key).map(|slot| &slot.value) {
            Some(Value::Hash(hash)) => hash.is_empty(),
            Some(Value::List(list)) => list.is_empty(),
            Some(Value::Sorted(set)) => set.is_empty(),
            _ => false,
        };
        if empty {
            self.slots.remove(key);
        }
    }
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::command(format!(
        "WRONGTYPE Operation against key {} holding the wrong kind of value",
        key
    ))
}

/// 内存存储
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    channels: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<String>>>>,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// 使用指定时钟（影响按分数裁剪有序集合时的“当前时间”）
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            channels: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// 把同一个内存存储同时作为命令连接和订阅连接
    pub fn connection(self: &Arc<Self>) -> StoreConnection {
        StoreConnection::new(self.clone(), self.clone())
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn channels(&self) -> MutexGuard<'_, HashMap<String, Vec<mpsc::UnboundedSender<String>>>> {
        self.channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 当前频道订阅者数量
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels()
            .get(channel)
            .map(|senders| senders.iter().filter(|s| !s.is_closed()).count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl StoreGateway for MemoryStore {
    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn read_hash_all(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        let mut state = self.state();
        match state.live(key).map(|slot| &slot.value) {
            None => Ok(HashMap::new()),
            Some(Value::Hash(hash)) => Ok(hash.clone()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> StoreResult<()> {
        let mut state = self.state();
        state
            .hash_mut(key)?
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hash_delete(&self, key: &str, field: &str) -> StoreResult<()> {
        let mut state = self.state();
        if state.live(key).is_none() {
            return Ok(());
        }
        state.hash_mut(key)?.remove(field);
        state.drop_if_empty(key);
        Ok(())
    }

    async fn expire(&self, key: &str, seconds: u64) -> StoreResult<()> {
        let mut state = self.state();
        if let Some(slot) = state.live(key) {
            slot.expires_at = Some(Instant::now() + Duration::from_secs(seconds));
        }
        Ok(())
    }

    async fn ttl(&self, key: &str) -> StoreResult<i64> {
        let mut state = self.state();
        Ok(match state.live(key) {
            None => -2,
            Some(Slot {
                expires_at: None, ..
            }) => -1,
            Some(Slot {
                expires_at: Some(deadline),
                ..
            }) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                // 与 Redis 一致，按秒向上取整
                ((remaining.as_millis() + 999) / 1000) as i64
            }
        })
    }

    async fn pttl(&self, key: &str) -> StoreResult<Option<u64>> {
        let mut state = self.state();
        Ok(state
            .live(key)
            .and_then(|slot| slot.expires_at)
            .map(|deadline| deadline.saturating_duration_since(Instant::now()).as_millis() as u64))
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.state().slots.remove(key);
        Ok(())
    }

    async fn keys(&self, pattern: &str) -> StoreResult<Vec<String>> {
        let mut state = self.state();
        state.purge_expired();
        let mut keys: Vec<String> = state
            .slots
            .keys()
            .filter(|key| glob_match(pattern, key))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn delete_wildcard(&self, pattern: &str) -> StoreResult<usize> {
        let keys = self.keys(pattern).await?;
        let mut state = self.state();
        for key in &keys {
            state.slots.remove(key);
        }
        tracing::info!(pattern = %pattern, removed = keys.len(), "deleted keys by pattern");
        Ok(keys.len())
    }

    async fn sorted_add(&self, key: &str, score: i64, member: &str) -> StoreResult<()> {
        let mut state = self.state();
        let set = state.sorted_mut(key)?;
        set.retain(|(_, existing)| existing != member);
        set.push((score, member.to_string()));
        set.sort();
        Ok(())
    }

    async fn read_ordered_with_scores(
        &self,
        key: &str,
        policy: Option<RetentionPolicy>,
    ) -> StoreResult<Vec<(String, i64)>> {
        let now = self.clock.now_millis();
        let mut state = self.state();
        if state.live(key).is_none() {
            return Ok(Vec::new());
        }

        let set = state.sorted_mut(key)?;
        if let Some(policy) = policy {
            if let Some(max_count) = policy.max_count {
                let max_count = max_count as usize;
                if set.len() > max_count {
                    let removed = set.len() - max_count;
                    set.drain(..removed);
                    tracing::info!(key = %key, removed, "enforce max count");
                }
            }
            if let Some(max_age) = policy.max_age_seconds {
                let max_score = max_age_cutoff(now, max_age);
                let before = set.len();
                set.retain(|(score, _)| *score > max_score);
                tracing::info!(key = %key, removed = before - set.len(), "enforce max age");
            }
        }

        let start = set.len().saturating_sub(ORDERED_READ_LIMIT);
        let items = set[start..]
            .iter()
            .map(|(score, member)| (member.clone(), *score))
            .collect();
        state.drop_if_empty(key);
        Ok(items)
    }

    async fn list_push(&self, key: &str, value: &str) -> StoreResult<u64> {
        let mut state = self.state();
        let list = state.list_mut(key)?;
        list.push_back(value.to_string());
        Ok(list.len() as u64)
    }

    async fn list_range(&self, key: &str) -> StoreResult<Vec<String>> {
        let mut state = self.state();
        match state.live(key).map(|slot| &slot.value) {
            None => Ok(Vec::new()),
            Some(Value::List(list)) => Ok(list.iter().cloned().collect()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn list_trim_to_newest(&self, key: &str, keep: u64) -> StoreResult<()> {
        let mut state = self.state();
        if state.live(key).is_none() {
            return Ok(());
        }
        let list = state.list_mut(key)?;
        while list.len() as u64 > keep {
            list.pop_front();
        }
        state.drop_if_empty(key);
        Ok(())
    }

    async fn increment(&self, key: &str, by: i64) -> StoreResult<i64> {
        let mut state = self.state();
        let current = match state.live(key).map(|slot| &slot.value) {
            None => 0,
            Some(Value::Str(raw)) => raw.parse::<i64>().map_err(|_| {
                StoreError::command("ERR value is not an integer or out of range")
            })?,
            Some(_) => return Err(wrong_type(key)),
        };
        let next = current + by;
        let expires_at = state.live(key).and_then(|slot| slot.expires_at);
        state.slots.insert(
            key.to_string(),
            Slot {
                value: Value::Str(next.to_string()),
                expires_at,
            },
        );
        Ok(next)
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl_ms: u64) -> StoreResult<bool> {
        let mut state = self.state();
        if state.live(key).is_some() {
            return Ok(false);
        }
        state.slots.insert(
            key.to_string(),
            Slot {
                value: Value::Str(value.to_string()),
                expires_at: Some(Instant::now() + Duration::from_millis(ttl_ms)),
            },
        );
        Ok(true)
    }

    async fn delete_if_equals(&self, key: &str, value: &str) -> StoreResult<bool> {
        let mut state = self.state();
        let matches = matches!(
            state.live(key).map(|slot| &slot.value),
            Some(Value::Str(current)) if current == value
        );
        if matches {
            state.slots.remove(key);
        }
        Ok(matches)
    }

    async fn publish(&self, channel: &str, payload: &str) -> StoreResult<()> {
        let mut channels = self.channels();
        if let Some(senders) = channels.get_mut(channel) {
            senders.retain(|sender| sender.send(payload.to_string()).is_ok());
        }
        Ok(())
    }
}

#[async_trait]
impl PubSubGateway for MemoryStore {
    async fn subscribe(&self, channel: &str) -> StoreResult<mpsc::UnboundedReceiver<String>> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.channels()
            .entry(channel.to_string())
            .or_default()
            .push(sender);
        Ok(receiver)
    }

    async fn unsubscribe(&self, channel: &str) -> StoreResult<()> {
        self.channels().remove(channel);
        Ok(())
    }
}
