//! 基于存储的分布式锁
//!
//! 锁记录是带过期时间的所有者令牌。释放时只删除自己的令牌，并在锁频道上
//! 发布令牌以唤醒其他实例上的等待者；竞争失败时按持有者剩余 TTL
//! 安排本地定时器，使外部锁的被动过期也能产生 `Expired` 事件。

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::store::{StoreConnection, StoreGateway, StoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockEvent {
    Released,
    Expired,
}

pub struct StreamLock {
    key: String,
    token: String,
    ttl: Duration,
    store: Arc<dyn StoreGateway>,
    events: broadcast::Sender<LockEvent>,
    expiry: Mutex<Option<JoinHandle<()>>>,
    listener: JoinHandle<()>,
}

impl StreamLock {
    pub fn key_for(name: &str) -> String {
        format!("stream_lock:/{}", name)
    }

    /// 创建锁并订阅锁频道
    pub async fn open(name: &str, connection: &StoreConnection, ttl: Duration) -> StoreResult<Self> {
        let key = Self::key_for(name);
        let token = Uuid::new_v4().to_string();
        let (events, _) = broadcast::channel(16);

        let mut released = connection.pubsub.subscribe(&key).await?;
        let listener = {
            let events = events.clone();
            let token = token.clone();
            tokio::spawn(async move {
                while let Some(owner) = released.recv().await {
                    if owner != token {
                        let _ = events.send(LockEvent::Released);
                    }
                }
            })
        };

        Ok(Self {
            key,
            token,
            ttl,
            store: connection.commands.clone(),
            events,
            expiry: Mutex::new(None),
            listener,
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn events(&self) -> broadcast::Receiver<LockEvent> {
        self.events.subscribe()
    }

    fn expiry(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.expiry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn arm(&self, delay: Duration) {
        let events = self.events.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(LockEvent::Expired);
        });
        if let Some(previous) = self.expiry().replace(timer) {
            previous.abort();
        }
    }

    fn disarm(&self) {
        if let Some(timer) = self.expiry().take() {
            timer.abort();
        }
    }

    /// 尝试获取锁；锁已被持有时返回 false
    pub async fn acquire(&self) -> StoreResult<bool> {
        let ttl_ms = self.ttl.as_millis() as u64;
        let acquired = self.store.set_if_absent(&self.key, &self.token, ttl_ms).await?;
        if acquired {
            self.arm(self.ttl);
        } else {
            let remaining = self.store.pttl(&self.key).await?;
            tracing::debug!(key = %self.key, remaining_ms = ?remaining, "Lock contended");
            self.arm(remaining.map(Duration::from_millis).unwrap_or(self.ttl));
        }
        Ok(acquired)
    }

    /// 释放锁；仅当锁仍属于自己时删除，返回是否删除
    pub async fn release(&self) -> StoreResult<bool> {
        let deleted = self.store.delete_if_equals(&self.key, &self.token).await?;
        self.disarm();
        if deleted {
            self.store.publish(&self.key, &self.token).await?;
        }
        let _ = self.events.send(LockEvent::Released);
        Ok(deleted)
    }
}

impl Drop for StreamLock {
    fn drop(&mut self) {
        self.listener.abort();
        self.disarm();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    #[tokio::test(start_paused = true)]
    async fn test_lock_is_exclusive_until_released() {
        let store = Arc::new(MemoryStore::new());
        let connection = store.connection();
        let a = StreamLock::open("ticket", &connection, Duration::from_millis(1000)).await.unwrap();
        let b = StreamLock::open("ticket", &connection, Duration::from_millis(1000)).await.unwrap();
        let mut b_events = b.events();

        assert!(a.acquire().await.unwrap());
        assert!(!b.acquire().await.unwrap());

        assert!(a.release().await.unwrap());
        assert_eq!(b_events.recv().await.unwrap(), LockEvent::Released);
        assert!(b.acquire().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_foreign_lock_expiry_emits_expired() {
        let store = Arc::new(MemoryStore::new());
        let connection = store.connection();
        let a = StreamLock::open("ticket", &connection, Duration::from_millis(1000)).await.unwrap();
        let b = StreamLock::open("ticket", &connection, Duration::from_millis(1000)).await.unwrap();
        let mut b_events = b.events();

        assert!(a.acquire().await.unwrap());
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!b.acquire().await.unwrap());

        // a 从不释放；b 在 a 的剩余 TTL 之后被唤醒
        let event = b_events.recv().await.unwrap();
        assert_eq!(event, LockEvent::Expired);
        assert!(b.acquire().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_does_not_delete_foreign_lock() {
        let store = Arc::new(MemoryStore::new());
        let connection = store.connection();
        let a = StreamLock::open("ticket", &connection, Duration::from_millis(1000)).await.unwrap();
        let b = StreamLock::open("ticket", &connection, Duration::from_millis(1000)).await.unwrap();

        assert!(a.acquire().await.unwrap());
        assert!(!b.release().await.unwrap());
        assert!(!b.acquire().await.unwrap());
    }
}
