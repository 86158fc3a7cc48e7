//! 基于分布式锁的串行计数器
//!
//! 每次自增请求按提交顺序排队。本进程同一时间只有一个处理循环：
//! 获得锁后执行自增、回复队首请求、释放锁，若队列非空则继续；
//! 获取失败时不再重试，直到锁的 `Released` / `Expired` 事件将其唤醒。

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;

use super::lock::StreamLock;
use crate::error::ApplicationError;
use crate::store::{StoreConnection, StoreGateway};

type Waiter = oneshot::Sender<Result<i64, ApplicationError>>;

#[derive(Default)]
struct CounterState {
    waiters: VecDeque<Waiter>,
    processing: bool,
    /// 处理过程中收到的唤醒
    rewake: bool,
}

struct CounterInner {
    key: String,
    store: Arc<dyn StoreGateway>,
    lock: StreamLock,
    state: Mutex<CounterState>,
}

pub struct StreamCounter {
    inner: Arc<CounterInner>,
    listener: JoinHandle<()>,
}

impl StreamCounter {
    pub fn key_for(name: &str) -> String {
        format!("stream_counter:/{}", name)
    }

    pub async fn open(
        name: &str,
        connection: &StoreConnection,
        lock_ttl: Duration,
    ) -> Result<Self, ApplicationError> {
        let lock = StreamLock::open(name, connection, lock_ttl).await?;
        let mut events = lock.events();
        let inner = Arc::new(CounterInner {
            key: Self::key_for(name),
            store: connection.commands.clone(),
            lock,
            state: Mutex::new(CounterState::default()),
        });

        let listener = {
            let inner = Arc::clone(&inner);
            tokio::spawn(async move {
                loop {
                    match events.recv().await {
                        Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => inner.wake(),
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            })
        };

        Ok(Self { inner, listener })
    }

    pub fn key(&self) -> &str {
        &self.inner.key
    }

    /// 排队执行一次原子自增，返回自增后的值
    pub async fn increment(&self) -> Result<i64, ApplicationError> {
        let (sender, receiver) = oneshot::channel();
        self.inner.state().waiters.push_back(sender);
        self.inner.wake();
        receiver
            .await
            .map_err(|_| ApplicationError::channel_closed("counter stopped before replying"))?
    }

    /// 排队中的请求数
    pub fn pending(&self) -> usize {
        self.inner.state().waiters.len()
    }
}

impl Drop for StreamCounter {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

impl CounterInner {
    fn state(&self) -> MutexGuard<'_, CounterState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn wake(self: &Arc<Self>) {
        {
            let mut state = self.state();
            if state.waiters.is_empty() {
                return;
            }
            if state.processing {
                state.rewake = true;
                return;
            }
            state.processing = true;
            state.rewake = false;
        }

        let inner = Arc::clone(self);
        tokio::spawn(async move { inner.process().await });
    }

    async fn process(self: Arc<Self>) {
        loop {
            match self.lock.acquire().await {
                Ok(true) => {
                    let result = self
                        .store
                        .increment(&self.key, 1)
                        .await
                        .map_err(ApplicationError::from);
                    if let Some(waiter) = self.state().waiters.pop_front() {
                        let _ = waiter.send(result);
                    }
                    if let Err(e) = self.lock.release().await {
                        // 锁会被动过期，过期事件会唤醒等待者
                        tracing::error!(key = %self.key, error = %e, "Failed to release counter lock");
                    }

                    let mut state = self.state();
                    state.rewake = false;
                    if state.waiters.is_empty() {
                        state.processing = false;
                        return;
                    }
                }
                Ok(false) => {
                    let mut state = self.state();
                    if state.rewake && !state.waiters.is_empty() {
                        state.rewake = false;
                        continue;
                    }
                    state.processing = false;
                    return;
                }
                Err(e) => {
                    tracing::error!(key = %self.key, error = %e, "Failed to acquire counter lock");
                    let mut state = self.state();
                    if let Some(waiter) = state.waiters.pop_front() {
                        let _ = waiter.send(Err(e.into()));
                    }
                    if state.waiters.is_empty() {
                        state.processing = false;
                        return;
                    }
                }
            }
        }
    }
}
