//! 在线状态宽限期定时器
//!
//! 每个用户至多一个定时器。重复调度会替换（并中止）旧定时器，
//! 取消后不会再触发；定时器触发时先从表中移除自身，再发送超时信号，
//! 因此一次调度至多触发一次。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use domain::UserId;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

struct ArmedTimer {
    generation: u64,
    handle: JoinHandle<()>,
}

type TimerTable = Arc<Mutex<HashMap<UserId, ArmedTimer>>>;

pub struct PresenceTimeoutManager {
    timers: TimerTable,
    fired: mpsc::UnboundedSender<UserId>,
    next_generation: AtomicU64,
}

fn lock(timers: &TimerTable) -> MutexGuard<'_, HashMap<UserId, ArmedTimer>> {
    timers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl PresenceTimeoutManager {
    /// 创建定时器管理器，返回超时信号的接收端
    pub fn new() -> (Self, mpsc::UnboundedReceiver<UserId>) {
        let (fired, receiver) = mpsc::unbounded_channel();
        (
            Self {
                timers: Arc::new(Mutex::new(HashMap::new())),
                fired,
                next_generation: AtomicU64::new(0),
            },
            receiver,
        )
    }

    /// 为用户调度（或重新调度）超时
    pub fn schedule(&self, user_id: UserId, delay: Duration) {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let timers = Arc::clone(&self.timers);
        let fired = self.fired.clone();
        let key = user_id.clone();

        // 持有表锁直到新定时器登记完成，避免零延迟定时器抢先检查
        let mut table = lock(&self.timers);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let still_armed = {
                let mut table = lock(&timers);
                match table.get(&key) {
                    Some(timer) if timer.generation == generation => {
                        table.remove(&key);
                        true
                    }
                    _ => false,
                }
            };
            if still_armed {
                let _ = fired.send(key);
            }
        });

        if let Some(previous) = table.insert(user_id, ArmedTimer { generation, handle }) {
            previous.handle.abort();
        }
    }

    /// 取消定时器，返回是否存在已调度的定时器
    pub fn cancel(&self, user_id: &UserId) -> bool {
        match lock(&self.timers).remove(user_id) {
            Some(timer) => {
                timer.handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn has(&self, user_id: &UserId) -> bool {
        lock(&self.timers).contains_key(user_id)
    }

    /// 当前已调度的定时器数量
    pub fn len(&self) -> usize {
        lock(&self.timers).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn cancel_all(&self) {
        for (_, timer) in lock(&self.timers).drain() {
            timer.handle.abort();
        }
    }
}

impl Drop for PresenceTimeoutManager {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_once() {
        let (manager, mut fired) = PresenceTimeoutManager::new();
        let user = UserId::from("u1");

        manager.schedule(user.clone(), Duration::from_millis(15_000));
        assert!(manager.has(&user));

        tokio::time::sleep(Duration::from_millis(14_999)).await;
        assert!(fired.try_recv().is_err());

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(fired.recv().await.unwrap(), user);
        assert!(!manager.has(&user));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(fired.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reschedule_replaces_existing_timer() {
        let (manager, mut fired) = PresenceTimeoutManager::new();
        let user = UserId::from("u1");

        manager.schedule(user.clone(), Duration::from_millis(1000));
        tokio::time::sleep(Duration::from_millis(500)).await;
        manager.schedule(user.clone(), Duration::from_millis(1000));
        assert_eq!(manager.len(), 1);

        // 第一次调度的到期时间已过，不应触发
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(fired.try_recv().is_err());

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(fired.recv().await.unwrap(), user);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(fired.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_fire() {
        let (manager, mut fired) = PresenceTimeoutManager::new();
        let user = UserId::from("u1");

        assert!(!manager.cancel(&user));
        manager.schedule(user.clone(), Duration::from_millis(1000));
        assert!(manager.cancel(&user));
        assert!(!manager.has(&user));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(fired.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_churn_does_not_leak_timers() {
        let (manager, mut fired) = PresenceTimeoutManager::new();

        for round in 0..100 {
            for user in 0..10 {
                let user = UserId::new(format!("u{}", user));
                manager.schedule(user.clone(), Duration::from_millis(1000));
                if round % 2 == 0 {
                    manager.cancel(&user);
                }
            }
        }
        assert_eq!(manager.len(), 10);

        tokio::time::sleep(Duration::from_secs(2)).await;
        let mut count = 0;
        while fired.try_recv().is_ok() {
            count += 1;
        }
        assert_eq!(count, 10);
        assert!(manager.is_empty());
    }
}
