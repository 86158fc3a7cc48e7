//! 作用域在线状态机
//!
//! 每个 (scope, userId) 的状态：
//! - Offline：没有条目
//! - Online：至少一个客户端
//! - PendingOffline：没有客户端，宽限期定时器已调度
//!
//! 本地状态总是在发出任何存储调用之前同步更新。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use config::PresenceConfig;
use domain::{
    ClientId, Millis, PresenceRecord, RetentionPolicy, ScopeMembership, ScopeName, UserData,
    UserId, UserType,
};
use tokio::sync::mpsc;

use super::bridge::RecordWatermarks;
use super::timeout::PresenceTimeoutManager;
use super::{PresenceInput, PresenceNotification};
use crate::clock::Clock;
use crate::error::ApplicationError;
use crate::store::{read_hash_json, StoreGateway};

/// 状态机参数
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceSettings {
    pub grace_period: Duration,
    pub snapshot_staleness_ms: Millis,
    /// 作用域哈希的过期时间（秒）
    pub max_persistence: Option<u64>,
}

impl PresenceSettings {
    /// 作用域策略中的 `maxPersistence` 优先于配置默认值
    pub fn from_config(config: &PresenceConfig, policy: &RetentionPolicy) -> Self {
        Self {
            grace_period: Duration::from_millis(config.grace_period_ms),
            snapshot_staleness_ms: config.snapshot_staleness_ms as Millis,
            max_persistence: policy.max_persistence.or(config.max_persistence_secs),
        }
    }
}

impl Default for PresenceSettings {
    fn default() -> Self {
        Self::from_config(&PresenceConfig::default(), &RetentionPolicy::default())
    }
}

/// 状态机的输出通道
pub struct PresenceChannels {
    pub notifications: mpsc::UnboundedReceiver<PresenceNotification>,
    pub timeouts: mpsc::UnboundedReceiver<UserId>,
}

/// 软下线后最后离开的客户端，宽限期结束时据此发布最终下线记录
#[derive(Debug, Clone)]
struct Departed {
    client_id: ClientId,
    user_type: UserType,
    user_data: UserData,
}

#[derive(Debug, Default)]
struct ScopeState {
    membership: ScopeMembership,
    departed: HashMap<UserId, Departed>,
}

pub struct PresenceManager {
    scope: ScopeName,
    store: Arc<dyn StoreGateway>,
    clock: Arc<dyn Clock>,
    settings: PresenceSettings,
    state: Mutex<ScopeState>,
    timeouts: PresenceTimeoutManager,
    notifications: mpsc::UnboundedSender<PresenceNotification>,
    watermarks: Arc<RecordWatermarks>,
}

impl PresenceManager {
    pub fn new(
        scope: ScopeName,
        store: Arc<dyn StoreGateway>,
        clock: Arc<dyn Clock>,
        settings: PresenceSettings,
        watermarks: Arc<RecordWatermarks>,
    ) -> (Self, PresenceChannels) {
        let (notifications, notification_rx) = mpsc::unbounded_channel();
        let (timeouts, timeout_rx) = PresenceTimeoutManager::new();

        let manager = Self {
            scope,
            store,
            clock,
            settings,
            state: Mutex::new(ScopeState::default()),
            timeouts,
            notifications,
            watermarks,
        };

        (
            manager,
            PresenceChannels {
                notifications: notification_rx,
                timeouts: timeout_rx,
            },
        )
    }

    pub fn scope(&self) -> &ScopeName {
        &self.scope
    }

    fn state(&self) -> MutexGuard<'_, ScopeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, notification: PresenceNotification) {
        if self.notifications.send(notification).is_err() {
            tracing::debug!(scope = %self.scope, "Presence notification receiver closed");
        }
    }

    /// 本地客户端上线：写入记录、刷新过期时间，并在首次注册时发布
    pub async fn online(
        &self,
        user_id: &UserId,
        client_id: &ClientId,
        user_type: UserType,
        user_data: UserData,
    ) -> Result<(), ApplicationError> {
        tracing::debug!(scope = %self.scope, user_id = %user_id, client_id = %client_id, "online");

        let now = self.clock.now_millis();
        let field = PresenceRecord::field_key_for(user_id, client_id);
        let record = PresenceRecord::online(
            user_id.clone(),
            client_id.clone(),
            user_type.clone(),
            user_data.clone(),
            self.watermarks.next_at(&field, now),
        );

        let already_registered = {
            let mut state = self.state();
            let already = state.membership.exists(user_id, client_id);
            self.apply_client_online(&mut state, user_id, client_id, user_type, user_data, now);
            already
        };

        let payload = serde_json::to_string(&record)?;
        let scope = self.scope.as_str();
        self.store.hash_set(scope, &field, &payload).await?;
        if let Some(seconds) = self.settings.max_persistence {
            self.store.expire(scope, seconds).await?;
        }
        if !already_registered {
            self.store.publish(scope, &payload).await?;
        }
        Ok(())
    }

    /// 本地客户端下线：删除记录并无条件发布下线记录
    pub async fn offline(
        &self,
        user_id: &UserId,
        client_id: &ClientId,
        user_type: UserType,
        user_data: UserData,
        hard: bool,
    ) -> Result<(), ApplicationError> {
        tracing::debug!(
            scope = %self.scope,
            user_id = %user_id,
            client_id = %client_id,
            hard,
            "offline"
        );

        let now = self.clock.now_millis();
        let field = PresenceRecord::field_key_for(user_id, client_id);
        let record = PresenceRecord::offline(
            user_id.clone(),
            client_id.clone(),
            user_type.clone(),
            user_data.clone(),
            hard,
            self.watermarks.next_at(&field, now),
        );

        {
            let mut state = self.state();
            self.apply_client_offline(&mut state, user_id, client_id, user_type, user_data, hard, now);
        }

        let payload = serde_json::to_string(&record)?;
        let scope = self.scope.as_str();
        self.store.hash_delete(scope, &field).await?;
        self.store.publish(scope, &payload).await?;
        Ok(())
    }

    /// 处理来自事件桥的输入
    pub fn apply(&self, input: PresenceInput) {
        let now = self.clock.now_millis();
        let mut state = self.state();
        match input {
            PresenceInput::ClientOnline {
                user_id,
                client_id,
                user_type,
                user_data,
            } => self.apply_client_online(&mut state, &user_id, &client_id, user_type, user_data, now),
            PresenceInput::ClientOffline {
                user_id,
                client_id,
                user_type,
                user_data,
                hard,
            } => self.apply_client_offline(
                &mut state, &user_id, &client_id, user_type, user_data, hard, now,
            ),
        }
    }

    fn apply_client_online(
        &self,
        state: &mut ScopeState,
        user_id: &UserId,
        client_id: &ClientId,
        user_type: UserType,
        user_data: UserData,
        now: Millis,
    ) {
        let membership = &mut state.membership;
        if !membership.exists(user_id, client_id) {
            if membership.user_exists(user_id) {
                if !membership.is_user_connected(user_id) && self.timeouts.cancel(user_id) {
                    tracing::info!(scope = %self.scope, user_id = %user_id, "Cancelled scheduled offline");
                }
            } else {
                self.timeouts.cancel(user_id);
                self.emit(PresenceNotification::UserOnline {
                    user_id: user_id.clone(),
                    user_type: user_type.clone(),
                });
            }
            self.emit(PresenceNotification::ClientOnline {
                user_id: user_id.clone(),
                client_id: client_id.clone(),
                user_type: user_type.clone(),
                user_data: user_data.clone(),
            });
        }

        state.departed.remove(user_id);
        membership.add(user_id, client_id, user_type, user_data, now);
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_client_offline(
        &self,
        state: &mut ScopeState,
        user_id: &UserId,
        client_id: &ClientId,
        user_type: UserType,
        user_data: UserData,
        hard: bool,
        now: Millis,
    ) {
        let membership = &mut state.membership;
        let removed = membership.remove(user_id, client_id, now);
        if removed {
            self.emit(PresenceNotification::ClientOffline {
                user_id: user_id.clone(),
                client_id: client_id.clone(),
                user_type: user_type.clone(),
                user_data: user_data.clone(),
                explicit: hard,
            });
        }

        if !membership.user_exists(user_id) || membership.is_user_connected(user_id) {
            return;
        }

        if hard {
            self.timeouts.cancel(user_id);
            state.departed.remove(user_id);
            let user_type = membership
                .remove_user(user_id)
                .map(|entry| entry.user_type)
                .unwrap_or(user_type);
            self.emit(PresenceNotification::UserOffline {
                user_id: user_id.clone(),
                user_type,
            });
        } else if removed {
            tracing::info!(scope = %self.scope, user_id = %user_id, "Scheduled offline");
            state.departed.insert(
                user_id.clone(),
                Departed {
                    client_id: client_id.clone(),
                    user_type,
                    user_data,
                },
            );
            self.timeouts.schedule(user_id.clone(), self.settings.grace_period);
        }
    }

    /// 宽限期结束：用户仍未重连则最终下线，并发布硬下线记录通知其他实例
    pub async fn handle_timeout(&self, user_id: &UserId) -> Result<(), ApplicationError> {
        let finalized = {
            let mut state = self.state();
            if state.membership.is_user_connected(user_id) {
                tracing::debug!(scope = %self.scope, user_id = %user_id, "User reconnected during grace period");
                return Ok(());
            }
            let departed = state.departed.remove(user_id);
            match state.membership.remove_user(user_id) {
                Some(entry) => {
                    self.emit(PresenceNotification::UserOffline {
                        user_id: user_id.clone(),
                        user_type: entry.user_type,
                    });
                    departed
                }
                None => None,
            }
        };

        let Some(departed) = finalized else {
            return Ok(());
        };

        let field = PresenceRecord::field_key_for(user_id, &departed.client_id);
        let record = PresenceRecord::offline(
            user_id.clone(),
            departed.client_id,
            departed.user_type,
            departed.user_data,
            true,
            self.watermarks.next_at(&field, self.clock.now_millis()),
        );
        self.store
            .publish(self.scope.as_str(), &serde_json::to_string(&record)?)
            .await?;
        Ok(())
    }

    /// 从存储全量重建成员表。
    ///
    /// 读取失败时记录日志并返回当前快照；成功时丢弃过期记录，
    /// 并保留读取开始之后本地更新过的条目以及仍处于宽限期的条目。
    pub async fn full_read(&self) -> ScopeMembership {
        let started = self.clock.now_millis();
        let records = match read_hash_json::<PresenceRecord>(&*self.store, self.scope.as_str()).await {
            Ok(records) => records,
            Err(e) => {
                tracing::error!(scope = %self.scope, error = %e, "Presence full read failed");
                return self.users();
            }
        };

        let threshold_now = self.clock.now_millis();
        let mut rebuilt = ScopeMembership::new();
        for (_, record) in records {
            if record.online && !record.is_stale(threshold_now, self.settings.snapshot_staleness_ms) {
                rebuilt.add(
                    &record.user_id,
                    &record.client_id,
                    record.user_type,
                    record.user_data,
                    started,
                );
            }
        }

        let mut state = self.state();
        let previous = std::mem::replace(&mut state.membership, rebuilt);
        for (user_id, entry) in previous.iter() {
            let touched = entry.last_touch > started;
            let pending = !state.membership.user_exists(user_id) && self.timeouts.has(user_id);
            if touched || pending {
                state.membership.restore(user_id.clone(), entry.clone());
            }
        }

        tracing::debug!(scope = %self.scope, users = state.membership.len(), "Presence full read");
        state.membership.clone()
    }

    /// 当前成员表快照
    pub fn users(&self) -> ScopeMembership {
        self.state().membership.clone()
    }

    pub fn has_pending_offline(&self, user_id: &UserId) -> bool {
        self.timeouts.has(user_id)
    }

    pub fn shutdown(&self) {
        self.timeouts.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::memory::MemoryStore;
    use crate::store::{MockStoreGateway, PubSubGateway, StoreError};
    use serde_json::json;

    const NOW: Millis = 10_000_000;

    struct Fixture {
        manager: PresenceManager,
        channels: PresenceChannels,
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(NOW));
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let (manager, channels) = PresenceManager::new(
            ScopeName::parse("presence:/dev/test").unwrap(),
            store.clone(),
            clock.clone(),
            PresenceSettings::default(),
            Arc::new(RecordWatermarks::new(45_000)),
        );
        Fixture {
            manager,
            channels,
            store,
            clock,
        }
    }

    fn drain(channels: &mut PresenceChannels) -> Vec<PresenceNotification> {
        let mut out = Vec::new();
        while let Ok(notification) = channels.notifications.try_recv() {
            out.push(notification);
        }
        out
    }

    fn kinds(notifications: &[PresenceNotification]) -> Vec<&'static str> {
        notifications
            .iter()
            .map(|n| match n {
                PresenceNotification::UserOnline { .. } => "user_online",
                PresenceNotification::UserOffline { .. } => "user_offline",
                PresenceNotification::ClientOnline { .. } => "client_online",
                PresenceNotification::ClientOffline { .. } => "client_offline",
            })
            .collect()
    }

    fn u(id: &str) -> UserId {
        UserId::from(id)
    }

    fn c(id: &str) -> ClientId {
        ClientId::from(id)
    }

    #[tokio::test(start_paused = true)]
    async fn test_online_is_idempotent() {
        let mut f = fixture();
        let mut published = f.store.subscribe("presence:/dev/test").await.unwrap();

        f.manager.online(&u("u1"), &c("c1"), json!(2), json!({})).await.unwrap();
        f.manager.online(&u("u1"), &c("c1"), json!(2), json!({})).await.unwrap();

        assert_eq!(kinds(&drain(&mut f.channels)), vec!["user_online", "client_online"]);
        assert!(published.try_recv().is_ok());
        assert!(published.try_recv().is_err());

        let stored = f.store.read_hash_all("presence:/dev/test").await.unwrap();
        assert_eq!(stored.len(), 1);
        assert!(f.store.ttl("presence:/dev/test").await.unwrap() > 0);
        assert_eq!(f.manager.users().get(&u("u1")).unwrap().clients_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_client_emits_client_online_only() {
        let mut f = fixture();
        f.manager.online(&u("u1"), &c("c1"), json!(2), json!({})).await.unwrap();
        drain(&mut f.channels);

        f.manager.online(&u("u1"), &c("c2"), json!(2), json!({})).await.unwrap();
        assert_eq!(kinds(&drain(&mut f.channels)), vec!["client_online"]);
        assert_eq!(f.manager.users().get(&u("u1")).unwrap().clients_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hard_offline_finalizes_immediately() {
        let mut f = fixture();
        f.manager.online(&u("u1"), &c("c1"), json!(2), json!({})).await.unwrap();
        drain(&mut f.channels);

        f.manager.offline(&u("u1"), &c("c1"), json!(2), json!({}), true).await.unwrap();

        let notifications = drain(&mut f.channels);
        assert_eq!(kinds(&notifications), vec!["client_offline", "user_offline"]);
        assert!(matches!(
            notifications[0],
            PresenceNotification::ClientOffline { explicit: true, .. }
        ));
        assert!(!f.manager.users().user_exists(&u("u1")));
        assert!(!f.manager.has_pending_offline(&u("u1")));
        assert!(f.store.read_hash_all("presence:/dev/test").await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_soft_offline_waits_for_grace_period() {
        let mut f = fixture();
        f.manager.online(&u("u1"), &c("c1"), json!(2), json!({})).await.unwrap();
        drain(&mut f.channels);

        f.manager.offline(&u("u1"), &c("c1"), json!(2), json!({}), false).await.unwrap();
        assert_eq!(kinds(&drain(&mut f.channels)), vec!["client_offline"]);
        assert!(f.manager.has_pending_offline(&u("u1")));
        assert!(f.manager.users().user_exists(&u("u1")));

        tokio::time::sleep(Duration::from_millis(14_999)).await;
        assert!(f.channels.timeouts.try_recv().is_err());

        let fired = f.channels.timeouts.recv().await.unwrap();
        assert_eq!(fired, u("u1"));

        let mut published = f.store.subscribe("presence:/dev/test").await.unwrap();
        f.manager.handle_timeout(&fired).await.unwrap();
        assert_eq!(kinds(&drain(&mut f.channels)), vec!["user_offline"]);
        assert!(!f.manager.users().user_exists(&u("u1")));

        let record: PresenceRecord = serde_json::from_str(&published.try_recv().unwrap()).unwrap();
        assert!(!record.online);
        assert!(record.hard);
        assert_eq!(record.client_id, c("c1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_within_grace_cancels_offline() {
        let mut f = fixture();
        f.manager.online(&u("u1"), &c("c1"), json!(2), json!({})).await.unwrap();
        f.manager.offline(&u("u1"), &c("c1"), json!(2), json!({}), false).await.unwrap();
        drain(&mut f.channels);

        tokio::time::sleep(Duration::from_secs(5)).await;
        f.manager.online(&u("u1"), &c("c2"), json!(2), json!({})).await.unwrap();
        assert_eq!(kinds(&drain(&mut f.channels)), vec!["client_online"]);
        assert!(!f.manager.has_pending_offline(&u("u1")));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(f.channels.timeouts.try_recv().is_err());
        assert!(drain(&mut f.channels).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_after_reconnect_is_noop() {
        let mut f = fixture();
        f.manager.online(&u("u1"), &c("c1"), json!(2), json!({})).await.unwrap();
        drain(&mut f.channels);

        f.manager.handle_timeout(&u("u1")).await.unwrap();
        assert!(drain(&mut f.channels).is_empty());
        assert!(f.manager.users().user_exists(&u("u1")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_offline_for_unknown_user_emits_nothing() {
        let mut f = fixture();
        f.manager.apply(PresenceInput::ClientOffline {
            user_id: u("ghost"),
            client_id: c("c9"),
            user_type: json!(0),
            user_data: json!({}),
            hard: true,
        });
        assert!(drain(&mut f.channels).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_read_drops_stale_records() {
        let f = fixture();
        let fresh = PresenceRecord::online(u("u1"), c("c1"), json!(2), json!({}), NOW - 1000);
        let stale = PresenceRecord::online(u("u2"), c("c2"), json!(2), json!({}), NOW - 50_000);
        let offline = PresenceRecord::offline(u("u3"), c("c3"), json!(2), json!({}), false, NOW);
        for record in [&fresh, &stale, &offline] {
            f.store
                .hash_set("presence:/dev/test", &record.field_key(), &serde_json::to_string(record).unwrap())
                .await
                .unwrap();
        }
        f.store.hash_set("presence:/dev/test", "u4.c4", "{corrupt").await.unwrap();

        let users = f.manager.full_read().await;
        assert!(users.user_exists(&u("u1")));
        assert!(!users.user_exists(&u("u2")));
        assert!(!users.user_exists(&u("u3")));
        assert!(!users.user_exists(&u("u4")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_read_keeps_entries_touched_during_read() {
        let f = fixture();
        // 本地先注册一个用户，再推进时钟，使其触达时间晚于读取开始时间
        f.manager.apply(PresenceInput::ClientOnline {
            user_id: u("u1"),
            client_id: c("c1"),
            user_type: json!(2),
            user_data: json!({}),
        });
        let before = f.manager.full_read().await;
        // 存储中没有 u1，且 u1 的触达时间不晚于读取开始，因此被移除
        assert!(!before.user_exists(&u("u1")));

        f.clock.advance(10);
        f.manager.apply(PresenceInput::ClientOnline {
            user_id: u("u2"),
            client_id: c("c2"),
            user_type: json!(2),
            user_data: json!({}),
        });
        f.clock.set(NOW);
        let after = f.manager.full_read().await;
        assert!(after.user_exists(&u("u2")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_read_keeps_pending_offline_entries() {
        let mut f = fixture();
        f.manager.online(&u("u1"), &c("c1"), json!(2), json!({})).await.unwrap();
        f.manager.offline(&u("u1"), &c("c1"), json!(2), json!({}), false).await.unwrap();
        drain(&mut f.channels);

        let users = f.manager.full_read().await;
        assert!(users.user_exists(&u("u1")));
        assert!(!users.is_user_connected(&u("u1")));

        let fired = f.channels.timeouts.recv().await.unwrap();
        f.manager.handle_timeout(&fired).await.unwrap();
        assert_eq!(kinds(&drain(&mut f.channels)), vec!["user_offline"]);
    }

    #[tokio::test]
    async fn test_full_read_failure_returns_current_snapshot() {
        let mut store = MockStoreGateway::new();
        store
            .expect_read_hash_all()
            .returning(|_| Err(StoreError::connection("refused")));
        let clock = Arc::new(ManualClock::new(NOW));
        let (manager, _channels) = PresenceManager::new(
            ScopeName::parse("presence:/dev/test").unwrap(),
            Arc::new(store),
            clock,
            PresenceSettings::default(),
            Arc::new(RecordWatermarks::new(45_000)),
        );
        manager.apply(PresenceInput::ClientOnline {
            user_id: u("u1"),
            client_id: c("c1"),
            user_type: json!(2),
            user_data: json!({}),
        });

        let users = manager.full_read().await;
        assert!(users.user_exists(&u("u1")));
    }

    #[tokio::test]
    async fn test_store_failure_is_surfaced_to_caller() {
        let mut store = MockStoreGateway::new();
        store
            .expect_hash_set()
            .returning(|_, _, _| Err(StoreError::connection("refused")));
        let (manager, _channels) = PresenceManager::new(
            ScopeName::parse("presence:/dev/test").unwrap(),
            Arc::new(store),
            Arc::new(ManualClock::new(NOW)),
            PresenceSettings::default(),
            Arc::new(RecordWatermarks::new(45_000)),
        );

        let result = manager.online(&u("u1"), &c("c1"), json!(2), json!({})).await;
        assert!(matches!(result, Err(ApplicationError::Store(StoreError::Connection(_)))));
        // 本地状态已在存储调用之前更新
        assert!(manager.users().is_user_connected(&u("u1")));
    }
}
