//! 在线状态资源
//!
//! 中介任务把三路输入接到状态机上：
//! - 事件桥的输入 → `PresenceManager::apply`
//! - 宽限期超时 → `PresenceManager::handle_timeout`
//! - 状态机通知 → 广播给本实例订阅者

use std::sync::{Arc, Mutex};

use config::PresenceConfig;
use domain::{
    ClientId, PresenceStatus, RequestOptions, RetentionPolicy, ScopeMembership, ScopeName,
    ServerMessage, ServerOp, UserData, UserId, UserType,
};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::bridge::{LocalClients, PresenceBridge, RecordWatermarks};
use super::manager::{PresenceChannels, PresenceManager, PresenceSettings};
use super::PresenceInput;
use crate::clock::Clock;
use crate::error::ApplicationError;
use crate::resource::{ClientHandle, Resource, Subscribers};
use crate::store::{PubSubGateway, StoreConnection};

pub struct PresenceResource {
    scope: ScopeName,
    manager: Arc<PresenceManager>,
    local: Arc<LocalClients>,
    subscribers: Arc<Subscribers>,
    pubsub: Arc<dyn PubSubGateway>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PresenceResource {
    /// 创建资源：挂接事件桥、启动中介任务并执行一次全量读取
    pub async fn open(
        scope: ScopeName,
        connection: &StoreConnection,
        clock: Arc<dyn Clock>,
        config: &PresenceConfig,
        policy: &RetentionPolicy,
    ) -> Result<Arc<Self>, ApplicationError> {
        let relay_staleness_ms = config.relay_staleness_ms as i64;
        let watermarks = Arc::new(RecordWatermarks::new(relay_staleness_ms));
        let local = Arc::new(LocalClients::new());

        let (manager, channels) = PresenceManager::new(
            scope.clone(),
            connection.commands.clone(),
            clock.clone(),
            PresenceSettings::from_config(config, policy),
            watermarks.clone(),
        );
        let manager = Arc::new(manager);
        let subscribers = Arc::new(Subscribers::new());

        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let bridge = PresenceBridge::new(scope.clone(), clock, relay_staleness_ms, local.clone(), watermarks);
        let bridge_task = bridge.attach(&*connection.pubsub, input_tx).await?;
        let mediator_task = tokio::spawn(mediate(
            scope.clone(),
            manager.clone(),
            subscribers.clone(),
            input_rx,
            channels,
        ));

        manager.full_read().await;
        tracing::info!(scope = %scope, "Presence resource opened");

        Ok(Arc::new(Self {
            scope,
            manager,
            local,
            subscribers,
            pubsub: connection.pubsub.clone(),
            tasks: Mutex::new(vec![bridge_task, mediator_task]),
        }))
    }

    pub fn manager(&self) -> &PresenceManager {
        &self.manager
    }

    /// 处理 set 请求
    pub async fn set_status(
        &self,
        client: &ClientHandle,
        user_id: UserId,
        user_type: UserType,
        status: PresenceStatus,
        user_data: UserData,
        ack: Option<&Value>,
    ) -> Result<(), ApplicationError> {
        match status {
            PresenceStatus::Online => {
                // 订阅以便在连接关闭时收到 unsubscribe
                self.subscribers.add(client.clone());
                self.local
                    .register(client.id(), &user_id, user_type.clone(), user_data.clone());
                self.manager
                    .online(&user_id, client.id(), user_type, user_data)
                    .await?;
            }
            PresenceStatus::Offline => {
                self.local.forget_user(client.id(), &user_id);
                self.manager
                    .offline(&user_id, client.id(), user_type, user_data, true)
                    .await?;
            }
        }
        client.ack(&self.scope, ack);
        Ok(())
    }

    /// 全量读取后回复当前成员表
    pub async fn get(&self, client: &ClientHandle, options: RequestOptions, ack: Option<&Value>) -> Result<(), ApplicationError> {
        let users = self.manager.full_read().await;
        client.send(ServerMessage::new(ServerOp::Get, self.scope.as_str(), view(&users, options)?));
        client.ack(&self.scope, ack);
        Ok(())
    }

    /// 全量读取后回复当前成员表，并订阅后续变化
    pub async fn sync(&self, client: &ClientHandle, options: RequestOptions, ack: Option<&Value>) -> Result<(), ApplicationError> {
        let users = self.manager.full_read().await;
        let op = if options.version >= 2 {
            ServerOp::Get
        } else {
            ServerOp::Online
        };
        client.send(ServerMessage::new(op, self.scope.as_str(), view(&users, options)?));
        self.subscribers.add(client.clone());
        client.ack(&self.scope, ack);
        Ok(())
    }

    /// 客户端离开：取消订阅，并对它设置为在线的每个用户执行隐式软下线
    pub async fn leave(&self, client_id: &ClientId) -> Result<bool, ApplicationError> {
        let was_subscribed = self.subscribers.remove(client_id);
        for (user_id, user_type, user_data) in self.local.remove_client(client_id) {
            self.manager
                .offline(&user_id, client_id, user_type, user_data, false)
                .await?;
        }
        Ok(was_subscribed)
    }

    pub async fn unsubscribe_client(&self, client: &ClientHandle, ack: Option<&Value>) -> Result<(), ApplicationError> {
        self.leave(client.id()).await?;
        client.ack(&self.scope, ack);
        Ok(())
    }

    /// 停止后台任务并取消频道订阅
    pub async fn close(&self) {
        self.abort_tasks();
        self.manager.shutdown();
        if let Err(e) = self.pubsub.unsubscribe(self.scope.as_str()).await {
            tracing::warn!(scope = %self.scope, error = %e, "Failed to unsubscribe presence channel");
        }
        tracing::info!(scope = %self.scope, "Presence resource closed");
    }

    fn abort_tasks(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

fn view(users: &ScopeMembership, options: RequestOptions) -> Result<Value, ApplicationError> {
    let value = if options.version >= 2 {
        serde_json::to_value(users.to_v2())?
    } else {
        serde_json::to_value(users.to_v1())?
    };
    Ok(value)
}

async fn mediate(
    scope: ScopeName,
    manager: Arc<PresenceManager>,
    subscribers: Arc<Subscribers>,
    mut inputs: mpsc::UnboundedReceiver<PresenceInput>,
    channels: PresenceChannels,
) {
    let PresenceChannels {
        mut notifications,
        mut timeouts,
    } = channels;

    loop {
        tokio::select! {
            Some(notification) = notifications.recv() => {
                subscribers.broadcast(&notification.to_message(&scope));
            }
            Some(input) = inputs.recv() => manager.apply(input),
            Some(user_id) = timeouts.recv() => {
                if let Err(e) = manager.handle_timeout(&user_id).await {
                    tracing::error!(scope = %scope, user_id = %user_id, error = %e, "Failed to publish final offline");
                }
            }
            else => break,
        }
    }
}

impl Resource for PresenceResource {
    fn name(&self) -> &ScopeName {
        &self.scope
    }

    fn subscribe(&self, client: ClientHandle) {
        self.subscribers.add(client);
    }

    fn unsubscribe(&self, client_id: &ClientId) -> bool {
        self.subscribers.remove(client_id)
    }

    fn broadcast(&self, message: &ServerMessage) {
        self.subscribers.broadcast(message);
    }

    fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

impl Drop for PresenceResource {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}
