//! 事件流资源
//!
//! sync 先以缓冲模式登记订阅，再读取快照；快照发送后按记录 id 去重地
//! 补发缓冲期间收到的推送，并跳过快照之后才到达的、已包含在快照中的推送，
//! 使返回的快照与后续推送之间既无缺口也无重复。不同实例的推送可能乱序到达，
//! 快照 id 只在匹配时移除，超过在途窗口后整体丢弃。

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use domain::{ClientId, RetentionPolicy, ScopeName, ServerMessage, ServerOp, StreamLogEntry};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use super::log::StreamLog;
use crate::error::ApplicationError;
use crate::resource::{ClientHandle, Resource};
use crate::store::{PubSubGateway, StoreConnection};

/// 快照之前发布的推送在该窗口之后不会再到达
const INFLIGHT_WINDOW: Duration = Duration::from_secs(10);

struct StreamSubscriber {
    handle: ClientHandle,
    /// sync 进行中时缓冲的推送
    pending: Option<Vec<ServerMessage>>,
    /// 已包含在快照中、可能仍在途的推送 id
    skip: HashSet<Uuid>,
    skip_until: Option<Instant>,
}

impl StreamSubscriber {
    fn new(handle: ClientHandle, pending: Option<Vec<ServerMessage>>) -> Self {
        Self {
            handle,
            pending,
            skip: HashSet::new(),
            skip_until: None,
        }
    }

    fn skip_snapshot(&mut self, seen: HashSet<Uuid>) {
        self.skip_until = (!seen.is_empty()).then(|| Instant::now() + INFLIGHT_WINDOW);
        self.skip = seen;
    }

    fn forward(&mut self, message: &ServerMessage) -> bool {
        if let Some(deadline) = self.skip_until {
            if Instant::now() >= deadline {
                self.skip = HashSet::new();
                self.skip_until = None;
            } else if entry_id(message).is_some_and(|id| self.skip.remove(&id)) {
                if self.skip.is_empty() {
                    self.skip_until = None;
                }
                return true;
            }
        }
        self.handle.send(message.clone())
    }
}

#[derive(Default)]
struct StreamSubscribers {
    clients: Mutex<BTreeMap<ClientId, StreamSubscriber>>,
}

impl StreamSubscribers {
    fn clients(&self) -> MutexGuard<'_, BTreeMap<ClientId, StreamSubscriber>> {
        self.clients
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn add(&self, handle: ClientHandle) {
        self.clients()
            .entry(handle.id().clone())
            .and_modify(|subscriber| subscriber.handle = handle.clone())
            .or_insert_with(|| StreamSubscriber::new(handle, None));
    }

    fn begin_sync(&self, handle: ClientHandle) {
        self.clients().insert(
            handle.id().clone(),
            StreamSubscriber::new(handle, Some(Vec::new())),
        );
    }

    fn finish_sync(&self, client_id: &ClientId, snapshot: ServerMessage, seen: HashSet<Uuid>) {
        let mut clients = self.clients();
        let Some(subscriber) = clients.get_mut(client_id) else {
            return;
        };
        subscriber.handle.send(snapshot);
        subscriber.skip_snapshot(seen);
        for message in subscriber.pending.take().unwrap_or_default() {
            subscriber.forward(&message);
        }
    }

    fn remove(&self, client_id: &ClientId) -> bool {
        self.clients().remove(client_id).is_some()
    }

    fn len(&self) -> usize {
        self.clients().len()
    }

    fn deliver(&self, message: &ServerMessage) {
        self.clients().retain(|_, subscriber| match subscriber.pending.as_mut() {
            Some(buffer) => {
                buffer.push(message.clone());
                true
            }
            None => subscriber.forward(message),
        });
    }
}

fn entry_id(message: &ServerMessage) -> Option<Uuid> {
    message
        .value
        .get("id")
        .and_then(Value::as_str)
        .and_then(|id| Uuid::parse_str(id).ok())
}

pub struct StreamResource {
    scope: ScopeName,
    log: StreamLog,
    subscribers: Arc<StreamSubscribers>,
    pubsub: Arc<dyn PubSubGateway>,
    fanout: JoinHandle<()>,
}

impl StreamResource {
    /// 创建资源并订阅作用域频道，把发布的推送分发给本实例订阅者
    pub async fn open(
        scope: ScopeName,
        connection: &StoreConnection,
        policy: RetentionPolicy,
    ) -> Result<Arc<Self>, ApplicationError> {
        let subscribers = Arc::new(StreamSubscribers::default());
        let mut messages = connection.pubsub.subscribe(scope.as_str()).await?;

        let fanout = {
            let subscribers = subscribers.clone();
            let scope = scope.clone();
            tokio::spawn(async move {
                while let Some(payload) = messages.recv().await {
                    match serde_json::from_str::<ServerMessage>(&payload) {
                        Ok(message) => subscribers.deliver(&message),
                        Err(e) => {
                            tracing::warn!(scope = %scope, error = %e, "Dropping unparseable stream message");
                        }
                    }
                }
            })
        };

        tracing::info!(scope = %scope, policy = ?policy, "Stream resource opened");
        Ok(Arc::new(Self {
            log: StreamLog::new(scope.clone(), connection.commands.clone(), policy),
            scope,
            subscribers,
            pubsub: connection.pubsub.clone(),
            fanout,
        }))
    }

    /// 追加记录，发布后回复确认
    pub async fn push(
        &self,
        client: &ClientHandle,
        resource: String,
        action: String,
        value: Value,
        user_data: Value,
        ack: Option<&Value>,
    ) -> Result<(), ApplicationError> {
        let entry = StreamLogEntry::new(resource, action, value, user_data);
        self.log.push(&entry).await?;
        client.ack(&self.scope, ack);
        Ok(())
    }

    pub async fn get(&self, client: &ClientHandle, ack: Option<&Value>) -> Result<(), ApplicationError> {
        let entries = self.log.get().await?;
        client.send(ServerMessage::new(
            ServerOp::Get,
            self.scope.as_str(),
            serde_json::to_value(entries)?,
        ));
        client.ack(&self.scope, ack);
        Ok(())
    }

    /// 回复快照并订阅后续推送
    pub async fn sync(&self, client: &ClientHandle, ack: Option<&Value>) -> Result<(), ApplicationError> {
        self.subscribers.begin_sync(client.clone());
        let entries = match self.log.get().await {
            Ok(entries) => entries,
            Err(e) => {
                self.subscribers.remove(client.id());
                return Err(e);
            }
        };

        let seen: HashSet<Uuid> = entries.iter().filter_map(|entry| entry.id).collect();
        let snapshot = ServerMessage::new(ServerOp::Get, self.scope.as_str(), serde_json::to_value(&entries)?);
        self.subscribers.finish_sync(client.id(), snapshot, seen);
        client.ack(&self.scope, ack);
        Ok(())
    }

    pub async fn close(&self) {
        self.fanout.abort();
        if let Err(e) = self.pubsub.unsubscribe(self.scope.as_str()).await {
            tracing::warn!(scope = %self.scope, error = %e, "Failed to unsubscribe stream channel");
        }
        tracing::info!(scope = %self.scope, "Stream resource closed");
    }
}

impl Resource for StreamResource {
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
        self.subscribers.deliver(message);
    }

    fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

impl Drop for StreamResource {
    fn drop(&mut self) {
        self.fanout.abort();
    }
}
