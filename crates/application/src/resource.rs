//! 资源能力接口
//!
//! 在线状态与事件流各自独立实现 `Resource`，注册表通过它统一处理订阅与广播。

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use domain::{ClientId, ScopeName, ServerMessage};
use serde_json::Value;
use tokio::sync::mpsc;

/// 代表一个客户端连接的发送端
#[derive(Debug, Clone)]
pub struct ClientHandle {
    id: ClientId,
    outbox: mpsc::UnboundedSender<ServerMessage>,
}

impl ClientHandle {
    pub fn new(id: ClientId, outbox: mpsc::UnboundedSender<ServerMessage>) -> Self {
        Self { id, outbox }
    }

    /// 创建客户端句柄及其接收端
    pub fn channel(id: impl Into<ClientId>) -> (Self, mpsc::UnboundedReceiver<ServerMessage>) {
        let (outbox, receiver) = mpsc::unbounded_channel();
        (Self::new(id.into(), outbox), receiver)
    }

    pub fn id(&self) -> &ClientId {
        &self.id
    }

    /// 发送消息；连接已关闭时返回 false
    pub fn send(&self, message: ServerMessage) -> bool {
        if self.outbox.send(message).is_err() {
            tracing::debug!(client_id = %self.id, "client outbox closed, message dropped");
            return false;
        }
        true
    }

    /// 请求带有 ack 时回复确认
    pub fn ack(&self, scope: &ScopeName, ack: Option<&Value>) {
        if let Some(ack) = ack {
            self.send(ServerMessage::ack(scope.as_str(), ack.clone()));
        }
    }

    pub fn is_closed(&self) -> bool {
        self.outbox.is_closed()
    }
}

/// 订阅 / 取消订阅 / 广播
pub trait Resource: Send + Sync {
    fn name(&self) -> &ScopeName;

    fn subscribe(&self, client: ClientHandle);

    /// 返回该客户端此前是否已订阅
    fn unsubscribe(&self, client_id: &ClientId) -> bool;

    fn broadcast(&self, message: &ServerMessage);

    fn subscriber_count(&self) -> usize;
}

/// 订阅者表
#[derive(Debug, Default)]
pub struct Subscribers {
    clients: Mutex<BTreeMap<ClientId, ClientHandle>>,
}

impl Subscribers {
    pub fn new() -> Self {
        Self::default()
    }

    fn clients(&self) -> MutexGuard<'_, BTreeMap<ClientId, ClientHandle>> {
        self.clients
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add(&self, client: ClientHandle) {
        self.clients().insert(client.id().clone(), client);
    }

    pub fn remove(&self, client_id: &ClientId) -> bool {
        self.clients().remove(client_id).is_some()
    }

    pub fn contains(&self, client_id: &ClientId) -> bool {
        self.clients().contains_key(client_id)
    }

    pub fn len(&self) -> usize {
        self.clients().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients().is_empty()
    }

    /// 发送给所有订阅者，并移除已关闭的连接
    pub fn broadcast(&self, message: &ServerMessage) {
        self.clients()
            .retain(|_, client| client.send(message.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::ServerOp;
    use serde_json::json;

    #[test]
    fn test_broadcast_prunes_closed_clients() {
        let subscribers = Subscribers::new();
        let (alive, mut alive_rx) = ClientHandle::channel("c1");
        let (gone, gone_rx) = ClientHandle::channel("c2");
        drop(gone_rx);

        subscribers.add(alive);
        subscribers.add(gone);
        assert_eq!(subscribers.len(), 2);

        let message = ServerMessage::new(ServerOp::Push, "stream:/dev/test", json!({}));
        subscribers.broadcast(&message);

        assert_eq!(alive_rx.try_recv().unwrap(), message);
        assert_eq!(subscribers.len(), 1);
        assert!(subscribers.contains(&ClientId::from("c1")));
    }
}
