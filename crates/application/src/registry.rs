//! 资源注册表
//!
//! 按作用域名前缀懒创建资源（`presence:/…`、`stream:/…`），之后复用；
//! 把客户端请求分派给对应资源，未知类型回复 `{op: "err", value: "unknown_type"}`。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use config::AppConfig;
use domain::{ClientId, ClientRequest, DomainError, ResourceKind, RetentionPolicy, ScopeName, ServerMessage};
use tokio::sync::Mutex as AsyncMutex;

use crate::clock::Clock;
use crate::error::ApplicationError;
use crate::presence::PresenceResource;
use crate::resource::{ClientHandle, Resource};
use crate::store::StoreConnection;
use crate::stream::{StreamCounter, StreamResource};

pub const UNKNOWN_TYPE: &str = "unknown_type";
pub const UNSUPPORTED_OPERATION: &str = "unsupported_operation";

#[derive(Clone)]
pub enum ResourceHandle {
    Presence(Arc<PresenceResource>),
    Stream(Arc<StreamResource>),
}

impl ResourceHandle {
    pub fn as_resource(&self) -> &dyn Resource {
        match self {
            ResourceHandle::Presence(presence) => presence.as_ref(),
            ResourceHandle::Stream(stream) => stream.as_ref(),
        }
    }

    async fn close(&self) {
        match self {
            ResourceHandle::Presence(presence) => presence.close().await,
            ResourceHandle::Stream(stream) => stream.close().await,
        }
    }
}

pub struct ResourceRegistry {
    connection: StoreConnection,
    clock: Arc<dyn Clock>,
    config: AppConfig,
    resources: AsyncMutex<HashMap<String, ResourceHandle>>,
    counters: AsyncMutex<HashMap<String, Arc<StreamCounter>>>,
    /// 作用域名前缀 → 策略覆盖
    policies: Mutex<Vec<(String, RetentionPolicy)>>,
}

impl ResourceRegistry {
    pub fn new(connection: StoreConnection, clock: Arc<dyn Clock>, config: AppConfig) -> Self {
        Self {
            connection,
            clock,
            config,
            resources: AsyncMutex::new(HashMap::new()),
            counters: AsyncMutex::new(HashMap::new()),
            policies: Mutex::new(Vec::new()),
        }
    }

    /// 为某个作用域名前缀设置策略，覆盖配置中的默认值
    pub fn set_policy(&self, prefix: impl Into<String>, policy: RetentionPolicy) {
        let prefix = prefix.into();
        let mut policies = self.policies.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        policies.retain(|(existing, _)| *existing != prefix);
        policies.push((prefix, policy));
    }

    /// 默认策略合并所有匹配前缀的覆盖，前缀越长优先级越高
    pub fn policy_for(&self, scope: &ScopeName) -> RetentionPolicy {
        let base = match scope.kind() {
            ResourceKind::Presence => {
                let mut policy = RetentionPolicy::default();
                policy.max_persistence = self.config.presence.max_persistence_secs;
                policy
            }
            ResourceKind::Stream => RetentionPolicy::default()
                .with_max_persistence(self.config.stream.max_persistence_secs)
                .with_max_length(self.config.stream.max_length),
        };

        let policies = self.policies.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut matching: Vec<&(String, RetentionPolicy)> = policies
            .iter()
            .filter(|(prefix, _)| scope.as_str().starts_with(prefix.as_str()))
            .collect();
        matching.sort_by_key(|(prefix, _)| prefix.len());
        matching
            .into_iter()
            .fold(base, |policy, (_, overrides)| policy.merged_with(overrides))
    }

    /// 获取或创建资源
    pub async fn resource(&self, scope: &ScopeName) -> Result<ResourceHandle, ApplicationError> {
        let mut resources = self.resources.lock().await;
        if let Some(existing) = resources.get(scope.as_str()) {
            return Ok(existing.clone());
        }

        let policy = self.policy_for(scope);
        let handle = match scope.kind() {
            ResourceKind::Presence => ResourceHandle::Presence(
                PresenceResource::open(
                    scope.clone(),
                    &self.connection,
                    self.clock.clone(),
                    &self.config.presence,
                    &policy,
                )
                .await?,
            ),
            ResourceKind::Stream => ResourceHandle::Stream(
                StreamResource::open(scope.clone(), &self.connection, policy).await?,
            ),
        };
        resources.insert(scope.as_str().to_string(), handle.clone());
        Ok(handle)
    }

    pub async fn len(&self) -> usize {
        self.resources.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// 获取或创建指定名称的计数器
    pub async fn counter(&self, name: &str) -> Result<Arc<StreamCounter>, ApplicationError> {
        let mut counters = self.counters.lock().await;
        if let Some(existing) = counters.get(name) {
            return Ok(existing.clone());
        }
        let counter = Arc::new(
            StreamCounter::open(
                name,
                &self.connection,
                Duration::from_millis(self.config.lock.ttl_ms),
            )
            .await?,
        );
        counters.insert(name.to_string(), counter.clone());
        Ok(counter)
    }

    /// 销毁资源，返回资源是否存在
    pub async fn destroy(&self, scope: &ScopeName) -> bool {
        let removed = self.resources.lock().await.remove(scope.as_str());
        match removed {
            Some(handle) => {
                handle.close().await;
                true
            }
            None => false,
        }
    }

    /// 关闭所有资源与计数器
    pub async fn shutdown(&self) {
        let handles: Vec<ResourceHandle> = self.resources.lock().await.drain().map(|(_, h)| h).collect();
        for handle in &handles {
            handle.close().await;
        }
        self.counters.lock().await.clear();
        tracing::info!(resources = handles.len(), "Resource registry shut down");
    }

    /// 连接断开：从所有资源退订，在线状态资源对该连接的用户执行软下线
    pub async fn disconnect_client(&self, client_id: &ClientId) -> Result<(), ApplicationError> {
        let handles: Vec<ResourceHandle> = self.resources.lock().await.values().cloned().collect();
        let mut first_error = None;
        for handle in handles {
            match handle {
                ResourceHandle::Presence(presence) => {
                    if let Err(e) = presence.leave(client_id).await {
                        tracing::error!(scope = %presence.name(), client_id = %client_id, error = %e, "Implicit offline failed");
                        first_error.get_or_insert(e);
                    }
                }
                ResourceHandle::Stream(stream) => {
                    stream.unsubscribe(client_id);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// 分派客户端请求
    pub async fn handle(&self, client: &ClientHandle, request: ClientRequest) -> Result<(), ApplicationError> {
        let scope = match ScopeName::parse(request.scope()) {
            Ok(scope) => scope,
            Err(e) => {
                tracing::warn!(client_id = %client.id(), scope = %request.scope(), error = %e, "Rejected request");
                client.send(ServerMessage::error(request.scope(), UNKNOWN_TYPE));
                return Err(e.into());
            }
        };

        tracing::debug!(client_id = %client.id(), scope = %scope, op = request.op_name(), "Handling request");
        let handle = self.resource(&scope).await?;

        match (handle, request) {
            (ResourceHandle::Presence(presence), ClientRequest::Set { key, user_type, value, user_data, ack, .. }) => {
                presence
                    .set_status(client, key, user_type, value, user_data, ack.as_ref())
                    .await
            }
            (ResourceHandle::Presence(presence), ClientRequest::Get { options, ack, .. }) => {
                presence.get(client, options, ack.as_ref()).await
            }
            (ResourceHandle::Presence(presence), ClientRequest::Sync { options, ack, .. }) => {
                presence.sync(client, options, ack.as_ref()).await
            }
            (ResourceHandle::Presence(presence), ClientRequest::Unsubscribe { ack, .. }) => {
                presence.unsubscribe_client(client, ack.as_ref()).await
            }
            (ResourceHandle::Stream(stream), ClientRequest::Push { resource, action, value, user_data, ack, .. }) => {
                stream
                    .push(client, resource, action, value, user_data, ack.as_ref())
                    .await
            }
            (ResourceHandle::Stream(stream), ClientRequest::Get { ack, .. }) => {
                stream.get(client, ack.as_ref()).await
            }
            (ResourceHandle::Stream(stream), ClientRequest::Sync { ack, .. }) => {
                stream.sync(client, ack.as_ref()).await
            }
            (ResourceHandle::Stream(stream), ClientRequest::Unsubscribe { ack, .. }) => {
                stream.unsubscribe(client.id());
                client.ack(&scope, ack.as_ref());
                Ok(())
            }
            (handle, ClientRequest::Subscribe { ack, .. }) => {
                handle.as_resource().subscribe(client.clone());
                client.ack(&scope, ack.as_ref());
                Ok(())
            }
            (_, request) => {
                client.send(ServerMessage::error(scope.as_str(), UNSUPPORTED_OPERATION));
                Err(DomainError::unsupported_operation(request.op_name(), scope.as_str()).into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::memory::MemoryStore;
    use domain::ServerOp;
    use serde_json::json;

    fn registry() -> ResourceRegistry {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        ResourceRegistry::new(store.connection(), clock, AppConfig::default())
    }

    fn request(value: serde_json::Value) -> ClientRequest {
        serde_json::from_value(value).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_type_is_rejected() {
        let registry = registry();
        let (client, mut rx) = ClientHandle::channel("c1");

        let result = registry
            .handle(&client, request(json!({"op": "get", "to": "queue:/dev/x"})))
            .await;
        assert!(matches!(
            result,
            Err(ApplicationError::Domain(DomainError::UnknownResourceType { .. }))
        ));
        assert_eq!(rx.try_recv().unwrap(), ServerMessage::error("queue:/dev/x", UNKNOWN_TYPE));
        assert!(registry.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resources_are_created_lazily_and_reused() {
        let registry = registry();
        let scope = ScopeName::parse("stream:/dev/feed").unwrap();

        let first = registry.resource(&scope).await.unwrap();
        let second = registry.resource(&scope).await.unwrap();
        match (first, second) {
            (ResourceHandle::Stream(a), ResourceHandle::Stream(b)) => assert!(Arc::ptr_eq(&a, &b)),
            _ => panic!("expected stream resources"),
        }
        assert_eq!(registry.len().await, 1);

        assert!(registry.destroy(&scope).await);
        assert!(!registry.destroy(&scope).await);
        assert!(registry.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_on_presence_is_unsupported() {
        let registry = registry();
        let (client, mut rx) = ClientHandle::channel("c1");

        let result = registry
            .handle(
                &client,
                request(json!({"op": "push", "to": "presence:/dev/x", "resource": "r", "action": "a"})),
            )
            .await;
        assert!(matches!(
            result,
            Err(ApplicationError::Domain(DomainError::UnsupportedOperation { .. }))
        ));
        assert_eq!(rx.try_recv().unwrap().op, ServerOp::Err);
    }

    #[tokio::test(start_paused = true)]
    async fn test_requests_are_acknowledged() {
        let registry = registry();
        let (client, mut rx) = ClientHandle::channel("c1");

        registry
            .handle(
                &client,
                request(json!({"op": "push", "to": "stream:/dev/x", "resource": "r", "action": "a", "ack": 1})),
            )
            .await
            .unwrap();
        registry
            .handle(&client, request(json!({"op": "subscribe", "to": "presence:/dev/x", "ack": 2})))
            .await
            .unwrap();

        assert_eq!(rx.try_recv().unwrap(), ServerMessage::ack("stream:/dev/x", json!(1)));
        assert_eq!(rx.try_recv().unwrap(), ServerMessage::ack("presence:/dev/x", json!(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_policy_overrides_by_prefix() {
        let registry = registry();
        registry.set_policy("stream:/dev", RetentionPolicy::default().with_max_length(10));
        registry.set_policy("stream:/dev/short", RetentionPolicy::default().with_max_length(2));

        let policy = registry.policy_for(&ScopeName::parse("stream:/dev/short/feed").unwrap());
        assert_eq!(policy.max_length, Some(2));
        assert_eq!(policy.max_persistence, Some(604_800));

        let policy = registry.policy_for(&ScopeName::parse("stream:/dev/other").unwrap());
        assert_eq!(policy.max_length, Some(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_counter_is_shared_by_name() {
        let registry = registry();
        let a = registry.counter("ticket").await.unwrap();
        let b = registry.counter("ticket").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.key(), "stream_counter:/ticket");
        assert_eq!(a.increment().await.unwrap(), 1);
        assert_eq!(b.increment().await.unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_closes_every_resource() {
        let registry = registry();
        registry
            .resource(&ScopeName::parse("presence:/dev/room").unwrap())
            .await
            .unwrap();
        registry
            .resource(&ScopeName::parse("stream:/dev/feed").unwrap())
            .await
            .unwrap();
        assert_eq!(registry.len().await, 2);

        registry.shutdown().await;
        assert!(registry.is_empty().await);
    }
}
