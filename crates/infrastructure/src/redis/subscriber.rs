//! Redis 订阅连接
//!
//! 单个 Pub/Sub 连接拆分为发送端与消息流：发送端负责动态订阅、退订，
//! 后台任务读取消息流并按频道分发给本地接收端。连接断开后按指数退避
//! 重连，并重新订阅所有仍在使用的频道。

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use application::{PubSubGateway, StoreError, StoreResult};
use async_trait::async_trait;
use config::RedisConfig;
use futures_util::stream::StreamExt;
use redis::aio::{PubSubSink, PubSubStream};
use redis::{Client, Msg};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info, warn};

use super::error::{RedisError, RedisResult};

type Routes = Arc<StdMutex<HashMap<String, Vec<mpsc::UnboundedSender<String>>>>>;

fn routes_of(routes: &Routes) -> MutexGuard<'_, HashMap<String, Vec<mpsc::UnboundedSender<String>>>> {
    routes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Redis 订阅网关
pub struct RedisPubSub {
    sink: Arc<Mutex<Option<PubSubSink>>>,
    routes: Routes,
    shutdown_signal: Arc<AtomicBool>,
    listener: StdMutex<Option<JoinHandle<()>>>,
}

impl RedisPubSub {
    /// 建立订阅连接并启动监听任务
    pub async fn connect(client: Client, config: &RedisConfig) -> RedisResult<Self> {
        let (sink, stream) = client
            .get_async_pubsub()
            .await
            .map_err(|e| RedisError::ConnectionError {
                message: format!("获取 PubSub 连接失败: {}", e),
            })?
            .split();

        let sink = Arc::new(Mutex::new(Some(sink)));
        let routes: Routes = Arc::new(StdMutex::new(HashMap::new()));
        let shutdown_signal = Arc::new(AtomicBool::new(false));

        let listener = tokio::spawn(listen_loop(
            client,
            config.clone(),
            stream,
            sink.clone(),
            routes.clone(),
            shutdown_signal.clone(),
        ));

        info!("Redis 订阅连接已建立");
        Ok(Self {
            sink,
            routes,
            shutdown_signal,
            listener: StdMutex::new(Some(listener)),
        })
    }

    /// 当前订阅的频道数
    pub fn channel_count(&self) -> usize {
        routes_of(&self.routes).len()
    }

    /// 停止监听并关闭连接，所有接收端随之结束
    pub async fn disconnect(&self) {
        self.shutdown_signal.store(true, Ordering::Relaxed);
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(listener) = listener {
            listener.abort();
        }
        self.sink.lock().await.take();
        routes_of(&self.routes).clear();
        info!("Redis 订阅连接已关闭");
    }
}

#[async_trait]
impl PubSubGateway for RedisPubSub {
    async fn subscribe(&self, channel: &str) -> StoreResult<mpsc::UnboundedReceiver<String>> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut sink = self.sink.lock().await;

        let known = routes_of(&self.routes).contains_key(channel);
        if !known {
            let sink = sink.as_mut().ok_or(StoreError::Closed)?;
            sink.subscribe(channel)
                .await
                .map_err(|e| RedisError::SubscribeError {
                    message: format!("订阅频道 {} 失败: {}", channel, e),
                })?;
            debug!(channel = %channel, "Subscribed");
        }

        routes_of(&self.routes)
            .entry(channel.to_string())
            .or_default()
            .push(sender);
        Ok(receiver)
    }

    async fn unsubscribe(&self, channel: &str) -> StoreResult<()> {
        let mut sink = self.sink.lock().await;
        if routes_of(&self.routes).remove(channel).is_none() {
            return Ok(());
        }

        if let Some(sink) = sink.as_mut() {
            sink.unsubscribe(channel)
                .await
                .map_err(|e| RedisError::SubscribeError {
                    message: format!("退订频道 {} 失败: {}", channel, e),
                })?;
        }
        debug!(channel = %channel, "Unsubscribed");
        Ok(())
    }
}

impl Drop for RedisPubSub {
    fn drop(&mut self) {
        self.shutdown_signal.store(true, Ordering::Relaxed);
        if let Some(listener) = self
            .listener
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            listener.abort();
        }
    }
}

fn dispatch(routes: &Routes, msg: Msg) {
    let channel = msg.get_channel_name().to_string();
    let payload: String = match msg.get_payload() {
        Ok(payload) => payload,
        Err(e) => {
            warn!(channel = %channel, error = %e, "Dropping undecodable message");
            return;
        }
    };

    if let Some(senders) = routes_of(routes).get_mut(&channel) {
        senders.retain(|sender| sender.send(payload.clone()).is_ok());
    }
}

/// 第 `retry_count` 次重连前的等待时间，按 2 的幂放大
fn backoff_delay(interval_ms: u64, retry_count: u32) -> Duration {
    let factor = 2_u64.saturating_pow(retry_count.saturating_sub(1));
    Duration::from_millis(interval_ms.saturating_mul(factor))
}

async fn listen_loop(
    client: Client,
    config: RedisConfig,
    stream: PubSubStream,
    sink: Arc<Mutex<Option<PubSubSink>>>,
    routes: Routes,
    shutdown_signal: Arc<AtomicBool>,
) {
    let mut stream = Some(stream);
    let mut retry_count = 0;

    while !shutdown_signal.load(Ordering::Relaxed) {
        if let Some(mut messages) = stream.take() {
            while let Some(msg) = messages.next().await {
                dispatch(&routes, msg);
            }
            if shutdown_signal.load(Ordering::Relaxed) {
                break;
            }
            warn!("Redis 订阅连接断开，准备重连");
        }

        match resubscribe(&client, &sink, &routes).await {
            Ok(messages) => {
                retry_count = 0;
                stream = Some(messages);
                info!("Redis 订阅连接已恢复");
            }
            Err(e) => {
                error!("Redis 订阅重连失败: {}", e);
                retry_count += 1;

                if retry_count >= config.max_reconnect_attempts {
                    error!("连接失败，已达最大重试次数");
                    sink.lock().await.take();
                    routes_of(&routes).clear();
                    break;
                }

                sleep(backoff_delay(config.reconnect_interval_ms, retry_count)).await;
            }
        }
    }

    info!("Redis 订阅监听已停止");
}

/// 新建连接并重新订阅所有频道。持有发送端锁直到完成，避免与并发订阅交错。
async fn resubscribe(
    client: &Client,
    sink: &Arc<Mutex<Option<PubSubSink>>>,
    routes: &Routes,
) -> RedisResult<PubSubStream> {
    let mut current = sink.lock().await;
    let (mut fresh, messages) = client
        .get_async_pubsub()
        .await
        .map_err(|e| RedisError::ReconnectError {
            message: e.to_string(),
        })?
        .split();

    let channels: Vec<String> = routes_of(routes).keys().cloned().collect();
    for channel in &channels {
        fresh
            .subscribe(channel)
            .await
            .map_err(|e| RedisError::ReconnectError {
                message: format!("重新订阅频道 {} 失败: {}", channel, e),
            })?;
    }

    info!("已重新订阅 {} 个频道", channels.len());
    *current = Some(fresh);
    Ok(messages)
}
