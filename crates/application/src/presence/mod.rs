//! 分布式在线状态
//!
//! 组件之间通过类型化消息连接：
//! - 输入：`PresenceInput`（来自本地操作或跨实例桥接）与超时信号
//! - 输出：`PresenceNotification`
//!
//! `PresenceResource` 作为中介，把桥接、超时管理器的输出接到状态机输入，
//! 再把状态机的通知广播给本实例的订阅者。

pub mod bridge;
pub mod manager;
pub mod resource;
pub mod timeout;

use domain::{
    ClientId, PresenceRecord, ScopeName, ServerMessage, ServerOp, UserData, UserId, UserType,
};
use serde_json::{json, Map, Value};

pub use bridge::{LocalClients, PresenceBridge, RecordWatermarks};
pub use manager::{PresenceChannels, PresenceManager, PresenceSettings};
pub use resource::PresenceResource;
pub use timeout::PresenceTimeoutManager;

/// 状态机输入
#[derive(Debug, Clone, PartialEq)]
pub enum PresenceInput {
    ClientOnline {
        user_id: UserId,
        client_id: ClientId,
        user_type: UserType,
        user_data: UserData,
    },
    ClientOffline {
        user_id: UserId,
        client_id: ClientId,
        user_type: UserType,
        user_data: UserData,
        hard: bool,
    },
}

impl From<PresenceRecord> for PresenceInput {
    fn from(record: PresenceRecord) -> Self {
        if record.online {
            PresenceInput::ClientOnline {
                user_id: record.user_id,
                client_id: record.client_id,
                user_type: record.user_type,
                user_data: record.user_data,
            }
        } else {
            PresenceInput::ClientOffline {
                user_id: record.user_id,
                client_id: record.client_id,
                user_type: record.user_type,
                user_data: record.user_data,
                hard: record.hard,
            }
        }
    }
}

/// 状态机输出
#[derive(Debug, Clone, PartialEq)]
pub enum PresenceNotification {
    UserOnline {
        user_id: UserId,
        user_type: UserType,
    },
    UserOffline {
        user_id: UserId,
        user_type: UserType,
    },
    ClientOnline {
        user_id: UserId,
        client_id: ClientId,
        user_type: UserType,
        user_data: UserData,
    },
    ClientOffline {
        user_id: UserId,
        client_id: ClientId,
        user_type: UserType,
        user_data: UserData,
        explicit: bool,
    },
}

impl PresenceNotification {
    pub fn user_id(&self) -> &UserId {
        match self {
            PresenceNotification::UserOnline { user_id, .. }
            | PresenceNotification::UserOffline { user_id, .. }
            | PresenceNotification::ClientOnline { user_id, .. }
            | PresenceNotification::ClientOffline { user_id, .. } => user_id,
        }
    }

    /// 转换为发往订阅者的消息
    pub fn to_message(&self, scope: &ScopeName) -> ServerMessage {
        match self {
            PresenceNotification::UserOnline { user_id, user_type } => ServerMessage::new(
                ServerOp::Online,
                scope.as_str(),
                single_entry(user_id, user_type),
            ),
            PresenceNotification::UserOffline { user_id, user_type } => ServerMessage::new(
                ServerOp::Offline,
                scope.as_str(),
                single_entry(user_id, user_type),
            ),
            PresenceNotification::ClientOnline {
                user_id,
                client_id,
                user_data,
                ..
            } => ServerMessage::new(
                ServerOp::ClientOnline,
                scope.as_str(),
                json!({
                    "userId": user_id,
                    "clientId": client_id,
                    "userData": user_data,
                }),
            ),
            PresenceNotification::ClientOffline {
                user_id,
                client_id,
                explicit,
                ..
            } => ServerMessage::new(
                ServerOp::ClientOffline,
                scope.as_str(),
                json!({
                    "userId": user_id,
                    "clientId": client_id,
                    "explicit": explicit,
                }),
            ),
        }
    }
}

fn single_entry(user_id: &UserId, user_type: &UserType) -> Value {
    let mut map = Map::new();
    map.insert(user_id.to_string(), user_type.clone());
    Value::Object(map)
}
