//! 客户端与服务端之间的消息格式
//!
//! 客户端请求按 `op` 字段区分，服务端消息统一为 `{op, to, value}`。

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::presence::{UserData, UserType};
use crate::value_objects::UserId;

/// 在线状态设置值
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Offline,
}

/// get / sync 的请求选项
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestOptions {
    #[serde(default = "RequestOptions::default_version")]
    pub version: u8,
}

impl RequestOptions {
    fn default_version() -> u8 {
        1
    }

    pub fn v2() -> Self {
        Self { version: 2 }
    }
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            version: Self::default_version(),
        }
    }
}

/// 客户端请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ClientRequest {
    Set {
        to: String,
        key: UserId,
        #[serde(rename = "type", default)]
        user_type: UserType,
        value: PresenceStatus,
        #[serde(rename = "userData", default)]
        user_data: UserData,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ack: Option<Value>,
    },
    Get {
        to: String,
        #[serde(default)]
        options: RequestOptions,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ack: Option<Value>,
    },
    Sync {
        to: String,
        #[serde(default)]
        options: RequestOptions,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ack: Option<Value>,
    },
    Subscribe {
        to: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ack: Option<Value>,
    },
    Unsubscribe {
        to: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ack: Option<Value>,
    },
    Push {
        to: String,
        resource: String,
        action: String,
        #[serde(default)]
        value: Value,
        #[serde(rename = "userData", default)]
        user_data: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ack: Option<Value>,
    },
}

impl ClientRequest {
    /// 目标作用域名称
    pub fn scope(&self) -> &str {
        match self {
            ClientRequest::Set { to, .. }
            | ClientRequest::Get { to, .. }
            | ClientRequest::Sync { to, .. }
            | ClientRequest::Subscribe { to, .. }
            | ClientRequest::Unsubscribe { to, .. }
            | ClientRequest::Push { to, .. } => to,
        }
    }

    pub fn op_name(&self) -> &'static str {
        match self {
            ClientRequest::Set { .. } => "set",
            ClientRequest::Get { .. } => "get",
            ClientRequest::Sync { .. } => "sync",
            ClientRequest::Subscribe { .. } => "subscribe",
            ClientRequest::Unsubscribe { .. } => "unsubscribe",
            ClientRequest::Push { .. } => "push",
        }
    }

    pub fn ack(&self) -> Option<&Value> {
        match self {
            ClientRequest::Set { ack, .. }
            | ClientRequest::Get { ack, .. }
            | ClientRequest::Sync { ack, .. }
            | ClientRequest::Subscribe { ack, .. }
            | ClientRequest::Unsubscribe { ack, .. }
            | ClientRequest::Push { ack, .. } => ack.as_ref(),
        }
    }
}

/// 服务端消息类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerOp {
    Ack,
    Err,
    Get,
    Online,
    Offline,
    ClientOnline,
    ClientOffline,
    Push,
}

/// 发往客户端的消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerMessage {
    pub op: ServerOp,
    pub to: String,
    pub value: Value,
}

impl ServerMessage {
    pub fn new(op: ServerOp, to: impl Into<String>, value: Value) -> Self {
        Self {
            op,
            to: to.into(),
            value,
        }
    }

    pub fn ack(to: impl Into<String>, ack: Value) -> Self {
        Self::new(ServerOp::Ack, to, ack)
    }

    pub fn error(to: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::new(ServerOp::Err, to, Value::String(reason.into()))
    }
}
