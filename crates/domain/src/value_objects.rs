use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::DomainError;

/// 毫秒级 Unix 时间戳，与存储中记录的 `at` 字段一致。
pub type Millis = i64;

/// 用户唯一标识。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for UserId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// 客户端（连接）唯一标识。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClientId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for ClientId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// 资源类型，由作用域名称前缀决定。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Presence,
    Stream,
}

impl ResourceKind {
    pub fn prefix(self) -> &'static str {
        match self {
            ResourceKind::Presence => "presence:/",
            ResourceKind::Stream => "stream:/",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Presence => f.write_str("presence"),
            ResourceKind::Stream => f.write_str("stream"),
        }
    }
}

/// 经过验证的作用域名称，例如 `presence:/account/ticket/1`。
///
/// 作用域名称同时作为存储键和发布频道名使用。
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScopeName {
    raw: String,
    kind: ResourceKind,
}

impl ScopeName {
    pub fn parse(value: impl Into<String>) -> Result<Self, DomainError> {
        let raw = value.into();
        let kind = if raw.starts_with(ResourceKind::Presence.prefix()) {
            ResourceKind::Presence
        } else if raw.starts_with(ResourceKind::Stream.prefix()) {
            ResourceKind::Stream
        } else if raw.contains(":/") {
            return Err(DomainError::unknown_resource_type(raw));
        } else {
            return Err(DomainError::invalid_scope(raw));
        };

        if raw.len() == kind.prefix().len() {
            return Err(DomainError::invalid_scope(raw));
        }

        Ok(Self { raw, kind })
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// 去掉类型前缀后的名称部分
    pub fn path(&self) -> &str {
        &self.raw[self.kind.prefix().len()..]
    }
}

impl fmt::Display for ScopeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_name_parses_known_prefixes() {
        let presence = ScopeName::parse("presence:/dev/test").unwrap();
        assert_eq!(presence.kind(), ResourceKind::Presence);
        assert_eq!(presence.path(), "dev/test");

        let stream = ScopeName::parse("stream:/dev/tickets").unwrap();
        assert_eq!(stream.kind(), ResourceKind::Stream);
        assert_eq!(stream.as_str(), "stream:/dev/tickets");
    }

    #[test]
    fn test_scope_name_rejects_unknown_type() {
        let err = ScopeName::parse("invalid:/thing").unwrap_err();
        assert!(matches!(err, DomainError::UnknownResourceType { .. }));

        let err = ScopeName::parse("no-prefix").unwrap_err();
        assert!(matches!(err, DomainError::InvalidScope { .. }));

        assert!(ScopeName::parse("presence:/").is_err());
    }
}
