//! 领域模型错误定义
//!
//! 定义了作用域、标识符与协议消息相关的错误类型，提供清晰的错误上下文。

use thiserror::Error;

/// 领域模型错误类型
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DomainError {
    /// 作用域名称不合法
    #[error("作用域名称不合法: {scope}")]
    InvalidScope { scope: String },

    /// 资源类型未知
    #[error("资源类型未知: {scope}")]
    UnknownResourceType { scope: String },

    /// 资源类型与请求不匹配
    #[error("操作 {op} 不适用于资源 {scope}")]
    UnsupportedOperation { op: String, scope: String },
}

impl DomainError {
    /// 创建作用域错误
    pub fn invalid_scope(scope: impl Into<String>) -> Self {
        Self::InvalidScope {
            scope: scope.into(),
        }
    }

    /// 创建未知资源类型错误
    pub fn unknown_resource_type(scope: impl Into<String>) -> Self {
        Self::UnknownResourceType {
            scope: scope.into(),
        }
    }

    /// 创建不支持的操作错误
    pub fn unsupported_operation(op: impl Into<String>, scope: impl Into<String>) -> Self {
        Self::UnsupportedOperation {
            op: op.into(),
            scope: scope.into(),
        }
    }
}
