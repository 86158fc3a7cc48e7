//! Redis 存储适配器
//!
//! 命令连接实现 `StoreGateway`，订阅连接实现 `PubSubGateway`。

pub mod error;
pub mod store;
pub mod subscriber;

// 重新导出
pub use error::*;
pub use store::*;
pub use subscriber::*;
