//! 在线状态与事件流系统的核心领域模型
//!
//! 包含标识符、在线记录、作用域成员表、事件流记录、保留策略以及客户端协议消息。
//! 本 crate 不做任何 I/O。

pub mod errors;
pub mod policy;
pub mod presence;
pub mod protocol;
pub mod stream;
pub mod value_objects;

// 重新导出常用类型
pub use errors::*;
pub use policy::*;
pub use presence::*;
pub use protocol::*;
pub use stream::*;
pub use value_objects::*;
