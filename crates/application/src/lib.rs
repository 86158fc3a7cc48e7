//! 应用层实现。
//!
//! 在线状态与事件流的协调核心：存储网关抽象、在线状态机及其超时与
//! 跨实例事件桥、事件流列表、分布式锁与计数器，以及按作用域分派请求的资源注册表。

pub mod clock;
pub mod error;
pub mod presence;
pub mod registry;
pub mod resource;
pub mod store;
pub mod stream;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::ApplicationError;
pub use presence::{
    PresenceInput, PresenceManager, PresenceNotification, PresenceResource, PresenceSettings,
    PresenceTimeoutManager,
};
pub use registry::{ResourceHandle, ResourceRegistry};
pub use resource::{ClientHandle, Resource, Subscribers};
pub use store::memory::MemoryStore;
pub use store::{PubSubGateway, StoreConnection, StoreError, StoreGateway, StoreResult};
pub use stream::{LockEvent, StreamCounter, StreamLock, StreamLog, StreamResource};
