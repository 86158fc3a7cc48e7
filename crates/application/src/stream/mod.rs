//! 事件流：存储列表、资源、分布式锁与计数器

pub mod counter;
pub mod lock;
pub mod log;
pub mod resource;

pub use counter::StreamCounter;
pub use lock::{LockEvent, StreamLock};
pub use log::StreamLog;
pub use resource::StreamResource;
