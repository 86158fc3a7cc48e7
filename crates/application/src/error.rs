use domain::DomainError;
use thiserror::Error;

use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum ApplicationError {
    #[error("domain error: {0}")]
    Domain(#[from] DomainError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("channel closed: {0}")]
    ChannelClosed(String),
}

impl ApplicationError {
    pub fn channel_closed(message: impl Into<String>) -> Self {
        ApplicationError::ChannelClosed(message.into())
    }
}
