use std::time::Duration;

use shared::{domain::ChannelId, error::ApiError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("cache {operation} failed: {source}")]
    Cache {
        operation: &'static str,
        source: anyhow::Error,
    },
    #[error("remote {operation} failed: {source}")]
    Remote {
        operation: &'static str,
        source: anyhow::Error,
    },
    #[error("remote {operation} rejected: {error}")]
    Api {
        operation: &'static str,
        #[source]
        error: ApiError,
    },
    #[error("remote {operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },
    #[error("event stream unavailable: {0}")]
    EventStream(String),
    #[error("no channel is open")]
    NoOpenChannel,
    #[error("channel {0} is no longer open")]
    ChannelClosed(ChannelId),
    #[error("session user is not resolved yet")]
    IdentityUnresolved,
}

impl SyncError {
    /// Classifies a collaborator failure, keeping structured server errors apart.
    pub fn remote(operation: &'static str, source: anyhow::Error) -> Self {
        match source.downcast::<ApiError>() {
            Ok(error) => Self::Api { operation, error },
            Err(source) => Self::Remote { operation, source },
        }
    }

    pub fn cache(operation: &'static str, source: anyhow::Error) -> Self {
        Self::Cache { operation, source }
    }

    /// Whether the UI should offer the same action again.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Cache { .. } | Self::Remote { .. } | Self::Timeout { .. } => true,
            Self::EventStream(_) => true,
            Self::Api { error, .. } => error.code.is_transient(),
            Self::NoOpenChannel | Self::ChannelClosed(_) | Self::IdentityUnresolved => false,
        }
    }
}

pub type SyncResult<T> = std::result::Result<T, SyncError>;
