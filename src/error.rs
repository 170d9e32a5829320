use thiserror::Error;

use crate::config::ConfigError;
use crate::store::StoreError;

/// Top-level error for sync manager operations.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("collection `{0}` is not registered")]
    UnknownCollection(String),
}

pub type Result<T, E = SyncError> = std::result::Result<T, E>;
