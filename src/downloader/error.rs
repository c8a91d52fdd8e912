use thiserror::Error;

use crate::common::client::ApiError;
use crate::common::runtime::RuntimeError;
use crate::common::storage::StoreError;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("同步已停止")]
    Stopped,
}

impl SyncError {
    /// 需要重新登录而不是展示通用错误
    pub fn is_auth_required(&self) -> bool {
        matches!(self, Self::Api(ApiError::AuthRequired(_)))
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
