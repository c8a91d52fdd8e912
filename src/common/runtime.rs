use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::downloader::models::LocalAgentRow;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum RuntimeError {
    #[error("本地运行时不可用")]
    Unavailable,

    #[error("本地命令 {command} 失败: {message}")]
    Command { command: String, message: String },
}

/// 宿主进程提供的本地能力：后台下载代理和后端地址解析
///
/// 字节传输由实现方负责，这里只消费它的任务行和控制命令。
#[async_trait]
pub trait NativeRuntime: Send + Sync {
    fn is_available(&self) -> bool;

    /// 宿主已知的权威后端地址，没有时返回 None
    async fn resolved_api_base(&self) -> Result<Option<String>, RuntimeError>;

    async fn list_local_tasks(&self) -> Result<Vec<LocalAgentRow>, RuntimeError>;

    async fn pause(&self, id: &str) -> Result<(), RuntimeError>;
    async fn resume(&self, id: &str) -> Result<(), RuntimeError>;
    async fn cancel(&self, id: &str) -> Result<(), RuntimeError>;
}

pub type SharedRuntime = Arc<dyn NativeRuntime>;

/// 没有宿主时使用，所有调用都表现为“运行时不存在”
#[derive(Debug, Default, Clone)]
pub struct NoRuntime;

#[async_trait]
impl NativeRuntime for NoRuntime {
    fn is_available(&self) -> bool {
        false
    }

    async fn resolved_api_base(&self) -> Result<Option<String>, RuntimeError> {
        Ok(None)
    }

    async fn list_local_tasks(&self) -> Result<Vec<LocalAgentRow>, RuntimeError> {
        Ok(Vec::new())
    }

    async fn pause(&self, _id: &str) -> Result<(), RuntimeError> {
        Err(RuntimeError::Unavailable)
    }

    async fn resume(&self, _id: &str) -> Result<(), RuntimeError> {
        Err(RuntimeError::Unavailable)
    }

    async fn cancel(&self, _id: &str) -> Result<(), RuntimeError> {
        Err(RuntimeError::Unavailable)
    }
}
