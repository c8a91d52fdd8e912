//! 下载任务同步层
//!
//! 把远端服务和本地后台代理两个来源的下载任务合并成一份规范列表，
//! 并负责后端地址的发现、健康检查和有限度的容错请求。

pub mod common;
pub mod downloader;

pub use common::client::{ApiError, BackendClient, ConnectivityResolver};
pub use common::config::SyncConfig;
pub use common::runtime::{NativeRuntime, NoRuntime, RuntimeError};
pub use common::storage::{FileStore, KeyValueStore, MemoryStore, StoreError};
pub use downloader::{DownloadSync, DownloadTask, SyncError, SyncState, TaskStatus};
