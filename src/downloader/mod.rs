pub mod assets;
pub mod control;
pub mod error;
pub mod events;
pub mod manager;
pub mod metadata;
pub mod models;
pub mod notifier;
pub mod progress;
pub mod reconcile;
pub mod snapshot;
pub mod task;

pub use error::SyncError;
pub use manager::{DownloadSync, SyncState};
pub use task::{DownloadTask, TaskStatus};
