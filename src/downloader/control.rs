use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::{Value, json};
use tracing::{debug, info};

use crate::common::client::{ApiError, BackendClient};
use crate::common::config::SyncConfig;
use crate::common::runtime::SharedRuntime;
use crate::common::storage::{KeyValueStore, load_json, save_json};

use super::error::Result;
use super::events::{DownloadEvent, SharedEmitter};
use super::models::RemoteTaskRecord;
use super::snapshot::{REMOTE_TASKS_PATH, SnapshotLoader};

pub const SESSION_LINKS_KEY: &str = "session_links";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAction {
    Pause,
    Resume,
    Cancel,
}

impl ControlAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Cancel => "cancel",
        }
    }
}

impl fmt::Display for ControlAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 控制命令的去向
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlRoute {
    Remote { session_id: String },
    Native,
}

/// 任务 id -> 外部下发的会话 id，持久化
#[derive(Debug, Default)]
pub struct SessionLinks {
    links: HashMap<String, String>,
}

impl SessionLinks {
    pub fn load(store: &dyn KeyValueStore) -> Self {
        let links = load_json(store, &SyncConfig::storage_key(SESSION_LINKS_KEY)).unwrap_or_default();
        Self { links }
    }

    pub fn get(&self, task_id: &str) -> Option<&str> {
        self.links.get(task_id).map(String::as_str)
    }

    pub fn link(&mut self, store: &dyn KeyValueStore, task_id: &str, session_id: &str) -> Result<()> {
        if self.get(task_id) == Some(session_id) {
            return Ok(());
        }
        self.links.insert(task_id.to_string(), session_id.to_string());
        save_json(store, &SyncConfig::storage_key(SESSION_LINKS_KEY), &self.links)?;
        Ok(())
    }
}

/// 暂停、恢复、取消和新建下载
///
/// 带外部会话 id 的任务走远端服务，其余交给本地运行时。
/// 每次调用之后快照缓存都会失效。
pub struct DownloadController {
    client: BackendClient,
    runtime: SharedRuntime,
    loader: SnapshotLoader,
    store: Arc<dyn KeyValueStore>,
    emitter: SharedEmitter,
    links: Mutex<SessionLinks>,
}

impl DownloadController {
    pub fn new(
        client: BackendClient,
        runtime: SharedRuntime,
        loader: SnapshotLoader,
        store: Arc<dyn KeyValueStore>,
        emitter: SharedEmitter,
    ) -> Self {
        let links = SessionLinks::load(store.as_ref());
        Self {
            client,
            runtime,
            loader,
            store,
            emitter,
            links: Mutex::new(links),
        }
    }

    fn links(&self) -> MutexGuard<'_, SessionLinks> {
        self.links.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn route(&self, task_id: &str, session_id: Option<&str>) -> ControlRoute {
        let session_id = session_id
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .or_else(|| self.links().get(task_id).map(str::to_string));
        match session_id {
            Some(session_id) => ControlRoute::Remote { session_id },
            None => ControlRoute::Native,
        }
    }

    pub async fn control(
        &self,
        action: ControlAction,
        task_id: &str,
        session_id: Option<&str>,
        token: Option<&str>,
    ) -> Result<()> {
        let route = self.route(task_id, session_id);
        debug!("[{}] {} -> {:?}", task_id, action, route);

        let outcome = match route {
            ControlRoute::Remote { .. } => self.control_remote(action, task_id, token).await,
            ControlRoute::Native => match action {
                ControlAction::Pause => self.runtime.pause(task_id).await,
                ControlAction::Resume => self.runtime.resume(task_id).await,
                ControlAction::Cancel => self.runtime.cancel(task_id).await,
            }
            .map_err(Into::into),
        };
        self.loader.invalidate();
        outcome?;

        info!("[{}] 已发送 {} 命令", task_id, action);
        Ok(())
    }

    async fn control_remote(&self, action: ControlAction, task_id: &str, token: Option<&str>) -> Result<()> {
        let token = require_token(token)?;
        let path = format!(
            "{}/{}/{}",
            REMOTE_TASKS_PATH,
            urlencoding::encode(task_id),
            action.as_str()
        );
        let _: Value = self.client.post(&path, None, Some(token)).await?;
        Ok(())
    }

    /// 在远端创建下载任务并广播开始事件
    pub async fn start_download(&self, game_id: &str, token: Option<&str>) -> Result<RemoteTaskRecord> {
        let token = require_token(token)?;
        let outcome: std::result::Result<RemoteTaskRecord, ApiError> = self
            .client
            .post(REMOTE_TASKS_PATH, Some(json!({ "game_id": game_id })), Some(token))
            .await;
        self.loader.invalidate();
        let record = outcome?;

        if let Some(session_id) = record.session_id.as_deref() {
            self.links().link(self.store.as_ref(), &record.id, session_id)?;
        }

        self.emitter.emit(DownloadEvent::Started {
            id: record.id.clone(),
            title: record.title.clone().unwrap_or_else(|| game_id.to_string()),
            icon_url: record.icon_url.clone(),
        });
        Ok(record)
    }
}

fn require_token(token: Option<&str>) -> Result<&str> {
    token
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ApiError::AuthRequired("远端下载需要登录".to_string()).into())
}
