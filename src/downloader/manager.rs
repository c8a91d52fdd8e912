use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::common::client::{ApiError, BackendClient, ConnectivityResolver};
use crate::common::config::SyncConfig;
use crate::common::runtime::SharedRuntime;
use crate::common::storage::KeyValueStore;

use super::control::{ControlAction, DownloadController};
use super::error::{Result, SyncError};
use super::events::SharedEmitter;
use super::metadata::MetadataCache;
use super::models::{LocalAgentRow, RemoteTaskRecord, Snapshot};
use super::notifier::TransitionNotifier;
use super::reconcile::{MergeOptions, merge};
use super::snapshot::SnapshotLoader;
use super::task::DownloadTask;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncState {
    Loading,
    Ready,
    /// 两个来源都没有任务
    NoData,
    /// 首次加载时两个来源都失败
    LoadFailed(String),
}

struct SyncInner {
    tasks: Vec<DownloadTask>,
    cache: MetadataCache,
    notifier: TransitionNotifier,
    state: SyncState,
    has_data: bool,
    // 单个来源失败时沿用上一次成功的结果
    last_remote: Vec<RemoteTaskRecord>,
    last_local: Vec<LocalAgentRow>,
}

/// 下载列表同步器
///
/// 持有规范列表、元数据缓存和状态通知器。轮询、主动刷新和 token 变化
/// 都经过同一个去重的快照加载器。`stop()` 之后所有在途的刷新都不再生效。
pub struct DownloadSync {
    config: SyncConfig,
    store: Arc<dyn KeyValueStore>,
    resolver: Arc<ConnectivityResolver>,
    loader: SnapshotLoader,
    controller: DownloadController,
    emitter: SharedEmitter,
    options: MergeOptions,
    inner: Mutex<SyncInner>,
    token: watch::Sender<Option<String>>,
    wake: Notify,
    alive: AtomicBool,
}

impl DownloadSync {
    pub fn new(
        config: SyncConfig,
        store: Arc<dyn KeyValueStore>,
        runtime: SharedRuntime,
        emitter: SharedEmitter,
    ) -> Result<Arc<Self>> {
        let resolver = Arc::new(ConnectivityResolver::new(
            config.clone(),
            store.clone(),
            runtime.clone(),
        )?);
        let client = BackendClient::new(config.clone(), resolver.clone())?;
        let loader = SnapshotLoader::new(client.clone(), runtime.clone(), config.snapshot_window);
        let controller = DownloadController::new(
            client,
            runtime,
            loader.clone(),
            store.clone(),
            emitter.clone(),
        );
        let cache = MetadataCache::load(
            store.as_ref(),
            config.metadata_hit_ttl,
            config.metadata_miss_ttl,
        );
        let (token, _) = watch::channel(None);

        Ok(Arc::new(Self {
            options: MergeOptions::from(&config),
            inner: Mutex::new(SyncInner {
                tasks: Vec::new(),
                cache,
                notifier: TransitionNotifier::new(config.failure_suppress_window),
                state: SyncState::Loading,
                has_data: false,
                last_remote: Vec::new(),
                last_local: Vec::new(),
            }),
            config,
            store,
            resolver,
            loader,
            controller,
            emitter,
            token,
            wake: Notify::new(),
            alive: AtomicBool::new(true),
        }))
    }

    fn inner(&self) -> MutexGuard<'_, SyncInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn resolver(&self) -> &Arc<ConnectivityResolver> {
        &self.resolver
    }

    pub fn tasks(&self) -> Vec<DownloadTask> {
        self.inner().tasks.clone()
    }

    pub fn state(&self) -> SyncState {
        self.inner().state.clone()
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn token(&self) -> Option<String> {
        self.token.borrow().clone()
    }

    /// 更换 token 会立即唤醒轮询
    pub fn set_token(&self, token: Option<String>) {
        let token = token.map(|t| t.trim().to_string()).filter(|t| !t.is_empty());
        self.token.send_if_modified(|current| {
            if *current == token {
                return false;
            }
            *current = token;
            true
        });
    }

    /// 页面切回前台等场景调用
    pub fn request_refresh(&self) {
        self.wake.notify_one();
    }

    /// 外部组件已展示更具体的错误时，压制这些别名随后的失败通知
    pub fn mark_failure_handled<I, S>(&self, aliases: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inner().notifier.mark_failure_handled(aliases, Instant::now());
    }

    pub fn stop(&self) {
        if self.alive.swap(false, Ordering::SeqCst) {
            info!("下载同步已停止");
        }
        self.wake.notify_one();
    }

    /// 拉取快照、合并、通知，返回新的规范列表
    pub async fn refresh(&self) -> Result<Vec<DownloadTask>> {
        if !self.is_alive() {
            return Err(SyncError::Stopped);
        }
        let token = self.token();
        let snapshot = self.loader.load(token.as_deref()).await;
        // 等待期间被停止则丢弃结果
        if !self.is_alive() {
            return Err(SyncError::Stopped);
        }
        Ok(self.apply_snapshot(&snapshot, Instant::now()))
    }

    fn apply_snapshot(&self, snapshot: &Snapshot, now: Instant) -> Vec<DownloadTask> {
        let mut guard = self.inner();
        let inner = &mut *guard;

        match &snapshot.remote_error {
            None => inner.last_remote = snapshot.remote.clone(),
            Some(ApiError::AuthRequired(message)) => {
                warn!("远端任务需要重新登录: {}", message);
                inner.last_remote.clear();
            }
            Some(e) => warn!("远端任务加载失败，沿用上次结果: {}", e),
        }
        match &snapshot.local_error {
            None => inner.last_local = snapshot.local.clone(),
            Some(e) => warn!("本地任务加载失败，沿用上次结果: {}", e),
        }

        inner.cache.sync_with_store(self.store.as_ref(), now);
        let merged = merge(
            &inner.last_remote,
            &inner.last_local,
            &inner.tasks,
            &mut inner.cache,
            &self.options,
            now,
        );
        if let Err(e) = inner.cache.persist(self.store.as_ref()) {
            warn!("保存下载元数据失败: {}", e);
        }

        let emitted = inner.notifier.observe(&merged, self.emitter.as_ref(), now);
        if emitted > 0 {
            debug!("本轮发出 {} 个下载事件", emitted);
        }

        inner.state = if !merged.is_empty() {
            inner.has_data = true;
            SyncState::Ready
        } else if inner.has_data {
            SyncState::Ready
        } else if snapshot.both_failed() {
            let reason = [
                snapshot.remote_error.as_ref().map(|e| e.to_string()),
                snapshot.local_error.as_ref().map(|e| e.to_string()),
            ]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join("; ");
            SyncState::LoadFailed(reason)
        } else {
            SyncState::NoData
        };

        inner.tasks = merged.clone();
        merged
    }

    pub async fn pause(&self, id: &str) -> Result<()> {
        self.control(ControlAction::Pause, id).await
    }

    pub async fn resume(&self, id: &str) -> Result<()> {
        self.control(ControlAction::Resume, id).await
    }

    pub async fn cancel(&self, id: &str) -> Result<()> {
        self.control(ControlAction::Cancel, id).await
    }

    async fn control(&self, action: ControlAction, id: &str) -> Result<()> {
        let session_id = self
            .inner()
            .tasks
            .iter()
            .find(|t| t.id == id)
            .and_then(|t| t.session_id.clone());
        let token = self.token();
        let outcome = self
            .controller
            .control(action, id, session_id.as_deref(), token.as_deref())
            .await;
        self.request_refresh();
        outcome
    }

    pub async fn start_download(&self, game_id: &str) -> Result<RemoteTaskRecord> {
        let token = self.token();
        let record = self.controller.start_download(game_id, token.as_deref()).await?;
        self.request_refresh();
        Ok(record)
    }

    /// 启动轮询任务，间隔到期、主动刷新或 token 变化时执行一次刷新
    pub fn spawn_polling(self: &Arc<Self>) -> JoinHandle<()> {
        let sync = Arc::clone(self);
        tokio::spawn(async move {
            let mut token_rx = sync.token.subscribe();
            loop {
                match sync.refresh().await {
                    Ok(_) => {}
                    Err(SyncError::Stopped) => break,
                    Err(e) => warn!("刷新下载列表失败: {}", e),
                }

                tokio::select! {
                    _ = tokio::time::sleep(sync.config.poll_interval) => {}
                    _ = sync.wake.notified() => debug!("收到刷新请求"),
                    changed = token_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        debug!("token 已变化，立即刷新");
                    }
                }
                if !sync.is_alive() {
                    break;
                }
            }
            debug!("轮询任务退出");
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::common::runtime::{NativeRuntime, NoRuntime, RuntimeError};
    use crate::common::storage::MemoryStore;
    use crate::downloader::events::RecordingEmitter;

    #[derive(Default)]
    struct ScriptedRuntime {
        rows: Mutex<Vec<LocalAgentRow>>,
        fail: AtomicBool,
        calls: AtomicUsize,
        paused: Mutex<Vec<String>>,
    }

    impl ScriptedRuntime {
        fn set_rows(&self, rows: Vec<LocalAgentRow>) {
            *self.rows.lock().unwrap() = rows;
        }
    }

    #[async_trait]
    impl NativeRuntime for ScriptedRuntime {
        fn is_available(&self) -> bool {
            true
        }

        async fn resolved_api_base(&self) -> std::result::Result<Option<String>, RuntimeError> {
            Ok(None)
        }

        async fn list_local_tasks(&self) -> std::result::Result<Vec<LocalAgentRow>, RuntimeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(RuntimeError::Command {
                    command: "list".to_string(),
                    message: "agent offline".to_string(),
                });
            }
            Ok(self.rows.lock().unwrap().clone())
        }

        async fn pause(&self, id: &str) -> std::result::Result<(), RuntimeError> {
            self.paused.lock().unwrap().push(id.to_string());
            Ok(())
        }

        async fn resume(&self, _id: &str) -> std::result::Result<(), RuntimeError> {
            Ok(())
        }

        async fn cancel(&self, _id: &str) -> std::result::Result<(), RuntimeError> {
            Ok(())
        }
    }

    fn row(id: &str, status: &str, progress: f64) -> LocalAgentRow {
        LocalAgentRow {
            id: id.to_string(),
            game_id: format!("game-{}", id),
            status: status.to_string(),
            progress,
            ..Default::default()
        }
    }

    fn config() -> SyncConfig {
        let mut config = SyncConfig::default();
        config.platform_bases = Vec::new();
        config
    }

    fn sync_with(runtime: SharedRuntime, emitter: SharedEmitter) -> Arc<DownloadSync> {
        DownloadSync::new(config(), Arc::new(MemoryStore::new()), runtime, emitter).unwrap()
    }

    #[tokio::test]
    async fn empty_sources_report_no_data() {
        let sync = sync_with(Arc::new(NoRuntime), Arc::new(RecordingEmitter::new()));
        assert_eq!(sync.state(), SyncState::Loading);

        let tasks = sync.refresh().await.unwrap();
        assert!(tasks.is_empty());
        assert_eq!(sync.state(), SyncState::NoData);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_local_source_keeps_previous_rows() {
        let runtime = Arc::new(ScriptedRuntime::default());
        runtime.set_rows(vec![row("dl-1", "downloading", 40.0)]);
        let sync = sync_with(runtime.clone(), Arc::new(RecordingEmitter::new()));

        assert_eq!(sync.refresh().await.unwrap().len(), 1);
        assert_eq!(sync.state(), SyncState::Ready);

        runtime.fail.store(true, Ordering::SeqCst);
        tokio::time::advance(Duration::from_secs(2)).await;
        let tasks = sync.refresh().await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].progress, 40.0);
        assert_eq!(runtime.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn completion_emits_once_across_refreshes() {
        let runtime = Arc::new(ScriptedRuntime::default());
        let emitter = Arc::new(RecordingEmitter::new());
        runtime.set_rows(vec![row("dl-1", "downloading", 90.0)]);
        let sync = sync_with(runtime.clone(), emitter.clone());

        sync.refresh().await.unwrap();
        runtime.set_rows(vec![row("dl-1", "completed", 100.0)]);
        tokio::time::advance(Duration::from_secs(2)).await;
        sync.refresh().await.unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;
        sync.refresh().await.unwrap();

        let events = emitter.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name(), "download-completed");
    }

    #[tokio::test]
    async fn stopped_sync_ignores_refresh() {
        let sync = sync_with(Arc::new(NoRuntime), Arc::new(RecordingEmitter::new()));
        sync.stop();
        assert!(matches!(sync.refresh().await, Err(SyncError::Stopped)));
        assert_eq!(sync.state(), SyncState::Loading);
    }

    #[tokio::test(start_paused = true)]
    async fn polling_refreshes_until_stopped() {
        let runtime = Arc::new(ScriptedRuntime::default());
        runtime.set_rows(vec![row("dl-1", "queued", 0.0)]);
        let sync = sync_with(runtime.clone(), Arc::new(RecordingEmitter::new()));

        let handle = sync.spawn_polling();
        tokio::time::sleep(Duration::from_secs(5)).await;
        let calls = runtime.calls.load(Ordering::SeqCst);
        assert!(calls >= 2, "expected several polls, got {}", calls);

        sync.stop();
        handle.await.unwrap();
        let after_stop = runtime.calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(runtime.calls.load(Ordering::SeqCst), after_stop);
    }

    #[tokio::test(start_paused = true)]
    async fn native_tasks_are_paused_through_runtime() {
        let runtime = Arc::new(ScriptedRuntime::default());
        runtime.set_rows(vec![row("dl-1", "downloading", 10.0)]);
        let sync = sync_with(runtime.clone(), Arc::new(RecordingEmitter::new()));
        sync.refresh().await.unwrap();

        sync.pause("dl-1").await.unwrap();
        assert_eq!(*runtime.paused.lock().unwrap(), vec!["dl-1".to_string()]);

        // 控制命令之后快照缓存失效，立即刷新会重新请求
        sync.refresh().await.unwrap();
        assert_eq!(runtime.calls.load(Ordering::SeqCst), 2);
    }
}
