use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use serde::Deserialize;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::common::client::{ApiError, BackendClient};
use crate::common::runtime::{RuntimeError, SharedRuntime};

use super::models::{LocalAgentRow, RemoteTaskRecord, Snapshot};

pub const REMOTE_TASKS_PATH: &str = "/downloads";

type SharedLoad = Shared<BoxFuture<'static, Snapshot>>;

struct CachedSnapshot {
    token: String,
    fetched_at: Instant,
    snapshot: Snapshot,
}

#[derive(Default)]
struct LoaderState {
    last: Option<CachedSnapshot>,
    inflight: Option<(String, u64, SharedLoad)>,
    generation: u64,
}

// 远端列表可能是裸数组，也可能包在 items / downloads 里
#[derive(Deserialize)]
#[serde(untagged)]
enum RemoteList {
    Plain(Vec<Value>),
    Wrapped {
        #[serde(alias = "downloads")]
        items: Vec<Value>,
    },
}

/// 拉取两个来源的原始快照
///
/// 同一个 token 在窗口期内重复调用直接返回缓存；已有请求在途时共享同一个 future。
#[derive(Clone)]
pub struct SnapshotLoader {
    client: BackendClient,
    runtime: SharedRuntime,
    window: Duration,
    state: Arc<Mutex<LoaderState>>,
}

impl SnapshotLoader {
    pub fn new(client: BackendClient, runtime: SharedRuntime, window: Duration) -> Self {
        Self {
            client,
            runtime,
            window,
            state: Arc::new(Mutex::new(LoaderState::default())),
        }
    }

    fn state(&self) -> MutexGuard<'_, LoaderState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub async fn load(&self, token: Option<&str>) -> Snapshot {
        let token = token.map(str::trim).unwrap_or_default().to_string();

        let load = {
            let mut state = self.state();
            if let Some(cached) = &state.last {
                if cached.token == token && cached.fetched_at.elapsed() < self.window {
                    debug!("窗口期内复用上一次快照");
                    return cached.snapshot.clone();
                }
            }
            let shared = state
                .inflight
                .as_ref()
                .filter(|(inflight_token, _, _)| *inflight_token == token)
                .map(|(_, _, load)| load.clone());
            match shared {
                Some(load) => load,
                None => {
                    let generation = state.generation;
                    let load = self.start_load(token.clone(), generation);
                    state.inflight = Some((token.clone(), generation, load.clone()));
                    load
                }
            }
        };

        load.await
    }

    fn start_load(&self, token: String, generation: u64) -> SharedLoad {
        let client = self.client.clone();
        let runtime = self.runtime.clone();
        let state = self.state.clone();

        async move {
            let (remote, local) = tokio::join!(
                fetch_remote(&client, &token),
                fetch_local(&runtime)
            );
            let mut snapshot = Snapshot::default();
            match remote {
                Ok(records) => snapshot.remote = records,
                Err(e) => snapshot.remote_error = Some(e),
            }
            match local {
                Ok(rows) => snapshot.local = rows,
                Err(e) => snapshot.local_error = Some(e),
            }

            let mut guard = state.lock().unwrap_or_else(PoisonError::into_inner);
            // 失效之后完成的请求不写回缓存
            if guard.generation == generation {
                guard.last = Some(CachedSnapshot {
                    token: token.clone(),
                    fetched_at: Instant::now(),
                    snapshot: snapshot.clone(),
                });
            }
            if guard
                .inflight
                .as_ref()
                .is_some_and(|(t, g, _)| *t == token && *g == generation)
            {
                guard.inflight = None;
            }
            drop(guard);
            snapshot
        }
        .boxed()
        .shared()
    }

    /// 控制命令之后调用，下一次加载一定会重新请求
    pub fn invalidate(&self) {
        let mut state = self.state();
        state.last = None;
        state.inflight = None;
        state.generation += 1;
    }
}

async fn fetch_remote(client: &BackendClient, token: &str) -> Result<Vec<RemoteTaskRecord>, ApiError> {
    // 没有 token 不发请求
    if token.is_empty() {
        return Ok(Vec::new());
    }
    let list: RemoteList = client.get(REMOTE_TASKS_PATH, Some(token)).await?;
    let items = match list {
        RemoteList::Plain(items) | RemoteList::Wrapped { items } => items,
    };
    Ok(items
        .into_iter()
        .filter_map(|item| match serde_json::from_value::<RemoteTaskRecord>(item) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!("跳过无法解析的远端任务记录: {}", e);
                None
            }
        })
        .collect())
}

async fn fetch_local(runtime: &SharedRuntime) -> Result<Vec<LocalAgentRow>, RuntimeError> {
    if !runtime.is_available() {
        return Ok(Vec::new());
    }
    runtime.list_local_tasks().await
}
