use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::join_all;
use itertools::Itertools;
use reqwest::Client;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

use crate::common::config::SyncConfig;
use crate::common::runtime::SharedRuntime;
use crate::common::storage::KeyValueStore;

use super::error::ApiError;
use super::models::{ConnectivityCandidate, HealthPayload, ReadinessPayload, limit_from_validation_error};

pub const API_BASE_KEY: &str = "api_base";

#[derive(Debug, Default)]
struct ResolverState {
    preferred: Option<String>,
    runtime_base: Option<String>,
    bootstrapped: bool,
    ready_until: Option<Instant>,
    last_candidates: Vec<ConnectivityCandidate>,
}

/// 在候选地址中选出首选后端
///
/// 首选地址只能由解析过程和请求成功回写修改，调用方拿到的都是副本。
pub struct ConnectivityResolver {
    http: Client,
    config: SyncConfig,
    store: Arc<dyn KeyValueStore>,
    runtime: SharedRuntime,
    state: Mutex<ResolverState>,
}

impl ConnectivityResolver {
    pub fn new(
        config: SyncConfig,
        store: Arc<dyn KeyValueStore>,
        runtime: SharedRuntime,
    ) -> Result<Self, ApiError> {
        let http = Client::builder().timeout(config.health_timeout).build()?;
        Ok(Self {
            http,
            config,
            store,
            runtime,
            state: Mutex::new(ResolverState::default()),
        })
    }

    fn state(&self) -> MutexGuard<'_, ResolverState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn preferred_base(&self) -> Option<String> {
        self.state().preferred.clone()
    }

    /// 上一次完整探测的结果
    pub fn last_candidates(&self) -> Vec<ConnectivityCandidate> {
        self.state().last_candidates.clone()
    }

    /// 候选顺序：宿主解析的地址、配置、上次成功的地址、平台默认
    pub fn candidate_bases(&self) -> Vec<String> {
        let runtime_base = self.state().runtime_base.clone();
        let persisted = self.store.get(&SyncConfig::storage_key(API_BASE_KEY));

        runtime_base
            .into_iter()
            .chain(self.config.api_bases.iter().cloned())
            .chain(persisted)
            .chain(self.config.platform_bases.iter().cloned())
            .filter_map(|base| normalize_base(&base))
            .unique()
            .collect()
    }

    // 请求成功后回写首选地址，变化时持久化
    pub(crate) fn record_success(&self, base: &str) {
        let changed = {
            let mut state = self.state();
            if state.preferred.as_deref() == Some(base) {
                false
            } else {
                state.preferred = Some(base.to_string());
                true
            }
        };
        if changed {
            info!("首选后端地址切换为 {}", base);
            if let Err(e) = self.store.set(&SyncConfig::storage_key(API_BASE_KEY), base) {
                warn!("保存后端地址失败: {}", e);
            }
        }
    }

    // 仅首次调用时询问宿主
    async fn bootstrap_from_runtime(&self) -> Option<String> {
        {
            let mut state = self.state();
            if state.bootstrapped {
                return None;
            }
            state.bootstrapped = true;
        }
        if !self.runtime.is_available() {
            return None;
        }

        match self.runtime.resolved_api_base().await {
            Ok(Some(base)) => match normalize_base(&base) {
                Some(base) => {
                    info!("使用宿主解析的后端地址 {}", base);
                    self.state().runtime_base = Some(base.clone());
                    self.record_success(&base);
                    Some(base)
                }
                None => {
                    warn!("宿主返回的后端地址无效: {}", base);
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!("向宿主查询后端地址失败: {}", e);
                None
            }
        }
    }

    /// 解析首选地址
    ///
    /// 当前首选仍然健康且兼容时直接保留，不重新排序；
    /// 没有任何健康候选时保留旧值，不报错。
    pub async fn resolve(&self) -> Option<String> {
        if let Some(base) = self.bootstrap_from_runtime().await {
            return Some(base);
        }

        let (current, runtime_base) = {
            let state = self.state();
            (state.preferred.clone(), state.runtime_base.clone())
        };
        if current.is_some() && current == runtime_base {
            return current;
        }

        let mut known = None;
        if let Some(current) = &current {
            let candidate = self.probe(current).await;
            if candidate.usable() {
                debug!("保留当前首选地址 {}", current);
                return Some(current.clone());
            }
            known = Some(candidate);
        }

        let bases = self.candidate_bases();
        let probes = bases.iter().map(|base| {
            let known = known.clone().filter(|c| &c.base_url == base);
            async move {
                match known {
                    Some(candidate) => candidate,
                    None => self.probe(base).await,
                }
            }
        });
        let candidates = join_all(probes).await;

        let chosen = candidates
            .iter()
            .find(|c| c.usable())
            .or_else(|| {
                let healthy = candidates.iter().find(|c| c.healthy);
                if let Some(c) = healthy {
                    warn!(
                        "没有兼容的后端，退而使用 {} (上限 {:?}，要求至少 {})",
                        c.base_url, c.observed_limit, self.config.min_compatible_limit
                    );
                }
                healthy
            })
            .map(|c| c.base_url.clone());

        self.state().last_candidates = candidates;

        match chosen {
            Some(base) => {
                self.record_success(&base);
                Some(base)
            }
            None => {
                debug!("没有健康的后端地址，保留 {:?}", current);
                current
            }
        }
    }

    /// 探测单个地址的健康和兼容性
    pub async fn probe(&self, base: &str) -> ConnectivityCandidate {
        let Ok(url) = join_url(base, &self.config.health_path) else {
            return ConnectivityCandidate::unhealthy(base);
        };
        let payload = match self.http.get(url).send().await {
            Ok(resp) if resp.status().is_success() => {
                resp.json::<HealthPayload>().await.unwrap_or_default()
            }
            Ok(resp) => {
                debug!("{} 健康检查返回 {}", base, resp.status());
                return ConnectivityCandidate::unhealthy(base);
            }
            Err(e) => {
                debug!("{} 健康检查失败: {}", base, e);
                return ConnectivityCandidate::unhealthy(base);
            }
        };

        let observed_limit = match payload.max_page_size {
            Some(limit) => Some(limit),
            None => self.probe_limit(base).await,
        };
        // 探测不出上限时视为兼容
        let compatible = observed_limit.is_none_or(|limit| limit >= self.config.min_compatible_limit);

        ConnectivityCandidate {
            base_url: base.to_string(),
            healthy: true,
            compatible,
            observed_limit,
        }
    }

    // 故意越界的请求，从校验错误中读出上限；2xx 表示不限
    async fn probe_limit(&self, base: &str) -> Option<u64> {
        let url = join_url(base, &self.config.compat_probe_path).ok()?;
        let resp = self.http.get(url).send().await.ok()?;
        if resp.status().is_success() {
            return None;
        }
        let body = resp.json::<Value>().await.ok()?;
        limit_from_validation_error(&body)
    }

    /// 宿主解析的地址在初始化完成前不接收业务请求
    ///
    /// 有限次轮询就绪状态，成功结果缓存一段时间。耗尽次数后放行并告警。
    pub async fn ensure_ready(&self, base: &str) -> bool {
        {
            let state = self.state();
            if state.runtime_base.as_deref() != Some(base) {
                return true;
            }
            if state.ready_until.is_some_and(|until| Instant::now() < until) {
                return true;
            }
        }

        let Ok(url) = join_url(base, &self.config.readiness_path) else {
            return false;
        };
        for attempt in 1..=self.config.readiness_attempts {
            match self.http.get(url.clone()).send().await {
                Ok(resp) if resp.status().is_success() => {
                    let ready = resp
                        .json::<ReadinessPayload>()
                        .await
                        .map(|p| p.ready)
                        .unwrap_or(false);
                    if ready {
                        self.state().ready_until = Some(Instant::now() + self.config.readiness_ttl);
                        debug!("{} 已就绪 (第 {} 次检查)", base, attempt);
                        return true;
                    }
                }
                Ok(resp) => debug!("{} 就绪检查返回 {}", base, resp.status()),
                Err(e) => debug!("{} 就绪检查失败: {}", base, e),
            }
            if attempt < self.config.readiness_attempts {
                tokio::time::sleep(self.config.readiness_delay).await;
            }
        }

        warn!(
            "{} 在 {} 次检查后仍未就绪，继续发送请求",
            base, self.config.readiness_attempts
        );
        false
    }
}

/// 去掉结尾斜杠，拒绝非 http(s) 地址
pub fn normalize_base(raw: &str) -> Option<String> {
    let trimmed = raw.trim().trim_end_matches('/');
    let url = Url::parse(trimmed).ok()?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return None;
    }
    Some(trimmed.to_string())
}

pub fn join_url(base: &str, path: &str) -> Result<Url, ApiError> {
    let path = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    };
    Ok(Url::parse(&format!("{}{}", base.trim_end_matches('/'), path))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::runtime::NoRuntime;
    use crate::common::storage::MemoryStore;

    fn resolver(config: SyncConfig, store: Arc<MemoryStore>) -> ConnectivityResolver {
        ConnectivityResolver::new(config, store, Arc::new(NoRuntime)).unwrap()
    }

    #[test]
    fn normalize_rejects_garbage_and_trims_slash() {
        assert_eq!(normalize_base(" http://a:1/ ").as_deref(), Some("http://a:1"));
        assert!(normalize_base("ftp://a").is_none());
        assert!(normalize_base("not a url").is_none());
    }

    #[test]
    fn join_url_keeps_base_path_prefix() {
        let url = join_url("http://host:8000/api/", "downloads/1/pause").unwrap();
        assert_eq!(url.as_str(), "http://host:8000/api/downloads/1/pause");
    }

    #[test]
    fn candidates_are_ordered_and_deduplicated() {
        let store = Arc::new(MemoryStore::new());
        store
            .set(&SyncConfig::storage_key(API_BASE_KEY), "http://saved:9000/")
            .unwrap();
        let mut config = SyncConfig::default();
        config.api_bases = vec!["http://configured:1".to_string(), "http://saved:9000".to_string()];
        config.platform_bases = vec!["http://127.0.0.1:8000".to_string()];

        let resolver = resolver(config, store);
        assert_eq!(
            resolver.candidate_bases(),
            vec!["http://configured:1", "http://saved:9000", "http://127.0.0.1:8000"]
        );
    }

    #[test]
    fn record_success_persists_preferred_base() {
        let store = Arc::new(MemoryStore::new());
        let resolver = resolver(SyncConfig::default(), store.clone());
        resolver.record_success("http://b:2");

        assert_eq!(resolver.preferred_base().as_deref(), Some("http://b:2"));
        assert_eq!(
            store.get(&SyncConfig::storage_key(API_BASE_KEY)).as_deref(),
            Some("http://b:2")
        );
    }
}
