use std::time::Duration;

use itertools::Itertools;
use tracing::warn;

/// 持久化键的统一前缀
pub const STORAGE_PREFIX: &str = "dlsync:";

/// 同步层的全部可调参数
#[derive(Debug, Clone)]
pub struct SyncConfig {
    // 后端地址
    pub api_bases: Vec<String>,
    pub platform_bases: Vec<String>,
    pub health_path: String,
    pub readiness_path: String,
    pub compat_probe_path: String,
    pub min_compatible_limit: u64,

    // 超时与重试
    pub health_timeout: Duration,
    pub request_timeout: Duration,
    pub readiness_attempts: u32,
    pub readiness_delay: Duration,
    pub readiness_ttl: Duration,
    pub retry_prefixes: Vec<String>,
    pub retry_backoff: Duration,

    // 轮询
    pub snapshot_window: Duration,
    pub poll_interval: Duration,
    pub failure_suppress_window: Duration,

    // 元数据缓存
    pub metadata_hit_ttl: Duration,
    pub metadata_miss_ttl: Duration,
    pub speed_history_limit: usize,
    pub artwork_template: String,
    pub placeholder_image: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_bases: Vec::new(),
            platform_bases: default_platform_bases(),
            health_path: "/health".to_string(),
            readiness_path: "/health/ready".to_string(),
            compat_probe_path: "/games?limit=100000".to_string(),
            min_compatible_limit: 200,
            health_timeout: Duration::from_millis(1500),
            request_timeout: Duration::from_secs(10),
            readiness_attempts: 18,
            readiness_delay: Duration::from_millis(250),
            readiness_ttl: Duration::from_secs(15),
            retry_prefixes: ["/downloads", "/games", "/library", "/health"]
                .iter()
                .map(|p| p.to_string())
                .collect(),
            retry_backoff: Duration::from_millis(200),
            snapshot_window: Duration::from_millis(1800),
            poll_interval: Duration::from_millis(1200),
            failure_suppress_window: Duration::from_secs(10),
            metadata_hit_ttl: Duration::from_secs(600),
            metadata_miss_ttl: Duration::from_secs(30),
            speed_history_limit: 48,
            artwork_template:
                "https://cdn.cloudflare.steamstatic.com/steam/apps/{app_id}/header.jpg".to_string(),
            placeholder_image: "/assets/placeholder-cover.png".to_string(),
        }
    }
}

impl SyncConfig {
    // 默认值之上叠加环境变量
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(raw) = std::env::var("DLSYNC_API_BASE") {
            config.api_bases = split_list(&raw);
        }
        if let Ok(raw) = std::env::var("DLSYNC_RETRY_PREFIXES") {
            let prefixes = split_list(&raw);
            if !prefixes.is_empty() {
                config.retry_prefixes = prefixes;
            }
        }
        if let Ok(raw) = std::env::var("DLSYNC_MIN_LIMIT") {
            match raw.trim().parse::<u64>() {
                Ok(limit) => config.min_compatible_limit = limit,
                Err(e) => warn!("忽略无效的 DLSYNC_MIN_LIMIT={}: {}", raw, e),
            }
        }
        if let Ok(raw) = std::env::var("DLSYNC_POLL_MS") {
            match raw.trim().parse::<u64>() {
                Ok(ms) if ms > 0 => config.poll_interval = Duration::from_millis(ms),
                _ => warn!("忽略无效的 DLSYNC_POLL_MS={}", raw),
            }
        }

        config
    }

    pub fn with_api_bases(mut self, bases: Vec<String>) -> Self {
        if !bases.is_empty() {
            self.api_bases = bases;
        }
        self
    }

    /// 路径是否在跨地址重试白名单内
    pub fn is_retry_eligible(&self, path: &str) -> bool {
        let path = path.split('?').next().unwrap_or(path);
        self.retry_prefixes.iter().any(|prefix| {
            path == prefix
                || path
                    .strip_prefix(prefix.as_str())
                    .is_some_and(|rest| rest.starts_with('/'))
        })
    }

    pub fn storage_key(name: &str) -> String {
        format!("{}{}", STORAGE_PREFIX, name)
    }
}

fn default_platform_bases() -> Vec<String> {
    if cfg!(target_os = "windows") {
        // Windows 上 localhost 解析到 IPv6 时常常连不上
        vec!["http://127.0.0.1:8000".to_string()]
    } else {
        vec![
            "http://127.0.0.1:8000".to_string(),
            "http://localhost:8000".to_string(),
        ]
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .unique()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_prefix_matches_whole_segments() {
        let config = SyncConfig::default();
        assert!(config.is_retry_eligible("/downloads"));
        assert!(config.is_retry_eligible("/downloads/abc/pause"));
        assert!(config.is_retry_eligible("/games?limit=5"));
        assert!(!config.is_retry_eligible("/downloadsx"));
        assert!(!config.is_retry_eligible("/auth/login"));
    }

    #[test]
    fn split_list_drops_blanks_and_duplicates() {
        let items = split_list(" http://a:1 ,,http://b:2, http://a:1 ");
        assert_eq!(items, vec!["http://a:1", "http://b:2"]);
    }
}
