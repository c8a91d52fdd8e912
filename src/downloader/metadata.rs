use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};

use crate::common::config::SyncConfig;
use crate::common::storage::{KeyValueStore, StoreError, load_json, save_json};

use super::models::DownloadMetadata;

pub const METADATA_KEY: &str = "download_metadata";

/// 身份别名 -> 展示元数据
///
/// 持久层只增不删；会话层记录本次进程解析出的结果，优先级高于持久层。
/// 持久层超过 `hit_ttl` 会从存储重新加载一次，以便看到其他进程的写入；
/// 查不到的别名在 `miss_ttl` 内直接判空，不再逐层查找。
#[derive(Debug)]
pub struct MetadataCache {
    persisted: HashMap<String, DownloadMetadata>,
    session: HashMap<String, DownloadMetadata>,
    misses: HashMap<String, Instant>,
    hit_ttl: Duration,
    miss_ttl: Duration,
    loaded_at: Option<Instant>,
    dirty: bool,
}

impl MetadataCache {
    pub fn new(hit_ttl: Duration, miss_ttl: Duration) -> Self {
        Self {
            persisted: HashMap::new(),
            session: HashMap::new(),
            misses: HashMap::new(),
            hit_ttl,
            miss_ttl,
            loaded_at: None,
            dirty: false,
        }
    }

    pub fn load(store: &dyn KeyValueStore, hit_ttl: Duration, miss_ttl: Duration) -> Self {
        let mut cache = Self::new(hit_ttl, miss_ttl);
        cache.reload(store, Instant::now());
        info!("已加载 {} 条下载元数据缓存", cache.persisted.len());
        cache
    }

    fn reload(&mut self, store: &dyn KeyValueStore, now: Instant) {
        let key = SyncConfig::storage_key(METADATA_KEY);
        if let Some(entries) = load_json::<HashMap<String, DownloadMetadata>>(store, &key) {
            // 其他进程写入的条目并入，不覆盖本会话的结果
            for (alias, meta) in entries {
                self.persisted.insert(alias, meta);
            }
        }
        self.misses.clear();
        self.loaded_at = Some(now);
    }

    // 持久层过期时从存储刷新
    pub fn sync_with_store(&mut self, store: &dyn KeyValueStore, now: Instant) {
        let stale = self
            .loaded_at
            .is_none_or(|at| now.saturating_duration_since(at) >= self.hit_ttl);
        if stale {
            debug!("元数据缓存持久层过期，重新加载");
            self.reload(store, now);
        }
    }

    pub fn persist(&mut self, store: &dyn KeyValueStore) -> Result<(), StoreError> {
        if !self.dirty {
            return Ok(());
        }
        let mut merged = self.persisted.clone();
        merged.extend(self.session.iter().map(|(k, v)| (k.clone(), v.clone())));
        save_json(store, &SyncConfig::storage_key(METADATA_KEY), &merged)?;
        self.persisted = merged;
        self.dirty = false;
        Ok(())
    }

    pub fn get(&self, alias: &str) -> Option<&DownloadMetadata> {
        self.session.get(alias).or_else(|| self.persisted.get(alias))
    }

    /// 按别名顺序查找并合并，先出现的别名字段优先
    pub fn lookup(&mut self, aliases: &[String], now: Instant) -> Option<DownloadMetadata> {
        let mut found: Option<DownloadMetadata> = None;
        let mut missed = Vec::new();

        for alias in aliases {
            if let Some(at) = self.misses.get(alias) {
                if now.saturating_duration_since(*at) < self.miss_ttl {
                    continue;
                }
            }
            match self.get(alias) {
                Some(meta) => {
                    found = Some(match found {
                        Some(acc) => acc.or(meta),
                        None => meta.clone(),
                    });
                }
                None => missed.push(alias.clone()),
            }
        }

        for alias in missed {
            self.misses.insert(alias, now);
        }
        found.filter(|meta| !meta.is_empty())
    }

    /// 在任务的全部别名下写入解析结果
    pub fn remember(&mut self, aliases: &[String], meta: &DownloadMetadata) {
        if meta.is_empty() {
            return;
        }
        for alias in aliases {
            self.misses.remove(alias);
            if self.get(alias) != Some(meta) {
                self.session.insert(alias.clone(), meta.clone());
                self.dirty = true;
            }
        }
    }

    pub fn len(&self) -> usize {
        let mut keys: Vec<&String> = self.persisted.keys().chain(self.session.keys()).collect();
        keys.sort();
        keys.dedup();
        keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MetadataCache {
    fn default() -> Self {
        let config = SyncConfig::default();
        Self::new(config.metadata_hit_ttl, config.metadata_miss_ttl)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::storage::MemoryStore;

    fn meta(title: &str) -> DownloadMetadata {
        DownloadMetadata {
            title: Some(title.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn remembered_metadata_resolves_under_every_alias() {
        let mut cache = MetadataCache::default();
        let aliases = vec!["dl-1".to_string(), "g1".to_string(), "570".to_string()];
        cache.remember(&aliases, &meta("Dota 2"));

        let now = Instant::now();
        let hit = cache.lookup(&["570".to_string()], now).unwrap();
        assert_eq!(hit.title.as_deref(), Some("Dota 2"));
    }

    #[test]
    fn lookup_merges_fields_across_aliases() {
        let mut cache = MetadataCache::default();
        cache.remember(&["g1".to_string()], &meta("Portal"));
        cache.remember(
            &["570".to_string()],
            &DownloadMetadata {
                image_url: Some("https://img/570.jpg".to_string()),
                ..Default::default()
            },
        );

        let hit = cache
            .lookup(&["g1".to_string(), "570".to_string()], Instant::now())
            .unwrap();
        assert_eq!(hit.title.as_deref(), Some("Portal"));
        assert_eq!(hit.image_url.as_deref(), Some("https://img/570.jpg"));
    }

    #[test]
    fn persist_then_load_survives_restart() {
        let store = MemoryStore::new();
        let mut cache = MetadataCache::default();
        cache.remember(&["g1".to_string()], &meta("Hades"));
        cache.persist(&store).unwrap();

        let reloaded = MetadataCache::load(&store, Duration::from_secs(60), Duration::from_secs(5));
        assert_eq!(reloaded.get("g1").and_then(|m| m.title.as_deref()), Some("Hades"));
    }

    #[tokio::test(start_paused = true)]
    async fn misses_expire_after_ttl() {
        let mut cache = MetadataCache::new(Duration::from_secs(600), Duration::from_secs(30));
        let aliases = vec!["g9".to_string()];
        assert!(cache.lookup(&aliases, Instant::now()).is_none());

        // 直接写入持久层，模拟其他进程的写入
        cache.persisted.insert("g9".to_string(), meta("Celeste"));
        assert!(cache.lookup(&aliases, Instant::now()).is_none());

        tokio::time::advance(Duration::from_secs(31)).await;
        let hit = cache.lookup(&aliases, Instant::now()).unwrap();
        assert_eq!(hit.title.as_deref(), Some("Celeste"));
    }
}
