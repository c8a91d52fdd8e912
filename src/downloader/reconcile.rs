use std::cmp::Ordering;
use std::collections::HashMap;

use tokio::time::Instant;
use tracing::debug;

use crate::common::config::SyncConfig;

use super::assets::{AssetOptions, human_title, resolve_assets};
use super::metadata::MetadataCache;
use super::models::{DownloadMetadata, LocalAgentRow, RemoteTaskRecord, SourceRecord};
use super::task::{
    DownloadTask, ETA_SENTINEL, SPEED_SENTINEL, TaskStatus, clamp_progress, format_eta,
    format_speed,
};

#[derive(Debug, Clone)]
pub struct MergeOptions {
    pub assets: AssetOptions,
    pub speed_history_limit: usize,
}

impl From<&SyncConfig> for MergeOptions {
    fn from(config: &SyncConfig) -> Self {
        Self {
            assets: AssetOptions {
                artwork_template: config.artwork_template.clone(),
                placeholder_image: config.placeholder_image.clone(),
            },
            speed_history_limit: config.speed_history_limit,
        }
    }
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self::from(&SyncConfig::default())
    }
}

// 以上一轮的规范列表建立的索引
struct PreviousIndex<'a> {
    by_id: HashMap<&'a str, &'a DownloadTask>,
    by_game: HashMap<&'a str, DownloadMetadata>,
    by_app: HashMap<&'a str, DownloadMetadata>,
}

impl<'a> PreviousIndex<'a> {
    fn build(previous: &'a [DownloadTask]) -> Self {
        let mut index = Self {
            by_id: HashMap::new(),
            by_game: HashMap::new(),
            by_app: HashMap::new(),
        };
        for task in previous {
            index.by_id.insert(task.id.as_str(), task);
            let meta = task_metadata(task);
            if !task.game_id.is_empty() {
                index.by_game.entry(task.game_id.as_str()).or_insert_with(|| meta.clone());
            }
            if let Some(app_id) = task.app_id.as_deref() {
                index.by_app.entry(app_id).or_insert(meta);
            }
        }
        index
    }

    fn metadata_for(&self, game_id: &str, app_id: Option<&str>) -> DownloadMetadata {
        let by_game = self.by_game.get(game_id).cloned().unwrap_or_default();
        match app_id.and_then(|id| self.by_app.get(id)) {
            Some(by_app) => by_game.or(by_app),
            None => by_game,
        }
    }
}

fn task_metadata(task: &DownloadTask) -> DownloadMetadata {
    DownloadMetadata {
        title: human_title(Some(task.title.as_str()), &[task.id.as_str(), task.game_id.as_str()]),
        game_slug: task.game_slug.clone(),
        app_id: task.app_id.clone(),
        image_url: task.image_url.clone(),
        icon_url: task.icon_url.clone(),
    }
}

/// 合并远端记录、本地代理行与上一轮规范列表
///
/// 远端先应用，本地遥测后叠加；结果按状态优先级、进度降序、id 排序。
/// 除了传入的元数据缓存之外没有其他状态，任何字段缺失都会退化为默认值。
pub fn merge(
    remote: &[RemoteTaskRecord],
    local: &[LocalAgentRow],
    previous: &[DownloadTask],
    cache: &mut MetadataCache,
    options: &MergeOptions,
    now: Instant,
) -> Vec<DownloadTask> {
    let index = PreviousIndex::build(previous);
    let mut merged: Vec<DownloadTask> = Vec::with_capacity(remote.len() + local.len());
    let mut positions: HashMap<String, usize> = HashMap::new();

    let records = remote
        .iter()
        .map(SourceRecord::Remote)
        .chain(local.iter().map(SourceRecord::Local));

    for record in records {
        let id = record.id();
        if id.is_empty() {
            debug!("跳过缺少 id 的任务记录: {:?}", record);
            continue;
        }

        let existing = positions
            .get(id)
            .map(|&pos| merged[pos].clone())
            .or_else(|| index.by_id.get(id).map(|task| (*task).clone()));

        let task = match record {
            SourceRecord::Remote(r) => apply_remote(r, existing, &index),
            SourceRecord::Local(l) => match existing {
                Some(existing) => apply_local(l, existing, &index, options),
                None => seed_local(l, &index, cache, options),
            },
        };

        match positions.get(id) {
            Some(&pos) => merged[pos] = task,
            None => {
                positions.insert(id.to_string(), merged.len());
                merged.push(task);
            }
        }
    }

    for task in merged.iter_mut() {
        resolve_assets(task, cache, &options.assets, now);
    }

    sort_tasks(&mut merged);
    merged
}

pub fn sort_tasks(tasks: &mut [DownloadTask]) {
    tasks.sort_by(|a, b| {
        a.status
            .priority()
            .cmp(&b.status.priority())
            .then_with(|| b.progress.partial_cmp(&a.progress).unwrap_or(Ordering::Equal))
            .then_with(|| a.id.cmp(&b.id))
    });
}

fn apply_remote(
    record: &RemoteTaskRecord,
    existing: Option<DownloadTask>,
    index: &PreviousIndex<'_>,
) -> DownloadTask {
    let id = record.id.trim();
    let mut task = existing.unwrap_or_else(|| DownloadTask::new(id, record.game_id.clone()));

    if !record.game_id.is_empty() {
        task.game_id = record.game_id.clone();
    }
    if record.app_id.is_some() {
        task.app_id = record.app_id.clone();
    }
    if record.game_slug.is_some() {
        task.game_slug = record.game_slug.clone();
    }
    if record.session_id.is_some() {
        task.session_id = record.session_id.clone();
    }

    // 远端字段优先，但像原始 id 的标题让位于已知的可读标题
    let prior = task_metadata(&task).or(&index.metadata_for(&task.game_id, task.app_id.as_deref()));
    let known_ids = [id, task.game_id.as_str()];
    task.title = human_title(record.title.as_deref(), &known_ids)
        .or_else(|| prior.title.clone())
        .or_else(|| record.title.clone().filter(|t| !t.trim().is_empty()))
        .unwrap_or_else(|| task.title.clone());
    task.image_url = record.image_url.clone().or(prior.image_url);
    task.icon_url = record.icon_url.clone().or(prior.icon_url);

    if let Some(status) = record.status.as_deref() {
        task.status = TaskStatus::parse_lenient(status);
    }
    if let Some(progress) = record.progress {
        task.progress = clamp_progress(progress);
    } else {
        task.progress = clamp_progress(task.progress);
    }

    task.speed_mbps = record.speed_mbps.filter(|v| v.is_finite()).unwrap_or(0.0);
    task.speed = record
        .speed
        .clone()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| match record.speed_mbps {
            Some(mbps) => format_speed(mbps),
            None => SPEED_SENTINEL.to_string(),
        });
    task.eta_minutes = record.eta_minutes;
    task.eta = record
        .eta
        .clone()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| match record.eta_minutes {
            Some(_) => format_eta(record.eta_minutes),
            None => ETA_SENTINEL.to_string(),
        });

    task.downloaded_bytes = record.downloaded_bytes.or(task.downloaded_bytes);
    task.total_bytes = record.total_bytes.or(task.total_bytes);
    if let Some(updated_at) = record.updated_at {
        task.updated_at = updated_at;
    }
    task
}

fn apply_local(
    row: &LocalAgentRow,
    mut task: DownloadTask,
    index: &PreviousIndex<'_>,
    options: &MergeOptions,
) -> DownloadTask {
    let status = TaskStatus::parse_lenient(&row.status);
    let local_progress = clamp_progress(row.progress);

    task.progress = if status.is_active() {
        // 活跃任务的进度只进不退；上一轮也在传输时同样以其为下限
        let previous_floor = index
            .by_id
            .get(task.id.as_str())
            .filter(|prev| prev.status.is_active())
            .map(|prev| prev.progress)
            .unwrap_or(0.0);
        local_progress.max(task.progress).max(previous_floor)
    } else {
        local_progress
    };
    task.status = status;

    if task.game_id.is_empty() {
        task.game_id = row.game_id.clone();
    }
    apply_telemetry(&mut task, row, options);
    task
}

fn seed_local(
    row: &LocalAgentRow,
    index: &PreviousIndex<'_>,
    cache: &mut MetadataCache,
    options: &MergeOptions,
) -> DownloadTask {
    let mut task = DownloadTask::new(row.id.trim(), row.game_id.clone());
    if task.game_id.is_empty() {
        task.title = task.id.clone();
    }

    let meta = cache
        .get(&row.game_id)
        .cloned()
        .unwrap_or_default()
        .or(&index.metadata_for(&row.game_id, None));
    if let Some(title) = meta.title {
        task.title = title;
    }
    task.game_slug = meta.game_slug;
    task.app_id = meta.app_id;
    task.image_url = meta.image_url;
    task.icon_url = meta.icon_url;

    task.status = TaskStatus::parse_lenient(&row.status);
    task.progress = clamp_progress(row.progress);
    apply_telemetry(&mut task, row, options);
    task
}

// 本地行里有的遥测字段一律覆盖，没有的保留原值
fn apply_telemetry(task: &mut DownloadTask, row: &LocalAgentRow, options: &MergeOptions) {
    task.speed_mbps = if row.speed_mbps.is_finite() { row.speed_mbps.max(0.0) } else { 0.0 };
    task.speed = format_speed(task.speed_mbps);
    task.eta_minutes = Some(row.eta_minutes);
    task.eta = format_eta(task.eta_minutes);

    task.downloaded_bytes = row.downloaded_bytes.or(task.downloaded_bytes);
    task.total_bytes = row.total_bytes.or(task.total_bytes);
    task.network_bps = row.network_bps.or(task.network_bps);
    task.disk_read_bps = row.disk_read_bps.or(task.disk_read_bps);
    task.disk_write_bps = row.disk_write_bps.or(task.disk_write_bps);
    task.remaining_bytes = row.remaining_bytes.or_else(|| {
        match (task.total_bytes, task.downloaded_bytes) {
            (Some(total), Some(done)) => Some(total.saturating_sub(done).max(0)),
            _ => task.remaining_bytes,
        }
    });

    if let Some(history) = &row.speed_history {
        let skip = history.len().saturating_sub(options.speed_history_limit);
        task.speed_history = history[skip..].to_vec();
    }
    if let Some(updated_at) = row.updated_at {
        task.updated_at = task.updated_at.max(updated_at);
    }
}
