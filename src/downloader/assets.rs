use lazy_static::lazy_static;
use regex::Regex;
use tokio::time::Instant;

use super::metadata::MetadataCache;
use super::models::DownloadMetadata;
use super::task::DownloadTask;

lazy_static! {
    static ref NUMERIC_ID: Regex = Regex::new(r"^\d+$").unwrap();
    static ref UUID_ID: Regex =
        Regex::new(r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$")
            .unwrap();
    static ref SYNTHETIC_SLUG: Regex =
        Regex::new(r"(?i)^(steam|app|game|dl|download)[-_ ]?\d+$").unwrap();
}

/// 判断一个“标题”是否其实是原始标识符
///
/// 启发式：纯数字、UUID、`steam-123` 一类的合成 slug，或与已知 id 相同。
/// 真实游戏名如果恰好是纯数字也会被误判。
pub fn looks_like_raw_identifier(value: &str, known_ids: &[&str]) -> bool {
    let value = value.trim();
    if value.is_empty() {
        return true;
    }
    NUMERIC_ID.is_match(value)
        || UUID_ID.is_match(value)
        || SYNTHETIC_SLUG.is_match(value)
        || known_ids.iter().any(|id| id.trim().eq_ignore_ascii_case(value))
}

pub fn human_title(value: Option<&str>, known_ids: &[&str]) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !looks_like_raw_identifier(v, known_ids))
        .map(str::to_string)
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

#[derive(Debug, Clone)]
pub struct AssetOptions {
    pub artwork_template: String,
    pub placeholder_image: String,
}

impl AssetOptions {
    pub fn derived_artwork(&self, app_id: Option<&str>) -> Option<String> {
        let app_id = app_id.map(str::trim).filter(|id| NUMERIC_ID.is_match(id))?;
        if self.artwork_template.is_empty() {
            return None;
        }
        Some(self.artwork_template.replace("{app_id}", app_id))
    }
}

// 展示字段的解析顺序：任务自带 -> 缓存命中 -> 由 appId 推导 -> 占位图
// 解析结果写回缓存的全部别名下
pub fn resolve_assets(
    task: &mut DownloadTask,
    cache: &mut MetadataCache,
    options: &AssetOptions,
    now: Instant,
) {
    let cached = cache
        .lookup(&task.aliases(), now)
        .unwrap_or_default();

    if task.app_id.is_none() {
        task.app_id = non_empty(&cached.app_id);
    }
    if task.game_slug.is_none() {
        task.game_slug = non_empty(&cached.game_slug);
    }

    let known_ids = [task.id.as_str(), task.game_id.as_str()];
    let title = human_title(Some(task.title.as_str()), &known_ids)
        .or_else(|| human_title(cached.title.as_deref(), &known_ids));
    if let Some(title) = &title {
        task.title = title.clone();
    } else if task.title.trim().is_empty() {
        task.title = if task.game_id.is_empty() { task.id.clone() } else { task.game_id.clone() };
    }

    let derived = options.derived_artwork(task.app_id.as_deref());
    let real = |value: &Option<String>| {
        non_empty(value).filter(|v| *v != options.placeholder_image)
    };
    let image = real(&task.image_url)
        .or_else(|| real(&cached.image_url))
        .or_else(|| derived.clone());
    let icon = real(&task.icon_url)
        .or_else(|| real(&cached.icon_url))
        .or_else(|| derived.clone());

    // 占位图只用于展示，不写回缓存
    let resolved = DownloadMetadata {
        title,
        game_slug: task.game_slug.clone(),
        app_id: task.app_id.clone(),
        image_url: image.clone(),
        icon_url: icon.clone(),
    };
    cache.remember(&task.aliases(), &resolved);

    task.image_url = Some(image.unwrap_or_else(|| options.placeholder_image.clone()));
    task.icon_url = Some(icon.unwrap_or_else(|| options.placeholder_image.clone()));
}
