use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::common::client::ApiError;
use crate::common::runtime::RuntimeError;

// 远端服务返回的任务记录，负责归属/购买语义
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct RemoteTaskRecord {
    #[serde(deserialize_with = "de_string")]
    pub id: String,
    #[serde(default, alias = "gameId", deserialize_with = "de_string")]
    pub game_id: String,
    #[serde(default, alias = "gameSlug", alias = "slug", deserialize_with = "de_opt_string")]
    pub game_slug: Option<String>,
    #[serde(default, alias = "appId", alias = "steam_app_id", deserialize_with = "de_opt_string")]
    pub app_id: Option<String>,
    #[serde(default, alias = "sessionId", deserialize_with = "de_opt_string")]
    pub session_id: Option<String>,
    #[serde(default, alias = "game_title", alias = "name", deserialize_with = "de_opt_string")]
    pub title: Option<String>,
    #[serde(default, alias = "imageUrl", alias = "header_image", deserialize_with = "de_opt_string")]
    pub image_url: Option<String>,
    #[serde(default, alias = "iconUrl", deserialize_with = "de_opt_string")]
    pub icon_url: Option<String>,
    #[serde(default, deserialize_with = "de_opt_string")]
    pub status: Option<String>,
    #[serde(default, deserialize_with = "de_opt_f64")]
    pub progress: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_string")]
    pub speed: Option<String>,
    #[serde(default, alias = "speedMbps", deserialize_with = "de_opt_f64")]
    pub speed_mbps: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_string")]
    pub eta: Option<String>,
    #[serde(default, alias = "etaMinutes", deserialize_with = "de_opt_i64")]
    pub eta_minutes: Option<i64>,
    #[serde(default, alias = "downloadedBytes", deserialize_with = "de_opt_i64")]
    pub downloaded_bytes: Option<i64>,
    #[serde(default, alias = "totalBytes", deserialize_with = "de_opt_i64")]
    pub total_bytes: Option<i64>,
    #[serde(default, alias = "updatedAt", deserialize_with = "de_timestamp")]
    pub updated_at: Option<i64>,
}

// 本地后台代理上报的任务行，负责实时传输遥测
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct LocalAgentRow {
    #[serde(deserialize_with = "de_string")]
    pub id: String,
    #[serde(default, deserialize_with = "de_string")]
    pub game_id: String,
    #[serde(default, deserialize_with = "de_string")]
    pub status: String,
    #[serde(default, deserialize_with = "de_f64")]
    pub progress: f64,
    #[serde(default, deserialize_with = "de_f64")]
    pub speed_mbps: f64,
    #[serde(default, deserialize_with = "de_i64")]
    pub eta_minutes: i64,
    #[serde(default, deserialize_with = "de_opt_i64")]
    pub downloaded_bytes: Option<i64>,
    #[serde(default, deserialize_with = "de_opt_i64")]
    pub total_bytes: Option<i64>,
    #[serde(default, deserialize_with = "de_opt_i64")]
    pub network_bps: Option<i64>,
    #[serde(default, deserialize_with = "de_opt_i64")]
    pub disk_read_bps: Option<i64>,
    #[serde(default, deserialize_with = "de_opt_i64")]
    pub disk_write_bps: Option<i64>,
    #[serde(default, deserialize_with = "de_opt_i64")]
    pub read_bytes: Option<i64>,
    #[serde(default, deserialize_with = "de_opt_i64")]
    pub written_bytes: Option<i64>,
    #[serde(default, deserialize_with = "de_opt_i64")]
    pub remaining_bytes: Option<i64>,
    #[serde(default, deserialize_with = "de_history")]
    pub speed_history: Option<Vec<f64>>,
    #[serde(default, deserialize_with = "de_timestamp")]
    pub updated_at: Option<i64>,
}

/// 两种来源记录的显式标记
#[derive(Debug, Clone, Copy)]
pub enum SourceRecord<'a> {
    Remote(&'a RemoteTaskRecord),
    Local(&'a LocalAgentRow),
}

impl<'a> SourceRecord<'a> {
    pub fn id(&self) -> &'a str {
        match *self {
            SourceRecord::Remote(r) => r.id.trim(),
            SourceRecord::Local(l) => l.id.trim(),
        }
    }
}

/// 用于跨会话回填的展示元数据
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DownloadMetadata {
    pub title: Option<String>,
    pub game_slug: Option<String>,
    pub app_id: Option<String>,
    pub image_url: Option<String>,
    pub icon_url: Option<String>,
}

impl DownloadMetadata {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.game_slug.is_none()
            && self.app_id.is_none()
            && self.image_url.is_none()
            && self.icon_url.is_none()
    }

    // 自身缺失的字段用 other 补齐
    pub fn or(self, other: &DownloadMetadata) -> DownloadMetadata {
        DownloadMetadata {
            title: self.title.or_else(|| other.title.clone()),
            game_slug: self.game_slug.or_else(|| other.game_slug.clone()),
            app_id: self.app_id.or_else(|| other.app_id.clone()),
            image_url: self.image_url.or_else(|| other.image_url.clone()),
            icon_url: self.icon_url.or_else(|| other.icon_url.clone()),
        }
    }
}

/// 两个来源的原始快照
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub remote: Vec<RemoteTaskRecord>,
    pub local: Vec<LocalAgentRow>,
    pub remote_error: Option<ApiError>,
    pub local_error: Option<RuntimeError>,
}

impl Snapshot {
    pub fn is_empty(&self) -> bool {
        self.remote.is_empty() && self.local.is_empty()
    }

    pub fn both_failed(&self) -> bool {
        self.remote_error.is_some() && self.local_error.is_some()
    }
}

fn value_to_string(value: Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let s = s.trim().to_string();
            if s.is_empty() { None } else { Some(s) }
        }
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn de_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    let value = Value::deserialize(deserializer)?;
    Ok(value_to_string(value).unwrap_or_default())
}

fn de_opt_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.and_then(value_to_string))
}

// 数值字段接受整数、小数和数字字符串，读不出来就当缺失
fn value_to_f64(value: &Value) -> Option<f64> {
    let number = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    number.filter(|f| f.is_finite())
}

fn value_to_i64(value: &Value) -> Option<i64> {
    if let Value::Number(n) = value {
        if let Some(i) = n.as_i64() {
            return Some(i);
        }
    }
    if let Value::String(s) = value {
        if let Ok(i) = s.trim().parse::<i64>() {
            return Some(i);
        }
    }
    // 浮点转整数在越界时饱和
    value_to_f64(value).map(|f| f.round() as i64)
}

fn de_opt_f64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<f64>, D::Error> {
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(value_to_f64))
}

fn de_f64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    Ok(de_opt_f64(deserializer)?.unwrap_or_default())
}

fn de_opt_i64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<i64>, D::Error> {
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(value_to_i64))
}

fn de_i64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    Ok(de_opt_i64(deserializer)?.unwrap_or_default())
}

fn de_history<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Vec<f64>>, D::Error> {
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Array(items)) => Some(items.iter().filter_map(value_to_f64).collect()),
        _ => None,
    })
}

// 时间戳既可能是秒数也可能是 RFC3339 字符串
fn de_timestamp<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<i64>, D::Error> {
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Some(Value::String(s)) => chrono::DateTime::parse_from_rfc3339(s.trim())
            .map(|dt| dt.timestamp())
            .ok()
            .or_else(|| {
                chrono::NaiveDateTime::parse_from_str(s.trim(), "%Y-%m-%dT%H:%M:%S%.f")
                    .map(|dt| dt.and_utc().timestamp())
                    .ok()
            }),
        _ => None,
    })
}
