use serde::{Deserialize, Serialize};

pub const SPEED_SENTINEL: &str = "0 MB/s";
pub const ETA_SENTINEL: &str = "--";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Downloading,
    Verifying,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Downloading => "downloading",
            Self::Verifying => "verifying",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    // 任意来源的状态字符串都落到封闭集合里，未知值按排队处理
    pub fn parse_lenient(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "downloading" | "active" | "running" | "in_progress" => Self::Downloading,
            "verifying" | "verify" | "validating" => Self::Verifying,
            "paused" => Self::Paused,
            "completed" | "complete" | "done" | "installed" => Self::Completed,
            "failed" | "error" => Self::Failed,
            "cancelled" | "canceled" | "removed" => Self::Cancelled,
            _ => Self::Queued,
        }
    }

    /// 排序优先级，数值越小越靠前
    pub fn priority(&self) -> u8 {
        match self {
            Self::Downloading => 0,
            Self::Verifying => 1,
            Self::Queued => 2,
            Self::Paused => 3,
            Self::Failed => 4,
            Self::Completed => 5,
            Self::Cancelled => 6,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Downloading | Self::Verifying)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 合并后的规范下载任务，直接交给界面使用
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DownloadTask {
    pub id: String,
    pub game_id: String,
    pub game_slug: Option<String>,
    pub app_id: Option<String>,
    pub session_id: Option<String>,
    pub title: String,
    pub image_url: Option<String>,
    pub icon_url: Option<String>,
    pub status: TaskStatus,
    pub progress: f64,
    pub speed: String,
    pub speed_mbps: f64,
    pub eta: String,
    pub eta_minutes: Option<i64>,
    pub downloaded_bytes: Option<i64>,
    pub total_bytes: Option<i64>,
    pub remaining_bytes: Option<i64>,
    pub network_bps: Option<i64>,
    pub disk_read_bps: Option<i64>,
    pub disk_write_bps: Option<i64>,
    pub speed_history: Vec<f64>,
    pub updated_at: i64,
}

impl DownloadTask {
    pub fn new(id: impl Into<String>, game_id: impl Into<String>) -> Self {
        let game_id = game_id.into();
        Self {
            id: id.into(),
            title: game_id.clone(),
            game_id,
            game_slug: None,
            app_id: None,
            session_id: None,
            image_url: None,
            icon_url: None,
            status: TaskStatus::Queued,
            progress: 0.0,
            speed: SPEED_SENTINEL.to_string(),
            speed_mbps: 0.0,
            eta: ETA_SENTINEL.to_string(),
            eta_minutes: None,
            downloaded_bytes: None,
            total_bytes: None,
            remaining_bytes: None,
            network_bps: None,
            disk_read_bps: None,
            disk_write_bps: None,
            speed_history: Vec::new(),
            updated_at: 0,
        }
    }

    /// 任务的全部身份别名：id、gameId、appId、slug
    pub fn aliases(&self) -> Vec<String> {
        let mut aliases = vec![self.id.clone()];
        for alias in [Some(&self.game_id), self.app_id.as_ref(), self.game_slug.as_ref()]
            .into_iter()
            .flatten()
        {
            let alias = alias.trim();
            if !alias.is_empty() && !aliases.iter().any(|a| a == alias) {
                aliases.push(alias.to_string());
            }
        }
        aliases
    }
}

pub fn clamp_progress(value: f64) -> f64 {
    if value.is_nan() {
        return 0.0;
    }
    value.clamp(0.0, 100.0)
}

pub fn format_speed(mbps: f64) -> String {
    if !mbps.is_finite() || mbps <= 0.0 {
        return SPEED_SENTINEL.to_string();
    }
    format!("{:.1} MB/s", mbps)
}

pub fn format_eta(minutes: Option<i64>) -> String {
    match minutes {
        Some(m) if m > 0 => {
            if m >= 60 {
                format!("{}h {}m", m / 60, m % 60)
            } else {
                format!("{}m", m)
            }
        }
        _ => ETA_SENTINEL.to_string(),
    }
}
