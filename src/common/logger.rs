use colored::*;

use crate::common::client::models::ConnectivityCandidate;
use crate::downloader::task::{DownloadTask, TaskStatus};

/// 初始化 tracing 输出
pub fn init_tracing(verbose: bool) {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    // 重复初始化（比如测试里）时忽略
    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(verbose)
        .try_init();
}

/// 漂亮的日志输出工具
pub struct PrettyLogger;

impl PrettyLogger {
    /// 显示成功消息
    pub fn success(message: impl AsRef<str>) {
        println!("{} {}", "✓".green().bold(), message.as_ref());
    }

    /// 显示信息消息
    pub fn info(message: impl AsRef<str>) {
        println!("{} {}", "ℹ".blue().bold(), message.as_ref());
    }

    /// 显示警告消息
    pub fn warning(message: impl AsRef<str>) {
        println!("{} {}", "⚠".yellow().bold(), message.as_ref());
    }

    /// 显示错误消息
    pub fn error(message: impl AsRef<str>) {
        eprintln!("{} {}", "✗".red().bold(), message.as_ref());
    }

    /// 显示步骤开始
    pub fn step_start(step: impl AsRef<str>) {
        println!("\n{} {}", "▶".cyan().bold(), step.as_ref().bold());
    }

    /// 显示分割线
    pub fn separator() {
        println!("{}", "─".repeat(50).bright_black());
    }

    /// 显示标题
    pub fn title(text: impl AsRef<str>) {
        let text = text.as_ref();
        let width = text.chars().count().min(48);
        let padding = (48 - width) / 2;
        println!(
            "{} {} {}",
            "─".repeat(padding).bright_black(),
            text.bold(),
            "─".repeat(48 - padding - width).bright_black()
        );
    }

    pub fn status_label(status: TaskStatus) -> ColoredString {
        let label = status.as_str();
        match status {
            TaskStatus::Downloading => label.green().bold(),
            TaskStatus::Verifying => label.cyan().bold(),
            TaskStatus::Queued => label.normal(),
            TaskStatus::Paused => label.yellow(),
            TaskStatus::Failed => label.red().bold(),
            TaskStatus::Completed => label.green(),
            TaskStatus::Cancelled => label.bright_black(),
        }
    }

    /// 显示一行任务
    pub fn task_line(task: &DownloadTask) {
        println!(
            "{} {:<12} {:>6.1}%  {:>10}  {:>7}  {} {}",
            "⬇".blue().bold(),
            Self::status_label(task.status),
            task.progress,
            task.speed,
            task.eta,
            task.title.bold(),
            format!("({})", task.id).bright_black()
        );
    }

    /// 显示候选地址的探测结果
    pub fn candidate_line(candidate: &ConnectivityCandidate, preferred: bool) {
        let marker = if preferred { "★".yellow().bold() } else { " ".normal() };
        let health = if candidate.healthy {
            "healthy".green()
        } else {
            "unhealthy".red()
        };
        let compat = match (candidate.compatible, candidate.observed_limit) {
            (true, Some(limit)) => format!("compatible (limit {})", limit).green(),
            (true, None) => "compatible".green(),
            (false, Some(limit)) => format!("incompatible (limit {})", limit).yellow(),
            (false, None) => "incompatible".yellow(),
        };
        println!("{} {:<32} {:<10} {}", marker, candidate.base_url, health, compat);
    }
}

/// 便捷宏用于漂亮的日志输出
#[macro_export]
macro_rules! log_success {
    ($($arg:tt)*) => {
        $crate::common::logger::PrettyLogger::success(format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::common::logger::PrettyLogger::info(format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_warning {
    ($($arg:tt)*) => {
        $crate::common::logger::PrettyLogger::warning(format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        $crate::common::logger::PrettyLogger::error(format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_step {
    ($($arg:tt)*) => {
        $crate::common::logger::PrettyLogger::step_start(format!($($arg)*))
    };
}
