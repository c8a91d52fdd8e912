use std::collections::HashMap;

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

use super::task::DownloadTask;

const BAR_TEMPLATE: &str = "{prefix:>12} [{bar:40.cyan/blue}] {pos:>3}% {msg}";

/// 终端里的下载看板，每个任务一条进度条
pub struct TaskBoard {
    multi_pb: MultiProgress,
    bars: HashMap<String, ProgressBar>,
    style: ProgressStyle,
}

impl TaskBoard {
    pub fn new() -> Self {
        let style = ProgressStyle::with_template(BAR_TEMPLATE)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-");
        Self {
            multi_pb: MultiProgress::new(),
            bars: HashMap::new(),
            style,
        }
    }

    /// 按新的规范列表更新；消失的任务移除进度条
    pub fn render(&mut self, tasks: &[DownloadTask]) {
        self.bars.retain(|id, pb| {
            let keep = tasks.iter().any(|t| &t.id == id);
            if !keep {
                pb.finish_and_clear();
            }
            keep
        });

        for task in tasks {
            let pb = self.bars.entry(task.id.clone()).or_insert_with(|| {
                let pb = self.multi_pb.add(ProgressBar::new(100));
                pb.set_style(self.style.clone());
                pb
            });
            pb.set_prefix(task.status.as_str());
            pb.set_position(task.progress.round() as u64);
            pb.set_message(format!("{}  {}  eta {}", task.title, task.speed, task.eta));
        }
    }

    pub fn finish(&mut self) {
        for (_, pb) in self.bars.drain() {
            pb.abandon();
        }
    }
}

impl Default for TaskBoard {
    fn default() -> Self {
        Self::new()
    }
}
