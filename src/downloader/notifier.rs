use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use super::events::{DownloadEvent, EventEmitter};
use super::task::{DownloadTask, TaskStatus};

/// 对比前后两次状态，每次真实的状态迁移只发一次事件
///
/// 失败事件可以被“已处理”标记压制：别的组件已经展示了更具体的错误时，
/// 在窗口期内对任一别名打标记即可。过期标记在每次观察时清理。
#[derive(Debug)]
pub struct TransitionNotifier {
    statuses: HashMap<String, TaskStatus>,
    handled: HashMap<String, Instant>,
    suppress_window: Duration,
}

impl TransitionNotifier {
    pub fn new(suppress_window: Duration) -> Self {
        Self {
            statuses: HashMap::new(),
            handled: HashMap::new(),
            suppress_window,
        }
    }

    pub fn statuses(&self) -> &HashMap<String, TaskStatus> {
        &self.statuses
    }

    pub fn mark_failure_handled<I, S>(&mut self, aliases: I, now: Instant)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for alias in aliases {
            let alias = alias.into();
            if !alias.trim().is_empty() {
                self.handled.insert(alias, now);
            }
        }
    }

    fn is_suppressed(&self, aliases: &[String], now: Instant) -> bool {
        aliases.iter().any(|alias| {
            self.handled
                .get(alias)
                .is_some_and(|at| now.saturating_duration_since(*at) <= self.suppress_window)
        })
    }

    /// 处理新的规范列表，返回本次发出的事件数
    pub fn observe(
        &mut self,
        tasks: &[DownloadTask],
        emitter: &dyn EventEmitter,
        now: Instant,
    ) -> usize {
        let window = self.suppress_window;
        self.handled
            .retain(|_, at| now.saturating_duration_since(*at) <= window);

        let mut next = HashMap::with_capacity(tasks.len());
        let mut emitted = 0;

        for task in tasks {
            next.insert(task.id.clone(), task.status);
            let Some(previous) = self.statuses.get(&task.id).copied() else {
                continue;
            };
            if previous == task.status {
                continue;
            }
            debug!("[{}] 状态变化 {} -> {}", task.id, previous, task.status);

            match task.status {
                TaskStatus::Failed => {
                    if self.is_suppressed(&task.aliases(), now) {
                        debug!("[{}] 失败已由其他组件处理，跳过通知", task.id);
                        continue;
                    }
                    emitter.emit(DownloadEvent::Failed {
                        id: task.id.clone(),
                        message: format!("{} 下载失败", task.title),
                        icon_url: task.icon_url.clone(),
                    });
                    emitted += 1;
                }
                TaskStatus::Completed => {
                    emitter.emit(DownloadEvent::Completed {
                        id: task.id.clone(),
                        title: task.title.clone(),
                        icon_url: task.icon_url.clone(),
                    });
                    emitted += 1;
                }
                _ => {}
            }
        }

        self.statuses = next;
        emitted
    }
}

impl Default for TransitionNotifier {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}
