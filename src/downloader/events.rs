use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tracing::{error, info};

/// 应用级下载事件，交给外部的提示界面消费
#[derive(Debug, Clone, PartialEq)]
pub enum DownloadEvent {
    Started {
        id: String,
        title: String,
        icon_url: Option<String>,
    },
    Failed {
        id: String,
        message: String,
        icon_url: Option<String>,
    },
    Completed {
        id: String,
        title: String,
        icon_url: Option<String>,
    },
}

impl DownloadEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Started { .. } => "download-started",
            Self::Failed { .. } => "download-failed",
            Self::Completed { .. } => "download-completed",
        }
    }

    pub fn task_id(&self) -> &str {
        match self {
            Self::Started { id, .. } | Self::Failed { id, .. } | Self::Completed { id, .. } => id,
        }
    }
}

pub trait EventEmitter: Send + Sync {
    fn emit(&self, event: DownloadEvent);
}

pub type SharedEmitter = Arc<dyn EventEmitter>;

/// 只写日志
#[derive(Debug, Default, Clone)]
pub struct TracingEmitter;

impl EventEmitter for TracingEmitter {
    fn emit(&self, event: DownloadEvent) {
        match &event {
            DownloadEvent::Started { id, title, .. } => info!("[{}] {} 开始下载", id, title),
            DownloadEvent::Completed { id, title, .. } => info!("[{}] {} 下载完成", id, title),
            DownloadEvent::Failed { id, message, .. } => error!("[{}] 下载失败: {}", id, message),
        }
    }
}

/// 广播给任意数量的订阅者，没有订阅者时事件直接丢弃
#[derive(Debug, Clone)]
pub struct ChannelEmitter {
    sender: broadcast::Sender<DownloadEvent>,
}

impl ChannelEmitter {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DownloadEvent> {
        self.sender.subscribe()
    }
}

impl EventEmitter for ChannelEmitter {
    fn emit(&self, event: DownloadEvent) {
        let _ = self.sender.send(event);
    }
}

/// 记录全部事件，测试用
#[derive(Debug, Default)]
pub struct RecordingEmitter {
    events: Mutex<Vec<DownloadEvent>>,
}

impl RecordingEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<DownloadEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl EventEmitter for RecordingEmitter {
    fn emit(&self, event: DownloadEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn channel_emitter_fans_out_to_subscribers() {
        let emitter = ChannelEmitter::new(8);
        let mut rx = emitter.subscribe();

        emitter.emit(DownloadEvent::Completed {
            id: "dl-1".to_string(),
            title: "Hades".to_string(),
            icon_url: None,
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.name(), "download-completed");
        assert_eq!(event.task_id(), "dl-1");
    }

    #[test]
    fn emitting_without_subscribers_is_harmless() {
        let emitter = ChannelEmitter::new(1);
        emitter.emit(DownloadEvent::Started {
            id: "dl-1".to_string(),
            title: "Hades".to_string(),
            icon_url: None,
        });
    }
}
