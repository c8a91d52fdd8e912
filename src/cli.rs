use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use download_sync::SyncConfig;

/// 下载任务同步工具
#[derive(Parser, Debug)]
#[command(name = "dlsync")]
#[command(version)]
#[command(author = "rpeng252@gmail.com")]
#[command(about = "合并远端与本地下载任务，并自动发现可用的后端地址", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// 后端地址，可多次指定或用逗号分隔
    #[arg(long = "api-base", value_name = "URL", global = true, value_delimiter = ',')]
    #[arg(value_hint = clap::ValueHint::Url)]
    pub api_bases: Vec<String>,

    /// 登录令牌
    #[arg(long, env = "DLSYNC_TOKEN", global = true, hide_env_values = true)]
    pub token: Option<String>,

    /// 持久化状态目录
    #[arg(long, value_name = "DIR", default_value = ".dlsync", global = true)]
    #[arg(value_hint = clap::ValueHint::DirPath)]
    pub state_dir: PathBuf,

    /// 轮询间隔（毫秒）
    #[arg(long, value_name = "MS", global = true)]
    pub poll_ms: Option<u64>,

    /// 输出调试日志
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// 探测候选地址并显示首选后端
    Resolve,
    /// 刷新一次并列出下载任务
    List {
        /// 以 JSON 输出
        #[arg(long)]
        json: bool,
    },
    /// 持续轮询并显示进度
    Watch,
    /// 暂停任务
    Pause { id: String },
    /// 恢复任务
    Resume { id: String },
    /// 取消任务
    Cancel { id: String },
    /// 新建下载
    Start { game_id: String },
}

impl Cli {
    /// 环境变量之上叠加命令行参数
    pub fn sync_config(&self) -> SyncConfig {
        let mut config = SyncConfig::from_env().with_api_bases(self.api_bases.clone());
        if let Some(ms) = self.poll_ms.filter(|ms| *ms > 0) {
            config.poll_interval = Duration::from_millis(ms);
        }
        config
    }
}
