use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{debug, info};

use download_sync::common::logger::{PrettyLogger, init_tracing};
use download_sync::downloader::events::TracingEmitter;
use download_sync::downloader::progress::TaskBoard;
use download_sync::{
    DownloadSync, FileStore, NoRuntime, SyncError, SyncState, log_error, log_info, log_step,
    log_success, log_warning,
};

mod cli;

use cli::{Cli, Command};

/// 打印一次刷新的结果
fn print_tasks(sync: &DownloadSync, json: bool) -> Result<()> {
    let tasks = sync.tasks();
    if json {
        println!("{}", serde_json::to_string_pretty(&tasks)?);
        return Ok(());
    }

    match sync.state() {
        SyncState::NoData => log_info!("没有下载任务"),
        SyncState::LoadFailed(reason) => log_error!("加载下载任务失败: {}", reason),
        SyncState::Loading | SyncState::Ready => {
            PrettyLogger::title(format!("{} 个下载任务", tasks.len()));
            for task in &tasks {
                PrettyLogger::task_line(task);
            }
            PrettyLogger::separator();
        }
    }
    Ok(())
}

fn report(action: &str, id: &str, outcome: std::result::Result<(), SyncError>) -> Result<()> {
    match outcome {
        Ok(()) => {
            log_success!("{} {} 成功", action, id);
            Ok(())
        }
        Err(e) if e.is_auth_required() => {
            log_error!("需要登录，请通过 --token 或 DLSYNC_TOKEN 提供令牌");
            Err(e.into())
        }
        Err(e) => {
            log_error!("{} {} 失败: {}", action, id, e);
            Err(e.into())
        }
    }
}

async fn watch(sync: Arc<DownloadSync>) -> Result<()> {
    let handle = sync.spawn_polling();
    let mut board = TaskBoard::new();
    let mut ticker = tokio::time::interval(std::time::Duration::from_millis(300));

    loop {
        tokio::select! {
            _ = ticker.tick() => board.render(&sync.tasks()),
            _ = tokio::signal::ctrl_c() => {
                debug!("收到 Ctrl-C");
                break;
            }
        }
    }

    sync.stop();
    board.finish();
    handle.await.context("等待轮询任务退出失败")?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    // 初始化日志
    init_tracing(args.verbose);

    let config = args.sync_config();
    debug!("配置: {:?}", config);

    let store = Arc::new(
        FileStore::open(&args.state_dir)
            .with_context(|| format!("无法打开状态目录 {:?}", args.state_dir))?,
    );
    let sync = DownloadSync::new(config, store, Arc::new(NoRuntime), Arc::new(TracingEmitter))
        .context("初始化下载同步失败")?;
    sync.set_token(args.token.clone());

    match args.command {
        Command::Resolve => {
            log_step!("探测后端地址");
            let resolver = sync.resolver();
            match resolver.resolve().await {
                Some(base) => {
                    for candidate in resolver.last_candidates() {
                        PrettyLogger::candidate_line(&candidate, candidate.base_url == base);
                    }
                    log_success!("首选后端: {}", base);
                }
                None => log_warning!("没有找到可用的后端地址"),
            }
        }
        Command::List { json } => {
            sync.refresh().await?;
            print_tasks(&sync, json)?;
        }
        Command::Watch => {
            info!("开始轮询下载任务，按 Ctrl-C 退出");
            watch(sync.clone()).await?;
        }
        Command::Pause { id } => {
            // 先刷新一次以拿到任务的会话信息
            sync.refresh().await?;
            report("暂停", &id, sync.pause(&id).await)?;
        }
        Command::Resume { id } => {
            sync.refresh().await?;
            report("恢复", &id, sync.resume(&id).await)?;
        }
        Command::Cancel { id } => {
            sync.refresh().await?;
            report("取消", &id, sync.cancel(&id).await)?;
        }
        Command::Start { game_id } => match sync.start_download(&game_id).await {
            Ok(record) => log_success!("已创建下载任务 {}", record.id),
            Err(e) => {
                log_error!("创建下载失败: {}", e);
                return Err(e.into());
            }
        },
    }

    sync.stop();
    Ok(())
}
