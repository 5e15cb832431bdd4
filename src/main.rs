use anyhow::{bail, Context, Result};
use clap::Parser;
use ditsync_lib::cli::{Cli, Command, SlotArgs};
use ditsync_lib::config::SyncSettings;
use ditsync_lib::core::render_status_lines;
use ditsync_lib::logging::{get_log_dir, LogConfig, RotatingFile};
use ditsync_lib::{app_config_dir, SlotId, SyncEvent, SyncSessionManager};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;

/// 显示层轮询事件通道的间隔
const DISPLAY_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// 初始化日志系统；返回的 guard 需要保持到进程结束
fn init_logging(config_dir: &Path) -> Option<WorkerGuard> {
    let config = LogConfig::load(config_dir);
    if !config.enabled {
        let _ = tracing::subscriber::set_global_default(tracing_subscriber::registry());
        return None;
    }

    let env_filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(config.tracing_level().into())
        .from_env_lossy();

    let file = match RotatingFile::open(&get_log_dir(config_dir), config.max_size_bytes()) {
        Ok(file) => file,
        Err(e) => {
            eprintln!("无法创建日志文件: {}", e);
            #[cfg(debug_assertions)]
            {
                let _ = tracing_subscriber::fmt()
                    .with_env_filter(env_filter)
                    .with_writer(std::io::stderr)
                    .try_init();
            }
            return None;
        }
    };
    let (writer, guard) = tracing_appender::non_blocking(file);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false);

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer);

    // debug 构建同时输出到 stderr
    #[cfg(debug_assertions)]
    let _ = tracing::subscriber::set_global_default(
        subscriber.with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        ),
    );
    #[cfg(not(debug_assertions))]
    let _ = tracing::subscriber::set_global_default(subscriber);

    Some(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_dir = cli.config_dir.clone().unwrap_or_else(app_config_dir);
    std::fs::create_dir_all(&config_dir)
        .with_context(|| format!("cannot create {}", config_dir.display()))?;
    let _guard = init_logging(&config_dir);

    tracing::info!("ditsync v{} 启动", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Command::Run(args) => run(&args, &config_dir).await,
        Command::Template { output } => match output {
            Some(path) => {
                let written = SyncSettings::template().save(&path)?;
                println!("Template written to {}", written.display());
                Ok(())
            }
            None => {
                println!("{}", serde_json::to_string_pretty(&SyncSettings::template())?);
                Ok(())
            }
        },
        Command::SaveSettings {
            slot,
            output,
            remember,
        } => {
            let (settings, _) = slot.resolve(&config_dir)?;
            let written = settings.save(&output)?;
            if remember {
                settings.options.save(&config_dir)?;
            }
            println!("Settings saved to {}", written.display());
            Ok(())
        }
        Command::LogConfig {
            enabled,
            max_size_mb,
            level,
        } => {
            let mut config = LogConfig::load(&config_dir);
            if enabled.is_some() || max_size_mb.is_some() || level.is_some() {
                config.update(enabled, max_size_mb, level.as_deref())?;
                config.save(&config_dir)?;
            }
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

async fn run(args: &SlotArgs, config_dir: &Path) -> Result<()> {
    let (settings, slots) = args.resolve(config_dir)?;
    let (manager, mut events) =
        SyncSessionManager::new(settings.options.clone(), settings.tools.clone());
    let manager = Arc::new(manager);

    let mut handles = Vec::new();
    let mut running = HashSet::new();
    for slot in slots {
        let (source, destinations) = settings.slot(slot);
        match manager.start(slot, source, destinations).await {
            Ok(handle) => {
                handles.push(handle);
                running.insert(slot);
            }
            Err(e) => eprintln!("Sync Option {}: {}", slot, e),
        }
    }
    if handles.is_empty() {
        bail!("nothing to sync");
    }
    let multi_slot = handles.len() > 1;

    let canceller = manager.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            canceller.cancel_all();
        }
    });

    display_until_finished(&mut events, running, |event| print_event(event, multi_slot)).await;

    let mut failed = false;
    for handle in handles {
        let summary = handle.await.context("sync task panicked")?;
        failed |= !summary.all_completed();
    }

    for slot in SlotId::ALL {
        let lines = render_status_lines(&manager.statuses(slot));
        if lines.is_empty() {
            continue;
        }
        println!("Sync Option {}:", slot);
        for line in lines {
            println!("  {}", line);
        }
    }

    if failed {
        bail!("not every destination completed");
    }
    Ok(())
}

/// 按固定间隔取出事件，直到每个已启动的槽位都发出 Finished
async fn display_until_finished(
    events: &mut UnboundedReceiver<SyncEvent>,
    mut running: HashSet<SlotId>,
    mut on_event: impl FnMut(&SyncEvent),
) {
    let mut ticker = tokio::time::interval(DISPLAY_POLL_INTERVAL);
    loop {
        ticker.tick().await;
        loop {
            match events.try_recv() {
                Ok(event) => {
                    if let SyncEvent::Finished { slot } = &event {
                        running.remove(slot);
                    }
                    on_event(&event);
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => return,
            }
        }
        if running.is_empty() {
            return;
        }
    }
}

fn print_event(event: &SyncEvent, multi_slot: bool) {
    let prefix = |slot: &SlotId| {
        if multi_slot {
            format!("[{}] ", slot)
        } else {
            String::new()
        }
    };
    match event {
        SyncEvent::Output { slot, line } => println!("{}{}", prefix(slot), line),
        SyncEvent::Status {
            slot,
            index,
            status,
        } if !status.is_empty() => println!("{}Dir {} {}", prefix(slot), index + 1, status),
        _ => {}
    }
}
