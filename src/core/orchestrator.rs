//! 多目标同步编排
//!
//! 一次派发 = 一个源目录 + 最多 `DESTINATION_SLOTS` 个目标。校验通过后才会重置状态表；
//! 同时模式下每个目标一个任务，所有任务结束后才关闭全局日志；顺序模式下取消后
//! 剩余目标标记为 Skipped。

use crate::config::{SyncOptions, ToolPaths};
use crate::core::estimator::SizeEstimator;
use crate::core::executor::{execute, ExecutorSettings, JobOutput, JobState, TransferJob};
use crate::core::progress::format_size;
use crate::core::runner::CommandRunner;
use crate::core::status::{
    is_terminal, SlotReporter, DESTINATION_SLOTS, STATUS_FAILED_ERROR, STATUS_IN_PROGRESS,
    STATUS_SKIPPED,
};
use crate::core::strategy::{Platform, ToolDetector, TransferPreferences, TransferTool};
use crate::core::transcript::GlobalLog;
use crate::error::SyncError;
use chrono::Local;
use std::sync::Arc;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// 一个目标的最终结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobResult {
    pub index: usize,
    pub destination: String,
    pub state: JobState,
    /// 顺序模式下因取消而未启动
    pub skipped: bool,
}

/// 一次派发的汇总
#[derive(Debug, Clone, Default)]
pub struct BatchSummary {
    pub run_id: String,
    pub cancelled: bool,
    pub results: Vec<JobResult>,
}

impl BatchSummary {
    pub fn all_completed(&self) -> bool {
        self.results
            .iter()
            .all(|r| r.state == JobState::Completed)
    }
}

/// 校验源和目标，返回 (槽位下标, 目标) 列表；空白目标被跳过但保留下标
pub fn validate_request(
    source: &str,
    destinations: &[String],
) -> Result<Vec<(usize, String)>, SyncError> {
    if source.trim().is_empty() {
        return Err(SyncError::EmptySource);
    }
    let jobs: Vec<(usize, String)> = destinations
        .iter()
        .take(DESTINATION_SLOTS)
        .enumerate()
        .filter(|(_, dest)| !dest.trim().is_empty())
        .map(|(i, dest)| (i, dest.trim().to_string()))
        .collect();
    if jobs.is_empty() {
        return Err(SyncError::NoDestinations);
    }
    Ok(jobs)
}

/// 外部依赖：命令执行、工具路径、平台
#[derive(Clone)]
pub struct Orchestrator {
    detector: ToolDetector,
    estimator: SizeEstimator,
    tools: ToolPaths,
    platform: Platform,
}

impl Orchestrator {
    pub fn new(runner: Arc<dyn CommandRunner>, tools: ToolPaths, platform: Platform) -> Self {
        Self {
            detector: ToolDetector::new(runner.clone(), tools.clone()),
            estimator: SizeEstimator::new(runner, tools.clone(), platform),
            tools,
            platform,
        }
    }

    /// 校验并重置状态表；失败时状态表保持原样
    pub fn prepare(
        &self,
        reporter: SlotReporter,
        source: &str,
        destinations: &[String],
        options: SyncOptions,
        cancel: CancellationToken,
    ) -> Result<Batch, SyncError> {
        let jobs = validate_request(source, destinations)?;

        let mut active = [false; DESTINATION_SLOTS];
        for (index, _) in &jobs {
            active[*index] = true;
        }
        reporter.reset(&active);

        Ok(Batch {
            orchestrator: self.clone(),
            run_id: Uuid::new_v4(),
            reporter,
            source: source.trim().to_string(),
            jobs,
            options,
            cancel,
        })
    }
}

/// 已校验、待执行的一次派发
pub struct Batch {
    orchestrator: Orchestrator,
    run_id: Uuid,
    reporter: SlotReporter,
    source: String,
    jobs: Vec<(usize, String)>,
    options: SyncOptions,
    cancel: CancellationToken,
}

/// 工作任务共享的只读上下文
struct WorkerContext {
    orchestrator: Orchestrator,
    reporter: SlotReporter,
    source: String,
    options: SyncOptions,
    settings: ExecutorSettings,
    global_log: Option<GlobalLog>,
}

impl Batch {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// 执行所有任务直到终止状态
    pub async fn run(self) -> BatchSummary {
        let span = info_span!("sync", run_id = %self.run_id, slot = %self.reporter.slot());
        self.run_inner().instrument(span).await
    }

    async fn run_inner(self) -> BatchSummary {
        let Batch {
            orchestrator,
            run_id,
            reporter,
            source,
            jobs,
            options,
            cancel,
        } = self;

        info!("开始同步 {}，目标数: {}", source, jobs.len());

        let global_log = if options.global_logging_enabled {
            match GlobalLog::open(&options.global_log_dir, &source, Local::now()) {
                Ok(log) => {
                    debug!("全局日志: {}", log.path().display());
                    Some(log)
                }
                Err(e) => {
                    warn!("打开全局日志失败: {:#}", e);
                    reporter.output(format!("Failed to open global log file: {:#}", e));
                    None
                }
            }
        } else {
            None
        };

        let ctx = Arc::new(WorkerContext {
            orchestrator,
            reporter: reporter.clone(),
            source: source.clone(),
            settings: ExecutorSettings::from(&options),
            options,
            global_log,
        });

        let results = if ctx.options.simultaneous_sync {
            run_simultaneous(&ctx, jobs, &cancel).await
        } else {
            run_sequential(&ctx, jobs, &cancel).await
        };

        let cancelled = cancel.is_cancelled();
        if let Some(log) = &ctx.global_log {
            log.close(&source, cancelled);
            reporter.output(if cancelled {
                "Global sync cancelled, log file closed."
            } else {
                "Global sync complete, log file closed."
            });
        }

        info!("同步结束 {}，已取消: {}", source, cancelled);
        BatchSummary {
            run_id: run_id.to_string(),
            cancelled,
            results,
        }
    }
}

async fn run_simultaneous(
    ctx: &Arc<WorkerContext>,
    jobs: Vec<(usize, String)>,
    cancel: &CancellationToken,
) -> Vec<JobResult> {
    let mut handles = Vec::with_capacity(jobs.len());
    for (index, dest) in &jobs {
        let ctx = ctx.clone();
        let cancel = cancel.clone();
        let dest = dest.clone();
        let index = *index;
        handles.push(tokio::spawn(
            async move { run_destination(&ctx, index, &dest, cancel).await }.in_current_span(),
        ));
    }

    let outcomes = futures::future::join_all(handles).await;

    jobs.into_iter()
        .zip(outcomes)
        .map(|((index, dest), outcome)| {
            let state = settle(&ctx.reporter, index, &dest, outcome);
            JobResult {
                index,
                destination: dest,
                state,
                skipped: false,
            }
        })
        .collect()
}

/// 任务异常退出（panic）时仍给出终止状态
fn settle(
    reporter: &SlotReporter,
    index: usize,
    dest: &str,
    outcome: Result<JobState, JoinError>,
) -> JobState {
    match outcome {
        Ok(state) => state,
        Err(e) => {
            error!("同步任务异常退出 {}: {}", dest, e);
            reporter.output(format!("Error during sync: {}", e));
            fail_unfinished(reporter, index);
            JobState::Failed {
                code: None,
                message: e.to_string(),
            }
        }
    }
}

async fn run_sequential(
    ctx: &Arc<WorkerContext>,
    jobs: Vec<(usize, String)>,
    cancel: &CancellationToken,
) -> Vec<JobResult> {
    let mut results = Vec::with_capacity(jobs.len());
    for (index, dest) in jobs {
        if cancel.is_cancelled() {
            ctx.reporter
                .output(format!("Skipping sync for {} due to cancellation.", dest));
            ctx.reporter.set_status(index, STATUS_SKIPPED);
            results.push(JobResult {
                index,
                destination: dest,
                state: JobState::Cancelled,
                skipped: true,
            });
            continue;
        }

        let worker = {
            let ctx = ctx.clone();
            let cancel = cancel.clone();
            let dest = dest.clone();
            tokio::spawn(
                async move { run_destination(&ctx, index, &dest, cancel).await }.in_current_span(),
            )
        };
        let state = settle(&ctx.reporter, index, &dest, worker.await);
        results.push(JobResult {
            index,
            destination: dest,
            state,
            skipped: false,
        });
    }
    results
}

/// 任务异常退出时，仍未结束的状态改为 `Failed (Error)`
fn fail_unfinished(reporter: &SlotReporter, index: usize) {
    let current = reporter
        .board()
        .snapshot()
        .get(index)
        .cloned()
        .unwrap_or_default();
    if !current.is_empty() && !is_terminal(&current) {
        reporter.set_status(index, STATUS_FAILED_ERROR);
    }
}

/// 单个目标的完整流程：日志、估算、策略、执行、收尾
async fn run_destination(
    ctx: &WorkerContext,
    index: usize,
    dest: &str,
    cancel: CancellationToken,
) -> JobState {
    let reporter = &ctx.reporter;
    let source = ctx.source.as_str();

    reporter.output(format!("Starting sync: {} -> {}", source, dest));
    reporter.set_status(index, STATUS_IN_PROGRESS);

    let mut output = JobOutput::new(reporter, index, ctx.global_log.as_ref());
    if ctx.options.destination_logging_enabled {
        output.open_destination_log(source, dest);
    }
    output.job_started(source, dest);

    let state = transfer(ctx, index, dest, cancel, &mut output).await;

    match &state {
        JobState::Completed => output.message(format!("Sync completed for {}", dest)),
        JobState::Cancelled => output.message(format!("Sync cancelled for {}", dest)),
        JobState::Failed {
            code: Some(code), ..
        } => output.message(format!("Sync failed for {} with code {}", dest, code)),
        JobState::Failed {
            code: None,
            message,
        } => output.message(format!("Execution Error on {}: {}", dest, message)),
        JobState::Pending | JobState::Running => {}
    }
    output.status(state.status_text());
    output.finish(dest);

    debug!("目标 {} 结束: {:?}", dest, state);
    state
}

async fn transfer(
    ctx: &WorkerContext,
    index: usize,
    dest: &str,
    cancel: CancellationToken,
    output: &mut JobOutput<'_>,
) -> JobState {
    if cancel.is_cancelled() {
        return JobState::Cancelled;
    }
    let orchestrator = &ctx.orchestrator;

    output.message("Calculating total size...");
    let estimate = orchestrator.estimator.estimate(&ctx.source, dest).await;
    match estimate {
        Some(estimate) => output.message(format!(
            "Total transfer size: {} in {} files",
            format_size(estimate.total_bytes as f64),
            estimate.total_files
        )),
        None => {
            output.message("Could not calculate total size accurately");
            output.message("Will estimate progress based on individual file transfers instead.");
        }
    }

    let prefs = TransferPreferences::from(&ctx.options);
    let strategy = orchestrator
        .detector
        .resolve(orchestrator.platform, prefs)
        .await;
    for line in strategy.description.iter().chain(&strategy.notices) {
        output.message(line.as_str());
    }
    if strategy.tool == TransferTool::NativeCopy {
        output.status("In Progress - Using native CP command");
    }

    let command = strategy.command(&orchestrator.tools, &ctx.source, dest);
    let job = TransferJob {
        index,
        source: ctx.source.clone(),
        destination: dest.to_string(),
        estimate,
        cancel,
    };
    execute(
        &command,
        strategy.progress_source(),
        &job,
        &ctx.settings,
        &orchestrator.estimator,
        output,
    )
    .await
}
