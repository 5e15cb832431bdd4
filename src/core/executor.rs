//! 传输执行器
//!
//! 状态机：`Pending -> Running -> {Completed, Cancelled, Failed}`，终止状态不再变化，
//! 也不会自动重试。取消是协作式的：每次读取输出或轮询时检查取消令牌，
//! 然后先发送 SIGTERM，宽限期后仍未退出则强制结束。

use crate::config::SyncOptions;
use crate::core::estimator::{SizeEstimate, SizeEstimator};
use crate::core::progress::ProgressTracker;
use crate::core::status::{
    SlotReporter, STATUS_CANCELLED, STATUS_COMPLETED, STATUS_FAILED, STATUS_IN_PROGRESS,
    STATUS_PENDING,
};
use crate::core::strategy::{CommandLine, ProgressSource};
use crate::core::transcript::{job_finished_marker, job_started_marker, DestinationLog, GlobalLog};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Child;
use tokio::time::MissedTickBehavior;
use tokio_stream::StreamExt;
use tokio_util::codec::{AnyDelimiterCodec, FramedRead};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// 任务状态
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Cancelled,
    Failed {
        code: Option<i32>,
        message: String,
    },
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Cancelled | JobState::Failed { .. }
        )
    }

    /// 显示用的状态字符串
    pub fn status_text(&self) -> String {
        match self {
            JobState::Pending => STATUS_PENDING.to_string(),
            JobState::Running => STATUS_IN_PROGRESS.to_string(),
            JobState::Completed => STATUS_COMPLETED.to_string(),
            JobState::Cancelled => STATUS_CANCELLED.to_string(),
            JobState::Failed {
                code: Some(code), ..
            } => format!("{} (code {})", STATUS_FAILED, code),
            JobState::Failed { code: None, .. } => STATUS_FAILED.to_string(),
        }
    }
}

/// 一个源 -> 目标的传输任务，由执行它的工作任务独占
#[derive(Debug, Clone)]
pub struct TransferJob {
    pub index: usize,
    pub source: String,
    pub destination: String,
    pub estimate: Option<SizeEstimate>,
    /// 与所属槽位共享
    pub cancel: CancellationToken,
}

/// 执行器参数
#[derive(Debug, Clone, Copy)]
pub struct ExecutorSettings {
    pub terminate_grace: Duration,
    pub progress_interval: Duration,
    pub poll_interval: Duration,
    pub polling_cap_percent: u8,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self::from(&SyncOptions::default())
    }
}

impl From<&SyncOptions> for ExecutorSettings {
    fn from(options: &SyncOptions) -> Self {
        Self {
            terminate_grace: options.terminate_grace(),
            progress_interval: options.progress_interval(),
            poll_interval: options.poll_interval(),
            polling_cap_percent: options.polling_cap_percent,
        }
    }
}

/// 任务的输出去向：输出流、全局日志、目标日志、状态表
pub struct JobOutput<'a> {
    reporter: &'a SlotReporter,
    index: usize,
    global_log: Option<&'a GlobalLog>,
    dest_log: Option<DestinationLog>,
}

impl<'a> JobOutput<'a> {
    pub fn new(reporter: &'a SlotReporter, index: usize, global_log: Option<&'a GlobalLog>) -> Self {
        Self {
            reporter,
            index,
            global_log,
            dest_log: None,
        }
    }

    /// 打开目标日志；失败只在输出流中报告一次
    pub fn open_destination_log(&mut self, source: &str, dest: &str) {
        match DestinationLog::open(source, dest) {
            Ok(log) => self.dest_log = Some(log),
            Err(e) => {
                warn!("无法打开目标日志: {:#}", e);
                self.message(format!("Destination Logging Error for {}: {:#}", dest, e));
            }
        }
    }

    pub fn job_started(&self, source: &str, dest: &str) {
        if let Some(log) = self.global_log {
            log.write_line(&job_started_marker(source, dest));
        }
    }

    /// 进程输出：写入输出流和所有日志
    pub fn line(&mut self, line: &str) {
        self.reporter.output(line);
        if let Some(log) = self.global_log {
            log.write_line(line);
        }
        if let Some(log) = self.dest_log.as_mut() {
            log.write_line(line);
        }
    }

    /// 引擎自己的消息：只写入输出流
    pub fn message(&self, line: impl Into<String>) {
        self.reporter.output(line);
    }

    pub fn status(&self, status: impl Into<String>) {
        self.reporter.set_status(self.index, status);
    }

    /// 写入结束标记并关闭目标日志
    pub fn finish(mut self, dest: &str) {
        if let Some(log) = self.dest_log.take() {
            log.finish();
        }
        if let Some(log) = self.global_log {
            log.write_line(&job_finished_marker(dest));
        }
    }
}

/// 运行外部传输进程直到终止状态
pub async fn execute(
    command: &CommandLine,
    progress: ProgressSource,
    job: &TransferJob,
    settings: &ExecutorSettings,
    estimator: &SizeEstimator,
    output: &mut JobOutput<'_>,
) -> JobState {
    if job.cancel.is_cancelled() {
        return JobState::Cancelled;
    }

    debug!("执行: {}", command);
    let mut child = match tokio::process::Command::new(&command.program)
        .args(&command.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            return JobState::Failed {
                code: None,
                message: format!("{}: {}", command.program, e),
            }
        }
    };

    let (stdout, stderr) = match (child.stdout.take(), child.stderr.take()) {
        (Some(stdout), Some(stderr)) => (stdout, stderr),
        _ => {
            terminate(&mut child, settings.terminate_grace).await;
            return JobState::Failed {
                code: None,
                message: "process output is not available".to_string(),
            };
        }
    };

    // rsync 用 \r 原地刷新进度，按 \r 和 \n 都切分
    let mut lines = FramedRead::new(stdout, line_codec()).merge(FramedRead::new(stderr, line_codec()));

    let start = Instant::now();
    let mut tracker = ProgressTracker::new(
        job.estimate,
        start,
        settings.progress_interval,
        settings.polling_cap_percent,
    );
    let polling = progress == ProgressSource::Polling;
    let mut ticker = tokio::time::interval(settings.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut streams_open = true;

    loop {
        tokio::select! {
            biased;

            _ = job.cancel.cancelled() => {
                debug!("取消传输: {}", job.destination);
                terminate(&mut child, settings.terminate_grace).await;
                return JobState::Cancelled;
            }

            frame = lines.next(), if streams_open => match frame {
                Some(Ok(bytes)) => {
                    let text = String::from_utf8_lossy(&bytes);
                    let line = text.trim_end();
                    if line.is_empty() {
                        continue;
                    }
                    output.line(line);
                    if !polling {
                        if let Some(status) = tracker.observe_line(line, Instant::now()) {
                            output.status(status);
                        }
                    }
                }
                Some(Err(e)) => warn!("读取进程输出失败: {}", e),
                None => streams_open = false,
            },

            _ = ticker.tick(), if polling && job.estimate.is_some() => {
                // 大目录上 du 可能很慢，查询期间也要响应取消
                let size = tokio::select! {
                    biased;
                    _ = job.cancel.cancelled() => None,
                    size = estimator.directory_size(&job.destination) => size,
                };
                if let Some(size) = size {
                    if let Some(status) = tracker.observe_polled_size(size, Instant::now()) {
                        output.status(status);
                    }
                }
            }

            exit = child.wait(), if !streams_open => {
                return match exit {
                    Ok(status) if status.success() => JobState::Completed,
                    Ok(status) => JobState::Failed {
                        code: status.code(),
                        message: match status.code() {
                            Some(code) => format!("exited with code {}", code),
                            None => "terminated by signal".to_string(),
                        },
                    },
                    Err(e) => JobState::Failed {
                        code: None,
                        message: e.to_string(),
                    },
                };
            }
        }
    }
}

fn line_codec() -> AnyDelimiterCodec {
    AnyDelimiterCodec::new(b"\r\n".to_vec(), b"\n".to_vec())
}

/// 先 SIGTERM，宽限期后强制结束
async fn terminate(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            // SAFETY: pid 属于尚未回收的子进程
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = child.start_kill();
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(_) => {}
        Err(_) => {
            warn!("进程在 {:?} 内未退出，强制结束", grace);
            if let Err(e) = child.kill().await {
                warn!("强制结束进程失败: {}", e);
            }
        }
    }
}
