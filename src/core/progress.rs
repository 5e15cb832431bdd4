//! 进度跟踪
//!
//! 两种输入：rsync 的输出行（字节计数模式）或目标目录大小轮询（cp 模式）。
//! 状态字符串每个任务每 `interval` 最多产生一次。

use crate::core::estimator::{parse_grouped, SizeEstimate};
use regex::Regex;
use std::sync::LazyLock;
use std::time::{Duration, Instant};

/// rsync `--progress` 行：`    32,768 100%   31.25MB/s    0:00:00 (xfr#1, to-chk=0/1)`
static PROGRESS_LINE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*([\d,]+)\s+(\d{1,3})%").expect("valid regex"));
static SENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"sent ([\d,]+) bytes").expect("valid regex"));
static PERCENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d{1,3})%").expect("valid regex"));

/// 不是文件名的 rsync 输出
const CHATTER_PREFIXES: &[&str] = &[
    "sending incremental file list",
    "building file list",
    "receiving",
    "sent ",
    "total size",
    "created directory",
    "rsync:",
    "rsync error",
    "Number of",
    "Total ",
    "Literal data",
    "Matched data",
    "File list",
];

const SIZE_UNITS: [&str; 6] = ["B", "KB", "MB", "GB", "TB", "PB"];

/// 1024 进制的可读大小，保留两位小数
pub fn format_size(bytes: f64) -> String {
    if bytes <= 0.0 || !bytes.is_finite() {
        return "0 B".to_string();
    }
    let mut value = bytes;
    let mut exp = 0;
    while value >= 1024.0 && exp < SIZE_UNITS.len() - 1 {
        value /= 1024.0;
        exp += 1;
    }
    if exp == 0 {
        format!("{} B", value.round() as u64)
    } else {
        format!("{:.2} {}", value, SIZE_UNITS[exp])
    }
}

/// `H:MM:SS`，超过一天加 `N day(s), ` 前缀
pub fn format_eta(eta: Duration) -> String {
    let total = eta.as_secs();
    let days = total / 86_400;
    let hours = (total % 86_400) / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;
    let clock = format!("{}:{:02}:{:02}", hours, minutes, seconds);
    match days {
        0 => clock,
        1 => format!("1 day, {}", clock),
        n => format!("{} days, {}", n, clock),
    }
}

/// 某一时刻的总体进度
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSnapshot {
    /// 总大小未知时为 `None`
    pub percent: Option<u8>,
    /// 字节/秒
    pub throughput: f64,
    pub eta: Option<Duration>,
}

impl ProgressSnapshot {
    /// `cap` 是百分比上限：字节计数模式为 100，轮询模式默认 99
    pub fn compute(total: Option<u64>, transferred: u64, elapsed: Duration, cap: u8) -> Self {
        let secs = elapsed.as_secs_f64();
        let throughput = if secs > 0.0 {
            transferred as f64 / secs
        } else {
            0.0
        };

        let percent = total.filter(|t| *t > 0).map(|t| {
            let pct = (transferred as u128 * 100 / t as u128).min(cap as u128);
            pct as u8
        });

        let eta = match (total, percent) {
            (Some(total), Some(pct)) if throughput > 0.0 && pct < cap => {
                let remaining = total.saturating_sub(transferred) as f64;
                Some(Duration::from_secs((remaining / throughput) as u64))
            }
            _ => None,
        };

        Self {
            percent,
            throughput,
            eta,
        }
    }
}

/// 从一行 rsync 输出中识别到的内容
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineKind {
    /// 单文件进度：当前文件已传字节和百分比
    FileProgress { bytes: u64, percent: u8 },
    /// 结束汇总 `sent N bytes`
    Sent(u64),
    /// 其他带百分比的行
    Percent(u8),
    /// 可能是正在传输的文件名
    FileName(String),
    Other,
}

pub fn classify_line(line: &str) -> LineKind {
    if let Some(caps) = PROGRESS_LINE_RE.captures(line) {
        if let (Some(bytes), Ok(percent)) = (parse_grouped(&caps[1]), caps[2].parse::<u8>()) {
            return LineKind::FileProgress {
                bytes,
                percent: percent.min(100),
            };
        }
    }
    if let Some(bytes) = SENT_RE.captures(line).and_then(|caps| parse_grouped(&caps[1])) {
        return LineKind::Sent(bytes);
    }
    if let Some(percent) = PERCENT_RE.captures(line).and_then(|caps| caps[1].parse::<u8>().ok()) {
        return LineKind::Percent(percent.min(100));
    }

    let trimmed = line.trim();
    if trimmed.is_empty()
        || trimmed.ends_with('/')
        || CHATTER_PREFIXES.iter().any(|p| trimmed.starts_with(p))
    {
        return LineKind::Other;
    }
    let name = trimmed.rsplit('/').next().unwrap_or(trimmed);
    LineKind::FileName(name.to_string())
}

/// 单个任务的进度状态
#[derive(Debug)]
pub struct ProgressTracker {
    total: Option<SizeEstimate>,
    start: Instant,
    interval: Duration,
    polling_cap: u8,
    last_emit: Option<Instant>,
    dirty: bool,
    bytes_transferred: u64,
    finished_file_bytes: u64,
    current_file_bytes: u64,
    /// 当前文件已计入 `finished_file_bytes`
    file_done: bool,
    file_percent: Option<u8>,
    current_file: Option<String>,
}

impl ProgressTracker {
    pub fn new(total: Option<SizeEstimate>, start: Instant, interval: Duration, polling_cap: u8) -> Self {
        Self {
            total,
            start,
            interval,
            polling_cap: polling_cap.clamp(1, 100),
            last_emit: None,
            dirty: false,
            bytes_transferred: 0,
            finished_file_bytes: 0,
            current_file_bytes: 0,
            file_done: false,
            file_percent: None,
            current_file: None,
        }
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred
    }

    fn total_bytes(&self) -> Option<u64> {
        self.total.map(|t| t.total_bytes).filter(|t| *t > 0)
    }

    fn advance_to(&mut self, bytes: u64) {
        if bytes > self.bytes_transferred {
            self.bytes_transferred = bytes;
            self.dirty = true;
        }
    }

    /// 处理一行 rsync 输出，到了刷新时间则返回新的状态字符串
    pub fn observe_line(&mut self, line: &str, now: Instant) -> Option<String> {
        match classify_line(line) {
            LineKind::FileProgress { bytes, percent } => {
                if percent >= 100 {
                    // rsync 可能在最终的 (xfr#...) 行之前已打印过一次 100%，每个文件只计一次
                    if !self.file_done {
                        self.finished_file_bytes += bytes;
                        self.file_done = true;
                    }
                    self.current_file_bytes = 0;
                } else {
                    // 新文件的进度从较小的值重新开始
                    if bytes < self.current_file_bytes {
                        self.finished_file_bytes += self.current_file_bytes;
                    }
                    self.current_file_bytes = bytes;
                    self.file_done = false;
                }
                self.file_percent = Some(percent);
                self.dirty = true;
                self.advance_to(self.finished_file_bytes + self.current_file_bytes);
            }
            LineKind::Sent(bytes) => self.advance_to(bytes),
            LineKind::Percent(percent) => {
                self.file_percent = Some(percent);
                self.dirty = true;
            }
            LineKind::FileName(name) => {
                if self.current_file_bytes > 0 {
                    self.finished_file_bytes += self.current_file_bytes;
                    self.current_file_bytes = 0;
                }
                self.current_file = Some(name);
                self.file_done = false;
                self.file_percent = None;
            }
            LineKind::Other => {}
        }
        self.maybe_emit(now, false)
    }

    /// 处理一次目标目录大小轮询
    pub fn observe_polled_size(&mut self, size: u64, now: Instant) -> Option<String> {
        self.advance_to(size);
        self.dirty = true;
        self.maybe_emit(now, true)
    }

    fn maybe_emit(&mut self, now: Instant, polling: bool) -> Option<String> {
        if !self.dirty {
            return None;
        }
        if let Some(last) = self.last_emit {
            if now.saturating_duration_since(last) < self.interval {
                return None;
            }
        }
        self.last_emit = Some(now);
        self.dirty = false;
        Some(self.render(now, polling))
    }

    /// 当前状态字符串
    pub fn render(&self, now: Instant, polling: bool) -> String {
        let cap = if polling { self.polling_cap } else { 100 };
        let elapsed = now.saturating_duration_since(self.start);
        let transferred = self.bytes_transferred;
        let file_part = self.file_percent.map(|pct| {
            let name = self.current_file.as_deref().unwrap_or("current file");
            format!("File: {}% - {}", pct, name)
        });

        let Some(total) = self.total_bytes() else {
            // 总大小未知：不显示任何百分比，只显示已传输字节
            let snapshot = ProgressSnapshot::compute(None, transferred, elapsed, cap);
            let mut status = format!(
                "In Progress - {} transferred - {}/s",
                format_size(transferred as f64),
                format_size(snapshot.throughput)
            );
            if let Some(name) = &self.current_file {
                status.push_str(" - ");
                status.push_str(name);
            }
            return status;
        };

        if transferred == 0 {
            if let Some(file) = file_part {
                return file;
            }
        }

        let snapshot = ProgressSnapshot::compute(Some(total), transferred, elapsed, cap);
        let percent = snapshot.percent.unwrap_or(0);
        let mut status = format!(
            "In Progress ({}%) - {}/{}",
            percent,
            format_size(transferred as f64),
            format_size(total as f64)
        );
        if elapsed > Duration::ZERO {
            status.push_str(&format!(" - {}/s", format_size(snapshot.throughput)));
        }
        if let Some(eta) = snapshot.eta {
            status.push_str(&format!(" - ETA: {}", format_eta(eta)));
        }
        if let Some(file) = file_part {
            status.push_str(" - ");
            status.push_str(&file);
        }
        status
    }
}
