//! 传输记录文件
//!
//! 全局日志：一次派发中所有任务共享，每次写入都在互斥锁内完成整行写入。
//! 目标日志：每个目标目录下固定的 `rsync_log.txt`，跨多次运行追加，由单个任务独占。

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::warn;

pub const DESTINATION_LOG_NAME: &str = "rsync_log.txt";

/// `rsync_log_<YYYYMMDD_HHMMSS>.txt`
pub fn global_log_file_name(now: DateTime<Local>) -> String {
    format!("rsync_log_{}.txt", now.format("%Y%m%d_%H%M%S"))
}

pub fn job_started_marker(source: &str, dest: &str) -> String {
    format!("--- Sync started: {} -> {} ---", source, dest)
}

pub fn job_finished_marker(dest: &str) -> String {
    format!("--- Sync finished for {} ---", dest)
}

fn write_line_to(writer: &mut BufWriter<File>, line: &str) -> std::io::Result<()> {
    let mut buf = String::with_capacity(line.len() + 1);
    buf.push_str(line.trim_end_matches(['\r', '\n']));
    buf.push('\n');
    writer.write_all(buf.as_bytes())?;
    writer.flush()
}

/// 全局日志句柄，克隆后共享同一个文件
#[derive(Debug, Clone)]
pub struct GlobalLog {
    path: PathBuf,
    file: Arc<Mutex<Option<BufWriter<File>>>>,
}

impl GlobalLog {
    /// 在 `dir`（空则为当前目录）下创建带时间戳的日志并写入开始标记
    pub fn open(dir: &str, source: &str, now: DateTime<Local>) -> Result<Self> {
        let name = global_log_file_name(now);
        let path = if dir.trim().is_empty() {
            PathBuf::from(name)
        } else {
            Path::new(dir).join(name)
        };

        let file = File::create(&path)
            .with_context(|| format!("Failed to open global log file {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        write_line_to(
            &mut writer,
            &format!("--- Global Sync Started for source: {} ---", source),
        )?;

        Ok(Self {
            path,
            file: Arc::new(Mutex::new(Some(writer))),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 整行写入；关闭后的写入被忽略
    pub fn write_line(&self, line: &str) {
        let mut guard = match self.file.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(writer) = guard.as_mut() {
            if let Err(e) = write_line_to(writer, line) {
                warn!("写入全局日志失败 {}: {}", self.path.display(), e);
            }
        }
    }

    /// 写入结束标记并关闭文件
    pub fn close(&self, source: &str, cancelled: bool) {
        let mut guard = match self.file.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(mut writer) = guard.take() {
            let word = if cancelled { "Cancelled" } else { "Finished" };
            let marker = format!("--- Global Sync {} for source: {} ---", word, source);
            let result = write_line_to(&mut writer, &marker).and_then(|_| write_line_to(&mut writer, ""));
            if let Err(e) = result {
                warn!("关闭全局日志失败 {}: {}", self.path.display(), e);
            }
        }
    }
}

/// 目标目录下的日志，由单个任务独占
#[derive(Debug)]
pub struct DestinationLog {
    dest: String,
    writer: BufWriter<File>,
}

impl DestinationLog {
    pub fn open(source: &str, dest: &str) -> Result<Self> {
        let path = Path::new(dest).join(DESTINATION_LOG_NAME);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("cannot open {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        write_line_to(&mut writer, &job_started_marker(source, dest))?;
        Ok(Self {
            dest: dest.to_string(),
            writer,
        })
    }

    pub fn write_line(&mut self, line: &str) {
        if let Err(e) = write_line_to(&mut self.writer, line) {
            warn!("写入目标日志失败 {}: {}", self.dest, e);
        }
    }

    /// 写入结束标记（后跟空行）
    pub fn finish(mut self) {
        let marker = job_finished_marker(&self.dest);
        self.write_line(&marker);
        self.write_line("");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_global_log_file_name() {
        let now = Local.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap();
        assert_eq!(global_log_file_name(now), "rsync_log_20240309_070501.txt");
    }

    #[test]
    fn test_global_log_markers() {
        let dir = tempfile::tempdir().unwrap();
        let log = GlobalLog::open(&dir.path().to_string_lossy(), "/src", Local::now()).unwrap();
        log.write_line(&job_started_marker("/src", "/dst"));
        log.write_line("clip.mov\r");
        log.close("/src", true);
        log.write_line("ignored after close");

        let content = std::fs::read_to_string(log.path()).unwrap();
        assert_eq!(
            content,
            "--- Global Sync Started for source: /src ---\n\
             --- Sync started: /src -> /dst ---\n\
             clip.mov\n\
             --- Global Sync Cancelled for source: /src ---\n\n"
        );
    }

    #[test]
    fn test_destination_log_appends_across_runs() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().to_string_lossy().to_string();

        for _ in 0..2 {
            let mut log = DestinationLog::open("/src", &dest).unwrap();
            log.write_line("sent 10 bytes");
            log.finish();
        }

        let content = std::fs::read_to_string(dir.path().join(DESTINATION_LOG_NAME)).unwrap();
        assert_eq!(content.matches("--- Sync started: /src -> ").count(), 2);
        assert_eq!(content.matches("--- Sync finished for ").count(), 2);
    }

    #[test]
    fn test_destination_log_missing_dir_is_error() {
        assert!(DestinationLog::open("/src", "/definitely/not/a/dir").is_err());
    }

    #[test]
    fn test_concurrent_writes_never_interleave() {
        let dir = tempfile::tempdir().unwrap();
        let log = GlobalLog::open(&dir.path().to_string_lossy(), "/src", Local::now()).unwrap();

        let handles: Vec<_> = ["alpha", "bravo"]
            .into_iter()
            .map(|job| {
                let log = log.clone();
                std::thread::spawn(move || {
                    for i in 0..500 {
                        log.write_line(&format!("{} line {:04} {}", job, i, "x".repeat(200)));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        log.close("/src", false);

        let content = std::fs::read_to_string(log.path()).unwrap();
        let body: Vec<&str> = content
            .lines()
            .filter(|l| !l.is_empty() && !l.starts_with("--- "))
            .collect();
        assert_eq!(body.len(), 1000);
        for line in body {
            let (job, rest) = line.split_once(" line ").unwrap();
            assert!(job == "alpha" || job == "bravo");
            assert_eq!(rest.len(), 4 + 1 + 200);
        }
    }
}
