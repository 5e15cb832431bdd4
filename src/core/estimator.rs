//! 源目录总大小/文件数估算
//!
//! 优先 `du -sk` + 文件计数；失败时退回 `rsync --stats --dry-run`。两者都失败时
//! 返回 `None`，调用方只显示已传输字节数。

use crate::config::ToolPaths;
use crate::core::runner::CommandRunner;
use crate::core::strategy::Platform;
use regex::Regex;
use std::path::PathBuf;
use std::sync::{Arc, LazyLock};
use tracing::{debug, warn};
use walkdir::WalkDir;

static TOTAL_SIZE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Total file size: ([\d,]+) bytes").expect("valid regex"));
static FILE_COUNT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Number of files: ([\d,]+)").expect("valid regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeEstimate {
    pub total_bytes: u64,
    pub total_files: u64,
}

/// `1,234,567` -> 1234567
pub(crate) fn parse_grouped(digits: &str) -> Option<u64> {
    digits.replace(',', "").parse().ok()
}

/// `du -sk` 输出的第一列（KiB）换算成字节
pub fn parse_du_kib(output: &str) -> Option<u64> {
    output
        .split_whitespace()
        .next()?
        .parse::<u64>()
        .ok()
        .map(|kib| kib * 1024)
}

/// 解析 `rsync --stats` 的总大小和文件数；总大小为 0 视为无效
pub fn parse_rsync_stats(output: &str) -> Option<SizeEstimate> {
    let total_bytes = TOTAL_SIZE_RE
        .captures(output)
        .and_then(|caps| parse_grouped(&caps[1]))?;
    let total_files = FILE_COUNT_RE
        .captures(output)
        .and_then(|caps| parse_grouped(&caps[1]))
        .unwrap_or(0);

    (total_bytes > 0).then_some(SizeEstimate {
        total_bytes,
        total_files,
    })
}

#[derive(Clone)]
pub struct SizeEstimator {
    runner: Arc<dyn CommandRunner>,
    tools: ToolPaths,
    platform: Platform,
}

impl SizeEstimator {
    pub fn new(runner: Arc<dyn CommandRunner>, tools: ToolPaths, platform: Platform) -> Self {
        Self {
            runner,
            tools,
            platform,
        }
    }

    /// 估算源目录；失败返回 `None`（不是错误）
    pub async fn estimate(&self, source: &str, dest: &str) -> Option<SizeEstimate> {
        if self.platform == Platform::Posix {
            match self.disk_usage(source).await {
                Some(total_bytes) => {
                    let total_files = count_files(PathBuf::from(source)).await;
                    return Some(SizeEstimate {
                        total_bytes,
                        total_files,
                    });
                }
                None => debug!("du 估算失败，改用 rsync --stats: {}", source),
            }
        }

        self.dry_run_stats(source, dest).await
    }

    /// 目标目录当前占用，用于 cp 模式的进度轮询
    pub async fn directory_size(&self, path: &str) -> Option<u64> {
        if let Some(size) = self.disk_usage(path).await {
            return Some(size);
        }
        let path = PathBuf::from(path);
        tokio::task::spawn_blocking(move || {
            if !path.exists() {
                return None;
            }
            Some(
                WalkDir::new(&path)
                    .follow_links(false)
                    .into_iter()
                    .filter_map(|e| e.ok())
                    .filter_map(|e| e.metadata().ok())
                    .filter(|m| m.is_file())
                    .map(|m| m.len())
                    .sum(),
            )
        })
        .await
        .ok()
        .flatten()
    }

    async fn disk_usage(&self, path: &str) -> Option<u64> {
        let args = vec!["-sk".to_string(), path.to_string()];
        match self.runner.run(&self.tools.du, &args).await {
            Ok(output) if output.success => parse_du_kib(&output.stdout),
            Ok(output) => {
                debug!("du 退出码 {:?}: {}", output.code, output.stderr.trim());
                None
            }
            Err(e) => {
                debug!("无法执行 du: {}", e);
                None
            }
        }
    }

    async fn dry_run_stats(&self, source: &str, dest: &str) -> Option<SizeEstimate> {
        let args = vec![
            "--stats".to_string(),
            "--dry-run".to_string(),
            "-a".to_string(),
            source.to_string(),
            dest.to_string(),
        ];
        match self.runner.run(&self.tools.rsync, &args).await {
            Ok(output) => {
                let estimate = parse_rsync_stats(&output.stdout);
                if estimate.is_none() {
                    warn!("无法解析 rsync --stats 输出: {}", source);
                }
                estimate
            }
            Err(e) => {
                warn!("无法执行 rsync --stats: {}", e);
                None
            }
        }
    }
}

async fn count_files(root: PathBuf) -> u64 {
    tokio::task::spawn_blocking(move || {
        WalkDir::new(&root)
            .follow_links(false)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .count() as u64
    })
    .await
    .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::runner::testing::ScriptedRunner;

    const STATS: &str = "\
Number of files: 1,342 (reg: 1,200, dir: 142)
Number of created files: 1,342
Total file size: 52,428,800,000 bytes
Total transferred file size: 52,428,800,000 bytes
";

    #[test]
    fn test_parse_du() {
        assert_eq!(parse_du_kib("2048\t/Volumes/A001\n"), Some(2048 * 1024));
        assert_eq!(parse_du_kib("du: cannot access"), None);
        assert_eq!(parse_du_kib(""), None);
    }

    #[test]
    fn test_parse_rsync_stats() {
        let estimate = parse_rsync_stats(STATS).unwrap();
        assert_eq!(estimate.total_bytes, 52_428_800_000);
        assert_eq!(estimate.total_files, 1342);

        assert_eq!(parse_rsync_stats("Total file size: 0 bytes"), None);
        assert_eq!(parse_rsync_stats("rsync error: some files could not be transferred"), None);
    }

    #[tokio::test]
    async fn test_du_preferred_on_posix() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.mov"), b"1234").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/b.mov"), b"5678").unwrap();

        let runner = Arc::new(ScriptedRunner::default().respond("du", true, "8\tsrc\n"));
        let estimator = SizeEstimator::new(runner.clone(), ToolPaths::default(), Platform::Posix);
        let source = dir.path().to_string_lossy().to_string();

        let estimate = estimator.estimate(&source, "/dst").await.unwrap();
        assert_eq!(estimate.total_bytes, 8 * 1024);
        assert_eq!(estimate.total_files, 2);
        assert!(!runner.called("rsync"));
    }

    #[tokio::test]
    async fn test_falls_back_to_dry_run() {
        let runner = Arc::new(
            ScriptedRunner::default()
                .respond("du", false, "")
                .respond("rsync", true, STATS),
        );
        let estimator = SizeEstimator::new(runner, ToolPaths::default(), Platform::Posix);
        let estimate = estimator.estimate("/src", "/dst").await.unwrap();
        assert_eq!(estimate.total_files, 1342);
    }

    #[tokio::test]
    async fn test_unknown_when_everything_fails() {
        let runner = Arc::new(ScriptedRunner::default().respond("rsync", true, "garbage"));
        let estimator = SizeEstimator::new(runner, ToolPaths::default(), Platform::Posix);
        assert_eq!(estimator.estimate("/src", "/dst").await, None);
    }

    #[tokio::test]
    async fn test_directory_size_walks_when_du_missing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("clip.mxf"), vec![0u8; 3000]).unwrap();

        let estimator = SizeEstimator::new(
            Arc::new(ScriptedRunner::default()),
            ToolPaths::default(),
            Platform::Posix,
        );
        let size = estimator
            .directory_size(&dir.path().to_string_lossy())
            .await;
        assert_eq!(size, Some(3000));
        assert_eq!(estimator.directory_size("/definitely/not/here").await, None);
    }
}
