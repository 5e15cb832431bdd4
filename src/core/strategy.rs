//! 传输策略选择
//!
//! `select_strategy` 是纯函数：平台、rsync 版本探测结果、用户偏好和优先级探测结果
//! 决定最终的命令参数。外部探测由 `ToolDetector` 完成，探测失败只会降级，不会报错。

use crate::config::{SyncOptions, ToolPaths};
use crate::core::runner::CommandRunner;
use regex::Regex;
use std::fmt;
use std::sync::{Arc, LazyLock};
use tracing::debug;

static VERSION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"version (\d+)\.(\d+)\.(\d+)").expect("valid regex"));

/// 快速模式的块大小参数
const FAST_BLOCK_SIZE: &str = "--block-size=32768";

/// 运行平台
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Posix,
    Windows,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(unix) {
            Platform::Posix
        } else {
            Platform::Windows
        }
    }

    /// 是否有 `cp -R`
    pub fn supports_native_copy(self) -> bool {
        self == Platform::Posix
    }

    /// 是否有 `nice`
    pub fn supports_priority(self) -> bool {
        self == Platform::Posix
    }
}

/// rsync 版本号
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ToolVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl ToolVersion {
    pub fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// 从 `rsync --version` 的输出中解析版本号
    pub fn parse(output: &str) -> Option<Self> {
        let caps = VERSION_RE.captures(output)?;
        Some(Self {
            major: caps[1].parse().ok()?,
            minor: caps[2].parse().ok()?,
            patch: caps[3].parse().ok()?,
        })
    }

    pub fn capabilities(self) -> Capabilities {
        Capabilities {
            supports_modern_flags: self.major >= 3,
            supports_checksum_choice: self >= ToolVersion::new(3, 2, 0),
        }
    }
}

impl fmt::Display for ToolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// 按版本推断的 rsync 能力
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    /// 3.0+：`--no-checksum` / `--no-times` / `--block-size` 组合可用
    pub supports_modern_flags: bool,
    /// 3.2.0+：`--checksum-choice=xxh64`
    pub supports_checksum_choice: bool,
}

/// 版本探测结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionDetection {
    Detected(ToolVersion),
    /// 能运行但输出里没有版本号
    Unparseable,
    /// 无法运行（未安装、无权限等）
    Failed(String),
}

/// 优先级提升探测结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PriorityProbe {
    Permitted,
    Denied,
    Unavailable(String),
}

/// 用户偏好
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransferPreferences {
    pub prefer_native_copy: bool,
    pub fast_mode: bool,
    pub use_checksum_verification: bool,
    pub higher_priority: bool,
}

impl From<&SyncOptions> for TransferPreferences {
    fn from(options: &SyncOptions) -> Self {
        Self {
            prefer_native_copy: options.native_copy,
            fast_mode: options.fast_sync,
            use_checksum_verification: options.checksum_verification,
            higher_priority: options.higher_priority,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferTool {
    Rsync,
    NativeCopy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumMode {
    Disabled,
    /// rsync 默认算法（MD5 或 MD4，取决于版本）
    Default,
    Xxh64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorityAdjustment {
    None,
    /// `nice -n -10`
    High,
    /// `nice -n 10`
    Low,
}

impl PriorityAdjustment {
    fn nice_args(self) -> Option<[&'static str; 2]> {
        match self {
            PriorityAdjustment::None => None,
            PriorityAdjustment::High => Some(["-n", "-10"]),
            PriorityAdjustment::Low => Some(["-n", "10"]),
        }
    }
}

/// 进度来源
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressSource {
    /// 解析 rsync 输出
    ByteCount,
    /// 轮询目标目录大小
    Polling,
}

/// 最终要执行的程序和参数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: String,
    pub args: Vec<String>,
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// 传输策略，每个任务执行前计算一次，之后不再修改
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferStrategy {
    pub tool: TransferTool,
    /// 工具参数（不含源和目标）
    pub flags: Vec<String>,
    pub checksum: ChecksumMode,
    pub priority: PriorityAdjustment,
    /// 所选模式的说明，写入输出流
    pub description: Vec<String>,
    /// 降级/替代提示，每次替代一条
    pub notices: Vec<String>,
}

impl TransferStrategy {
    pub fn progress_source(&self) -> ProgressSource {
        match self.tool {
            TransferTool::Rsync => ProgressSource::ByteCount,
            TransferTool::NativeCopy => ProgressSource::Polling,
        }
    }

    /// 拼出完整命令，必要时套上 nice
    pub fn command(&self, tools: &ToolPaths, source: &str, dest: &str) -> CommandLine {
        let program = match self.tool {
            TransferTool::Rsync => tools.rsync.clone(),
            TransferTool::NativeCopy => tools.cp.clone(),
        };
        let mut args = self.flags.clone();
        args.push(source.to_string());
        args.push(dest.to_string());

        match self.priority.nice_args() {
            Some(nice) => {
                let mut wrapped: Vec<String> = nice.iter().map(|s| s.to_string()).collect();
                wrapped.push(program);
                wrapped.extend(args);
                CommandLine {
                    program: tools.nice.clone(),
                    args: wrapped,
                }
            }
            None => CommandLine { program, args },
        }
    }
}

fn flags(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

/// 根据环境和偏好选择传输策略；永不失败
pub fn select_strategy(
    platform: Platform,
    version: &VersionDetection,
    prefs: TransferPreferences,
    priority: Option<&PriorityProbe>,
) -> TransferStrategy {
    let mut strategy = if prefs.prefer_native_copy && platform.supports_native_copy() {
        native_copy_strategy(prefs)
    } else {
        let mut strategy = rsync_strategy(version, prefs);
        if prefs.prefer_native_copy {
            strategy.notices.insert(
                0,
                "Native copy is not available on this platform; using rsync instead.".to_string(),
            );
        }
        strategy
    };

    if prefs.higher_priority && platform.supports_priority() {
        match priority {
            Some(PriorityProbe::Permitted) => {
                strategy.priority = PriorityAdjustment::High;
                strategy
                    .description
                    .push("Using higher process priority...".to_string());
            }
            Some(PriorityProbe::Denied) => {
                strategy.priority = PriorityAdjustment::Low;
                strategy.notices.push(
                    "Using standard process priority (requires admin privileges for high priority)..."
                        .to_string(),
                );
            }
            Some(PriorityProbe::Unavailable(e)) => {
                strategy.notices.push(format!(
                    "Could not adjust process priority: {}. Continuing without priority adjustment.",
                    e
                ));
            }
            None => {}
        }
    }

    strategy
}

fn native_copy_strategy(prefs: TransferPreferences) -> TransferStrategy {
    let mut notices = Vec::new();
    if prefs.use_checksum_verification {
        notices.push(
            "Checksum verification is not available with native copy; files are copied without verification."
                .to_string(),
        );
    }
    TransferStrategy {
        tool: TransferTool::NativeCopy,
        flags: flags(&["-R"]),
        checksum: ChecksumMode::Disabled,
        priority: PriorityAdjustment::None,
        description: vec![
            "Using native CP command for maximum speed...".to_string(),
            "Native copy reports no progress stream; progress is estimated from destination size."
                .to_string(),
        ],
        notices,
    }
}

fn rsync_strategy(version: &VersionDetection, prefs: TransferPreferences) -> TransferStrategy {
    let mut strategy = TransferStrategy {
        tool: TransferTool::Rsync,
        flags: flags(&["-a", "--progress"]),
        checksum: ChecksumMode::Disabled,
        priority: PriorityAdjustment::None,
        description: Vec::new(),
        notices: Vec::new(),
    };

    let version = match version {
        VersionDetection::Detected(v) => *v,
        VersionDetection::Unparseable => {
            strategy.notices.push(
                "Could not detect rsync version; using basic rsync command (compatible with all versions)..."
                    .to_string(),
            );
            apply_default_checksum(&mut strategy, prefs, None);
            return strategy;
        }
        VersionDetection::Failed(e) => {
            strategy.notices.push(format!(
                "Error detecting rsync version: {}. Using basic command...",
                e
            ));
            apply_default_checksum(&mut strategy, prefs, None);
            return strategy;
        }
    };

    let caps = version.capabilities();
    if caps.supports_modern_flags {
        if prefs.fast_mode {
            strategy.description.push(
                "Using fast sync mode (optimized for speed) with modern rsync...".to_string(),
            );
            if prefs.use_checksum_verification {
                // 快速模式 + 校验：保留整文件传输，用校验和代替跳过比较
                strategy.flags = flags(&["-a", "--progress", "--whole-file", FAST_BLOCK_SIZE]);
            } else {
                strategy.flags = flags(&[
                    "-a",
                    "--progress",
                    "--no-checksum",
                    "--no-times",
                    "--whole-file",
                    FAST_BLOCK_SIZE,
                ]);
            }
        } else {
            strategy.description.push(
                "Using standard sync mode (thorough verification) with modern rsync...".to_string(),
            );
        }

        if prefs.use_checksum_verification {
            if caps.supports_checksum_choice {
                strategy.flags.push("--checksum".to_string());
                strategy.flags.push("--checksum-choice=xxh64".to_string());
                strategy.checksum = ChecksumMode::Xxh64;
                strategy.description.push(
                    "Using XXH64 checksum (rsync 3.2.0+) for data integrity verification..."
                        .to_string(),
                );
            } else {
                apply_default_checksum(&mut strategy, prefs, Some(version));
            }
        }
    } else {
        if prefs.fast_mode {
            strategy.flags = flags(&["-rltDW", "--progress"]);
            strategy
                .description
                .push("Using maximum performance mode for older rsync...".to_string());
            strategy.description.push(
                "Note: This optimized mode may skip some metadata but maximizes transfer speed."
                    .to_string(),
            );
        } else {
            strategy
                .description
                .push("Using standard sync mode with older rsync...".to_string());
        }
        apply_default_checksum(&mut strategy, prefs, Some(version));
    }

    strategy
}

/// 回退到 rsync 默认校验算法，并记录一条提示
fn apply_default_checksum(
    strategy: &mut TransferStrategy,
    prefs: TransferPreferences,
    version: Option<ToolVersion>,
) {
    if !prefs.use_checksum_verification {
        return;
    }
    strategy.flags.push("--checksum".to_string());
    strategy.checksum = ChecksumMode::Default;
    let detected = version
        .map(|v| format!("rsync {}", v))
        .unwrap_or_else(|| "this rsync".to_string());
    strategy.notices.push(format!(
        "XXH64 checksum requires rsync 3.2.0+ ({} detected); using the default checksum algorithm for data integrity verification...",
        detected
    ));
}

/// 外部工具探测
#[derive(Clone)]
pub struct ToolDetector {
    runner: Arc<dyn CommandRunner>,
    tools: ToolPaths,
}

impl ToolDetector {
    pub fn new(runner: Arc<dyn CommandRunner>, tools: ToolPaths) -> Self {
        Self { runner, tools }
    }

    /// 执行 `rsync --version`，只看第一行
    pub async fn detect_version(&self) -> VersionDetection {
        match self
            .runner
            .run(&self.tools.rsync, &["--version".to_string()])
            .await
        {
            Ok(output) => {
                let first_line = output.stdout.lines().next().unwrap_or_default();
                match ToolVersion::parse(first_line) {
                    Some(v) => {
                        debug!("检测到 rsync 版本: {}", v);
                        VersionDetection::Detected(v)
                    }
                    None => {
                        debug!("无法解析 rsync 版本: {:?}", first_line);
                        VersionDetection::Unparseable
                    }
                }
            }
            Err(e) => VersionDetection::Failed(e.to_string()),
        }
    }

    /// 试运行 `nice -n -10 true`；GNU nice 在无权限时仍执行命令但会在 stderr 警告
    pub async fn probe_priority(&self) -> PriorityProbe {
        let args = flags(&["-n", "-10", "true"]);
        match self.runner.run(&self.tools.nice, &args).await {
            Ok(output) if output.success && output.stderr.trim().is_empty() => {
                PriorityProbe::Permitted
            }
            Ok(_) => PriorityProbe::Denied,
            Err(e) => PriorityProbe::Unavailable(e.to_string()),
        }
    }

    /// 按需探测后选择策略
    pub async fn resolve(&self, platform: Platform, prefs: TransferPreferences) -> TransferStrategy {
        let use_native = prefs.prefer_native_copy && platform.supports_native_copy();
        let version = if use_native {
            VersionDetection::Unparseable
        } else {
            self.detect_version().await
        };
        let priority = if prefs.higher_priority && platform.supports_priority() {
            Some(self.probe_priority().await)
        } else {
            None
        };
        select_strategy(platform, &version, prefs, priority.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::runner::testing::ScriptedRunner;

    fn prefs(fast: bool, checksum: bool) -> TransferPreferences {
        TransferPreferences {
            prefer_native_copy: false,
            fast_mode: fast,
            use_checksum_verification: checksum,
            higher_priority: false,
        }
    }

    fn detected(major: u32, minor: u32, patch: u32) -> VersionDetection {
        VersionDetection::Detected(ToolVersion::new(major, minor, patch))
    }

    #[test]
    fn test_parse_version() {
        let v = ToolVersion::parse("rsync  version 3.2.7  protocol version 31").unwrap();
        assert_eq!(v, ToolVersion::new(3, 2, 7));
        assert!(v.capabilities().supports_checksum_choice);

        let old = ToolVersion::parse("rsync  version 2.6.9  protocol version 29").unwrap();
        assert!(!old.capabilities().supports_modern_flags);

        let v31 = ToolVersion::parse("rsync  version 3.1.3  protocol version 31").unwrap();
        assert!(v31.capabilities().supports_modern_flags);
        assert!(!v31.capabilities().supports_checksum_choice);

        assert!(ToolVersion::parse("openrsync: protocol version 29").is_none());
    }

    #[test]
    fn test_modern_fast_mode() {
        let s = select_strategy(Platform::Posix, &detected(3, 2, 7), prefs(true, false), None);
        assert_eq!(
            s.flags,
            vec!["-a", "--progress", "--no-checksum", "--no-times", "--whole-file", "--block-size=32768"]
        );
        assert_eq!(s.checksum, ChecksumMode::Disabled);
        assert!(s.notices.is_empty());
    }

    #[test]
    fn test_modern_checksum_uses_xxh64() {
        let s = select_strategy(Platform::Posix, &detected(3, 2, 0), prefs(false, true), None);
        assert_eq!(
            s.flags,
            vec!["-a", "--progress", "--checksum", "--checksum-choice=xxh64"]
        );
        assert_eq!(s.checksum, ChecksumMode::Xxh64);
        assert!(s.notices.is_empty());
    }

    #[test]
    fn test_checksum_falls_back_below_3_2() {
        let s = select_strategy(Platform::Posix, &detected(3, 1, 3), prefs(true, true), None);
        assert_eq!(s.checksum, ChecksumMode::Default);
        assert!(s.flags.contains(&"--checksum".to_string()));
        assert!(!s.flags.iter().any(|f| f.starts_with("--checksum-choice")));
        assert!(!s.flags.contains(&"--no-checksum".to_string()));
        assert!(s.flags.contains(&"--whole-file".to_string()));
        assert_eq!(s.notices.len(), 1);
        assert!(s.notices[0].contains("default checksum"));
    }

    #[test]
    fn test_old_rsync_fast_mode() {
        let s = select_strategy(Platform::Posix, &detected(2, 6, 9), prefs(true, false), None);
        assert_eq!(s.flags, vec!["-rltDW", "--progress"]);
        assert!(s.description.iter().any(|d| d.contains("skip some metadata")));

        let s = select_strategy(Platform::Posix, &detected(2, 6, 9), prefs(false, true), None);
        assert_eq!(s.flags, vec!["-a", "--progress", "--checksum"]);
        assert_eq!(s.checksum, ChecksumMode::Default);
        assert_eq!(s.notices.len(), 1);
    }

    #[test]
    fn test_unknown_version_uses_baseline() {
        let s = select_strategy(
            Platform::Posix,
            &VersionDetection::Failed("not found".to_string()),
            prefs(true, false),
            None,
        );
        assert_eq!(s.flags, vec!["-a", "--progress"]);
        assert_eq!(s.notices.len(), 1);
    }

    #[test]
    fn test_native_copy_declares_polling() {
        let p = TransferPreferences {
            prefer_native_copy: true,
            ..prefs(true, true)
        };
        let s = select_strategy(Platform::Posix, &VersionDetection::Unparseable, p, None);
        assert_eq!(s.tool, TransferTool::NativeCopy);
        assert_eq!(s.progress_source(), ProgressSource::Polling);
        assert_eq!(s.checksum, ChecksumMode::Disabled);
        assert_eq!(s.notices.len(), 1);

        let tools = ToolPaths::default();
        assert_eq!(s.command(&tools, "/src", "/dst").to_string(), "cp -R /src /dst");
    }

    #[test]
    fn test_native_copy_unavailable_on_windows() {
        let p = TransferPreferences {
            prefer_native_copy: true,
            ..prefs(false, false)
        };
        let s = select_strategy(Platform::Windows, &detected(3, 2, 7), p, None);
        assert_eq!(s.tool, TransferTool::Rsync);
        assert_eq!(s.notices.len(), 1);
    }

    #[test]
    fn test_priority_wrappers() {
        let p = TransferPreferences {
            higher_priority: true,
            ..prefs(false, false)
        };
        let tools = ToolPaths::default();

        let s = select_strategy(
            Platform::Posix,
            &detected(3, 2, 7),
            p,
            Some(&PriorityProbe::Permitted),
        );
        assert_eq!(
            s.command(&tools, "a/", "b").to_string(),
            "nice -n -10 rsync -a --progress a/ b"
        );

        let s = select_strategy(Platform::Posix, &detected(3, 2, 7), p, Some(&PriorityProbe::Denied));
        assert_eq!(s.priority, PriorityAdjustment::Low);
        assert!(s.notices[0].contains("admin privileges"));

        let s = select_strategy(Platform::Windows, &detected(3, 2, 7), p, Some(&PriorityProbe::Permitted));
        assert_eq!(s.priority, PriorityAdjustment::None);
    }

    #[tokio::test]
    async fn test_detector_with_canned_output() {
        let runner = ScriptedRunner::default()
            .respond(
                "rsync",
                true,
                "rsync  version 3.1.3  protocol version 31\nCopyright (C) 1996-2018\n",
            )
            .respond("nice", true, "");
        let detector = ToolDetector::new(Arc::new(runner), ToolPaths::default());

        assert_eq!(detector.detect_version().await, detected(3, 1, 3));
        assert_eq!(detector.probe_priority().await, PriorityProbe::Permitted);
    }

    #[tokio::test]
    async fn test_detector_degrades_when_tool_missing() {
        let detector = ToolDetector::new(Arc::new(ScriptedRunner::default()), ToolPaths::default());
        let p = TransferPreferences {
            higher_priority: true,
            ..prefs(true, false)
        };

        let s = detector.resolve(Platform::Posix, p).await;
        assert_eq!(s.flags, vec!["-a", "--progress"]);
        assert_eq!(s.priority, PriorityAdjustment::None);
        assert_eq!(s.notices.len(), 2);
    }
}
